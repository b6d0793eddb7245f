//! Change-log payloads.
//!
//! # Purpose
//! Defines the read-only entries a store emits for each write and the filter
//! watchers use to select the entries they care about.
use super::Document;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an entry in the store's change log.
///
/// Positions are totally ordered and strictly increasing in write order. A
/// cursor opened at position `p` delivers entries with positions `> p`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogPosition(pub u64);

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(ChangeOp::Insert),
            "update" => Some(ChangeOp::Update),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub position: LogPosition,
    pub op: ChangeOp,
    pub collection: String,
    /// Post-write document for inserts and updates, `{id}` for deletes.
    pub payload: Document,
}

/// Collection/operation selector applied to the change log.
///
/// An empty list selects everything for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    pub collections: Vec<String>,
    pub operations: Vec<ChangeOp>,
}

impl ChangeFilter {
    pub fn inserts(collection: &str) -> Self {
        Self {
            collections: vec![collection.to_string()],
            operations: vec![ChangeOp::Insert],
        }
    }

    pub fn matches(&self, entry: &ChangeEntry) -> bool {
        (self.collections.is_empty() || self.collections.iter().any(|c| *c == entry.collection))
            && (self.operations.is_empty() || self.operations.contains(&entry.op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(collection: &str, op: ChangeOp) -> ChangeEntry {
        ChangeEntry {
            position: LogPosition(1),
            op,
            collection: collection.to_string(),
            payload: Document::new(),
        }
    }

    #[test]
    fn insert_filter_ignores_other_collections_and_ops() {
        let filter = ChangeFilter::inserts("Namespaces");
        assert!(filter.matches(&entry("Namespaces", ChangeOp::Insert)));
        assert!(!filter.matches(&entry("Namespaces", ChangeOp::Update)));
        assert!(!filter.matches(&entry("Users", ChangeOp::Insert)));
        assert!(ChangeFilter::default().matches(&entry("Users", ChangeOp::Delete)));
    }

    #[test]
    fn op_names_round_trip() {
        for op in [ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete] {
            assert_eq!(ChangeOp::parse(op.as_str()), Some(op));
        }
        assert_eq!(ChangeOp::parse("noop"), None);
    }
}
