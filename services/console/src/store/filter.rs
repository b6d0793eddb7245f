//! Query criteria, sort keys, and aggregation pipelines.
//!
//! # Purpose
//! Backends share one definition of what a criteria matches so that the
//! soft-delete predicate behaves identically in memory and in Postgres. The
//! in-memory evaluator here is also used by the Postgres backend for the
//! stages it does not push down to SQL.
//!
//! # Matching rules
//! - `Eq(path, null)` matches a null or missing field.
//! - `Eq(path, v)` matches a field equal to `v`, or an array field containing `v`.
//! - Range comparisons only match values of the same JSON type (numbers or strings).
use crate::model::{DELETION_TIMESTAMP_PATH, Document};
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Exists(String, bool),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(path: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(path.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(path.into(), value.into())
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(path.into(), value.into())
    }

    pub fn exists(path: impl Into<String>, exists: bool) -> Self {
        Filter::Exists(path.into(), exists)
    }

    /// Matches every document.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    /// The soft-delete predicate: documents whose deletion marker is unset.
    pub fn live() -> Self {
        Filter::Eq(DELETION_TIMESTAMP_PATH.to_string(), Value::Null)
    }

    /// Conjunction that flattens nested `And`s.
    pub fn and(self, other: Filter) -> Filter {
        let mut clauses = match self {
            Filter::And(clauses) => clauses,
            single => vec![single],
        };
        match other {
            Filter::And(more) => clauses.extend(more),
            single => clauses.push(single),
        }
        Filter::And(clauses)
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(path, Value::Null) => doc.get_path(path).is_none_or(Value::is_null),
            Filter::Eq(path, expected) => match doc.get_path(path) {
                Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
                Some(actual) => actual == expected,
                None => false,
            },
            Filter::In(path, values) => doc
                .get_path(path)
                .is_some_and(|actual| values.contains(actual)),
            Filter::Lt(path, bound) => compare_at(doc, path, bound) == Some(Ordering::Less),
            Filter::Lte(path, bound) => matches!(
                compare_at(doc, path, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gt(path, bound) => compare_at(doc, path, bound) == Some(Ordering::Greater),
            Filter::Gte(path, bound) => matches!(
                compare_at(doc, path, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Exists(path, exists) => doc.get_path(path).is_some() == *exists,
            Filter::And(clauses) => clauses.iter().all(|clause| clause.matches(doc)),
            Filter::Or(clauses) => clauses.iter().any(|clause| clause.matches(doc)),
        }
    }
}

fn compare_at(doc: &Document, path: &str, bound: &Value) -> Option<Ordering> {
    compare_same_type(doc.get_path(path)?, bound)
}

fn compare_same_type(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn ascending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Rank of a JSON type in sort order; missing and null sort lowest, matching
/// the Postgres `jsonb` ordering with `NULLS FIRST`.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::String(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::Bool(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

fn compare_for_sort(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    let by_rank = type_rank(left).cmp(&type_rank(right));
    if by_rank != Ordering::Equal {
        return by_rank;
    }
    match (left, right) {
        (Some(a), Some(b)) => compare_same_type(a, b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

/// Stable multi-key sort.
pub fn sort_documents(docs: &mut [Document], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for key in keys {
            let ordering = compare_for_sort(a.get_path(&key.path), b.get_path(&key.path));
            let ordering = match key.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// One step of an aggregation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<SortKey>),
    Limit(usize),
    /// Groups by the value at `by`, emitting `{"key": <value>, <count_field>: n}`
    /// in order of first appearance.
    Group { by: String, count_field: String },
}

pub fn run_pipeline(mut docs: Vec<Document>, stages: &[Stage]) -> Vec<Document> {
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => docs.into_iter().filter(|doc| filter.matches(doc)).collect(),
            Stage::Sort(keys) => {
                sort_documents(&mut docs, keys);
                docs
            }
            Stage::Limit(limit) => {
                docs.truncate(*limit);
                docs
            }
            Stage::Group { by, count_field } => group_count(docs, by, count_field),
        };
    }
    docs
}

fn group_count(docs: Vec<Document>, by: &str, count_field: &str) -> Vec<Document> {
    let mut groups: Vec<(Value, u64)> = Vec::new();
    for doc in &docs {
        let key = doc.get_path(by).cloned().unwrap_or(Value::Null);
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, count)) => *count += 1,
            None => groups.push((key, 1)),
        }
    }
    groups
        .into_iter()
        .map(|(key, count)| {
            let mut map = Map::new();
            map.insert("key".to_string(), key);
            map.insert(count_field.to_string(), Value::from(count));
            Document::from(map)
        })
        .collect()
}
