//! Document store access.
//!
//! # Purpose
//! [`DocumentStore`] is the backend seam: raw per-collection primitives plus
//! the replication change-log feed. Backends know nothing about soft deletes
//! or version stamps; [`query::Query`] layers those invariants on top so every
//! action gets the same semantics.
use crate::model::{ChangeEntry, ChangeFilter, Document, LogPosition};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

pub mod clock;
pub mod filter;
pub mod memory;
pub mod postgres;
pub mod query;

use filter::{Filter, SortKey, Stage};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of change-log entries kept before the oldest are evicted.
    pub change_retention: usize,
    /// A tailing cursor with no new entries for this long dies.
    pub cursor_idle_timeout: Duration,
    /// Poll period for backends without push notification.
    pub poll_interval: Duration,
    /// Max entries fetched per cursor round-trip.
    pub change_batch: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            change_retention: 10_000,
            cursor_idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            change_batch: 256,
        }
    }
}

/// Outcome of an identifier- or criteria-keyed write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(
        "change log truncated: position {requested} precedes retained history (truncated through {truncated_through})"
    )]
    ChangeLogTruncated {
        requested: LogPosition,
        truncated_through: LogPosition,
    },
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Live read position on the change log.
///
/// `Ok(None)` means the cursor died (idle timeout, dropped connection, killed
/// server-side) without a logical end; the owner reopens from the last entry
/// it consumed.
#[async_trait]
pub trait ChangeCursor: Send {
    async fn next(&mut self) -> StoreResult<Option<ChangeEntry>>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `limit == 0` is unbounded. Without sort keys, results come in insertion order.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &[SortKey],
        limit: usize,
    ) -> StoreResult<Vec<Document>>;

    /// Persist documents that already carry ids; returns the stored forms.
    /// Fails with `Conflict` if any id is taken.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<Vec<Document>>;

    /// Replace the document with the same id. Never inserts.
    async fn replace(&self, collection: &str, document: Document) -> StoreResult<WriteResult>;

    /// Set dotted-path fields on every document matching `filter`.
    async fn update_fields(
        &self,
        collection: &str,
        filter: &Filter,
        fields: &Map<String, Value>,
    ) -> StoreResult<WriteResult>;

    async fn remove(&self, collection: &str, id: &str) -> StoreResult<WriteResult>;

    /// Runs over every stored document, deleted or not.
    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> StoreResult<Vec<Document>>;

    /// Position of the newest change-log entry.
    async fn change_log_head(&self) -> StoreResult<LogPosition>;

    /// Tail the change log strictly after `from`.
    async fn open_change_cursor(
        &self,
        from: LogPosition,
        filter: ChangeFilter,
    ) -> StoreResult<Box<dyn ChangeCursor>>;

    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}
