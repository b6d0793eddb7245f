//! In-memory implementation of the document store.
//!
//! # Purpose
//! This store implements [`DocumentStore`] entirely in memory using per-collection vectors guarded
//! by `tokio::sync::RwLock`. It exists for:
//! - local development and tests (no external dependencies)
//! - deployments where durability is not required
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - **Single-process consistency**: a write and its change-log entry are recorded while the
//!   collection write lock is held, so the log order is the write order.
//!
//! # Change log
//! Every write appends an entry to a bounded, in-memory change log. When the retention window
//! (`StoreConfig::change_retention`) overflows, the oldest entries are evicted and the eviction
//! watermark (`truncated_through`) advances. Cursors positioned behind the watermark fail with
//! `ChangeLogTruncated`.
//!
//! Cursors are woken through a `watch` channel carrying the head position. They die after
//! `cursor_idle_timeout` without new entries, and immediately when [`InMemoryStore::kill_cursors`]
//! is called, which is how tests simulate a server-side cursor timeout.
use super::filter::{Filter, SortKey, Stage, run_pipeline, sort_documents};
use super::{ChangeCursor, DocumentStore, StoreConfig, StoreError, StoreResult, WriteResult};
use crate::model::{ChangeEntry, ChangeFilter, ChangeOp, Document, LogPosition};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};

/// Bounded, in-memory append-only change log.
///
/// - `record()` assigns the next position, appends the entry, and evicts older entries when the
///   configured capacity is exceeded.
/// - Eviction advances `truncated_through`; a reader whose position is older cannot resume.
#[derive(Debug)]
struct ChangeLog {
    next_position: u64,
    capacity: usize,
    items: VecDeque<ChangeEntry>,
    truncated_through: LogPosition,
}

impl ChangeLog {
    fn new(capacity: usize) -> Self {
        Self {
            next_position: 1,
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.clamp(1, 4096)),
            truncated_through: LogPosition(0),
        }
    }

    fn record(&mut self, op: ChangeOp, collection: &str, payload: Document) -> LogPosition {
        let position = LogPosition(self.next_position);
        self.next_position += 1;
        self.items.push_back(ChangeEntry {
            position,
            op,
            collection: collection.to_string(),
            payload,
        });
        while self.items.len() > self.capacity {
            if let Some(evicted) = self.items.pop_front() {
                self.truncated_through = evicted.position;
            }
        }
        position
    }

    fn head(&self) -> LogPosition {
        LogPosition(self.next_position - 1)
    }

    /// Matching entries after `from`, and the position scanning reached.
    fn read_after(
        &self,
        from: LogPosition,
        filter: &ChangeFilter,
        limit: usize,
    ) -> StoreResult<(Vec<ChangeEntry>, LogPosition)> {
        if from < self.truncated_through {
            return Err(StoreError::ChangeLogTruncated {
                requested: from,
                truncated_through: self.truncated_through,
            });
        }
        let mut matched = Vec::new();
        let mut scanned = from.max(self.truncated_through);
        for entry in self.items.iter().filter(|entry| entry.position > from) {
            if matched.len() >= limit {
                break;
            }
            scanned = entry.position;
            if filter.matches(entry) {
                matched.push(entry.clone());
            }
        }
        Ok((matched, scanned))
    }
}

type Collections = HashMap<String, Vec<Document>>;

/// In-memory document store.
///
/// All state is wrapped in `Arc` so the store can be shared across async request handlers and
/// cursors can outlive the borrow that opened them.
pub struct InMemoryStore {
    config: StoreConfig,
    /// Authoritative documents keyed by collection, in insertion order.
    collections: Arc<RwLock<Collections>>,
    /// Change log shared by all collections; one global order.
    changes: Arc<RwLock<ChangeLog>>,
    /// Latest recorded position, used to wake tailing cursors.
    head_tx: watch::Sender<LogPosition>,
    /// Cursor generation; bumping it kills every open cursor.
    kill_tx: watch::Sender<u64>,
}

impl InMemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        let capacity = config.change_retention;
        let (head_tx, _) = watch::channel(LogPosition(0));
        let (kill_tx, _) = watch::channel(0);
        Self {
            config,
            collections: Arc::new(RwLock::new(HashMap::new())),
            changes: Arc::new(RwLock::new(ChangeLog::new(capacity))),
            head_tx,
            kill_tx,
        }
    }

    /// Terminate every open cursor, as a server-side cursor timeout would.
    pub fn kill_cursors(&self) {
        self.kill_tx.send_modify(|generation| *generation += 1);
        tracing::debug!("killed in-memory change cursors");
    }

    async fn record(&self, op: ChangeOp, collection: &str, payload: Document) {
        let position = self.changes.write().await.record(op, collection, payload);
        self.head_tx.send_replace(position);
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &[SortKey],
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<Document> = documents
            .iter()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        sort_documents(&mut matched, sort);
        if limit > 0 {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<Vec<Document>> {
        let mut collections = self.collections.write().await;
        let stored = collections.entry(collection.to_string()).or_default();
        for document in &documents {
            let id = document
                .id()
                .ok_or_else(|| StoreError::Malformed("insert requires an id".into()))?;
            if stored.iter().any(|existing| existing.id() == Some(id)) {
                return Err(StoreError::Conflict(format!("{collection} {id} exists")));
            }
        }
        for document in &documents {
            stored.push(document.clone());
            // Recorded under the collection lock so log order matches write order.
            self.record(ChangeOp::Insert, collection, document.clone())
                .await;
        }
        Ok(documents)
    }

    async fn replace(&self, collection: &str, document: Document) -> StoreResult<WriteResult> {
        let id = document
            .id()
            .ok_or_else(|| StoreError::Malformed("replace requires an id".into()))?
            .to_string();
        let mut collections = self.collections.write().await;
        let Some(slot) = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|doc| doc.id() == Some(id.as_str())))
        else {
            return Ok(WriteResult::default());
        };
        *slot = document.clone();
        self.record(ChangeOp::Update, collection, document).await;
        Ok(WriteResult {
            matched: 1,
            modified: 1,
        })
    }

    async fn update_fields(
        &self,
        collection: &str,
        filter: &Filter,
        fields: &Map<String, Value>,
    ) -> StoreResult<WriteResult> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(WriteResult::default());
        };
        let mut result = WriteResult::default();
        for document in documents.iter_mut().filter(|doc| filter.matches(doc)) {
            for (path, value) in fields {
                document.set_path(path, value.clone());
            }
            result.matched += 1;
            result.modified += 1;
            self.record(ChangeOp::Update, collection, document.clone())
                .await;
        }
        Ok(result)
    }

    async fn remove(&self, collection: &str, id: &str) -> StoreResult<WriteResult> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(WriteResult::default());
        };
        let before = documents.len();
        documents.retain(|doc| doc.id() != Some(id));
        if documents.len() == before {
            return Ok(WriteResult::default());
        }
        let mut payload = Document::new();
        payload.set_id(id);
        self.record(ChangeOp::Delete, collection, payload).await;
        Ok(WriteResult {
            matched: 1,
            modified: 1,
        })
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> StoreResult<Vec<Document>> {
        let documents = self
            .collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default();
        Ok(run_pipeline(documents, pipeline))
    }

    async fn change_log_head(&self) -> StoreResult<LogPosition> {
        Ok(self.changes.read().await.head())
    }

    async fn open_change_cursor(
        &self,
        from: LogPosition,
        filter: ChangeFilter,
    ) -> StoreResult<Box<dyn ChangeCursor>> {
        {
            // Fail fast on positions that already rotated out.
            let log = self.changes.read().await;
            if from < log.truncated_through {
                return Err(StoreError::ChangeLogTruncated {
                    requested: from,
                    truncated_through: log.truncated_through,
                });
            }
        }
        let kills = self.kill_tx.subscribe();
        let generation = *kills.borrow();
        Ok(Box::new(MemoryCursor {
            log: self.changes.clone(),
            head: self.head_tx.subscribe(),
            kills,
            generation,
            scanned: from,
            filter,
            pending: VecDeque::new(),
            idle_timeout: self.config.cursor_idle_timeout,
            batch: self.config.change_batch.max(1),
            alive: true,
        }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        // In-memory backend is always "healthy" if the process is running.
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Tailing cursor over the in-memory change log.
struct MemoryCursor {
    log: Arc<RwLock<ChangeLog>>,
    head: watch::Receiver<LogPosition>,
    kills: watch::Receiver<u64>,
    generation: u64,
    /// Position scanning has reached, including entries the filter rejected.
    scanned: LogPosition,
    filter: ChangeFilter,
    pending: VecDeque<ChangeEntry>,
    idle_timeout: Duration,
    batch: usize,
    alive: bool,
}

#[async_trait]
impl ChangeCursor for MemoryCursor {
    async fn next(&mut self) -> StoreResult<Option<ChangeEntry>> {
        loop {
            if *self.kills.borrow() != self.generation {
                self.alive = false;
            }
            if !self.alive {
                return Ok(None);
            }
            if let Some(entry) = self.pending.pop_front() {
                return Ok(Some(entry));
            }
            // Mark the head seen before reading so a write racing this read still wakes us.
            self.head.borrow_and_update();
            let (entries, scanned) =
                self.log
                    .read()
                    .await
                    .read_after(self.scanned, &self.filter, self.batch)?;
            self.scanned = scanned;
            if !entries.is_empty() {
                self.pending.extend(entries);
                continue;
            }
            if self.scanned < *self.head.borrow() {
                continue;
            }
            let woke = tokio::select! {
                changed = self.head.changed() => changed.is_ok(),
                killed = self.kills.changed() => killed.is_ok(),
                _ = tokio::time::sleep(self.idle_timeout) => false,
            };
            if !woke {
                self.alive = false;
            }
        }
    }
}
