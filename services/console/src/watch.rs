//! Change-log watcher.
//!
//! # Purpose
//! [`ChangeLogWatcher`] tails the document store's change log from a position and hands matching
//! entries to the caller one at a time. The underlying cursor can die at any point (idle timeout,
//! dropped connection, server-side kill); the watcher reopens it from the last entry it delivered,
//! so the caller sees one gap-free, duplicate-free sequence.
//!
//! # Key invariants
//! - `last_seen` only advances when an entry is handed to the caller.
//! - Reopen always starts from `last_seen`, never from the original `from`.
//! - A position that has rotated out of the change log surfaces as
//!   [`StoreError::ChangeLogTruncated`]; the watcher never resumes from an arbitrary point.
//!
//! # Ownership
//! A watcher owns its cursor exclusively. Concurrent waits each open their own watcher.
use crate::model::{ChangeEntry, ChangeFilter, LogPosition};
use crate::store::{ChangeCursor, DocumentStore, StoreError, StoreResult};
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_millis(50);

enum WatchState {
    Disconnected,
    Tailing(Box<dyn ChangeCursor>),
    Dead,
}

impl WatchState {
    fn name(&self) -> &'static str {
        match self {
            WatchState::Disconnected => "disconnected",
            WatchState::Tailing(_) => "tailing",
            WatchState::Dead => "dead",
        }
    }
}

pub struct ChangeLogWatcher {
    store: Arc<dyn DocumentStore>,
    filter: ChangeFilter,
    last_seen: LogPosition,
    state: WatchState,
    reopens: u64,
    reopen_delay: Duration,
    /// Whether the current cursor has delivered anything since it was opened.
    delivered: bool,
}

impl ChangeLogWatcher {
    /// Create a watcher that will deliver entries strictly after `from`.
    ///
    /// Nothing is opened until the first [`ChangeLogWatcher::next`] call.
    pub fn open(store: Arc<dyn DocumentStore>, from: LogPosition, filter: ChangeFilter) -> Self {
        Self {
            store,
            filter,
            last_seen: from,
            state: WatchState::Disconnected,
            reopens: 0,
            reopen_delay: DEFAULT_REOPEN_DELAY,
            delivered: false,
        }
    }

    pub fn with_reopen_delay(mut self, delay: Duration) -> Self {
        self.reopen_delay = delay;
        self
    }

    pub fn last_seen(&self) -> LogPosition {
        self.last_seen
    }

    /// Number of times a dead cursor has been replaced.
    pub fn reopens(&self) -> u64 {
        self.reopens
    }

    pub fn state(&self) -> &'static str {
        self.state.name()
    }

    async fn connect(&mut self) -> StoreResult<()> {
        let cursor = self
            .store
            .open_change_cursor(self.last_seen, self.filter.clone())
            .await?;
        self.state = WatchState::Tailing(cursor);
        self.delivered = false;
        Ok(())
    }

    /// Next matching entry. Blocks until one arrives.
    ///
    /// # Errors
    /// - [`StoreError::ChangeLogTruncated`] when `last_seen` is no longer retained.
    /// - Backend errors from opening or reading the cursor.
    pub async fn next(&mut self) -> StoreResult<ChangeEntry> {
        loop {
            match &mut self.state {
                WatchState::Disconnected => self.connect().await?,
                WatchState::Dead => {
                    if !self.delivered {
                        tokio::time::sleep(self.reopen_delay).await;
                    }
                    self.reopens += 1;
                    metrics::counter!("console_watcher_reopens_total").increment(1);
                    tracing::debug!(
                        last_seen = %self.last_seen,
                        reopens = self.reopens,
                        "reopening change cursor"
                    );
                    self.connect().await?;
                }
                WatchState::Tailing(cursor) => match cursor.next().await {
                    Ok(Some(entry)) => {
                        self.last_seen = entry.position;
                        self.delivered = true;
                        return Ok(entry);
                    }
                    Ok(None) => self.state = WatchState::Dead,
                    Err(err) => {
                        self.state = WatchState::Dead;
                        if matches!(err, StoreError::ChangeLogTruncated { .. }) {
                            tracing::warn!(last_seen = %self.last_seen, "change log truncated past watcher");
                        }
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Consume entries until one satisfies `predicate` and return it.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> StoreResult<ChangeEntry>
    where
        F: FnMut(&ChangeEntry) -> bool,
    {
        loop {
            let entry = self.next().await?;
            if predicate(&entry) {
                return Ok(entry);
            }
        }
    }

    /// The watcher as a lazy, unbounded stream.
    pub fn into_stream(self) -> impl Stream<Item = StoreResult<ChangeEntry>> + Send {
        futures::stream::unfold(self, |mut watcher| async move {
            let item = watcher.next().await;
            Some((item, watcher))
        })
    }
}
