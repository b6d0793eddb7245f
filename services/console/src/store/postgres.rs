//! Postgres-backed implementation of the document store.
//!
//! # Data model
//! - `documents` holds the authoritative state: one JSONB document per `(collection, id)`.
//!   `inserted_seq` preserves insertion order for unsorted reads.
//! - `document_changes` is the append-only change log shared by every collection. Each row has a
//!   monotonically increasing `seq` assigned by Postgres; that `seq` is the [`LogPosition`].
//! - `change_log_state.truncated_through` records the highest `seq` removed by retention.
//!
//! # Consistency / atomicity
//! Every mutating primitive updates `documents` and appends its change rows in the same
//! transaction. Writers take a transaction-scoped advisory lock first, so `seq` order is also
//! commit order and a polling cursor never observes a later `seq` before an earlier one commits.
//!
//! # Criteria translation
//! [`Filter`] trees are rendered into JSONB predicates with `QueryBuilder`. Paths and values are
//! always bound parameters; only fixed SQL fragments are pushed as text.
//!
//! # Retention of the change log
//! When `StoreConfig::change_retention` is non-zero a best-effort task bounds `document_changes`
//! to the newest N rows and advances `truncated_through` in the same transaction. Failures are
//! logged and retried on the next tick.
//!
//! # Security notes
//! - Database URLs may contain credentials; avoid logging them.
//! - Use TLS and least-privilege DB roles in production.
use super::filter::{Filter, SortDirection, SortKey, Stage, run_pipeline};
use super::{ChangeCursor, DocumentStore, StoreConfig, StoreError, StoreResult, WriteResult};
use crate::config::PostgresConfig;
use crate::model::{ChangeEntry, ChangeFilter, ChangeOp, Document, LogPosition};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "pg-tests")]
const RETENTION_TICK: Duration = Duration::from_secs(1);
#[cfg(not(feature = "pg-tests"))]
const RETENTION_TICK: Duration = Duration::from_secs(60);

/// Advisory lock key serializing change-log appends.
const CHANGE_LOG_LOCK: i64 = 0x636f_6e73_6f6c_65;

/// Durable document store backed by Postgres.
///
/// # Example
/// ```rust,no_run
/// use console::config::PostgresConfig;
/// use console::store::{StoreConfig, postgres::PostgresStore};
///
/// async fn open(pg: PostgresConfig, cfg: StoreConfig) {
///     let _ = PostgresStore::connect(&pg, cfg).await;
/// }
/// ```
pub struct PostgresStore {
    pool: PgPool,
    config: StoreConfig,
}

#[derive(Debug, FromRow)]
struct DbDocument {
    doc: Json<Value>,
}

#[derive(Debug, FromRow)]
struct DbKeyedDocument {
    id: String,
    doc: Json<Value>,
}

#[derive(Debug, FromRow)]
struct DbChange {
    seq: i64,
    op: String,
    collection: String,
    payload: Json<Value>,
}

impl PostgresStore {
    /// Connect to Postgres, run migrations, and optionally start retention maintenance.
    ///
    /// # Errors
    /// - Connection, migration, or pool setup failures.
    pub async fn connect(pg: &PostgresConfig, config: StoreConfig) -> StoreResult<Self> {
        // Avoid logging `pg.url` because it may contain credentials.
        let connect_options = PgConnectOptions::from_str(&pg.url)?;
        let connect = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options);
        let pool = tokio::time::timeout(Duration::from_millis(pg.connect_timeout_ms), connect)
            .await
            .map_err(|_| {
                StoreError::Unexpected(anyhow::anyhow!(
                    "postgres connect timed out after {}ms",
                    pg.connect_timeout_ms
                ))
            })??;

        // Migrations run before serving requests so handlers can assume the schema exists.
        sqlx::migrate!("./migrations").run(&pool).await?;

        if config.change_retention > 0 {
            spawn_retention_task(pool.clone(), config.change_retention as i64);
        }
        tracing::info!(
            max_connections = pg.max_connections,
            change_retention = config.change_retention,
            "postgres document store ready"
        );
        Ok(Self { pool, config })
    }
}

/// Spawn a best-effort background task that bounds `document_changes` to the newest `max_rows`.
///
/// Readers positioned before the new watermark fail with `ChangeLogTruncated` instead of
/// silently skipping the deleted rows.
fn spawn_retention_task(pool: PgPool, max_rows: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_TICK);
        loop {
            ticker.tick().await;
            match trim_change_log(&pool, max_rows).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "trimmed change log"),
                Err(err) => tracing::warn!(error = %err, "change log retention failed"),
            }
        }
    });
}

async fn trim_change_log(pool: &PgPool, max_rows: i64) -> StoreResult<u64> {
    let mut tx = pool.begin().await?;
    lock_change_log(&mut tx).await?;
    let cutoff: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) - $1 FROM document_changes")
            .bind(max_rows)
            .fetch_one(&mut *tx)
            .await?;
    if cutoff <= 0 {
        return Ok(0);
    }
    let removed = sqlx::query("DELETE FROM document_changes WHERE seq <= $1")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query(
        "UPDATE change_log_state SET truncated_through = GREATEST(truncated_through, $1) WHERE id",
    )
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(removed)
}

async fn lock_change_log(conn: &mut PgConnection) -> StoreResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(CHANGE_LOG_LOCK)
        .execute(conn)
        .await?;
    Ok(())
}

async fn append_change(
    conn: &mut PgConnection,
    op: ChangeOp,
    collection: &str,
    doc_id: &str,
    payload: &Document,
) -> StoreResult<()> {
    sqlx::query(
        r#"INSERT INTO document_changes (op, collection, doc_id, payload) VALUES ($1, $2, $3, $4)"#,
    )
    .bind(op.as_str())
    .bind(collection)
    .bind(doc_id)
    .bind(Json(payload.as_map()))
    .execute(conn)
    .await?;
    Ok(())
}

async fn truncated_through(executor: &PgPool) -> StoreResult<LogPosition> {
    let value: i64 =
        sqlx::query_scalar("SELECT truncated_through FROM change_log_state WHERE id")
            .fetch_optional(executor)
            .await?
            .unwrap_or(0);
    Ok(LogPosition(value.max(0) as u64))
}

fn document_from_db(Json(value): Json<Value>) -> StoreResult<Document> {
    Document::try_from(value)
        .map_err(|value| StoreError::Malformed(format!("stored document is not an object: {value}")))
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

fn push_path(qb: &mut QueryBuilder<'_, Postgres>, path: &str) {
    qb.push("(doc #> ");
    qb.push_bind(path_segments(path));
    qb.push("::text[])");
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    qb.push_bind(Json(value.clone()));
    qb.push("::jsonb");
}

fn push_comparison(qb: &mut QueryBuilder<'_, Postgres>, path: &str, op: &str, bound: &Value) {
    // jsonb orders across types; restrict to same-type comparisons.
    qb.push("(jsonb_typeof");
    push_path(qb, path);
    qb.push(" = jsonb_typeof(");
    push_value(qb, bound);
    qb.push(") AND ");
    push_path(qb, path);
    qb.push(op);
    push_value(qb, bound);
    qb.push(")");
}

fn push_junction(qb: &mut QueryBuilder<'_, Postgres>, clauses: &[Filter], joiner: &str, empty: &str) {
    if clauses.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (index, clause) in clauses.iter().enumerate() {
        if index > 0 {
            qb.push(joiner);
        }
        push_filter(qb, clause);
    }
    qb.push(")");
}

/// Render `filter` as a boolean SQL expression over the `doc` column.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::Eq(path, Value::Null) => {
            qb.push("(");
            push_path(qb, path);
            qb.push(" IS NULL OR ");
            push_path(qb, path);
            qb.push(" = 'null'::jsonb)");
        }
        Filter::Eq(path, value) => {
            qb.push("(");
            push_path(qb, path);
            qb.push(" = ");
            push_value(qb, value);
            if !value.is_array() {
                qb.push(" OR (jsonb_typeof");
                push_path(qb, path);
                qb.push(" = 'array' AND ");
                push_path(qb, path);
                qb.push(" @> jsonb_build_array(");
                push_value(qb, value);
                qb.push("))");
            }
            qb.push(")");
        }
        Filter::In(path, values) => {
            if values.is_empty() {
                qb.push("FALSE");
                return;
            }
            push_path(qb, path);
            qb.push(" IN (");
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    qb.push(", ");
                }
                push_value(qb, value);
            }
            qb.push(")");
        }
        Filter::Lt(path, bound) => push_comparison(qb, path, " < ", bound),
        Filter::Lte(path, bound) => push_comparison(qb, path, " <= ", bound),
        Filter::Gt(path, bound) => push_comparison(qb, path, " > ", bound),
        Filter::Gte(path, bound) => push_comparison(qb, path, " >= ", bound),
        Filter::Exists(path, exists) => {
            push_path(qb, path);
            qb.push(if *exists { " IS NOT NULL" } else { " IS NULL" });
        }
        Filter::And(clauses) => push_junction(qb, clauses, " AND ", "TRUE"),
        Filter::Or(clauses) => push_junction(qb, clauses, " OR ", "FALSE"),
    }
}

/// Missing fields sort lowest in both directions' natural order.
fn push_order(qb: &mut QueryBuilder<'_, Postgres>, sort: &[SortKey]) {
    qb.push(" ORDER BY ");
    for key in sort {
        push_path(qb, &key.path);
        qb.push(match key.direction {
            SortDirection::Ascending => " ASC NULLS FIRST, ",
            SortDirection::Descending => " DESC NULLS LAST, ",
        });
    }
    qb.push("inserted_seq");
}

fn select_documents<'a>(collection: &str, filter: &Filter) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("SELECT id, doc FROM documents WHERE collection = ");
    qb.push_bind(collection.to_string());
    qb.push(" AND ");
    push_filter(&mut qb, filter);
    qb
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: &[SortKey],
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let mut qb = select_documents(collection, filter);
        push_order(&mut qb, sort);
        if limit > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        let rows = qb
            .build_query_as::<DbKeyedDocument>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|row| document_from_db(row.doc)).collect()
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<Vec<Document>> {
        let mut tx = self.pool.begin().await?;
        lock_change_log(&mut tx).await?;
        let mut stored = Vec::with_capacity(documents.len());
        for document in documents {
            let id = document
                .id()
                .ok_or_else(|| StoreError::Malformed("insert requires an id".into()))?
                .to_string();
            let row = sqlx::query_as::<_, DbDocument>(
                r#"INSERT INTO documents (collection, id, doc) VALUES ($1, $2, $3)
                   ON CONFLICT (collection, id) DO NOTHING
                   RETURNING doc"#,
            )
            .bind(collection)
            .bind(&id)
            .bind(Json(document.as_map()))
            .fetch_optional(&mut *tx)
            .await?;
            // Dropping `tx` rolls back the whole batch.
            let Some(row) = row else {
                return Err(StoreError::Conflict(format!("{collection} {id} exists")));
            };
            let document = document_from_db(row.doc)?;
            append_change(&mut tx, ChangeOp::Insert, collection, &id, &document).await?;
            stored.push(document);
        }
        tx.commit().await?;
        Ok(stored)
    }

    async fn replace(&self, collection: &str, document: Document) -> StoreResult<WriteResult> {
        let id = document
            .id()
            .ok_or_else(|| StoreError::Malformed("replace requires an id".into()))?
            .to_string();
        let mut tx = self.pool.begin().await?;
        lock_change_log(&mut tx).await?;
        let row = sqlx::query_as::<_, DbDocument>(
            r#"UPDATE documents SET doc = $3 WHERE collection = $1 AND id = $2 RETURNING doc"#,
        )
        .bind(collection)
        .bind(&id)
        .bind(Json(document.as_map()))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(WriteResult::default());
        };
        let stored = document_from_db(row.doc)?;
        append_change(&mut tx, ChangeOp::Update, collection, &id, &stored).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        lock_change_log(&mut tx).await?;
        let mut qb = select_documents(collection, filter);
        qb.push(" ORDER BY inserted_seq FOR UPDATE");
        let rows = qb
            .build_query_as::<DbKeyedDocument>()
            .fetch_all(&mut *tx)
            .await?;
        let mut result = WriteResult::default();
        for row in rows {
            let mut document = document_from_db(row.doc)?;
            for (path, value) in fields {
                document.set_path(path, value.clone());
            }
            sqlx::query("UPDATE documents SET doc = $3 WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(&row.id)
                .bind(Json(document.as_map()))
                .execute(&mut *tx)
                .await?;
            append_change(&mut tx, ChangeOp::Update, collection, &row.id, &document).await?;
            result.matched += 1;
            result.modified += 1;
        }
        tx.commit().await?;
        Ok(result)
    }

    async fn remove(&self, collection: &str, id: &str) -> StoreResult<WriteResult> {
        let mut tx = self.pool.begin().await?;
        lock_change_log(&mut tx).await?;
        let removed = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Ok(WriteResult::default());
        }
        let mut payload = Document::new();
        payload.set_id(id);
        append_change(&mut tx, ChangeOp::Delete, collection, id, &payload).await?;
        tx.commit().await?;
        Ok(WriteResult {
            matched: removed,
            modified: removed,
        })
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> StoreResult<Vec<Document>> {
        // A leading match is pushed down; the remaining stages run in process.
        let (filter, rest) = match pipeline.split_first() {
            Some((Stage::Match(filter), rest)) => (filter.clone(), rest),
            _ => (Filter::all(), pipeline),
        };
        let documents = self.find(collection, &filter, &[], 0).await?;
        Ok(run_pipeline(documents, rest))
    }

    async fn change_log_head(&self) -> StoreResult<LogPosition> {
        let head: i64 = sqlx::query_scalar(
            r#"SELECT GREATEST(
                   COALESCE((SELECT MAX(seq) FROM document_changes), 0),
                   COALESCE((SELECT truncated_through FROM change_log_state WHERE id), 0)
               )"#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(LogPosition(head.max(0) as u64))
    }

    async fn open_change_cursor(
        &self,
        from: LogPosition,
        filter: ChangeFilter,
    ) -> StoreResult<Box<dyn ChangeCursor>> {
        let watermark = truncated_through(&self.pool).await?;
        if from < watermark {
            return Err(StoreError::ChangeLogTruncated {
                requested: from,
                truncated_through: watermark,
            });
        }
        Ok(Box::new(PgCursor {
            pool: self.pool.clone(),
            filter,
            scanned: from,
            pending: VecDeque::new(),
            poll_interval: self.config.poll_interval,
            idle_timeout: self.config.cursor_idle_timeout,
            batch: self.config.change_batch.max(1) as i64,
            last_activity: Instant::now(),
            alive: true,
        }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

/// Polling cursor over `document_changes`.
///
/// Rows are read unfiltered so `scanned` advances past entries the filter rejects; the
/// truncation watermark is checked after each read so a concurrent retention pass cannot
/// hide a gap.
struct PgCursor {
    pool: PgPool,
    filter: ChangeFilter,
    scanned: LogPosition,
    pending: VecDeque<ChangeEntry>,
    poll_interval: Duration,
    idle_timeout: Duration,
    batch: i64,
    last_activity: Instant,
    alive: bool,
}

impl PgCursor {
    async fn poll(&mut self) -> StoreResult<usize> {
        let rows = sqlx::query_as::<_, DbChange>(
            r#"SELECT seq, op, collection, payload FROM document_changes
               WHERE seq > $1 ORDER BY seq LIMIT $2"#,
        )
        .bind(self.scanned.0 as i64)
        .bind(self.batch)
        .fetch_all(&self.pool)
        .await?;
        let watermark = truncated_through(&self.pool).await?;
        if self.scanned < watermark {
            return Err(StoreError::ChangeLogTruncated {
                requested: self.scanned,
                truncated_through: watermark,
            });
        }
        let read = rows.len();
        for row in rows {
            let op = ChangeOp::parse(&row.op)
                .ok_or_else(|| StoreError::Malformed(format!("unknown change op {}", row.op)))?;
            let entry = ChangeEntry {
                position: LogPosition(row.seq as u64),
                op,
                collection: row.collection,
                payload: document_from_db(row.payload)?,
            };
            self.scanned = entry.position;
            if self.filter.matches(&entry) {
                self.pending.push_back(entry);
            }
        }
        Ok(read)
    }
}

#[async_trait]
impl ChangeCursor for PgCursor {
    async fn next(&mut self) -> StoreResult<Option<ChangeEntry>> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Ok(Some(entry));
            }
            if !self.alive {
                return Ok(None);
            }
            let read = match self.poll().await {
                Ok(read) => read,
                Err(err @ StoreError::ChangeLogTruncated { .. }) => return Err(err),
                Err(err) => {
                    // A dropped connection kills the cursor; the owner reopens from its position.
                    tracing::warn!(error = %err, "change cursor poll failed");
                    self.alive = false;
                    continue;
                }
            };
            if read > 0 {
                self.last_activity = Instant::now();
                continue;
            }
            if self.last_activity.elapsed() >= self.idle_timeout {
                self.alive = false;
                continue;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
