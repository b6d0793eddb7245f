//! Collection-scoped query layer.
//!
//! # Purpose
//! Every action reads and writes documents through [`Query`], which enforces
//! the two store-wide invariants in one place:
//! - reads exclude soft-deleted documents unless the caller asks for them;
//! - writes stamp `metadata.resourceVersion` from the process clock, so each
//!   successful write strictly advances the document's version.
//!
//! # Notes
//! `update` is an explicit existence-checked replace: zero matched documents
//! is `ObjectNotFound` and nothing is written.
use super::clock::next_stamp;
use super::filter::{Filter, SortKey, Stage};
use super::{DocumentStore, StoreError, StoreResult, WriteResult};
use crate::model::{
    CREATION_TIMESTAMP_PATH, DELETION_TIMESTAMP_PATH, Document, ID_FIELD, RESOURCE_VERSION_PATH,
};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct Query {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl Query {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// First live document matching `criteria`.
    pub async fn find_one(&self, criteria: Filter) -> StoreResult<Option<Document>> {
        let mut found = self.find(criteria, &[], 1).await?;
        Ok(found.pop())
    }

    pub async fn find_by_id(&self, id: &str) -> StoreResult<Option<Document>> {
        self.find_one(Filter::eq(ID_FIELD, id)).await
    }

    /// Live documents matching `criteria`; `limit == 0` is unbounded.
    pub async fn find(
        &self,
        criteria: Filter,
        sort: &[SortKey],
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        self.store
            .find(&self.collection, &Filter::live().and(criteria), sort, limit)
            .await
    }

    /// Same as [`Query::find`] but soft-deleted documents are returned too.
    pub async fn find_including_deleted(
        &self,
        criteria: Filter,
        sort: &[SortKey],
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        self.store
            .find(&self.collection, &criteria, sort, limit)
            .await
    }

    pub async fn insert(&self, document: Document) -> StoreResult<Document> {
        self.insert_many(vec![document])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Unexpected(anyhow::anyhow!("insert returned no document")))
    }

    /// Bulk insert; each document is stamped independently.
    pub async fn insert_many(&self, documents: Vec<Document>) -> StoreResult<Vec<Document>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let count = documents.len() as u64;
        let stamped = documents.into_iter().map(stamp_new).collect();
        let inserted = self.store.insert_many(&self.collection, stamped).await?;
        metrics::counter!("console_store_writes_total", "op" => "insert").increment(count);
        tracing::debug!(collection = %self.collection, count, "inserted documents");
        Ok(inserted)
    }

    /// Replace an existing document by id and return its stored form.
    pub async fn update(&self, mut document: Document) -> StoreResult<Document> {
        let id = document
            .id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Malformed("update requires an id".into()))?;
        document.set_path(RESOURCE_VERSION_PATH, Value::from(next_stamp()));
        let result = self.store.replace(&self.collection, document).await?;
        if result.matched == 0 {
            return Err(StoreError::ObjectNotFound(format!(
                "{} {id}",
                self.collection
            )));
        }
        metrics::counter!("console_store_writes_total", "op" => "update").increment(1);
        self.find_including_deleted(Filter::eq(ID_FIELD, id.as_str()), &[], 1)
            .await?
            .pop()
            .ok_or_else(|| StoreError::ObjectNotFound(format!("{} {id}", self.collection)))
    }

    /// Partial update of every document matching `criteria`. Does not check existence.
    pub async fn update_fields(
        &self,
        criteria: Filter,
        mut fields: Map<String, Value>,
    ) -> StoreResult<WriteResult> {
        fields.insert(
            RESOURCE_VERSION_PATH.to_string(),
            Value::from(next_stamp()),
        );
        let result = self
            .store
            .update_fields(&self.collection, &criteria, &fields)
            .await?;
        metrics::counter!("console_store_writes_total", "op" => "update_fields")
            .increment(result.modified);
        Ok(result)
    }

    /// Mark a document deleted without removing it.
    pub async fn soft_delete(&self, document: &Document) -> StoreResult<WriteResult> {
        let id = document
            .id()
            .ok_or_else(|| StoreError::Malformed("soft delete requires an id".into()))?;
        let mut fields = Map::new();
        fields.insert(
            DELETION_TIMESTAMP_PATH.to_string(),
            Value::from(next_stamp()),
        );
        self.update_fields(Filter::eq(ID_FIELD, id), fields).await
    }

    /// Physically remove a document by id.
    pub async fn remove(&self, document: &Document) -> StoreResult<WriteResult> {
        let id = document
            .id()
            .ok_or_else(|| StoreError::Malformed("remove requires an id".into()))?;
        let result = self.store.remove(&self.collection, id).await?;
        metrics::counter!("console_store_writes_total", "op" => "remove")
            .increment(result.modified);
        Ok(result)
    }

    /// Raw aggregation; include [`Filter::live`] in a `Match` stage to skip deleted documents.
    pub async fn aggregate(&self, pipeline: &[Stage]) -> StoreResult<Vec<Document>> {
        self.store.aggregate(&self.collection, pipeline).await
    }
}

fn stamp_new(mut document: Document) -> Document {
    let now = next_stamp();
    document.set_path(CREATION_TIMESTAMP_PATH, Value::from(now));
    document.set_path(RESOURCE_VERSION_PATH, Value::from(now));
    document.set_path(DELETION_TIMESTAMP_PATH, Value::Null);
    if document.id().is_none() {
        document.set_id(uuid::Uuid::new_v4().to_string());
    }
    document
}
