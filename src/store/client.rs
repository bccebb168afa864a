use super::{RecordStore, SortKeyCondition, TransactItem, WriteRequest};
use crate::config::MAX_BATCH_WRITE_ITEMS;
use crate::error::{Result, StoreError};
use crate::record::{Condition, FieldUpdate, Fields, Record, RecordKey, from_fields, to_fields};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// Handle on one logical table of the backing store. Cheap to clone; every
/// call goes straight to the store, nothing is cached.
#[derive(Clone)]
pub struct Table {
    name: String,
    store: Arc<dyn RecordStore>,
    batch_chunk: usize,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("batch_chunk", &self.batch_chunk)
            .finish_non_exhaustive()
    }
}

impl Table {
    pub fn new(store: Arc<dyn RecordStore>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store,
            batch_chunk: MAX_BATCH_WRITE_ITEMS,
        }
    }

    pub fn with_batch_chunk(mut self, batch_chunk: usize) -> Self {
        self.batch_chunk = batch_chunk.clamp(1, MAX_BATCH_WRITE_ITEMS);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn get(
        &self,
        key: &RecordKey,
        projection: Option<&[String]>,
    ) -> Result<Option<Fields>> {
        self.store.get(&self.name, key, projection).await
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &RecordKey) -> Result<Option<T>> {
        match self.get(key, None).await? {
            Some(fields) => from_fields(&fields).map(Some),
            None => Ok(None),
        }
    }

    pub async fn query(
        &self,
        partition_key: &str,
        sort: Option<&SortKeyCondition>,
    ) -> Result<Vec<Record>> {
        self.store
            .query(&self.name, partition_key, sort, None, None)
            .await
    }

    pub async fn query_projected(
        &self,
        partition_key: &str,
        sort: Option<&SortKeyCondition>,
        projection: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        self.store
            .query(&self.name, partition_key, sort, Some(projection), limit)
            .await
    }

    pub async fn query_as<T: DeserializeOwned>(
        &self,
        partition_key: &str,
        sort: Option<&SortKeyCondition>,
    ) -> Result<Vec<(RecordKey, T)>> {
        self.query(partition_key, sort)
            .await?
            .into_iter()
            .map(|record| Ok((record.key, from_fields(&record.fields)?)))
            .collect()
    }

    pub async fn put(&self, record: Record, condition: Option<Condition>) -> Result<()> {
        self.store.put(&self.name, record, condition).await
    }

    pub async fn put_as<T: Serialize>(
        &self,
        key: RecordKey,
        value: &T,
        condition: Option<Condition>,
    ) -> Result<()> {
        self.put(Record::new(key, to_fields(value)?), condition)
            .await
    }

    /// Inserts only when nothing lives at `key`; a collision surfaces as
    /// `AlreadyExists`.
    pub async fn put_if_absent(&self, key: RecordKey, fields: Fields) -> Result<()> {
        match self
            .put(Record::new(key.clone(), fields), Some(Condition::NotExists))
            .await
        {
            Err(StoreError::ConditionFailed { .. }) => Err(StoreError::AlreadyExists {
                table: self.name.clone(),
                key,
            }),
            other => other,
        }
    }

    pub async fn update(
        &self,
        key: &RecordKey,
        update: FieldUpdate,
        condition: Option<Condition>,
    ) -> Result<()> {
        self.store.update(&self.name, key, update, condition).await
    }

    pub async fn delete(&self, key: &RecordKey, condition: Option<Condition>) -> Result<()> {
        self.store.delete(&self.name, key, condition).await
    }

    /// Unconditional writes, split into store-sized chunks. Chunks are
    /// independent: a failure leaves earlier chunks applied.
    pub async fn batch_write(&self, writes: Vec<WriteRequest>) -> Result<()> {
        let total = writes.len();
        let mut pending = writes.into_iter().peekable();
        let mut chunks = 0usize;
        while pending.peek().is_some() {
            let chunk: Vec<WriteRequest> = pending.by_ref().take(self.batch_chunk).collect();
            self.store.batch_write(&self.name, chunk).await?;
            chunks += 1;
        }
        debug!(table = %self.name, total, chunks, "batch write complete");
        Ok(())
    }

    pub async fn transact_write(&self, items: Vec<TransactItem>) -> Result<()> {
        self.store.transact_write(items).await
    }
}
