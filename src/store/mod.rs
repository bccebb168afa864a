pub mod client;
pub mod memory;

pub use client::Table;
pub use memory::{MemoryStore, StoreStats, WriteHook};

use crate::error::Result;
use crate::record::{Condition, FieldUpdate, Fields, Record, RecordKey};
use async_trait::async_trait;

/// Sort-key predicate for partition queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKeyCondition {
    Equals(String),
    BeginsWith(String),
    Between(String, String),
    GreaterThan(String),
    LessThan(String),
}

impl SortKeyCondition {
    pub fn matches(&self, sort_key: &str) -> bool {
        match self {
            SortKeyCondition::Equals(v) => sort_key == v,
            SortKeyCondition::BeginsWith(prefix) => sort_key.starts_with(prefix.as_str()),
            SortKeyCondition::Between(lo, hi) => sort_key >= lo.as_str() && sort_key <= hi.as_str(),
            SortKeyCondition::GreaterThan(v) => sort_key > v.as_str(),
            SortKeyCondition::LessThan(v) => sort_key < v.as_str(),
        }
    }
}

/// Unconditional write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    Put(Record),
    Delete(RecordKey),
}

impl WriteRequest {
    pub fn key(&self) -> &RecordKey {
        match self {
            WriteRequest::Put(record) => &record.key,
            WriteRequest::Delete(key) => key,
        }
    }
}

/// One member of an all-or-nothing transaction group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactItem {
    Put {
        table: String,
        record: Record,
        condition: Option<Condition>,
    },
    Update {
        table: String,
        key: RecordKey,
        update: FieldUpdate,
        condition: Option<Condition>,
    },
    Delete {
        table: String,
        key: RecordKey,
        condition: Option<Condition>,
    },
    ConditionCheck {
        table: String,
        key: RecordKey,
        condition: Condition,
    },
}

impl TransactItem {
    pub fn table(&self) -> &str {
        match self {
            TransactItem::Put { table, .. }
            | TransactItem::Update { table, .. }
            | TransactItem::Delete { table, .. }
            | TransactItem::ConditionCheck { table, .. } => table,
        }
    }

    pub fn key(&self) -> &RecordKey {
        match self {
            TransactItem::Put { record, .. } => &record.key,
            TransactItem::Update { key, .. }
            | TransactItem::Delete { key, .. }
            | TransactItem::ConditionCheck { key, .. } => key,
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            TransactItem::Put { condition, .. }
            | TransactItem::Update { condition, .. }
            | TransactItem::Delete { condition, .. } => condition.as_ref(),
            TransactItem::ConditionCheck { condition, .. } => Some(condition),
        }
    }
}

/// Boundary to the partitioned key-value store.
///
/// Single-record writes are atomic and, when a condition is given, applied
/// only if the condition holds against the record's state at write time;
/// otherwise they fail with `ConditionFailed` and change nothing.
/// `transact_write` applies every item or none, failing with
/// `TransactionCanceled`. Any call may fail with `Unavailable`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(
        &self,
        table: &str,
        key: &RecordKey,
        projection: Option<&[String]>,
    ) -> Result<Option<Fields>>;

    async fn query(
        &self,
        table: &str,
        partition_key: &str,
        sort: Option<&SortKeyCondition>,
        projection: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>>;

    async fn put(&self, table: &str, record: Record, condition: Option<Condition>) -> Result<()>;

    /// Creates the record if it does not exist.
    async fn update(
        &self,
        table: &str,
        key: &RecordKey,
        update: FieldUpdate,
        condition: Option<Condition>,
    ) -> Result<()>;

    /// Deleting a missing record succeeds when its condition holds.
    async fn delete(
        &self,
        table: &str,
        key: &RecordKey,
        condition: Option<Condition>,
    ) -> Result<()>;

    async fn batch_write(&self, table: &str, writes: Vec<WriteRequest>) -> Result<()>;

    async fn transact_write(&self, items: Vec<TransactItem>) -> Result<()>;
}
