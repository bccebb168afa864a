use super::{RecordStore, SortKeyCondition, TransactItem, WriteRequest};
use crate::clock::{Clock, SystemClock};
use crate::config::{MAX_BATCH_WRITE_ITEMS, MAX_TRANSACTION_ITEMS};
use crate::error::{CancellationReason, Result, StoreError};
use crate::record::{Condition, FieldUpdate, Fields, Record, RecordKey, is_expired, project_fields};
use async_trait::async_trait;
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::debug;

type TableData = OrdMap<RecordKey, Fields>;
type Tables = im::HashMap<String, TableData>;

/// Runs before a conditional single-record write is evaluated. Receives the
/// store so it can play a racing writer through the `*_raw` methods.
pub type WriteHook = Arc<dyn Fn(&MemoryStore, &str, &RecordKey) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub condition_failures: u64,
    pub transactions_committed: u64,
    pub transactions_canceled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    condition_failures: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_canceled: AtomicU64,
}

/// In-process partitioned record store.
///
/// Each table is an ordered map keyed by `(partition_key, sort_key)`, so a
/// partition query is a range scan. All writes take the table-set lock for
/// the duration of the condition check and the apply, which makes every
/// single-record write and every transaction group atomic. Transactions are
/// applied to a copy-on-write clone of the table set and swapped in only
/// once every condition has passed.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    unavailable: AtomicBool,
    failing_calls: AtomicU32,
    write_hook: Mutex<Option<WriteHook>>,
    max_transaction_items: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// The clock decides `ttl` expiry.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::new()),
            clock,
            counters: Counters::default(),
            unavailable: AtomicBool::new(false),
            failing_calls: AtomicU32::new(0),
            write_hook: Mutex::new(None),
            max_transaction_items: MAX_TRANSACTION_ITEMS,
        }
    }

    pub fn with_max_transaction_items(mut self, max_transaction_items: usize) -> Self {
        self.max_transaction_items = max_transaction_items;
        self
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.counters.reads.load(Ordering::SeqCst),
            writes: self.counters.writes.load(Ordering::SeqCst),
            condition_failures: self.counters.condition_failures.load(Ordering::SeqCst),
            transactions_committed: self.counters.transactions_committed.load(Ordering::SeqCst),
            transactions_canceled: self.counters.transactions_canceled.load(Ordering::SeqCst),
        }
    }

    /// While set, every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `calls` store calls fail with `Unavailable`; later calls
    /// succeed again.
    pub fn fail_next_calls(&self, calls: u32) {
        self.failing_calls.store(calls, Ordering::SeqCst);
    }

    pub fn set_write_hook(&self, hook: Option<WriteHook>) {
        *self.write_hook.lock() = hook;
    }

    /// Unconditional write that skips hooks, counters and availability.
    pub fn insert_raw(&self, table: &str, record: Record) {
        let mut tables = self.tables.write();
        table_mut(&mut tables, table).insert(record.key, record.fields);
    }

    /// Unconditional field update that skips hooks, counters and availability.
    pub fn update_raw(&self, table: &str, key: &RecordKey, update: &FieldUpdate) {
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table);
        let mut fields = data.get(key).cloned().unwrap_or_default();
        update.apply_to(&mut fields);
        data.insert(key.clone(), fields);
    }

    /// Current live fields of a record, without touching the read counter.
    pub fn peek(&self, table: &str, key: &RecordKey) -> Option<Fields> {
        let tables = self.tables.read();
        tables
            .get(table)
            .and_then(|data| self.live(data, key))
            .cloned()
    }

    pub fn len(&self, table: &str) -> usize {
        let now = self.clock.now_secs();
        self.tables
            .read()
            .get(table)
            .map(|data| data.values().filter(|f| !is_expired(f, now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store marked unavailable"));
        }
        if self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::unavailable("memory store outage"));
        }
        Ok(())
    }

    fn live<'a>(&self, data: &'a TableData, key: &RecordKey) -> Option<&'a Fields> {
        data.get(key)
            .filter(|fields| !is_expired(fields, self.clock.now_secs()))
    }

    fn run_write_hook(&self, table: &str, key: &RecordKey, condition: Option<&Condition>) {
        if condition.is_none() {
            return;
        }
        let hook = self.write_hook.lock().clone();
        if let Some(hook) = hook {
            hook(self, table, key);
        }
    }

    fn check_condition(
        &self,
        table: &str,
        key: &RecordKey,
        current: Option<&Fields>,
        condition: Option<&Condition>,
    ) -> Result<()> {
        let Some(condition) = condition else {
            return Ok(());
        };
        match condition.evaluate(current) {
            None => Ok(()),
            Some(actual) => {
                self.counters
                    .condition_failures
                    .fetch_add(1, Ordering::SeqCst);
                debug!(table, key = %key, ?actual, "conditional write rejected");
                Err(StoreError::ConditionFailed {
                    table: table.to_string(),
                    key: key.clone(),
                    actual: Box::new(actual),
                })
            }
        }
    }

    fn count_write(&self, n: u64) {
        self.counters.writes.fetch_add(n, Ordering::SeqCst);
    }
}

fn table_mut<'a>(tables: &'a mut Tables, table: &str) -> &'a mut TableData {
    tables
        .entry(table.to_string())
        .or_insert_with(TableData::new)
}

fn validate_unique_keys<'a>(
    keys: impl Iterator<Item = (&'a str, &'a RecordKey)>,
    what: &str,
) -> Result<()> {
    let mut seen = HashSet::new();
    for (table, key) in keys {
        if !seen.insert((table, key)) {
            return Err(StoreError::Validation(format!(
                "{what} addresses {table}/{key} more than once"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(
        &self,
        table: &str,
        key: &RecordKey,
        projection: Option<&[String]>,
    ) -> Result<Option<Fields>> {
        self.check_available()?;
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .and_then(|data| self.live(data, key))
            .map(|fields| project_fields(fields, projection)))
    }

    async fn query(
        &self,
        table: &str,
        partition_key: &str,
        sort: Option<&SortKeyCondition>,
        projection: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        self.check_available()?;
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now_secs();
        let tables = self.tables.read();
        let Some(data) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(data
            .range(RecordKey::partition_start(partition_key)..)
            .take_while(|(key, _)| key.partition_key == partition_key)
            .filter(|(key, _)| sort.is_none_or(|cond| cond.matches(&key.sort_key)))
            .filter(|(_, fields)| !is_expired(fields, now))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, fields)| Record::new(key.clone(), project_fields(fields, projection)))
            .collect())
    }

    async fn put(&self, table: &str, record: Record, condition: Option<Condition>) -> Result<()> {
        self.check_available()?;
        self.run_write_hook(table, &record.key, condition.as_ref());
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table);
        self.check_condition(
            table,
            &record.key,
            self.live(data, &record.key),
            condition.as_ref(),
        )?;
        data.insert(record.key, record.fields);
        self.count_write(1);
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key: &RecordKey,
        update: FieldUpdate,
        condition: Option<Condition>,
    ) -> Result<()> {
        self.check_available()?;
        self.run_write_hook(table, key, condition.as_ref());
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table);
        let current = self.live(data, key);
        self.check_condition(table, key, current, condition.as_ref())?;
        let mut fields = current.cloned().unwrap_or_default();
        update.apply_to(&mut fields);
        data.insert(key.clone(), fields);
        self.count_write(1);
        Ok(())
    }

    async fn delete(
        &self,
        table: &str,
        key: &RecordKey,
        condition: Option<Condition>,
    ) -> Result<()> {
        self.check_available()?;
        self.run_write_hook(table, key, condition.as_ref());
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table);
        self.check_condition(table, key, self.live(data, key), condition.as_ref())?;
        data.remove(key);
        self.count_write(1);
        Ok(())
    }

    async fn batch_write(&self, table: &str, writes: Vec<WriteRequest>) -> Result<()> {
        self.check_available()?;
        if writes.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(StoreError::Validation(format!(
                "batch of {} writes exceeds the limit of {MAX_BATCH_WRITE_ITEMS}",
                writes.len()
            )));
        }
        validate_unique_keys(writes.iter().map(|w| (table, w.key())), "batch")?;
        let count = writes.len() as u64;
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table);
        for write in writes {
            match write {
                WriteRequest::Put(record) => {
                    data.insert(record.key, record.fields);
                }
                WriteRequest::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        self.count_write(count);
        Ok(())
    }

    async fn transact_write(&self, items: Vec<TransactItem>) -> Result<()> {
        self.check_available()?;
        if items.is_empty() {
            return Ok(());
        }
        if items.len() > self.max_transaction_items {
            return Err(StoreError::Validation(format!(
                "transaction of {} items exceeds the limit of {}",
                items.len(),
                self.max_transaction_items
            )));
        }
        validate_unique_keys(
            items.iter().map(|item| (item.table(), item.key())),
            "transaction",
        )?;

        let mut tables = self.tables.write();
        let reasons: Vec<CancellationReason> = items
            .iter()
            .map(|item| {
                let current = tables
                    .get(item.table())
                    .and_then(|data| self.live(data, item.key()));
                match item.condition().and_then(|c| c.evaluate(current)) {
                    Some(actual) => CancellationReason::ConditionFailed { actual },
                    None => CancellationReason::None,
                }
            })
            .collect();
        if reasons.iter().any(CancellationReason::is_failure) {
            self.counters
                .transactions_canceled
                .fetch_add(1, Ordering::SeqCst);
            debug!(items = items.len(), "transaction canceled by failed condition");
            return Err(StoreError::TransactionCanceled { reasons });
        }

        let mut next = tables.clone();
        let mut applied = 0;
        for item in items {
            match item {
                TransactItem::Put { table, record, .. } => {
                    table_mut(&mut next, &table).insert(record.key, record.fields);
                    applied += 1;
                }
                TransactItem::Update {
                    table, key, update, ..
                } => {
                    let data = table_mut(&mut next, &table);
                    let mut fields = self.live(data, &key).cloned().unwrap_or_default();
                    update.apply_to(&mut fields);
                    data.insert(key, fields);
                    applied += 1;
                }
                TransactItem::Delete { table, key, .. } => {
                    table_mut(&mut next, &table).remove(&key);
                    applied += 1;
                }
                TransactItem::ConditionCheck { .. } => {}
            }
        }
        *tables = next;
        self.count_write(applied);
        self.counters
            .transactions_committed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
