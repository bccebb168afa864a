pub mod allocate;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod optimistic;
pub mod record;
pub mod retry;
pub mod store;
pub mod transact;

pub use allocate::{UniqueKeyAllocator, invitation_code};
pub use clock::{Clock, IdGenerator, Sleeper};
pub use config::CoordinationConfig;
pub use error::{Result, StoreError, StoreErrorCode};
pub use lock::{LockId, LockManager, LockState};
pub use optimistic::{
    Draft, OptimisticUpdate, Projection, UpdateOutcome, optimistic_update, optimistic_update_typed,
};
pub use record::{AttrValue, Condition, FieldUpdate, Fields, Record, RecordKey};
pub use retry::{BackoffPolicy, retry_transient, with_backoff};
pub use store::{MemoryStore, RecordStore, Table};
pub use transact::{TransactOp, TransactionBuilder, TransactionCoordinator};

use crate::clock::{SystemClock, TokioSleeper, UuidIdGenerator};
use std::sync::Arc;
use tracing::info;

/// Entry point wiring one backing store to the coordination primitives.
///
/// Every primitive handed out shares the instance's store, configuration,
/// clock, id generator and sleeper. Nothing here holds state between calls;
/// all coordination goes through the store's conditional writes.
#[derive(Clone)]
pub struct WorldStore {
    store: Arc<dyn RecordStore>,
    config: CoordinationConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for WorldStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorldStore {
    pub fn open(store: Arc<dyn RecordStore>, config: CoordinationConfig) -> Result<Self> {
        config.validate()?;
        info!(
            optimistic_max_attempts = config.optimistic_max_attempts,
            lease_duration_ms = config.lease_duration_ms,
            "world store opened"
        );
        Ok(Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidIdGenerator),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Fresh in-memory store with the given configuration.
    pub fn in_memory(config: CoordinationConfig) -> Result<Self> {
        let max_items = config.max_transaction_items;
        Self::open(
            Arc::new(MemoryStore::new().with_max_transaction_items(max_items)),
            config,
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn table(&self, name: impl Into<String>) -> Table {
        Table::new(self.store.clone(), name).with_batch_chunk(self.config.batch_write_chunk)
    }

    /// Optimistic update on `table` using the configured backoff and sleeper.
    pub fn optimistic<'a, I, S, F>(
        &self,
        table: &'a Table,
        key: RecordKey,
        update_keys: I,
        reducer: F,
    ) -> OptimisticUpdate<'a>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&mut Draft) -> Result<()> + Send + Sync + 'a,
    {
        OptimisticUpdate::new(table, key, update_keys, reducer)
            .policy(self.config.optimistic_backoff())
            .sleeper(self.sleeper.clone())
    }

    pub fn lock_manager(&self, table: impl Into<String>) -> LockManager {
        LockManager::new(self.table(table), &self.config)
            .with_clock(self.clock.clone())
            .with_ids(self.ids.clone())
            .with_sleeper(self.sleeper.clone())
    }

    pub fn allocator(&self, table: impl Into<String>) -> UniqueKeyAllocator {
        UniqueKeyAllocator::new(self.table(table), &self.config)
    }

    pub fn transactions(&self) -> TransactionCoordinator {
        TransactionCoordinator::new(self.store.clone(), &self.config)
    }
}
