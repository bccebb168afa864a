use crate::error::{Result, StoreError};
use crate::retry::BackoffPolicy;
use std::time::Duration;

/// Largest transaction group the backing store accepts.
pub const MAX_TRANSACTION_ITEMS: usize = 100;
/// Largest unconditional batch the backing store accepts per request.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// Runtime configuration shared by the coordination primitives.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationConfig {
    pub optimistic_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: bool,
    pub lease_duration_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub allocate_max_attempts: u32,
    pub max_transaction_items: usize,
    pub batch_write_chunk: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            optimistic_max_attempts: 5,
            backoff_base_ms: 20,
            backoff_max_ms: 1_000,
            backoff_jitter: true,
            lease_duration_ms: 5_000,
            lock_poll_interval_ms: 200,
            allocate_max_attempts: 10,
            max_transaction_items: MAX_TRANSACTION_ITEMS,
            batch_write_chunk: MAX_BATCH_WRITE_ITEMS,
        }
    }
}

impl CoordinationConfig {
    pub fn production() -> Self {
        Self {
            optimistic_max_attempts: 8,
            ..Self::default()
        }
    }

    /// Short leases and no jitter so local runs and tests stay predictable.
    pub fn development() -> Self {
        Self {
            backoff_base_ms: 1,
            backoff_max_ms: 20,
            backoff_jitter: false,
            lease_duration_ms: 1_000,
            lock_poll_interval_ms: 50,
            ..Self::default()
        }
    }

    /// Tighter retry and polling cadence for user-facing request handlers.
    pub fn low_latency() -> Self {
        Self {
            optimistic_max_attempts: 4,
            backoff_base_ms: 5,
            backoff_max_ms: 100,
            lease_duration_ms: 3_000,
            lock_poll_interval_ms: 50,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.optimistic_max_attempts == 0 {
            return Err(invalid("optimistic_max_attempts must be at least 1"));
        }
        if self.allocate_max_attempts == 0 {
            return Err(invalid("allocate_max_attempts must be at least 1"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(invalid("backoff_base_ms exceeds backoff_max_ms"));
        }
        if self.lease_duration_ms == 0 {
            return Err(invalid("lease_duration_ms must be positive"));
        }
        if self.lock_poll_interval_ms == 0 || self.lock_poll_interval_ms >= self.lease_duration_ms
        {
            return Err(invalid(
                "lock_poll_interval_ms must be positive and shorter than the lease",
            ));
        }
        if self.max_transaction_items == 0 || self.max_transaction_items > MAX_TRANSACTION_ITEMS {
            return Err(invalid(format!(
                "max_transaction_items must be within 1..={MAX_TRANSACTION_ITEMS}"
            )));
        }
        if self.batch_write_chunk == 0 || self.batch_write_chunk > MAX_BATCH_WRITE_ITEMS {
            return Err(invalid(format!(
                "batch_write_chunk must be within 1..={MAX_BATCH_WRITE_ITEMS}"
            )));
        }
        Ok(())
    }

    pub fn optimistic_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.optimistic_max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            multiplier: 2,
            jitter: self.backoff_jitter,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::InvalidConfig {
        message: message.into(),
    }
}
