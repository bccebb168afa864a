use crate::config::CoordinationConfig;
use crate::error::{Result, StoreError};
use crate::record::{Fields, RecordKey};
use crate::store::Table;
use rand::Rng;
use std::future::Future;
use tracing::{debug, warn};

/// Letters that survive being read aloud or copied by hand: no `I` or `O`.
pub const INVITATION_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Random code of `len` characters drawn from [`INVITATION_ALPHABET`].
pub fn invitation_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| INVITATION_ALPHABET[rng.gen_range(0..INVITATION_ALPHABET.len())] as char)
        .collect()
}

/// Claims collision-free keys by put-if-absent, regenerating on collision
/// up to a fixed number of attempts.
#[derive(Debug, Clone)]
pub struct UniqueKeyAllocator {
    table: Table,
    max_attempts: u32,
}

impl UniqueKeyAllocator {
    pub fn new(table: Table, config: &CoordinationConfig) -> Self {
        Self {
            table,
            max_attempts: config.allocate_max_attempts,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Inserts `fields_for(key)` at the first generated key nobody holds.
    /// `generator` receives the 1-based attempt number.
    pub async fn allocate<G, F>(&self, mut generator: G, fields_for: F) -> Result<RecordKey>
    where
        G: FnMut(u32) -> RecordKey,
        F: Fn(&RecordKey) -> Fields,
    {
        let max_attempts = self.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let key = generator(attempt);
            match self.table.put_if_absent(key.clone(), fields_for(&key)).await {
                Ok(()) => {
                    debug!(table = self.table.name(), key = %key, attempt, "unique key allocated");
                    return Ok(key);
                }
                Err(StoreError::AlreadyExists { .. }) => {
                    debug!(table = self.table.name(), key = %key, attempt, "unique key collision");
                }
                Err(err) => return Err(err),
            }
        }
        Err(self.exhausted(max_attempts))
    }

    /// Returns the first generated candidate that `exists` reports free.
    ///
    /// Nothing is written, so two callers can be handed the same candidate;
    /// use [`allocate`](Self::allocate) when the key is itself a record.
    pub async fn allocate_exists_check<G, E, Fut>(&self, mut generator: G, exists: E) -> Result<String>
    where
        G: FnMut(u32) -> String,
        E: Fn(&str) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let max_attempts = self.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let candidate = generator(attempt);
            if !exists(&candidate).await? {
                return Ok(candidate);
            }
            debug!(table = self.table.name(), candidate = %candidate, attempt, "candidate taken");
        }
        Err(self.exhausted(max_attempts))
    }

    fn exhausted(&self, attempts: u32) -> StoreError {
        warn!(table = self.table.name(), attempts, "unique key allocation exhausted");
        StoreError::AllocationExhausted {
            table: self.table.name().to_string(),
            attempts,
        }
    }
}
