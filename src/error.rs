use crate::record::{ConditionActual, RecordKey};
use thiserror::Error;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    ConditionFailed,
    AlreadyExists,
    TransactionCanceled,
    ConflictExhausted,
    AllocationExhausted,
    Unavailable,
    LockAcquireTimedOut,
    Validation,
    InvalidConfig,
    Encode,
    Decode,
}

impl StoreErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreErrorCode::ConditionFailed => "condition_failed",
            StoreErrorCode::AlreadyExists => "already_exists",
            StoreErrorCode::TransactionCanceled => "transaction_canceled",
            StoreErrorCode::ConflictExhausted => "conflict_exhausted",
            StoreErrorCode::AllocationExhausted => "allocation_exhausted",
            StoreErrorCode::Unavailable => "store_unavailable",
            StoreErrorCode::LockAcquireTimedOut => "lock_acquire_timed_out",
            StoreErrorCode::Validation => "validation",
            StoreErrorCode::InvalidConfig => "invalid_config",
            StoreErrorCode::Encode => "encode",
            StoreErrorCode::Decode => "decode",
        }
    }
}

/// Why one item of a canceled transaction group was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    /// The item's own condition held; the group failed elsewhere.
    None,
    ConditionFailed { actual: ConditionActual },
}

impl CancellationReason {
    pub fn is_failure(&self) -> bool {
        !matches!(self, CancellationReason::None)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("condition failed on {table}/{key}: observed {actual:?}")]
    ConditionFailed {
        table: String,
        key: RecordKey,
        actual: Box<ConditionActual>,
    },
    #[error("record {table}/{key} already exists")]
    AlreadyExists { table: String, key: RecordKey },
    #[error(
        "transaction canceled: {} of {} items failed their condition",
        .reasons.iter().filter(|r| r.is_failure()).count(),
        .reasons.len()
    )]
    TransactionCanceled { reasons: Vec<CancellationReason> },
    #[error("optimistic update of {table}/{key} gave up after {attempts} conflicting attempts")]
    ConflictExhausted {
        table: String,
        key: RecordKey,
        attempts: u32,
    },
    #[error("no free key in table '{table}' after {attempts} attempts")]
    AllocationExhausted { table: String, attempts: u32 },
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("timed out waiting for lock on {table}/{key}")]
    LockAcquireTimedOut { table: String, key: RecordKey },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn code(&self) -> StoreErrorCode {
        match self {
            StoreError::ConditionFailed { .. } => StoreErrorCode::ConditionFailed,
            StoreError::AlreadyExists { .. } => StoreErrorCode::AlreadyExists,
            StoreError::TransactionCanceled { .. } => StoreErrorCode::TransactionCanceled,
            StoreError::ConflictExhausted { .. } => StoreErrorCode::ConflictExhausted,
            StoreError::AllocationExhausted { .. } => StoreErrorCode::AllocationExhausted,
            StoreError::Unavailable { .. } => StoreErrorCode::Unavailable,
            StoreError::LockAcquireTimedOut { .. } => StoreErrorCode::LockAcquireTimedOut,
            StoreError::Validation(_) => StoreErrorCode::Validation,
            StoreError::InvalidConfig { .. } => StoreErrorCode::InvalidConfig,
            StoreError::Encode(_) => StoreErrorCode::Encode,
            StoreError::Decode(_) => StoreErrorCode::Decode,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// A single-record guard lost a race with another writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConditionFailed { .. })
    }

    /// Errors a caller may recover from by re-reading and trying again.
    /// Unavailability is deliberately excluded.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConditionFailed { .. } | StoreError::TransactionCanceled { .. }
        )
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }
}
