pub mod draft;

pub use draft::Draft;

use crate::clock::{Sleeper, TokioSleeper};
use crate::error::{Result, StoreError};
use crate::record::{Condition, Fields, RecordKey, from_fields, to_fields};
use crate::retry::{BackoffPolicy, with_backoff};
use crate::store::Table;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

pub type Reducer<'a> = dyn Fn(&mut Draft) -> Result<()> + Send + Sync + 'a;
pub type DeleteCondition<'a> = dyn Fn(&Draft) -> bool + Send + Sync + 'a;

/// Result of a successful optimistic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The reducer changed nothing; no write was issued.
    Unchanged(Fields),
    /// The diff was written; carries the projected fields as written.
    Updated(Fields),
    Deleted,
}

impl UpdateOutcome {
    pub fn fields(&self) -> Option<&Fields> {
        match self {
            UpdateOutcome::Unchanged(fields) | UpdateOutcome::Updated(fields) => Some(fields),
            UpdateOutcome::Deleted => None,
        }
    }

    pub fn into_fields(self) -> Option<Fields> {
        match self {
            UpdateOutcome::Unchanged(fields) | UpdateOutcome::Updated(fields) => Some(fields),
            UpdateOutcome::Deleted => None,
        }
    }

    pub fn wrote(&self) -> bool {
        !matches!(self, UpdateOutcome::Unchanged(_))
    }
}

/// Read-mutate-conditionally-write cycle over one record.
///
/// Each attempt reads the record projected onto the update keys, runs the
/// reducer over a fresh [`Draft`], and writes the diff guarded on the read
/// values being unchanged. A lost guard restarts the cycle under the backoff
/// policy; running out of attempts yields `ConflictExhausted`. Any other
/// store error, `Unavailable` included, ends the cycle immediately.
pub struct OptimisticUpdate<'a> {
    table: &'a Table,
    key: RecordKey,
    update_keys: Vec<String>,
    reducer: Box<Reducer<'a>>,
    delete_condition: Option<Box<DeleteCondition<'a>>>,
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl<'a> OptimisticUpdate<'a> {
    pub fn new<I, S, F>(table: &'a Table, key: RecordKey, update_keys: I, reducer: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&mut Draft) -> Result<()> + Send + Sync + 'a,
    {
        Self {
            table,
            key,
            update_keys: update_keys.into_iter().map(Into::into).collect(),
            reducer: Box::new(reducer),
            delete_condition: None,
            policy: BackoffPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Delete the whole record instead of updating it when `condition`
    /// holds for the post-reducer draft.
    pub fn delete_when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Draft) -> bool + Send + Sync + 'a,
    {
        self.delete_condition = Some(Box::new(condition));
        self
    }

    pub fn policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn run(self) -> Result<UpdateOutcome> {
        let result = with_backoff(
            &self.policy,
            self.sleeper.as_ref(),
            StoreError::is_conflict,
            |attempt| self.attempt(attempt),
        )
        .await;
        match result {
            Err(StoreError::ConditionFailed { .. }) => {
                let attempts = self.policy.max_attempts.max(1);
                warn!(
                    table = self.table.name(),
                    key = %self.key,
                    attempts,
                    "optimistic update exhausted its attempts"
                );
                Err(StoreError::ConflictExhausted {
                    table: self.table.name().to_string(),
                    key: self.key.clone(),
                    attempts,
                })
            }
            other => other,
        }
    }

    async fn attempt(&self, attempt: u32) -> Result<UpdateOutcome> {
        let read = self.table.get(&self.key, Some(&self.update_keys)).await?;
        let existed = read.is_some();
        let original = read.unwrap_or_default();

        let mut draft = Draft::new(&self.update_keys, &original, existed);
        (self.reducer)(&mut draft)?;

        let guard = Condition::expect_fields(&self.update_keys, &original);
        if self
            .delete_condition
            .as_ref()
            .is_some_and(|condition| condition(&draft))
        {
            self.table.delete(&self.key, Some(guard)).await?;
            debug!(table = self.table.name(), key = %self.key, attempt, "optimistic delete applied");
            return Ok(UpdateOutcome::Deleted);
        }

        let diff = draft.diff(&original);
        if diff.is_empty() {
            return Ok(UpdateOutcome::Unchanged(original));
        }
        self.table.update(&self.key, diff, Some(guard)).await?;
        debug!(table = self.table.name(), key = %self.key, attempt, "optimistic update applied");
        Ok(UpdateOutcome::Updated(draft.into_fields()))
    }
}

/// One-call form of [`OptimisticUpdate`].
///
/// Always runs under `BackoffPolicy::default()` (five jittered attempts) and
/// sleeps on tokio time, whatever `CoordinationConfig` is in use. Use
/// `WorldStore::optimistic` to get the configured policy and sleeper.
pub async fn optimistic_update<F>(
    table: &Table,
    key: &RecordKey,
    update_keys: &[&str],
    reducer: F,
    delete_condition: Option<&DeleteCondition<'_>>,
) -> Result<UpdateOutcome>
where
    F: Fn(&mut Draft) -> Result<()> + Send + Sync,
{
    let mut update = OptimisticUpdate::new(table, key.clone(), update_keys.iter().copied(), reducer);
    if let Some(condition) = delete_condition {
        update = update.delete_when(move |draft| condition(draft));
    }
    update.run().await
}

/// A typed view over a fixed set of record fields.
///
/// Members missing from the record must deserialize, so implementors
/// normally carry `#[serde(default)]`.
pub trait Projection: Serialize + DeserializeOwned + Default + Send + Sync {
    const FIELDS: &'static [&'static str];
}

/// Optimistic update whose reducer works on a typed projection instead of a
/// raw draft. Returns the projection as stored afterwards.
pub async fn optimistic_update_typed<T, F>(
    table: &Table,
    key: &RecordKey,
    policy: BackoffPolicy,
    reducer: F,
) -> Result<T>
where
    T: Projection,
    F: Fn(&mut T) -> Result<()> + Send + Sync,
{
    let outcome = OptimisticUpdate::new(table, key.clone(), T::FIELDS.iter().copied(), |draft| {
        let mut value = decode_projection::<T>(draft.fields())?;
        reducer(&mut value)?;
        let encoded = to_fields(&value)?;
        for field in T::FIELDS {
            match encoded.get(*field) {
                Some(v) => draft.set(field, v.clone())?,
                None => {
                    draft.remove(field)?;
                }
            }
        }
        Ok(())
    })
    .policy(policy)
    .run()
    .await?;

    match outcome.into_fields() {
        Some(fields) => decode_projection(&fields),
        None => Ok(T::default()),
    }
}

fn decode_projection<T: Projection>(fields: &Fields) -> Result<T> {
    if fields.is_empty() {
        return Ok(T::default());
    }
    from_fields(fields)
}
