use crate::clock::{Clock, IdGenerator, Sleeper, SystemClock, TokioSleeper, UuidIdGenerator};
use crate::config::CoordinationConfig;
use crate::error::{Result, StoreError};
use crate::optimistic::{Draft, OptimisticUpdate, UpdateOutcome};
use crate::record::{AttrValue, Fields, RecordKey};
use crate::retry::BackoffPolicy;
use crate::store::Table;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Ordered list of waiting lock ids; the head holds the lock.
pub const LOCK_QUEUE_FIELD: &str = "atomicLocks";
/// Lease expiry of the queue head, in epoch milliseconds.
pub const LEASE_FIELD: &str = "timeToUnlock";

const LOCK_FIELDS: [&str; 2] = [LOCK_QUEUE_FIELD, LEASE_FIELD];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId(String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lock queue and lease as stored on the guarded record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockState {
    pub queue: Vec<String>,
    pub time_to_unlock: Option<u64>,
}

impl LockState {
    pub fn from_fields(fields: &Fields) -> Self {
        let queue = fields
            .get(LOCK_QUEUE_FIELD)
            .and_then(AttrValue::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_text().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let time_to_unlock = fields
            .get(LEASE_FIELD)
            .and_then(AttrValue::as_number)
            .map(|ms| ms.max(0) as u64);
        Self {
            queue,
            time_to_unlock,
        }
    }

    fn from_draft(draft: &Draft) -> Self {
        Self::from_fields(draft.fields())
    }

    pub fn head(&self) -> Option<&str> {
        self.queue.first().map(String::as_str)
    }

    /// A queued head without a recorded lease counts as expired, so a
    /// damaged record can never wedge the queue.
    pub fn lease_expired(&self, now_ms: u64) -> bool {
        match self.time_to_unlock {
            Some(deadline) => now_ms > deadline,
            None => !self.queue.is_empty(),
        }
    }

    /// The id presumed to hold the lock at `now_ms`, if any.
    pub fn holder(&self, now_ms: u64) -> Option<&str> {
        self.head().filter(|_| !self.lease_expired(now_ms))
    }
}

/// Lease-based mutual exclusion over a record's lock-queue fields.
///
/// Waiters append themselves to the queue and poll until they reach its
/// head. A head whose lease has lapsed is evicted by the next waiter that
/// notices, which bounds how long a crashed holder can block the queue to
/// one lease plus one poll interval. Every queue change is an optimistic
/// update, so no two waiters can corrupt the queue.
pub struct LockManager {
    table: Table,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    sleeper: Arc<dyn Sleeper>,
    lease_duration: Duration,
    poll_interval: Duration,
    update_policy: BackoffPolicy,
}

impl LockManager {
    pub fn new(table: Table, config: &CoordinationConfig) -> Self {
        Self {
            table,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidIdGenerator),
            sleeper: Arc::new(TokioSleeper),
            lease_duration: config.lease_duration(),
            poll_interval: config.lock_poll_interval(),
            update_policy: config.optimistic_backoff(),
        }
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

    pub fn with_update_policy(mut self, policy: BackoffPolicy) -> Self {
        self.update_policy = policy;
        self
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Waits until the lock on `key` is granted. Contention on the queue never
    /// fails the call, only store errors do; use
    /// [`acquire_with_timeout`](Self::acquire_with_timeout) for a bound.
    pub async fn acquire(&self, key: &RecordKey) -> Result<LockId> {
        self.acquire_until(key, None).await
    }

    /// Like `acquire`, but withdraws from the queue and fails with
    /// `LockAcquireTimedOut` once `wait` has elapsed on the manager's clock.
    pub async fn acquire_with_timeout(&self, key: &RecordKey, wait: Duration) -> Result<LockId> {
        let deadline = self.clock.now_ms().saturating_add(wait.as_millis() as u64);
        self.acquire_until(key, Some(deadline)).await
    }

    /// Any failure after the id may have been queued withdraws it again, so
    /// a waiter that gave up never becomes head.
    async fn acquire_until(&self, key: &RecordKey, deadline: Option<u64>) -> Result<LockId> {
        let id = LockId(self.ids.next_id());
        match self.wait_for_grant(key, &id, deadline).await {
            Ok(()) => {
                debug!(table = self.table.name(), key = %key, lock_id = %id, "lock acquired");
                Ok(id)
            }
            Err(err) => {
                if let Err(release_err) = self.release(key, &id).await {
                    warn!(
                        table = self.table.name(),
                        key = %key,
                        lock_id = %id,
                        error = %release_err,
                        "failed to withdraw abandoned lock id"
                    );
                }
                Err(err)
            }
        }
    }

    /// Polls until `id` heads the queue. A queue change that loses every
    /// optimistic attempt is not a failure: the waiter polls and tries again.
    async fn wait_for_grant(
        &self,
        key: &RecordKey,
        id: &LockId,
        deadline: Option<u64>,
    ) -> Result<()> {
        let mut state = self.contended(key, self.enqueue(key, id).await)?;
        loop {
            if let Some(current) = state.take() {
                match current.head() {
                    Some(head) if head == id.as_str() => return Ok(()),
                    Some(head) if current.lease_expired(self.clock.now_ms()) => {
                        state = self.contended(key, self.evict(key, head).await)?;
                        continue;
                    }
                    _ if !current.queue.iter().any(|q| q == id.as_str()) => {
                        state = self.contended(key, self.enqueue(key, id).await)?;
                        continue;
                    }
                    _ => {}
                }
            }

            if deadline.is_some_and(|d| self.clock.now_ms() >= d) {
                warn!(table = self.table.name(), key = %key, lock_id = %id, "lock wait timed out");
                return Err(StoreError::LockAcquireTimedOut {
                    table: self.table.name().to_string(),
                    key: key.clone(),
                });
            }
            self.sleeper.sleep(self.poll_interval).await;
            state = Some(self.inspect(key).await?);
        }
    }

    /// `None` when the queue change ran out of optimistic attempts.
    fn contended(&self, key: &RecordKey, result: Result<LockState>) -> Result<Option<LockState>> {
        match result {
            Ok(state) => Ok(Some(state)),
            Err(StoreError::ConflictExhausted { attempts, .. }) => {
                debug!(table = self.table.name(), key = %key, attempts, "lock queue contended, polling again");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Removes `id` from the queue. When the head releases, the next waiter
    /// starts a fresh lease; when the queue empties, both lock fields go.
    /// Releasing an id that is not queued is a no-op.
    pub async fn release(&self, key: &RecordKey, id: &LockId) -> Result<()> {
        let outcome = self
            .update(key, |draft| {
                let state = LockState::from_draft(draft);
                let was_head = state.head() == Some(id.as_str());
                if !draft.list_remove(LOCK_QUEUE_FIELD, &AttrValue::from(id.as_str()))? {
                    return Ok(());
                }
                if draft.list(LOCK_QUEUE_FIELD).is_empty() {
                    draft.remove(LOCK_QUEUE_FIELD)?;
                    draft.remove(LEASE_FIELD)?;
                } else if was_head {
                    draft.set(LEASE_FIELD, self.lease_deadline())?;
                }
                Ok(())
            })
            .await?;
        if outcome.wrote() {
            debug!(table = self.table.name(), key = %key, lock_id = %id, "lock released");
        }
        Ok(())
    }

    /// Extends the lease when `id` is the current head. Returns whether the
    /// lease was renewed.
    pub async fn renew(&self, key: &RecordKey, id: &LockId) -> Result<bool> {
        let outcome = self
            .update(key, |draft| {
                if LockState::from_draft(draft).head() == Some(id.as_str()) {
                    draft.set(LEASE_FIELD, self.lease_deadline())?;
                }
                Ok(())
            })
            .await?;
        Ok(outcome
            .fields()
            .map(LockState::from_fields)
            .is_some_and(|state| state.head() == Some(id.as_str())))
    }

    /// Runs `f` while holding the lock on `key`, releasing it afterwards
    /// whether or not `f` succeeded.
    pub async fn with_lock<T, F, Fut>(&self, key: &RecordKey, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = self.acquire(key).await?;
        let result = f().await;
        let released = self.release(key, &id).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(
                    table = self.table.name(),
                    key = %key,
                    lock_id = %id,
                    error = %release_err,
                    "lock release failed after locked section failed"
                );
                Err(err)
            }
        }
    }

    /// Fresh read of the lock fields.
    pub async fn inspect(&self, key: &RecordKey) -> Result<LockState> {
        let projection: Vec<String> = LOCK_FIELDS.iter().map(|f| f.to_string()).collect();
        Ok(self
            .table
            .get(key, Some(&projection))
            .await?
            .map(|fields| LockState::from_fields(&fields))
            .unwrap_or_default())
    }

    async fn enqueue(&self, key: &RecordKey, id: &LockId) -> Result<LockState> {
        let outcome = self
            .update(key, |draft| {
                let state = LockState::from_draft(draft);
                draft.list_push_unique(LOCK_QUEUE_FIELD, id.as_str())?;
                if state.queue.is_empty() || state.time_to_unlock.is_none() {
                    draft.set(LEASE_FIELD, self.lease_deadline())?;
                }
                Ok(())
            })
            .await?;
        debug!(table = self.table.name(), key = %key, lock_id = %id, "lock id enqueued");
        Ok(outcome
            .fields()
            .map(LockState::from_fields)
            .unwrap_or_default())
    }

    /// Drops `expected_head` if it is still the head and its lease is still
    /// lapsed when the eviction is applied; otherwise changes nothing.
    async fn evict(&self, key: &RecordKey, expected_head: &str) -> Result<LockState> {
        let outcome = self
            .update(key, |draft| {
                let state = LockState::from_draft(draft);
                if state.head() != Some(expected_head)
                    || !state.lease_expired(self.clock.now_ms())
                {
                    return Ok(());
                }
                draft.list_remove(LOCK_QUEUE_FIELD, &AttrValue::from(expected_head))?;
                if draft.list(LOCK_QUEUE_FIELD).is_empty() {
                    draft.remove(LOCK_QUEUE_FIELD)?;
                    draft.remove(LEASE_FIELD)?;
                } else {
                    draft.set(LEASE_FIELD, self.lease_deadline())?;
                }
                Ok(())
            })
            .await?;
        if outcome.wrote() {
            warn!(
                table = self.table.name(),
                key = %key,
                evicted = expected_head,
                "evicted lock holder with expired lease"
            );
        }
        Ok(outcome
            .fields()
            .map(LockState::from_fields)
            .unwrap_or_default())
    }

    async fn update<F>(&self, key: &RecordKey, reducer: F) -> Result<UpdateOutcome>
    where
        F: Fn(&mut Draft) -> Result<()> + Send + Sync,
    {
        OptimisticUpdate::new(&self.table, key.clone(), LOCK_FIELDS, reducer)
            .policy(self.update_policy.clone())
            .sleeper(self.sleeper.clone())
            .run()
            .await
    }

    fn lease_deadline(&self) -> u64 {
        self.clock
            .now_ms()
            .saturating_add(self.lease_duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::{LEASE_FIELD, LOCK_QUEUE_FIELD, LockManager, LockState};
    use crate::clock::{Clock, ClockSleeper, ManualClock, ScriptedIdGenerator, Sleeper};
    use crate::config::CoordinationConfig;
    use crate::record::{AttrValue, FieldUpdate, Fields, Record, RecordKey};
    use crate::retry::BackoffPolicy;
    use crate::store::{MemoryStore, Table};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn manager(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>, ids: &[&str]) -> LockManager {
        LockManager::new(
            Table::new(store.clone(), "assets"),
            &CoordinationConfig::default(),
        )
        .with_clock(clock.clone())
        .with_sleeper(Arc::new(ClockSleeper::new(clock.clone())))
        .with_ids(Arc::new(ScriptedIdGenerator::new(ids.iter().copied())))
        .with_update_policy(BackoffPolicy::immediate(5))
    }

    fn asset() -> RecordKey {
        RecordKey::new("ASSET#castle", "Meta")
    }

    fn seed_queue(store: &MemoryStore, queue: &[&str], lease: i64) {
        let mut fields = Fields::new();
        fields.insert(
            LOCK_QUEUE_FIELD.into(),
            AttrValue::List(queue.iter().map(|id| AttrValue::from(*id)).collect()),
        );
        fields.insert(LEASE_FIELD.into(), AttrValue::Number(lease));
        store.insert_raw("assets", Record::new(asset(), fields));
    }

    /// Starts a store outage covering exactly one call, then advances time.
    struct OutageSleeper {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl Sleeper for OutageSleeper {
        async fn sleep(&self, duration: Duration) {
            self.store.fail_next_calls(1);
            self.clock.advance(duration);
        }
    }

    #[test]
    fn lock_state_reads_queue_and_lease() {
        let mut fields = Fields::new();
        fields.insert(
            LOCK_QUEUE_FIELD.into(),
            AttrValue::List(vec!["A".into(), "B".into()]),
        );
        fields.insert(LEASE_FIELD.into(), AttrValue::Number(6_000));
        let state = LockState::from_fields(&fields);
        assert_eq!(state.head(), Some("A"));
        assert_eq!(state.holder(6_000), Some("A"));
        assert_eq!(state.holder(6_001), None);
        assert!(LockState::default().holder(0).is_none());
    }

    #[tokio::test]
    async fn uncontended_acquire_sets_lease_and_release_clears_fields() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_000);
        let locks = manager(&store, &clock, &["A"]);

        let id = locks.acquire(&asset()).await.expect("acquire");
        assert_eq!(id.as_str(), "A");
        let state = locks.inspect(&asset()).await.expect("inspect");
        assert_eq!(state.queue, vec!["A".to_string()]);
        assert_eq!(state.time_to_unlock, Some(6_000));

        locks.release(&asset(), &id).await.expect("release");
        let fields = store.peek("assets", &asset()).expect("record kept");
        assert!(!fields.contains_key(LOCK_QUEUE_FIELD));
        assert!(!fields.contains_key(LEASE_FIELD));
    }

    #[tokio::test]
    async fn lock_fields_do_not_disturb_other_record_fields() {
        let store = Arc::new(MemoryStore::new());
        let mut fields = Fields::new();
        fields.insert("name".into(), AttrValue::from("Castle"));
        store.insert_raw("assets", Record::new(asset(), fields));
        let clock = ManualClock::new(0);
        let locks = manager(&store, &clock, &["A"]);

        let id = locks.acquire(&asset()).await.expect("acquire");
        locks.release(&asset(), &id).await.expect("release");
        let fields = store.peek("assets", &asset()).expect("record kept");
        assert_eq!(fields.get("name"), Some(&AttrValue::from("Castle")));
    }

    #[tokio::test]
    async fn renew_extends_only_the_head() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_000);
        let locks = manager(&store, &clock, &["A"]);
        let id = locks.acquire(&asset()).await.expect("acquire");

        clock.set(4_000);
        assert!(locks.renew(&asset(), &id).await.expect("renew"));
        assert_eq!(
            locks.inspect(&asset()).await.expect("inspect").time_to_unlock,
            Some(9_000)
        );
        assert!(
            !locks
                .renew(&asset(), &super::LockId::new("stranger"))
                .await
                .expect("renew")
        );
    }

    #[tokio::test]
    async fn timeout_withdraws_waiter_from_queue() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_000);
        let holder = manager(&store, &clock, &["A"]);
        let waiter = manager(&store, &clock, &["B"]);

        holder.acquire(&asset()).await.expect("holder acquires");
        let err = waiter
            .acquire_with_timeout(&asset(), Duration::from_millis(1_000))
            .await
            .expect_err("lease still valid for 5s");
        assert_eq!(err.code_str(), "lock_acquire_timed_out");

        let state = holder.inspect(&asset()).await.expect("inspect");
        assert_eq!(state.queue, vec!["A".to_string()]);
        assert_eq!(state.time_to_unlock, Some(6_000));
    }

    #[tokio::test]
    async fn with_lock_releases_after_failure() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(0);
        let locks = manager(&store, &clock, &["A"]);

        let err = locks
            .with_lock(&asset(), || async {
                Err::<(), _>(crate::error::StoreError::Validation("draft invalid".into()))
            })
            .await
            .expect_err("section fails");
        assert_eq!(err.code_str(), "validation");
        assert!(locks.inspect(&asset()).await.expect("inspect").queue.is_empty());
    }

    #[tokio::test]
    async fn eviction_removes_only_the_expired_head() {
        let store = Arc::new(MemoryStore::new());
        seed_queue(&store, &["A", "B", "C"], 6_000);
        let clock = ManualClock::new(8_000);
        let b = manager(&store, &clock, &["B"]);

        let id = b.acquire(&asset()).await.expect("B takes over from A");
        assert_eq!(id.as_str(), "B");
        let state = b.inspect(&asset()).await.expect("inspect");
        assert_eq!(state.queue, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(state.time_to_unlock, Some(13_000));

        let c = manager(&store, &clock, &["C"]);
        let err = c
            .acquire_with_timeout(&asset(), Duration::from_millis(1_000))
            .await
            .expect_err("B's fresh lease holds");
        assert_eq!(err.code_str(), "lock_acquire_timed_out");
        let state = b.inspect(&asset()).await.expect("inspect");
        assert_eq!(state.queue, vec!["B".to_string()]);
        assert_eq!(state.time_to_unlock, Some(13_000));
    }

    #[tokio::test]
    async fn racing_evictions_remove_the_head_once() {
        let store = Arc::new(MemoryStore::new());
        seed_queue(&store, &["A", "B", "C"], 6_000);
        let clock = ManualClock::new(8_000);
        let c = manager(&store, &clock, &["C"]);

        let fired = Arc::new(AtomicBool::new(false));
        let hook_fired = fired.clone();
        store.set_write_hook(Some(Arc::new(
            move |store: &MemoryStore, table: &str, key: &RecordKey| {
                if !hook_fired.swap(true, Ordering::SeqCst) {
                    store.update_raw(
                        table,
                        key,
                        &FieldUpdate::default()
                            .set(
                                LOCK_QUEUE_FIELD,
                                vec![AttrValue::from("B"), AttrValue::from("C")],
                            )
                            .set(LEASE_FIELD, 13_000_u64),
                    );
                }
            },
        )));

        let state = c.evict(&asset(), "A").await.expect("evict");
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(state.queue, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(state.time_to_unlock, Some(13_000));

        let again = c.evict(&asset(), "A").await.expect("second evict");
        assert_eq!(again, state);
    }

    #[tokio::test]
    async fn exhausted_enqueue_keeps_waiting_instead_of_failing() {
        let store = Arc::new(MemoryStore::new());
        seed_queue(&store, &["A"], 2_000);
        let clock = ManualClock::new(1_000);
        let b = manager(&store, &clock, &["B"]);

        let bumps = Arc::new(AtomicU32::new(0));
        let hook_bumps = bumps.clone();
        store.set_write_hook(Some(Arc::new(
            move |store: &MemoryStore, table: &str, key: &RecordKey| {
                let n = hook_bumps.fetch_add(1, Ordering::SeqCst);
                if n < 12 {
                    store.update_raw(
                        table,
                        key,
                        &FieldUpdate::default().set(LEASE_FIELD, 2_001 + u64::from(n)),
                    );
                }
            },
        )));

        let id = b.acquire(&asset()).await.expect("contention is not fatal");
        assert_eq!(id.as_str(), "B");
        assert!(bumps.load(Ordering::SeqCst) > 12);
        assert!(clock.now_ms() > 2_012);
        let state = b.inspect(&asset()).await.expect("inspect");
        assert_eq!(state.queue, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn failed_wait_withdraws_the_queued_id() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_000);
        let a = manager(&store, &clock, &["A"]);
        let a_id = a.acquire(&asset()).await.expect("A acquires");

        let b = manager(&store, &clock, &["B"]).with_sleeper(Arc::new(OutageSleeper {
            store: store.clone(),
            clock: clock.clone(),
        }));
        let err = b.acquire(&asset()).await.expect_err("poll hits the outage");
        assert_eq!(err.code_str(), "store_unavailable");
        let state = a.inspect(&asset()).await.expect("inspect");
        assert_eq!(state.queue, vec!["A".to_string()]);

        a.release(&asset(), &a_id).await.expect("release");
        assert!(a.inspect(&asset()).await.expect("inspect").queue.is_empty());
    }
}
