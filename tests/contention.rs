use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use worldstore::clock::TokioSleeper;
use worldstore::record::FieldUpdate;
use worldstore::{
    AttrValue, BackoffPolicy, CoordinationConfig, MemoryStore, RecordKey, TransactionBuilder,
    WorldStore, optimistic_update, retry_transient,
};

fn contention_config() -> CoordinationConfig {
    CoordinationConfig {
        optimistic_max_attempts: 200,
        ..CoordinationConfig::development()
    }
}

fn open() -> (Arc<MemoryStore>, WorldStore) {
    let store = Arc::new(MemoryStore::new());
    let world = WorldStore::open(store.clone(), contention_config()).expect("open world store");
    (store, world)
}

/// Concurrent appends to one list field converge: every id lands exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_converge_without_loss() {
    let (store, world) = open();
    let key = RecordKey::new("SESSION#hot", "Meta");
    let mut tasks = JoinSet::new();

    for i in 0..32 {
        let world = world.clone();
        let key = key.clone();
        tasks.spawn(async move {
            let table = world.table("sessions");
            let connection = format!("conn-{i}");
            world
                .optimistic(&table, key, ["connections"], move |draft| {
                    draft
                        .list_push_unique("connections", connection.as_str())
                        .map(|_| ())
                })
                .run()
                .await
                .expect("append converges")
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task");
    }

    let fields = store.peek("sessions", &key).expect("record created");
    let list = fields
        .get("connections")
        .and_then(AttrValue::as_list)
        .expect("connections list");
    let ids: BTreeSet<&str> = list.iter().filter_map(AttrValue::as_text).collect();
    assert_eq!(list.len(), 32, "no duplicates");
    assert_eq!(ids.len(), 32, "no lost appends");
}

/// Two concurrent pairs of optimistic updates on the same record both land.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_writers_both_land() {
    let (store, world) = open();
    let key = RecordKey::new("ROOM#hall", "Meta");
    let table = Arc::new(world.table("rooms"));

    let left = {
        let table = table.clone();
        let key = key.clone();
        tokio::spawn(async move {
            optimistic_update(
                &table,
                &key,
                &["occupants"],
                |draft| draft.list_push_unique("occupants", "alice").map(|_| ()),
                None,
            )
            .await
        })
    };
    let right = {
        let table = table.clone();
        let key = key.clone();
        tokio::spawn(async move {
            optimistic_update(
                &table,
                &key,
                &["occupants"],
                |draft| draft.list_push_unique("occupants", "bob").map(|_| ()),
                None,
            )
            .await
        })
    };
    left.await.expect("join").expect("alice lands");
    right.await.expect("join").expect("bob lands");

    let fields = store.peek("rooms", &key).expect("room");
    let occupants: BTreeSet<&str> = fields
        .get("occupants")
        .and_then(AttrValue::as_list)
        .expect("occupants")
        .iter()
        .filter_map(AttrValue::as_text)
        .collect();
    assert_eq!(occupants, BTreeSet::from(["alice", "bob"]));
}

/// The lock serializes a read-then-blind-write critical section.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_serializes_unguarded_read_modify_write() {
    let (store, world) = open();
    let key = RecordKey::new("ASSET#castle", "Meta");
    let counter_key = RecordKey::new("ASSET#castle", "Counter");
    let locks = Arc::new(world.lock_manager("assets"));
    let table = world.table("assets");
    let mut tasks = JoinSet::new();

    for _ in 0..8 {
        let locks = locks.clone();
        let table = table.clone();
        let key = key.clone();
        let counter_key = counter_key.clone();
        tasks.spawn(async move {
            let (table, counter_key) = (&table, &counter_key);
            locks
                .with_lock(&key, || async move {
                    let current = table
                        .get(&counter_key, None)
                        .await?
                        .and_then(|fields| fields.get("count").and_then(AttrValue::as_number))
                        .unwrap_or(0);
                    tokio::task::yield_now().await;
                    table
                        .update(
                            &counter_key,
                            FieldUpdate::default().set("count", current + 1),
                            None,
                        )
                        .await
                })
                .await
                .expect("locked increment")
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task");
    }

    let count = store
        .peek("assets", &counter_key)
        .and_then(|fields| fields.get("count").and_then(AttrValue::as_number));
    assert_eq!(count, Some(8));
    let state = locks.inspect(&key).await.expect("inspect");
    assert!(state.queue.is_empty());
}

/// Transaction groups racing on the same records are retried by the caller
/// with fresh reads until every transfer commits.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_transactions_retry_at_call_site() {
    let (store, world) = open();
    let from = RecordKey::new("SESSION#a", "Meta");
    let to = RecordKey::new("SESSION#b", "Meta");
    let coordinator = world.transactions();
    let policy = BackoffPolicy {
        max_attempts: 100,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        multiplier: 2,
        jitter: true,
    };
    let mut tasks = JoinSet::new();

    for i in 0..10 {
        let coordinator = coordinator.clone();
        let policy = policy.clone();
        let from = from.clone();
        let to = to.clone();
        tasks.spawn(async move {
            let connection = format!("conn-{i}");
            retry_transient(&policy, &TokioSleeper, |_| {
                TransactionBuilder::new()
                    .update("sessions", from.clone(), ["moved"], |draft| {
                        let moved = draft.number("moved").unwrap_or(0);
                        draft.set("moved", moved + 1)
                    })
                    .update("sessions", to.clone(), ["connections"], {
                        let connection = connection.clone();
                        move |draft| {
                            draft
                                .list_push_unique("connections", connection.as_str())
                                .map(|_| ())
                        }
                    })
                    .commit(&coordinator)
            })
            .await
            .expect("transfer commits")
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task");
    }

    let moved = store
        .peek("sessions", &from)
        .and_then(|fields| fields.get("moved").and_then(AttrValue::as_number));
    assert_eq!(moved, Some(10));
    let received = store
        .peek("sessions", &to)
        .and_then(|fields| fields.get("connections").and_then(|v| v.as_list().map(<[_]>::len)));
    assert_eq!(received, Some(10));
}
