use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tokio::runtime::Runtime;
use worldstore::{
    AttrValue, CoordinationConfig, Fields, MemoryStore, Record, RecordKey, TransactionBuilder,
    WorldStore, invitation_code, optimistic_update,
};

const SEEDED_SESSIONS: u64 = 1_000;
const LIST_LEN: usize = 32;

fn session_key(id: u64) -> RecordKey {
    RecordKey::new(format!("SESSION#{id}"), "Meta")
}

fn setup_world() -> WorldStore {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=SEEDED_SESSIONS {
        let mut fields = Fields::new();
        fields.insert(
            "connections".into(),
            AttrValue::List(
                (0..LIST_LEN)
                    .map(|n| AttrValue::from(format!("conn-{id}-{n}")))
                    .collect(),
            ),
        );
        fields.insert("moved".into(), AttrValue::Number(0));
        store.insert_raw("sessions", Record::new(session_key(id), fields));
    }
    WorldStore::open(store, CoordinationConfig::development()).expect("open")
}

fn bench_coordination_hot_paths(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let world = setup_world();
    let sessions = world.table("sessions");

    let mut next_session = 1_u64;
    c.bench_function("optimistic_toggle_list_member", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = black_box(next_session);
                next_session = next_session % SEEDED_SESSIONS + 1;
                let extra = format!("extra-{id}");
                optimistic_update(
                    &sessions,
                    &session_key(id),
                    &["connections"],
                    |draft| {
                        let value = AttrValue::from(extra.as_str());
                        if !draft.list_remove("connections", &value)? {
                            draft.list_push_unique("connections", value)?;
                        }
                        Ok(())
                    },
                    None,
                )
                .await
                .expect("optimistic update");
            });
        })
    });

    c.bench_function("optimistic_noop_read_only", |b| {
        b.iter(|| {
            rt.block_on(async {
                optimistic_update(
                    &sessions,
                    &session_key(black_box(1)),
                    &["connections"],
                    |_| Ok(()),
                    None,
                )
                .await
                .expect("noop update");
            });
        })
    });

    let locks = world.lock_manager("sessions");
    c.bench_function("lock_acquire_release_uncontended", |b| {
        b.iter(|| {
            rt.block_on(async {
                let key = session_key(black_box(2));
                let id = locks.acquire(&key).await.expect("acquire");
                locks.release(&key, &id).await.expect("release");
            });
        })
    });

    let coordinator = world.transactions();
    let mut next_pair = 1_u64;
    c.bench_function("transact_two_record_move", |b| {
        b.iter(|| {
            rt.block_on(async {
                let from = black_box(next_pair);
                let to = from % SEEDED_SESSIONS + 1;
                next_pair = to;
                TransactionBuilder::new()
                    .update("sessions", session_key(from), ["moved"], |draft| {
                        let moved = draft.number("moved").unwrap_or(0);
                        draft.set("moved", moved + 1)
                    })
                    .update("sessions", session_key(to), ["moved"], |draft| {
                        let moved = draft.number("moved").unwrap_or(0);
                        draft.set("moved", moved - 1)
                    })
                    .commit(&coordinator)
                    .await
                    .expect("transact");
            });
        })
    });

    let allocator = world.allocator("invites");
    c.bench_function("allocate_invitation_code", |b| {
        b.iter(|| {
            rt.block_on(async {
                allocator
                    .allocate(
                        |_| RecordKey::new(format!("INVITE#{}", invitation_code(10)), "Meta"),
                        |_| Fields::new(),
                    )
                    .await
                    .expect("allocate");
            });
        })
    });
}

criterion_group!(benches, bench_coordination_hot_paths);
criterion_main!(benches);
