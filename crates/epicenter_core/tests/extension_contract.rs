//! Exercises the extension and provider contracts from the consumer side:
//! synchronous factories, readiness futures, exported capabilities, LIFO
//! teardown, and reconstruction of state from the raw update stream — the
//! shape a persistence extension actually takes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_lite::future::block_on;
use serde::{Deserialize, Serialize};
use yrs::Transact;
use yrs::updates::decoder::Decode;

use epicenter_core::schema::RowRecord;
use epicenter_core::{
    ContentDocPool, GetResult, Lifecycle, ProviderLifecycle, TypedSchema, WorkspaceDefinition,
    create_workspace,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: String,
    body: String,
}

impl RowRecord for Note {
    fn row_id(&self) -> &str {
        &self.id
    }
}

fn note(id: &str, body: &str) -> Note {
    Note {
        id: id.to_string(),
        body: body.to_string(),
    }
}

/// The shape a persistence extension exports: the captured update log plus a
/// `clear_data` capability.
struct MemoryPersistence {
    updates: Arc<Mutex<Vec<Vec<u8>>>>,
    _sub: yrs::Subscription,
}

impl MemoryPersistence {
    fn snapshot(&self) -> Vec<Vec<u8>> {
        self.updates.lock().unwrap().clone()
    }

    fn clear_data(&self) {
        self.updates.lock().unwrap().clear();
    }
}

fn with_memory_persistence(
    definition: WorkspaceDefinition,
) -> epicenter_core::Result<epicenter_core::WorkspaceClient> {
    Ok(create_workspace(definition)
        .with_extension("persistence", |ctx| {
            let updates: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&updates);
            let sub = ctx
                .doc
                .observe_update_v1(move |_txn, event| {
                    sink.lock().unwrap().push(event.update.clone());
                })
                .expect("Failed to observe document updates");
            Ok(Lifecycle::with_exports(MemoryPersistence { updates, _sub: sub })
                .on_ready(async { Ok(()) }))
        })?
        .build())
}

#[test]
fn persistence_extension_replays_into_fresh_client() {
    block_on(async {
        let client = with_memory_persistence(WorkspaceDefinition::new("ws")).unwrap();
        client.when_ready().await.unwrap();

        let notes = client.table("notes", TypedSchema::<Note>::new());
        notes.set(vec![note("n1", "first"), note("n2", "second")]).unwrap();
        notes.set(note("n1", "first, edited")).unwrap();
        notes.delete("n2".to_string());

        let log = client
            .extensions()
            .get::<MemoryPersistence>("persistence")
            .unwrap()
            .snapshot();
        assert!(!log.is_empty());

        // A cold start replays the captured update log and converges to the
        // same state.
        let restored = create_workspace(WorkspaceDefinition::new("ws")).build();
        for update in &log {
            restored.apply_update(update).unwrap();
        }
        let restored_notes = restored.table("notes", TypedSchema::<Note>::new());
        assert!(matches!(
            restored_notes.get("n1"),
            GetResult::Valid(row) if row.body == "first, edited"
        ));
        assert!(restored_notes.get("n2").is_not_found());
        assert_eq!(restored_notes.count(), 1);
    });
}

#[test]
fn persistence_extension_clear_data() {
    let client = with_memory_persistence(WorkspaceDefinition::new("ws")).unwrap();
    let notes = client.table("notes", TypedSchema::<Note>::new());
    notes.set(note("n1", "body")).unwrap();

    let persistence = client
        .extensions()
        .get::<MemoryPersistence>("persistence")
        .unwrap();
    assert!(!persistence.snapshot().is_empty());

    persistence.clear_data();
    assert!(persistence.snapshot().is_empty());
}

#[test]
fn extensions_destroy_in_reverse_order_of_registration() {
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let o1 = Arc::clone(&order);
    let o2 = Arc::clone(&order);
    let o3 = Arc::clone(&order);

    let client = create_workspace(WorkspaceDefinition::new("ws"))
        .with_extension("persistence", move |_ctx| {
            Ok(Lifecycle::new().on_destroy(move || {
                o1.lock().unwrap().push("persistence");
                async {}
            }))
        })
        .unwrap()
        .with_extension("sync", move |_ctx| {
            Ok(Lifecycle::new().on_destroy(move || {
                o2.lock().unwrap().push("sync");
                async {}
            }))
        })
        .unwrap()
        .with_extension("presence", move |_ctx| {
            Ok(Lifecycle::new().on_destroy(move || {
                o3.lock().unwrap().push("presence");
                async {}
            }))
        })
        .unwrap()
        .build();

    block_on(client.destroy());
    assert_eq!(
        *order.lock().unwrap(),
        vec!["presence", "sync", "persistence"]
    );
}

/// A content-doc provider that persists the update stream per file and
/// replays it on the next materialization — the provider-side counterpart of
/// the workspace persistence extension.
#[test]
fn content_provider_persists_and_replays() {
    block_on(async {
        type UpdateStore = Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>;
        let store: UpdateStore = Arc::new(Mutex::new(HashMap::new()));

        let factory_store = Arc::clone(&store);
        let pool = ContentDocPool::new().with_provider(move |ctx| {
            // Replay whatever this file persisted before.
            if let Some(stored) = factory_store.lock().unwrap().get(ctx.file_id) {
                let mut txn = ctx.doc.transact_mut();
                for update in stored {
                    let decoded = yrs::Update::decode_v1(update).expect("persisted update decodes");
                    txn.apply_update(decoded).expect("persisted update applies");
                }
            }
            // Capture everything from here on.
            let sink = Arc::clone(&factory_store);
            let file_id = ctx.file_id.to_string();
            let sub = ctx
                .doc
                .observe_update_v1(move |_txn, event| {
                    sink.lock()
                        .unwrap()
                        .entry(file_id.clone())
                        .or_default()
                        .push(event.update.clone());
                })
                .expect("Failed to observe document updates");
            Ok(ProviderLifecycle::new().on_destroy(move || {
                drop(sub);
                async {}
            }))
        });

        let doc = pool.ensure("f1").await.unwrap();
        doc.write_text("durable content");
        doc.write_binary(&[1, 2, 3]);
        pool.destroy("f1").await;

        // A fresh materialization replays the full timeline, history intact.
        let restored = pool.ensure("f1").await.unwrap();
        assert_eq!(restored.version_count(), 2);
        assert_eq!(restored.read_bytes(), vec![1, 2, 3]);
        assert_eq!(restored.bytes_at(0), Some(b"durable content".to_vec()));
    });
}

#[test]
fn provider_readiness_gates_ensure() {
    block_on(async {
        let readiness_order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let in_factory = Arc::clone(&readiness_order);
        let in_ready = Arc::clone(&readiness_order);
        let ensured = Arc::new(AtomicUsize::new(0));
        let ensured_count = Arc::clone(&ensured);

        let pool = ContentDocPool::new().with_provider(move |_ctx| {
            in_factory.lock().unwrap().push("factory");
            let in_ready = Arc::clone(&in_ready);
            Ok(ProviderLifecycle::new().on_ready(async move {
                in_ready.lock().unwrap().push("ready");
                Ok(())
            }))
        });

        pool.ensure("f1").await.unwrap();
        ensured_count.fetch_add(1, Ordering::SeqCst);

        // The factory runs synchronously, readiness resolves before `ensure`
        // returns.
        assert_eq!(*readiness_order.lock().unwrap(), vec!["factory", "ready"]);
        assert_eq!(ensured.load(Ordering::SeqCst), 1);
    });
}
