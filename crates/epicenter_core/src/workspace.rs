//! Workspace client: the process-owned handle to a root CRDT document.
//!
//! A [`WorkspaceClient`] owns the root document and exposes typed tables and
//! kv accessors over it, a workspace-wide [`batch`](WorkspaceClient::batch),
//! and an extension registry populated through the chainable builder:
//!
//! ```ignore
//! let definition = WorkspaceDefinition::new("workspace-guid")
//!     .with_table("posts", TypedSchema::<Post>::new());
//!
//! let client = create_workspace(definition)
//!     .with_extension("persistence", |ctx| {
//!         let posts = ctx.table("posts", TypedSchema::<Post>::new());
//!         let exports = MyPersistence::attach(ctx.doc, posts);
//!         Ok(Lifecycle::with_exports(exports))
//!     })?
//!     .with_actions(|client| MyActions::new(client.id().to_string()))
//!     .build();
//! ```
//!
//! Extension factories are synchronous by contract; asynchronous work belongs
//! behind the lifecycle's `when_ready` future. Each factory receives the
//! client-so-far — id, doc, the typed table/kv accessors, and every
//! previously added extension's exports. Extensions are destroyed in reverse
//! insertion order before the root document is dropped.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::error::{EpicenterError, Result};
use crate::kv::YKeyValueLww;
use crate::kv::batch::TxnQueue;
use crate::schema::{KvSchema, TableSchema};
use crate::store::CellStore;
use crate::table::{KvHelper, TableHelper, table_array_name};

/// Boxed future used across lifecycle boundaries.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type DestroyFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

type Registrar = Box<dyn FnOnce(&WorkspaceClient) + Send>;

/// A workspace definition: the root document guid plus the mappings of table
/// and kv definitions.
///
/// Declared tables and kv values are registered on the client at build time,
/// so extension factories can resolve their typed accessors synchronously
/// through [`ExtensionContext::table`] / [`ExtensionContext::kv`]. Tables not
/// named here can still be created lazily through
/// [`WorkspaceClient::table`] / [`WorkspaceClient::kv`] after build.
pub struct WorkspaceDefinition {
    /// Stable guid of the root document; replicas sharing it converge.
    pub id: String,
    tables: Vec<(String, Registrar)>,
    kv: Vec<(String, Registrar)>,
}

impl WorkspaceDefinition {
    /// Define a workspace with the given document guid.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tables: Vec::new(),
            kv: Vec::new(),
        }
    }

    /// Declare a table and its schema.
    pub fn with_table<S: TableSchema>(mut self, name: impl Into<String>, schema: S) -> Self {
        let name = name.into();
        let table_name = name.clone();
        self.tables.push((
            name,
            Box::new(move |client| {
                client.table(&table_name, schema);
            }),
        ));
        self
    }

    /// Declare a kv value and its schema.
    pub fn with_kv<S: KvSchema>(mut self, name: impl Into<String>, schema: S) -> Self {
        let name = name.into();
        let kv_name = name.clone();
        self.kv.push((
            name,
            Box::new(move |client| {
                client.kv(&kv_name, schema);
            }),
        ));
        self
    }

    /// Names of the declared tables, in declaration order.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Names of the declared kv values, in declaration order.
    pub fn kv_names(&self) -> Vec<&str> {
        self.kv.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl std::fmt::Debug for WorkspaceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceDefinition")
            .field("id", &self.id)
            .field("tables", &self.table_names())
            .field("kv", &self.kv_names())
            .finish()
    }
}

/// What an extension factory returns: readiness, teardown, and exports.
pub struct Lifecycle {
    when_ready: Option<BoxFuture<'static, Result<()>>>,
    destroy: Option<DestroyFn>,
    exports: Box<dyn Any + Send + Sync>,
}

impl Lifecycle {
    /// A lifecycle with no exports, readiness, or teardown.
    pub fn new() -> Self {
        Self {
            when_ready: None,
            destroy: None,
            exports: Box::new(()),
        }
    }

    /// A lifecycle exposing `exports` to later extensions and to the client.
    pub fn with_exports<E: Any + Send + Sync>(exports: E) -> Self {
        Self {
            when_ready: None,
            destroy: None,
            exports: Box::new(exports),
        }
    }

    /// Attach the asynchronous readiness of this extension.
    pub fn on_ready(mut self, fut: impl Future<Output = Result<()>> + Send + 'static) -> Self {
        self.when_ready = Some(Box::pin(fut));
        self
    }

    /// Attach an asynchronous teardown, run at client destroy (LIFO).
    pub fn on_destroy<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.destroy = Some(Box::new(move || Box::pin(f())));
        self
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered registry of extension exports, keyed by the builder key.
#[derive(Default)]
pub struct Extensions {
    entries: Vec<(String, Box<dyn Any + Send + Sync>)>,
}

impl Extensions {
    /// Typed access to an extension's exports.
    pub fn get<E: Any>(&self, key: &str) -> Option<&E> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, exports)| exports.downcast_ref::<E>())
    }

    /// Whether an extension with this key was registered.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Registered keys, in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions").field("keys", &self.keys()).finish()
    }
}

/// The client-so-far context handed to extension factories: id, doc, typed
/// table/kv accessors, and the exports of all previously added extensions.
pub struct ExtensionContext<'a> {
    /// Workspace id (the root document guid)
    pub id: &'a str,
    /// The root CRDT document
    pub doc: &'a Doc,
    /// Exports of all previously registered extensions
    pub extensions: &'a Extensions,
    client: &'a WorkspaceClient,
}

impl ExtensionContext<'_> {
    /// The typed table accessor for `name`, resolved against the in-progress
    /// client. Tables declared in the [`WorkspaceDefinition`] are already
    /// registered; others are created on first use.
    pub fn table<S: TableSchema>(&self, name: &str, schema: S) -> TableHelper<S> {
        self.client.table(name, schema)
    }

    /// The typed kv accessor for `name`, resolved against the in-progress
    /// client.
    pub fn kv<S: KvSchema>(&self, name: &str, schema: S) -> KvHelper<S> {
        self.client.kv(name, schema)
    }
}

/// The running workspace instance.
pub struct WorkspaceClient {
    id: String,
    doc: Doc,
    queue: Arc<TxnQueue>,
    kv_store: YKeyValueLww<Value>,
    tables: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
    kvs: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
    extensions: Extensions,
    ready: Mutex<Vec<BoxFuture<'static, Result<()>>>>,
    destroyers: Mutex<Vec<(String, DestroyFn)>>,
    actions: Option<Box<dyn Any + Send + Sync>>,
    /// Per-store duplicate compaction, run after remote updates land.
    compactors: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
}

/// Start building a workspace client for `definition`. Declared tables and
/// kv values are registered before any extension factory runs.
pub fn create_workspace(definition: WorkspaceDefinition) -> WorkspaceBuilder {
    let WorkspaceDefinition { id, tables, kv } = definition;

    let mut options = Options::default();
    options.guid = id.as_str().into();
    // gc stays on: the LWW stores rely on collapsed tombstones for compact
    // storage under unbounded updates.
    let doc = Doc::with_options(options);
    let queue = Arc::new(TxnQueue::new());
    let kv_store = YKeyValueLww::with_queue(
        &doc,
        "kv",
        Arc::clone(&queue),
        Arc::new(|| chrono::Utc::now().timestamp_millis()),
    );

    let mut compactors: Vec<Box<dyn Fn() + Send + Sync>> = Vec::new();
    {
        let kv = kv_store.clone();
        compactors.push(Box::new(move || kv.flush_cleanup()));
    }

    let client = WorkspaceClient {
        id,
        doc,
        queue,
        kv_store,
        tables: RwLock::new(HashMap::new()),
        kvs: RwLock::new(HashMap::new()),
        extensions: Extensions::default(),
        ready: Mutex::new(Vec::new()),
        destroyers: Mutex::new(Vec::new()),
        actions: None,
        compactors: RwLock::new(compactors),
    };

    for (_, register) in tables {
        register(&client);
    }
    for (_, register) in kv {
        register(&client);
    }

    WorkspaceBuilder { client }
}

/// Chainable builder; every step wraps a fully usable client.
pub struct WorkspaceBuilder {
    client: WorkspaceClient,
}

impl WorkspaceBuilder {
    /// Register an extension. The synchronous `factory` runs immediately
    /// against the client-so-far; its exports become visible to later
    /// factories under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is already taken or the factory fails.
    pub fn with_extension<F>(mut self, key: &str, factory: F) -> Result<Self>
    where
        F: FnOnce(ExtensionContext<'_>) -> Result<Lifecycle>,
    {
        if self.client.extensions.contains(key) {
            return Err(EpicenterError::Extension {
                key: key.to_string(),
                message: "extension key already registered".to_string(),
            });
        }
        let lifecycle = factory(ExtensionContext {
            id: &self.client.id,
            doc: &self.client.doc,
            extensions: &self.client.extensions,
            client: &self.client,
        })?;

        self.client
            .extensions
            .entries
            .push((key.to_string(), lifecycle.exports));
        if let Some(ready) = lifecycle.when_ready {
            self.client.ready.lock().unwrap().push(ready);
        }
        if let Some(destroy) = lifecycle.destroy {
            self.client
                .destroyers
                .lock()
                .unwrap()
                .push((key.to_string(), destroy));
        }
        Ok(self)
    }

    /// Attach typed actions built from the client-so-far; retrieve them later
    /// with [`WorkspaceClient::actions`].
    pub fn with_actions<A: Any + Send + Sync>(
        mut self,
        f: impl FnOnce(&WorkspaceClient) -> A,
    ) -> Self {
        let actions = f(&self.client);
        self.client.actions = Some(Box::new(actions));
        self
    }

    /// Finish the chain and take ownership of the client.
    pub fn build(self) -> WorkspaceClient {
        self.client
    }
}

impl WorkspaceClient {
    /// The workspace id (root document guid).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The root CRDT document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Registered extension exports.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Typed actions attached through the builder, if any.
    pub fn actions<A: Any>(&self) -> Option<&A> {
        self.actions.as_ref().and_then(|a| a.downcast_ref::<A>())
    }

    /// The typed table accessor for `name`, creating its store on first use.
    ///
    /// Accessors are memoized per name; requesting the same table with a
    /// different schema type is a programmer error and panics.
    pub fn table<S: TableSchema>(&self, name: &str, schema: S) -> TableHelper<S> {
        if let Some(existing) = self.tables.read().unwrap().get(name) {
            return existing
                .downcast_ref::<TableHelper<S>>()
                .unwrap_or_else(|| {
                    panic!("table '{}' was registered with a different schema type", name)
                })
                .clone();
        }

        let cells =
            CellStore::with_queue(&self.doc, &table_array_name(name), Arc::clone(&self.queue));
        let helper = TableHelper::with_cells(name, schema, cells);
        {
            let kv = helper.rows().cells().kv().clone();
            self.compactors
                .write()
                .unwrap()
                .push(Box::new(move || kv.flush_cleanup()));
        }
        self.tables
            .write()
            .unwrap()
            .insert(name.to_string(), Box::new(helper.clone()));
        helper
    }

    /// The typed kv accessor for `name`, over the workspace's shared kv
    /// store. Memoized per name; a schema type mismatch panics.
    pub fn kv<S: KvSchema>(&self, name: &str, schema: S) -> KvHelper<S> {
        if let Some(existing) = self.kvs.read().unwrap().get(name) {
            return existing
                .downcast_ref::<KvHelper<S>>()
                .unwrap_or_else(|| {
                    panic!("kv '{}' was registered with a different schema type", name)
                })
                .clone();
        }

        let helper = KvHelper::with_kv(name, schema, self.kv_store.clone());
        self.kvs
            .write()
            .unwrap()
            .insert(name.to_string(), Box::new(helper.clone()));
        helper
    }

    /// Run `f` with every table, cell, and kv write coalesced into one
    /// transaction: at most one observer notification per affected store.
    /// Nested calls are absorbed by the outer batch.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.queue.run_batch(&self.doc, f)
    }

    /// Await the readiness of every registered extension.
    ///
    /// # Errors
    ///
    /// Propagates the first readiness failure.
    pub async fn when_ready(&self) -> Result<()> {
        let pending: Vec<_> = self.ready.lock().unwrap().drain(..).collect();
        for fut in pending {
            fut.await?;
        }
        Ok(())
    }

    /// Destroy the client: extensions tear down in reverse insertion order,
    /// then the root document is dropped.
    pub async fn destroy(self) {
        let destroyers: Vec<_> = self.destroyers.lock().unwrap().drain(..).collect();
        for (key, destroy) in destroyers.into_iter().rev() {
            log::debug!("workspace '{}': destroying extension '{}'", self.id, key);
            destroy().await;
        }
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for sync.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the diff between the current state and a remote state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| EpicenterError::Crdt(format!("failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a remote peer, then compact every store the merge
    /// may have left with duplicate entries.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| EpicenterError::Crdt(format!("failed to decode update: {}", e)))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| EpicenterError::Crdt(format!("failed to apply update: {}", e)))?;
        }
        for compact in self.compactors.read().unwrap().iter() {
            compact();
        }
        Ok(())
    }

    /// Observe the raw v1 update stream of the root document (persistence and
    /// sync extensions consume this).
    pub fn observe_updates<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| {
                callback(&event.update);
            })
            .expect("Failed to observe document updates")
    }
}

impl std::fmt::Debug for WorkspaceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceClient")
            .field("id", &self.id)
            .field("extensions", &self.extensions.keys())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RowRecord, TypedSchema};
    use crate::table::GetResult;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: String,
        title: String,
    }

    impl RowRecord for Post {
        fn row_id(&self) -> &str {
            &self.id
        }
    }

    fn post(id: &str, title: &str) -> Post {
        Post {
            id: id.to_string(),
            title: title.to_string(),
        }
    }

    fn create_client(id: &str) -> WorkspaceClient {
        create_workspace(WorkspaceDefinition::new(id)).build()
    }

    #[test]
    fn test_definition_pins_doc_guid() {
        let client = create_client("ws-1");
        assert_eq!(client.id(), "ws-1");
        assert_eq!(client.doc().guid().to_string(), "ws-1");
    }

    #[test]
    fn test_definition_declares_tables_and_kv() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Flags {
            beta: bool,
        }

        let definition = WorkspaceDefinition::new("ws-1")
            .with_table("posts", TypedSchema::<Post>::new())
            .with_kv("flags", TypedSchema::<Flags>::new());
        assert_eq!(definition.table_names(), vec!["posts"]);
        assert_eq!(definition.kv_names(), vec!["flags"]);

        let client = create_workspace(definition).build();
        let posts = client.table("posts", TypedSchema::<Post>::new());
        posts.set(post("p1", "declared")).unwrap();
        assert!(matches!(posts.get("p1"), GetResult::Valid(row) if row.title == "declared"));
    }

    #[test]
    fn test_extension_factory_uses_declared_table() {
        let definition =
            WorkspaceDefinition::new("ws-1").with_table("posts", TypedSchema::<Post>::new());

        let client = create_workspace(definition)
            .with_extension("seed", |ctx| {
                // Declared tables are registered before any factory runs, so
                // the typed accessor resolves synchronously against the
                // client-so-far.
                let posts = ctx.table("posts", TypedSchema::<Post>::new());
                posts.set(post("p1", "seeded")).unwrap();
                Ok(Lifecycle::new())
            })
            .unwrap()
            .build();

        let posts = client.table("posts", TypedSchema::<Post>::new());
        assert!(matches!(posts.get("p1"), GetResult::Valid(row) if row.title == "seeded"));
    }

    #[test]
    fn test_extension_factory_uses_declared_kv() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Flags {
            beta: bool,
        }

        let definition =
            WorkspaceDefinition::new("ws-1").with_kv("flags", TypedSchema::<Flags>::new());

        let client = create_workspace(definition)
            .with_extension("defaults", |ctx| {
                let flags = ctx.kv("flags", TypedSchema::<Flags>::new());
                if flags.get().is_not_found() {
                    flags.set(Flags { beta: true }).unwrap();
                }
                Ok(Lifecycle::new())
            })
            .unwrap()
            .build();

        let flags = client.kv("flags", TypedSchema::<Flags>::new());
        assert!(matches!(flags.get(), GetResult::Valid(f) if f.beta));
    }

    #[test]
    fn test_table_accessor_is_memoized() {
        let client = create_client("ws-1");
        let a = client.table("posts", TypedSchema::<Post>::new());
        a.set(post("p1", "hello")).unwrap();

        let b = client.table("posts", TypedSchema::<Post>::new());
        assert!(matches!(b.get("p1"), GetResult::Valid(row) if row.title == "hello"));
    }

    #[test]
    fn test_batch_read_your_writes() {
        let client = create_client("ws-1");
        let posts = client.table("posts", TypedSchema::<Post>::new());

        let events: Arc<Mutex<Vec<BTreeSet<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _h = posts.observe(move |ids| {
            sink.lock().unwrap().push(ids.clone());
        });

        client.batch(|| {
            posts.set(post("p1", "hello")).unwrap();
            assert!(matches!(posts.get("p1"), GetResult::Valid(row) if row.title == "hello"));
            posts.delete("p1".to_string());
            assert!(posts.get("p1").is_not_found());
        });

        // A row created and deleted inside one batch nets to nothing; at most
        // one notification fires for it.
        assert!(events.lock().unwrap().len() <= 1);
        assert!(posts.get("p1").is_not_found());
    }

    #[test]
    fn test_batch_fires_single_notification_with_all_rows() {
        let client = create_client("ws-1");
        let posts = client.table("posts", TypedSchema::<Post>::new());

        let events: Arc<Mutex<Vec<BTreeSet<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _h = posts.observe(move |ids| {
            sink.lock().unwrap().push(ids.clone());
        });

        client.batch(|| {
            posts.set(post("p1", "hello")).unwrap();
            posts.set(post("p2", "world")).unwrap();
        });

        let fired = events.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].contains("p1"));
        assert!(fired[0].contains("p2"));
    }

    #[test]
    fn test_batch_spans_tables_and_kv() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Flags {
            beta: bool,
        }

        let client = create_client("ws-1");
        let posts = client.table("posts", TypedSchema::<Post>::new());
        let flags = client.kv("flags", TypedSchema::<Flags>::new());

        let table_events = Arc::new(AtomicUsize::new(0));
        let kv_events = Arc::new(AtomicUsize::new(0));
        let tc = Arc::clone(&table_events);
        let kc = Arc::clone(&kv_events);
        let _h1 = posts.observe(move |_| {
            tc.fetch_add(1, Ordering::SeqCst);
        });
        let _h2 = flags.observe(move || {
            kc.fetch_add(1, Ordering::SeqCst);
        });

        client.batch(|| {
            posts.set(post("p1", "a")).unwrap();
            posts.set(post("p2", "b")).unwrap();
            flags.set(Flags { beta: true }).unwrap();
        });

        assert_eq!(table_events.load(Ordering::SeqCst), 1);
        assert_eq!(kv_events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_batch_absorbed() {
        let client = create_client("ws-1");
        let posts = client.table("posts", TypedSchema::<Post>::new());

        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        let _h = posts.observe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.batch(|| {
            posts.set(post("p1", "a")).unwrap();
            client.batch(|| {
                posts.set(post("p2", "b")).unwrap();
            });
        });

        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_extension_sees_earlier_exports() {
        struct First {
            marker: &'static str,
        }
        struct Second {
            inherited: String,
        }

        let client = create_workspace(WorkspaceDefinition::new("ws-1"))
            .with_extension("first", |_ctx| {
                Ok(Lifecycle::with_exports(First { marker: "hello" }))
            })
            .unwrap()
            .with_extension("second", |ctx| {
                let first = ctx
                    .extensions
                    .get::<First>("first")
                    .expect("first extension registered before second");
                Ok(Lifecycle::with_exports(Second {
                    inherited: first.marker.to_string(),
                }))
            })
            .unwrap()
            .build();

        let second = client.extensions().get::<Second>("second").unwrap();
        assert_eq!(second.inherited, "hello");
    }

    #[test]
    fn test_duplicate_extension_key_rejected() {
        let result = create_workspace(WorkspaceDefinition::new("ws-1"))
            .with_extension("dup", |_ctx| Ok(Lifecycle::new()))
            .unwrap()
            .with_extension("dup", |_ctx| Ok(Lifecycle::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_destroy_runs_lifo() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);

        let client = create_workspace(WorkspaceDefinition::new("ws-1"))
            .with_extension("first", move |_ctx| {
                Ok(Lifecycle::new().on_destroy(move || {
                    o1.lock().unwrap().push("first");
                    async {}
                }))
            })
            .unwrap()
            .with_extension("second", move |_ctx| {
                Ok(Lifecycle::new().on_destroy(move || {
                    o2.lock().unwrap().push("second");
                    async {}
                }))
            })
            .unwrap()
            .build();

        futures_lite::future::block_on(client.destroy());
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn test_when_ready_awaits_all_extensions() {
        let readied = Arc::new(AtomicUsize::new(0));
        let r1 = Arc::clone(&readied);
        let r2 = Arc::clone(&readied);

        let client = create_workspace(WorkspaceDefinition::new("ws-1"))
            .with_extension("a", move |_ctx| {
                Ok(Lifecycle::new().on_ready(async move {
                    r1.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            })
            .unwrap()
            .with_extension("b", move |_ctx| {
                Ok(Lifecycle::new().on_ready(async move {
                    r2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            })
            .unwrap()
            .build();

        futures_lite::future::block_on(client.when_ready()).unwrap();
        assert_eq!(readied.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_actions_built_from_client() {
        struct Actions {
            workspace_id: String,
        }

        let client = create_workspace(WorkspaceDefinition::new("ws-1"))
            .with_actions(|client| Actions {
                workspace_id: client.id().to_string(),
            })
            .build();

        let actions = client.actions::<Actions>().unwrap();
        assert_eq!(actions.workspace_id, "ws-1");
    }

    #[test]
    fn test_replicas_converge_through_apply_update() {
        let a = create_client("shared-ws");
        let b = create_client("shared-ws");
        let posts_a = a.table("posts", TypedSchema::<Post>::new());
        let posts_b = b.table("posts", TypedSchema::<Post>::new());

        posts_a.set(post("p1", "from a")).unwrap();
        b.apply_update(&a.encode_state_as_update()).unwrap();

        assert!(matches!(posts_b.get("p1"), GetResult::Valid(row) if row.title == "from a"));
    }

    #[test]
    fn test_observe_updates_streams_writes() {
        let client = create_client("ws-1");
        let posts = client.table("posts", TypedSchema::<Post>::new());

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updates);
        let _sub = client.observe_updates(move |_bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        posts.set(post("p1", "a")).unwrap();
        assert!(updates.load(Ordering::SeqCst) >= 1);
    }
}
