//! In-memory registry of content documents.
//!
//! The pool materializes per-file content docs on demand and owns their
//! provider lifecycles (persistence, sync — attached by the embedder as
//! factories). `ensure` is idempotent and deduplicates concurrent calls for
//! the same file: the first caller materializes, everyone else awaits the
//! same slot and receives the same document.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use yrs::Doc;

use super::doc::ContentDoc;
use crate::error::Result;
use crate::workspace::BoxFuture;

type DestroyFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Context handed to provider factories at materialization time.
pub struct ProviderContext<'a> {
    /// The file id (document guid)
    pub file_id: &'a str,
    /// The freshly created content document
    pub doc: &'a Doc,
}

/// What a provider factory returns: readiness and teardown.
///
/// Factories are synchronous by contract; asynchronous connection work
/// belongs behind `on_ready`.
pub struct ProviderLifecycle {
    when_ready: Option<BoxFuture<'static, Result<()>>>,
    destroy: Option<DestroyFn>,
}

impl ProviderLifecycle {
    /// A provider with no readiness or teardown.
    pub fn new() -> Self {
        Self {
            when_ready: None,
            destroy: None,
        }
    }

    /// Attach the provider's asynchronous readiness.
    pub fn on_ready(
        mut self,
        fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        self.when_ready = Some(Box::pin(fut));
        self
    }

    /// Attach an asynchronous teardown, run at document destroy (LIFO).
    pub fn on_destroy<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.destroy = Some(Box::new(move || Box::pin(f())));
        self
    }
}

impl Default for ProviderLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

type ProviderFactory = Arc<dyn Fn(ProviderContext<'_>) -> Result<ProviderLifecycle> + Send + Sync>;

struct PoolEntry {
    doc: Arc<ContentDoc>,
    /// Provider teardowns in creation order; run reversed at destroy.
    teardown: Mutex<Vec<DestroyFn>>,
}

type Slot = Arc<OnceCell<Arc<PoolEntry>>>;

/// Registry of live content documents with idempotent `ensure`/`destroy`.
pub struct ContentDocPool {
    factories: Vec<ProviderFactory>,
    entries: Mutex<HashMap<String, Slot>>,
    ensure_calls: std::sync::atomic::AtomicU64,
}

impl ContentDocPool {
    /// An empty pool with no providers.
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            entries: Mutex::new(HashMap::new()),
            ensure_calls: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Attach a provider factory, run for every document the pool
    /// materializes.
    pub fn with_provider(
        mut self,
        factory: impl Fn(ProviderContext<'_>) -> Result<ProviderLifecycle> + Send + Sync + 'static,
    ) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }

    /// Materialize (or return) the content document for `file_id`.
    ///
    /// Idempotent: the same id always resolves to the same document.
    /// Concurrent calls for one id share a single materialization — provider
    /// factories run exactly once per live document.
    ///
    /// # Errors
    ///
    /// If a factory or a readiness future fails, already-created providers
    /// for the file are destroyed in reverse order, the pool slot is
    /// released, and the error propagates.
    pub async fn ensure(&self, file_id: &str) -> Result<Arc<ContentDoc>> {
        self.ensure_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let slot: Slot = {
            let mut entries = self.entries.lock().unwrap();
            Arc::clone(
                entries
                    .entry(file_id.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        match slot.get_or_try_init(|| self.materialize(file_id)).await {
            Ok(entry) => Ok(Arc::clone(&entry.doc)),
            Err(err) => {
                let mut entries = self.entries.lock().unwrap();
                if let Some(existing) = entries.get(file_id)
                    && existing.get().is_none()
                {
                    entries.remove(file_id);
                }
                Err(err)
            }
        }
    }

    async fn materialize(&self, file_id: &str) -> Result<Arc<PoolEntry>> {
        log::debug!("content pool: materializing doc for '{}'", file_id);
        let doc = Arc::new(ContentDoc::new(file_id));

        let mut teardown: Vec<DestroyFn> = Vec::new();
        let mut readiness: Vec<BoxFuture<'static, Result<()>>> = Vec::new();
        for factory in &self.factories {
            match factory(ProviderContext {
                file_id,
                doc: doc.doc(),
            }) {
                Ok(provider) => {
                    if let Some(ready) = provider.when_ready {
                        readiness.push(ready);
                    }
                    if let Some(destroy) = provider.destroy {
                        teardown.push(destroy);
                    }
                }
                Err(err) => {
                    run_teardown(teardown).await;
                    return Err(err);
                }
            }
        }

        for ready in readiness {
            if let Err(err) = ready.await {
                run_teardown(teardown).await;
                return Err(err);
            }
        }

        Ok(Arc::new(PoolEntry {
            doc,
            teardown: Mutex::new(teardown),
        }))
    }

    /// Tear down the document for `file_id`: providers destroy in reverse
    /// order, then the document is dropped. Idempotent; a no-op for unknown
    /// ids.
    pub async fn destroy(&self, file_id: &str) {
        let slot = { self.entries.lock().unwrap().remove(file_id) };
        let Some(slot) = slot else {
            return;
        };
        if let Some(entry) = slot.get() {
            log::debug!("content pool: destroying doc for '{}'", file_id);
            let teardown = std::mem::take(&mut *entry.teardown.lock().unwrap());
            run_teardown(teardown).await;
        }
    }

    /// Tear down every live document, best effort: one failing provider
    /// cannot strand the rest.
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = { self.entries.lock().unwrap().keys().cloned().collect() };
        for id in ids {
            self.destroy(&id).await;
        }
    }

    /// Whether a document for `file_id` is currently materialized.
    pub fn is_open(&self, file_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(file_id)
            .is_some_and(|slot| slot.get().is_some())
    }

    /// Total `ensure` invocations so far (metadata-only operations such as
    /// `mv` must not move this counter).
    pub fn ensure_calls(&self) -> u64 {
        self.ensure_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of materialized documents.
    pub fn open_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }
}

impl Default for ContentDocPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContentDocPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDocPool")
            .field("open", &self.open_count())
            .field("providers", &self.factories.len())
            .finish()
    }
}

/// Run provider teardowns LIFO.
async fn run_teardown(mut teardown: Vec<DestroyFn>) {
    while let Some(destroy) = teardown.pop() {
        destroy().await;
    }
}
