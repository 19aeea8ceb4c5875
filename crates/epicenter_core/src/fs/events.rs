//! Filesystem change events.
//!
//! The filesystem derives semantic events from `files` table changes — the
//! same stream that keeps the path index current — so local writes and remote
//! sync surface identically to subscribers. Events carry *paths* (resolved
//! through the index), which is what UI layers actually key on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::FileKind;
use crate::kv::ObserverHandle;

/// A semantic filesystem change.
#[derive(Debug, Clone, PartialEq)]
pub enum FsEvent {
    /// A file or folder became visible at `path`.
    Created {
        /// Path of the new node
        path: String,
        /// Row id
        id: String,
        /// File or folder
        kind: FileKind,
    },
    /// Metadata or content bookkeeping of the node at `path` changed.
    Modified {
        /// Path of the changed node
        path: String,
        /// Row id
        id: String,
    },
    /// The node was renamed or reparented.
    Moved {
        /// Path before the move
        from: String,
        /// Path after the move
        to: String,
        /// Row id
        id: String,
    },
    /// The node left the active tree (trashed or hard-deleted).
    Removed {
        /// Last path the node was visible at
        path: String,
        /// Row id
        id: String,
    },
}

impl FsEvent {
    /// The row id the event concerns.
    pub fn id(&self) -> &str {
        match self {
            FsEvent::Created { id, .. }
            | FsEvent::Modified { id, .. }
            | FsEvent::Moved { id, .. }
            | FsEvent::Removed { id, .. } => id,
        }
    }
}

type Listener = Arc<dyn Fn(&[FsEvent]) + Send + Sync>;

/// Registry of filesystem event listeners.
///
/// Listeners fire once per committed table transaction with every event that
/// transaction produced, in row-id order.
pub(crate) struct EventRegistry {
    listeners: RwLock<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub(crate) fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(
        &self,
        f: impl Fn(&[FsEvent]) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().unwrap().insert(id, Arc::new(f));
        ObserverHandle::from_raw(id)
    }

    pub(crate) fn unsubscribe(&self, handle: ObserverHandle) {
        self.listeners.write().unwrap().remove(&handle.raw());
    }

    pub(crate) fn emit(&self, events: &[FsEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self.listeners.read().unwrap().values().cloned().collect();
        for listener in listeners {
            listener(events);
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("listeners", &self.listeners.read().unwrap().len())
            .finish()
    }
}
