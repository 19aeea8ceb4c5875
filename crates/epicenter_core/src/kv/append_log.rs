//! Positional key-value store over a CRDT append-only array.
//!
//! [`YKeyValue`] wraps a yrs array of `{key, val}` entries plus an in-memory
//! map for O(1) reads. Writers push entries; duplicate entries for a key are
//! removed so the array holds at most one entry per key, keeping storage
//! constant under unbounded updates. When concurrent replicas race on the
//! same key, the entry that ends up rightmost in the merged array wins —
//! array order is determined by the CRDT's clientID-based ordering, so every
//! replica agrees on the winner.
//!
//! The in-memory map is mutated only by the array observer; `set`/`delete`
//! touch the pending overlays and the array, which is what gives
//! read-your-writes inside a still-open batch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use yrs::types::array::ArrayEvent;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Array, ArrayRef, Doc, Observable, ReadTxn, StateVector, Subscription, Transact, TransactionMut, Update};

use super::batch::TxnQueue;
use super::entry::{self, EntryChange, RawEntry};
use super::ObserverHandle;
use crate::error::{EpicenterError, Result};
use crate::value::{from_any, to_any};

type Handler<T> = Arc<dyn Fn(&HashMap<String, EntryChange<T>>) + Send + Sync>;

struct Shared<T> {
    /// Confirmed state; written only by the array observer.
    map: RwLock<HashMap<String, T>>,
    /// Mirror of entry keys by array position; written only by the observer.
    order: RwLock<Vec<String>>,
    /// Writes not yet confirmed by the observer.
    pending: RwLock<HashMap<String, T>>,
    /// Deletes not yet confirmed by the observer.
    pending_deletes: RwLock<HashSet<String>>,
    /// Keys left with duplicate entries by a remote merge.
    cleanup: Mutex<HashSet<String>>,
    handlers: RwLock<HashMap<u64, Handler<T>>>,
    next_handler_id: AtomicU64,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            pending: RwLock::new(HashMap::new()),
            pending_deletes: RwLock::new(HashSet::new()),
            cleanup: Mutex::new(HashSet::new()),
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
        }
    }
}

/// Append-log key-value store with positional (rightmost-wins) conflict
/// resolution.
///
/// # Example
///
/// ```ignore
/// use epicenter_core::kv::YKeyValue;
/// use yrs::Doc;
///
/// let doc = Doc::new();
/// let kv: YKeyValue<String> = YKeyValue::new(&doc, "settings");
///
/// kv.set("theme", "dark".to_string());
/// assert_eq!(kv.get("theme"), Some("dark".to_string()));
/// ```
#[derive(Clone)]
pub struct YKeyValue<T> {
    doc: Doc,
    array: ArrayRef,
    shared: Arc<Shared<T>>,
    queue: Arc<TxnQueue>,
    _sub: Arc<Subscription>,
}

impl<T> YKeyValue<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a store over the named array of `doc`, with its own
    /// transaction queue.
    pub fn new(doc: &Doc, name: &str) -> Self {
        Self::with_queue(doc, name, Arc::new(TxnQueue::new()))
    }

    /// Create a store sharing a transaction queue with other stores on the
    /// same document (workspace batching).
    pub(crate) fn with_queue(doc: &Doc, name: &str, queue: Arc<TxnQueue>) -> Self {
        let doc = doc.clone();
        let array = doc.get_or_insert_array(name);
        let shared = Arc::new(Shared::new());

        Self::initial_sweep(&doc, &array, &shared);

        let sub = {
            let shared = Arc::clone(&shared);
            array.observe(move |txn, event| {
                Self::process_event(&shared, txn, event);
            })
        };

        Self {
            doc,
            array,
            shared,
            queue,
            _sub: Arc::new(sub),
        }
    }

    /// Scan the array right-to-left semantics: keep the rightmost entry per
    /// key, delete all leftmost duplicates in one transaction, and populate
    /// the confirmed map and positional mirror.
    fn initial_sweep(doc: &Doc, array: &ArrayRef, shared: &Arc<Shared<T>>) {
        let raw: Vec<Option<RawEntry>> = {
            let txn = doc.transact();
            array.iter(&txn).map(|out| RawEntry::decode(&out)).collect()
        };

        let mut winner_pos: HashMap<String, usize> = HashMap::new();
        let mut losers: Vec<usize> = Vec::new();
        for (i, decoded) in raw.iter().enumerate() {
            if let Some(e) = decoded
                && let Some(prev) = winner_pos.insert(e.key.clone(), i)
            {
                losers.push(prev);
            }
        }

        if !losers.is_empty() {
            losers.sort_unstable();
            let mut txn = doc.transact_mut();
            for &i in losers.iter().rev() {
                array.remove(&mut txn, i as u32);
            }
        }

        let loser_set: HashSet<usize> = losers.into_iter().collect();
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for (i, decoded) in raw.into_iter().enumerate() {
            if loser_set.contains(&i) {
                continue;
            }
            match decoded {
                Some(e) => match from_any::<T>(&e.val) {
                    Ok(v) => {
                        map.insert(e.key.clone(), v);
                        order.push(e.key);
                    }
                    Err(err) => {
                        log::warn!("kv: dropping undecodable entry for '{}': {}", e.key, err);
                        order.push(String::new());
                    }
                },
                None => order.push(String::new()),
            }
        }
        *shared.map.write().unwrap() = map;
        *shared.order.write().unwrap() = order;
    }

    /// Translate a positional array delta into semantic per-key changes,
    /// update the confirmed state, and notify handlers.
    fn process_event(shared: &Arc<Shared<T>>, txn: &TransactionMut, event: &ArrayEvent) {
        let delta = event.delta(txn);
        if delta.is_empty() {
            return;
        }
        let array = event.target();

        let touched = {
            let mut order = shared.order.write().unwrap();
            entry::apply_delta(&mut order, delta)
        };
        if touched.is_empty() {
            return;
        }

        let mut changes: HashMap<String, EntryChange<T>> = HashMap::new();
        {
            let order = shared.order.read().unwrap();
            let mut map = shared.map.write().unwrap();
            let mut cleanup = shared.cleanup.lock().unwrap();
            for key in &touched {
                let positions = entry::positions_of(&order, key);
                if positions.is_empty() {
                    if let Some(old) = map.remove(key) {
                        changes.insert(key.clone(), EntryChange::Removed { old });
                    }
                    continue;
                }
                // Rightmost entry wins; duplicates are scheduled for cleanup.
                let Some(&winner_pos) = positions.last() else {
                    continue;
                };
                let Some(raw) = array
                    .get(txn, winner_pos as u32)
                    .and_then(|out| RawEntry::decode(&out))
                else {
                    continue;
                };
                let value = match from_any::<T>(&raw.val) {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("kv: undecodable value for key '{}': {}", key, err);
                        continue;
                    }
                };
                if positions.len() > 1 {
                    cleanup.insert(key.clone());
                }
                match map.insert(key.clone(), value.clone()) {
                    None => {
                        changes.insert(key.clone(), EntryChange::Added { new: value });
                    }
                    Some(old) => {
                        // Duplicate cleanup and stale remote entries leave
                        // the winner untouched and must not produce events.
                        if old != value {
                            changes.insert(key.clone(), EntryChange::Updated { old, new: value });
                        }
                    }
                }
            }
        }

        {
            let mut pending = shared.pending.write().unwrap();
            let mut pending_deletes = shared.pending_deletes.write().unwrap();
            for key in &touched {
                pending.remove(key);
                pending_deletes.remove(key);
            }
        }

        if changes.is_empty() {
            return;
        }
        let handlers: Vec<Handler<T>> = shared.handlers.read().unwrap().values().cloned().collect();
        for handler in handlers {
            handler(&changes);
        }
    }

    /// Get the value for `key`, honoring pending writes and deletes.
    pub fn get(&self, key: &str) -> Option<T> {
        if self.shared.pending_deletes.read().unwrap().contains(key) {
            return None;
        }
        if let Some(v) = self.shared.pending.read().unwrap().get(key) {
            return Some(v.clone());
        }
        self.shared.map.read().unwrap().get(key).cloned()
    }

    /// Whether `key` currently holds a value.
    pub fn has(&self, key: &str) -> bool {
        if self.shared.pending_deletes.read().unwrap().contains(key) {
            return false;
        }
        if self.shared.pending.read().unwrap().contains_key(key) {
            return true;
        }
        self.shared.map.read().unwrap().contains_key(key)
    }

    /// Set `key` to `val`. Pushes a new entry; any prior entry for the key is
    /// removed in the same transaction so the array stays at one entry per key.
    pub fn set(&self, key: impl Into<String>, val: T) {
        let key = key.into();
        let encoded = match to_any(&val) {
            Ok(any) => RawEntry::encode(&key, any, None),
            Err(err) => {
                log::error!("kv: failed to encode value for key '{}': {}", key, err);
                return;
            }
        };
        self.shared.pending.write().unwrap().insert(key.clone(), val);
        self.shared.pending_deletes.write().unwrap().remove(&key);

        let array = self.array.clone();
        self.queue.execute(
            &self.doc,
            Box::new(move |txn| {
                entry::remove_entries_for_key(&array, txn, &key);
                array.push_back(txn, encoded);
            }),
        );
    }

    /// Remove `key`. A no-op if the key is absent.
    pub fn delete(&self, key: &str) {
        self.shared.pending.write().unwrap().remove(key);
        self.shared
            .pending_deletes
            .write()
            .unwrap()
            .insert(key.to_string());

        let array = self.array.clone();
        let shared = Arc::clone(&self.shared);
        let key = key.to_string();
        self.queue.execute(
            &self.doc,
            Box::new(move |txn| {
                if entry::remove_entries_for_key(&array, txn, &key) == 0 {
                    // Nothing was stored; the overlay must not keep masking
                    // the key (no observer event will fire to clear it).
                    shared.pending_deletes.write().unwrap().remove(&key);
                }
            }),
        );
    }

    /// Snapshot of all visible entries, sorted by key.
    pub fn entries(&self) -> Vec<(String, T)> {
        let mut snapshot: BTreeMap<String, T> = BTreeMap::new();
        {
            let map = self.shared.map.read().unwrap();
            let deletes = self.shared.pending_deletes.read().unwrap();
            for (k, v) in map.iter() {
                if !deletes.contains(k) {
                    snapshot.insert(k.clone(), v.clone());
                }
            }
        }
        for (k, v) in self.shared.pending.read().unwrap().iter() {
            snapshot.insert(k.clone(), v.clone());
        }
        snapshot.into_iter().collect()
    }

    /// Number of visible keys.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the store holds no visible keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the underlying array, including not-yet-cleaned duplicates.
    pub fn array_len(&self) -> u32 {
        let txn = self.doc.transact();
        self.array.len(&txn)
    }

    /// Register a change handler; fires once per committed transaction with
    /// the aggregated per-key change set.
    pub fn observe(
        &self,
        f: impl Fn(&HashMap<String, EntryChange<T>>) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.shared.handlers.write().unwrap().insert(id, Arc::new(f));
        ObserverHandle(id)
    }

    /// Remove a previously registered change handler.
    pub fn unobserve(&self, handle: ObserverHandle) {
        self.shared.handlers.write().unwrap().remove(&handle.0);
    }

    /// Run `f` with writes batched into a single transaction; the observer
    /// fires once when the outermost batch exits.
    pub fn transact<R>(&self, f: impl FnOnce() -> R) -> R {
        self.queue.run_batch(&self.doc, f)
    }

    /// The underlying document.
    pub fn doc(&self) -> &Doc {
        &self.doc
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

    /// Apply an update from a remote peer, then compact any duplicate entries
    /// the merge produced.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| EpicenterError::Crdt(format!("failed to decode update: {}", e)))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| EpicenterError::Crdt(format!("failed to apply update: {}", e)))?;
        }
        self.flush_cleanup();
        Ok(())
    }

    /// Remove all loser entries scheduled by the observer, keeping the
    /// rightmost entry per key.
    pub(crate) fn flush_cleanup(&self) {
        let keys: Vec<String> = {
            let mut cleanup = self.shared.cleanup.lock().unwrap();
            if cleanup.is_empty() {
                return;
            }
            cleanup.drain().collect()
        };
        let mut txn = self.doc.transact_mut();
        for key in keys {
            let positions = entry::entry_positions(&self.array, &txn, &key);
            if positions.len() <= 1 {
                continue;
            }
            for &i in positions[..positions.len() - 1].iter().rev() {
                self.array.remove(&mut txn, i);
            }
        }
    }
}

impl<T> std::fmt::Debug for YKeyValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YKeyValue")
            .field("keys", &self.shared.map.read().unwrap().len())
            .finish_non_exhaustive()
    }
}
