//! Last-write-wins key-value store over a CRDT append-only array.
//!
//! [`YKeyValueLww`] has the same shape as [`super::YKeyValue`] but every
//! entry carries a monotonic logical timestamp. Conflicts resolve by
//! timestamp first (strictly higher wins) and by array position on ties
//! (rightmost wins, which is deterministic under the CRDT's clientID
//! ordering). The clock is self-healing: any higher remote timestamp raises
//! the local clock, so the next local write strictly supersedes everything
//! seen so far, even against peers with faster wall clocks.
//!
//! Because the underlying document garbage-collects tombstones, repeatedly
//! setting the same key costs amortized O(1) storage per key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use yrs::types::Change;
use yrs::types::array::ArrayEvent;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Array, ArrayRef, Doc, Observable, ReadTxn, StateVector, Subscription, Transact, TransactionMut, Update};

use super::batch::TxnQueue;
use super::entry::{self, EntryChange, LwwEntry, RawEntry};
use super::ObserverHandle;
use crate::error::{EpicenterError, Result};
use crate::value::{from_any, to_any};

/// Wall-clock source in milliseconds; injectable for deterministic tests.
pub type TimeSource = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_time_source() -> TimeSource {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Per-replica monotonic logical clock.
///
/// Every tick is strictly greater than every timestamp previously seen,
/// whether locally generated or observed on incoming remote entries.
pub(crate) struct MonotonicClock {
    last: AtomicI64,
    now: TimeSource,
}

impl MonotonicClock {
    fn new(now: TimeSource) -> Self {
        Self {
            last: AtomicI64::new(0),
            now,
        }
    }

    /// `ts_new = now` if the wall clock moved past everything seen,
    /// otherwise `last_seen + 1`.
    fn tick(&self) -> i64 {
        let now = (self.now)();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = if now > current { now } else { current + 1 };
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Raise the clock to at least `ts` (remote entry observed).
    fn observe(&self, ts: i64) {
        self.last.fetch_max(ts, Ordering::SeqCst);
    }

    fn last_seen(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

type Handler<T> = Arc<dyn Fn(&HashMap<String, EntryChange<T>>) + Send + Sync>;

struct Shared<T> {
    /// Confirmed winners per key; written only by the array observer.
    map: RwLock<HashMap<String, LwwEntry<T>>>,
    /// Mirror of entry keys by array position; written only by the observer.
    order: RwLock<Vec<String>>,
    /// Writes not yet confirmed by the observer.
    pending: RwLock<HashMap<String, LwwEntry<T>>>,
    /// Deletes not yet confirmed by the observer.
    pending_deletes: RwLock<HashSet<String>>,
    /// Keys left with duplicate entries by a remote merge.
    cleanup: Mutex<HashSet<String>>,
    clock: MonotonicClock,
    handlers: RwLock<HashMap<u64, Handler<T>>>,
    next_handler_id: AtomicU64,
}

impl<T> Shared<T> {
    fn new(now: TimeSource) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            pending: RwLock::new(HashMap::new()),
            pending_deletes: RwLock::new(HashSet::new()),
            cleanup: Mutex::new(HashSet::new()),
            clock: MonotonicClock::new(now),
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
        }
    }
}

/// Timestamped key-value store: timestamp wins, position breaks ties.
///
/// This is the foundation of the cell/table layer; everything above it
/// inherits its convergence guarantees.
///
/// # Example
///
/// ```ignore
/// use epicenter_core::kv::YKeyValueLww;
/// use yrs::Doc;
///
/// let doc = Doc::new();
/// let kv: YKeyValueLww<i64> = YKeyValueLww::new(&doc, "counters");
///
/// kv.set("visits", 3);
/// assert_eq!(kv.get("visits"), Some(3));
/// assert!(kv.ts("visits").unwrap() > 0);
/// ```
#[derive(Clone)]
pub struct YKeyValueLww<T> {
    doc: Doc,
    array: ArrayRef,
    shared: Arc<Shared<T>>,
    queue: Arc<TxnQueue>,
    _sub: Arc<Subscription>,
}

/// Pick the winning candidate: strictly higher `ts` wins, equal `ts` falls
/// back to the larger array index. Entries without a timestamp lose to any
/// timestamped entry.
fn winner_index(candidates: &[(u32, Option<i64>)]) -> Option<u32> {
    candidates
        .iter()
        .max_by_key(|(pos, ts)| (ts.unwrap_or(i64::MIN), *pos))
        .map(|(pos, _)| *pos)
}

impl<T> YKeyValueLww<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a store over the named array of `doc`, using the system clock.
    pub fn new(doc: &Doc, name: &str) -> Self {
        Self::with_queue(doc, name, Arc::new(TxnQueue::new()), system_time_source())
    }

    /// Create a store with an injected wall-clock source (deterministic
    /// timestamp tests).
    pub fn with_time_source(doc: &Doc, name: &str, now: TimeSource) -> Self {
        Self::with_queue(doc, name, Arc::new(TxnQueue::new()), now)
    }

    pub(crate) fn with_queue(
        doc: &Doc,
        name: &str,
        queue: Arc<TxnQueue>,
        now: TimeSource,
    ) -> Self {
        let doc = doc.clone();
        let array = doc.get_or_insert_array(name);
        let shared = Arc::new(Shared::new(now));

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

    /// Group entries by key, keep the winner per key (by ts, then index),
    /// delete losers in one transaction, and raise the clock to the maximum
    /// timestamp seen.
    fn initial_sweep(doc: &Doc, array: &ArrayRef, shared: &Arc<Shared<T>>) {
        let raw: Vec<Option<RawEntry>> = {
            let txn = doc.transact();
            array.iter(&txn).map(|out| RawEntry::decode(&out)).collect()
        };

        let mut by_key: HashMap<String, Vec<(u32, Option<i64>)>> = HashMap::new();
        for (i, decoded) in raw.iter().enumerate() {
            if let Some(e) = decoded {
                by_key
                    .entry(e.key.clone())
                    .or_default()
                    .push((i as u32, e.ts));
                if let Some(ts) = e.ts {
                    shared.clock.observe(ts);
                }
            }
        }

        let mut losers: Vec<u32> = Vec::new();
        for candidates in by_key.values() {
            let Some(win) = winner_index(candidates) else {
                continue;
            };
            losers.extend(
                candidates
                    .iter()
                    .map(|(pos, _)| *pos)
                    .filter(|pos| *pos != win),
            );
        }

        if !losers.is_empty() {
            losers.sort_unstable();
            let mut txn = doc.transact_mut();
            for &i in losers.iter().rev() {
                array.remove(&mut txn, i);
            }
        }

        let loser_set: HashSet<u32> = losers.into_iter().collect();
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for (i, decoded) in raw.into_iter().enumerate() {
            if loser_set.contains(&(i as u32)) {
                continue;
            }
            match decoded {
                Some(e) => match from_any::<T>(&e.val) {
                    Ok(v) => {
                        map.insert(
                            e.key.clone(),
                            LwwEntry {
                                val: v,
                                ts: e.ts.unwrap_or(0),
                            },
                        );
                        order.push(e.key);
                    }
                    Err(err) => {
                        log::warn!("lww: dropping undecodable entry for '{}': {}", e.key, err);
                        order.push(String::new());
                    }
                },
                None => order.push(String::new()),
            }
        }
        *shared.map.write().unwrap() = map;
        *shared.order.write().unwrap() = order;
    }

    fn process_event(shared: &Arc<Shared<T>>, txn: &TransactionMut, event: &ArrayEvent) {
        let delta = event.delta(txn);
        if delta.is_empty() {
            return;
        }
        let array = event.target();

        // Incoming entries raise the clock before anything else, so a local
        // write issued from inside a change handler still supersedes them.
        for change in delta {
            if let Change::Added(values) = change {
                for out in values {
                    if let Some(raw) = RawEntry::decode(out)
                        && let Some(ts) = raw.ts
                    {
                        shared.clock.observe(ts);
                    }
                }
            }
        }

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
                        changes.insert(key.clone(), EntryChange::Removed { old: old.val });
                    }
                    continue;
                }

                let candidates: Vec<(u32, Option<i64>)> = positions
                    .iter()
                    .map(|&pos| {
                        let ts = array
                            .get(txn, pos as u32)
                            .and_then(|out| RawEntry::decode(&out))
                            .and_then(|raw| raw.ts);
                        (pos as u32, ts)
                    })
                    .collect();
                let Some(win_pos) = winner_index(&candidates) else {
                    continue;
                };
                let Some(raw) = array.get(txn, win_pos).and_then(|out| RawEntry::decode(&out))
                else {
                    continue;
                };
                let value = match from_any::<T>(&raw.val) {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("lww: undecodable value for key '{}': {}", key, err);
                        continue;
                    }
                };
                let new_entry = LwwEntry {
                    val: value,
                    ts: raw.ts.unwrap_or(0),
                };
                if positions.len() > 1 {
                    cleanup.insert(key.clone());
                }
                match map.insert(key.clone(), new_entry.clone()) {
                    None => {
                        changes.insert(key.clone(), EntryChange::Added { new: new_entry.val });
                    }
                    Some(old) => {
                        // Loser deletion and stale remote entries leave the
                        // winner in place and must not produce an event.
                        if old.ts != new_entry.ts || old.val != new_entry.val {
                            changes.insert(
                                key.clone(),
                                EntryChange::Updated {
                                    old: old.val,
                                    new: new_entry.val,
                                },
                            );
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
        if let Some(e) = self.shared.pending.read().unwrap().get(key) {
            return Some(e.val.clone());
        }
        self.shared.map.read().unwrap().get(key).map(|e| e.val.clone())
    }

    /// The timestamp of the currently visible entry for `key`.
    pub fn ts(&self, key: &str) -> Option<i64> {
        if self.shared.pending_deletes.read().unwrap().contains(key) {
            return None;
        }
        if let Some(e) = self.shared.pending.read().unwrap().get(key) {
            return Some(e.ts);
        }
        self.shared.map.read().unwrap().get(key).map(|e| e.ts)
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

    /// Set `key` to `val` at the next monotonic timestamp.
    pub fn set(&self, key: impl Into<String>, val: T) {
        let key = key.into();
        let ts = self.shared.clock.tick();
        let encoded = match to_any(&val) {
            Ok(any) => RawEntry::encode(&key, any, Some(ts)),
            Err(err) => {
                log::error!("lww: failed to encode value for key '{}': {}", key, err);
                return;
            }
        };
        self.shared
            .pending
            .write()
            .unwrap()
            .insert(key.clone(), LwwEntry { val, ts });
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
                    shared.pending_deletes.write().unwrap().remove(&key);
                }
            }),
        );
    }

    /// Snapshot of all visible entries with their timestamps, sorted by key.
    pub fn entries(&self) -> Vec<(String, LwwEntry<T>)> {
        let mut snapshot: BTreeMap<String, LwwEntry<T>> = BTreeMap::new();
        {
            let map = self.shared.map.read().unwrap();
            let deletes = self.shared.pending_deletes.read().unwrap();
            for (k, e) in map.iter() {
                if !deletes.contains(k) {
                    snapshot.insert(k.clone(), e.clone());
                }
            }
        }
        for (k, e) in self.shared.pending.read().unwrap().iter() {
            snapshot.insert(k.clone(), e.clone());
        }
        snapshot.into_iter().collect()
    }

    /// All visible keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|(k, _)| k).collect()
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

    /// The highest timestamp this replica has generated or observed.
    pub fn last_ts_seen(&self) -> i64 {
        self.shared.clock.last_seen()
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

    /// Remove all loser entries scheduled by the observer, keeping the winner
    /// per key (by ts, then index).
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
            let candidates: Vec<(u32, Option<i64>)> = positions
                .iter()
                .map(|&pos| {
                    let ts = self
                        .array
                        .get(&txn, pos)
                        .and_then(|out| RawEntry::decode(&out))
                        .and_then(|raw| raw.ts);
                    (pos, ts)
                })
                .collect();
            let Some(win) = winner_index(&candidates) else {
                continue;
            };
            for &pos in positions.iter().rev() {
                if pos != win {
                    self.array.remove(&mut txn, pos);
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for YKeyValueLww<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YKeyValueLww")
            .field("keys", &self.shared.map.read().unwrap().len())
            .field("last_ts_seen", &self.shared.clock.last_seen())
            .finish_non_exhaustive()
    }
}
