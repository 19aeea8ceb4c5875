//! Key-value stores over a CRDT append-only array.
//!
//! Two flavors share the same shape:
//!
//! - [`YKeyValue`] resolves concurrent writes positionally (rightmost entry
//!   in the merged array wins).
//! - [`YKeyValueLww`] carries a monotonic timestamp per entry and resolves by
//!   timestamp first, position on ties. It is the foundation of the cell,
//!   row, and table layers.
//!
//! Both keep storage constant per key under unbounded updates by deleting
//! superseded entries, and both provide read-your-writes inside open batches
//! through pending overlays.

mod append_log;
pub(crate) mod batch;
mod entry;
mod lww;

pub use append_log::YKeyValue;
pub use entry::{EntryChange, LwwEntry};
pub use lww::{TimeSource, YKeyValueLww};

/// Handle returned by `observe`; pass it to `unobserve` to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(pub(crate) u64);

impl ObserverHandle {
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn raw(&self) -> u64 {
        self.0
    }
}
