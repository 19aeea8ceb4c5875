//! Shared transaction queue for batched writes.
//!
//! yrs fires observers once per committed transaction. To give `batch(fn)` its
//! "one notification per affected store" guarantee, every store on a given
//! root document routes its mutations through one [`TxnQueue`]: outside a
//! batch an operation commits immediately in its own transaction, inside a
//! batch it is queued and the whole queue is flushed in a single transaction
//! when the outermost batch exits. Nested batches are absorbed by a depth
//! counter.

use std::sync::Mutex;

use yrs::{Doc, Transact, TransactionMut};

/// A deferred array mutation, executed inside the flush transaction.
pub(crate) type QueuedOp = Box<dyn FnOnce(&mut TransactionMut) + Send>;

/// Depth-counted operation queue shared by all stores of one root document.
pub(crate) struct TxnQueue {
    depth: Mutex<usize>,
    ops: Mutex<Vec<QueuedOp>>,
}

impl TxnQueue {
    pub(crate) fn new() -> Self {
        Self {
            depth: Mutex::new(0),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Whether a batch is currently open.
    pub(crate) fn is_batching(&self) -> bool {
        *self.depth.lock().unwrap() > 0
    }

    /// Run `op` now in its own transaction, or queue it if a batch is open.
    pub(crate) fn execute(&self, doc: &Doc, op: QueuedOp) {
        if self.is_batching() {
            self.ops.lock().unwrap().push(op);
        } else {
            let mut txn = doc.transact_mut();
            op(&mut txn);
        }
    }

    /// Run `f` inside a batch; flush queued operations in one transaction when
    /// the outermost batch exits. Re-entrant calls are absorbed.
    pub(crate) fn run_batch<R>(&self, doc: &Doc, f: impl FnOnce() -> R) -> R {
        *self.depth.lock().unwrap() += 1;
        let guard = BatchGuard { queue: self, doc };
        let result = f();
        drop(guard);
        result
    }
}

struct BatchGuard<'a> {
    queue: &'a TxnQueue,
    doc: &'a Doc,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let outermost = {
            let mut depth = self.queue.depth.lock().unwrap();
            *depth -= 1;
            *depth == 0
        };
        if !outermost {
            return;
        }
        let ops = std::mem::take(&mut *self.queue.ops.lock().unwrap());
        if std::thread::panicking() {
            // The batch body panicked; its queued writes must not commit.
            return;
        }
        if !ops.is_empty() {
            let mut txn = self.doc.transact_mut();
            for op in ops {
                op(&mut txn);
            }
        }
    }
}
