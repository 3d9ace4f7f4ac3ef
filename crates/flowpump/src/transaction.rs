//! Thread-bound transaction queries consumed by the transaction-aware sink
//! supplier.
//!
//! A transaction is single-threaded by contract: the binding lives in a
//! thread-local slot and is scoped by an RAII guard.

use std::cell::Cell;
use std::fmt;

/// Identity of one transactional unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

thread_local! {
    static CURRENT_TX: Cell<Option<TransactionId>> = const { Cell::new(None) };
}

/// The transaction bound to the current thread, if any.
pub fn current_transaction() -> Option<TransactionId> {
    CURRENT_TX.with(Cell::get)
}

/// Returns `true` if the current thread is inside a transaction.
pub fn is_transacted() -> bool {
    current_transaction().is_some()
}

/// RAII guard binding a transaction to the current thread. Unbinding (and
/// restoring any outer binding) happens on drop.
#[derive(Debug)]
pub struct TransactionBinding {
    previous: Option<TransactionId>,
}

impl TransactionBinding {
    pub fn bind(id: TransactionId) -> Self {
        let previous = CURRENT_TX.with(|slot| slot.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for TransactionBinding {
    fn drop(&mut self) {
        CURRENT_TX.with(|slot| slot.set(self.previous));
    }
}
