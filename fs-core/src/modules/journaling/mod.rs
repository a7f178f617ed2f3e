//! Journal collaborator boundary
//!
//! AuroraFS does not own a transaction log. When a volume carries the
//! journal feature bit, every mutating operation is bracketed by a
//! [`Journal`] supplied at mount time: `begin` before the first device
//! write, `commit` once the operation succeeded, `abort` when it failed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::error::{Error, Result};

/// Transaction identifier handed out by [`Journal::begin`]
pub type TxnId = u64;

/// External transaction log
pub trait Journal: Send + Sync {
    /// Open a transaction for the named operation
    fn begin(&self, op: &str) -> Result<TxnId>;
    /// Make the transaction durable
    fn commit(&self, txn: TxnId) -> Result<()>;
    /// Discard the transaction
    fn abort(&self, txn: TxnId) -> Result<()>;
}

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active
    Active,
    /// Transaction is committed
    Committed,
    /// Transaction was aborted
    Aborted,
}

/// A bracketed filesystem operation
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxnId,
    /// Operation name passed to `begin`
    pub op: String,
    pub state: TransactionState,
    pub start_time: SystemTime,
}

/// In-memory journal that records the bracketing it observes
///
/// Useful for tests and for hosts that only need the call sequence.
#[derive(Debug)]
pub struct MemoryJournal {
    next_id: AtomicU64,
    transactions: Mutex<HashMap<TxnId, Transaction>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    /// All transactions seen so far, ordered by id
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut all: Vec<_> = self.transactions.lock().values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }

    /// Transactions currently in `state`
    pub fn count(&self, state: TransactionState) -> usize {
        self.transactions
            .lock()
            .values()
            .filter(|t| t.state == state)
            .count()
    }

    fn finish(&self, txn: TxnId, state: TransactionState) -> Result<()> {
        let mut transactions = self.transactions.lock();
        let entry = transactions.get_mut(&txn).ok_or(Error::NotFound)?;
        if entry.state != TransactionState::Active {
            return Err(Error::invalid(format!(
                "transaction {} is already {:?}",
                txn, entry.state
            )));
        }
        entry.state = state;
        Ok(())
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal for MemoryJournal {
    fn begin(&self, op: &str) -> Result<TxnId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.transactions.lock().insert(
            id,
            Transaction {
                id,
                op: op.to_string(),
                state: TransactionState::Active,
                start_time: SystemTime::now(),
            },
        );
        log::debug!("JOURNAL: begin {} ({})", id, op);
        Ok(id)
    }

    fn commit(&self, txn: TxnId) -> Result<()> {
        self.finish(txn, TransactionState::Committed)?;
        log::debug!("JOURNAL: commit {}", txn);
        Ok(())
    }

    fn abort(&self, txn: TxnId) -> Result<()> {
        self.finish(txn, TransactionState::Aborted)?;
        log::debug!("JOURNAL: abort {}", txn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_lifecycle() {
        let journal = MemoryJournal::new();
        let a = journal.begin("create").unwrap();
        let b = journal.begin("unlink").unwrap();
        assert_ne!(a, b);
        assert_eq!(journal.count(TransactionState::Active), 2);

        journal.commit(a).unwrap();
        journal.abort(b).unwrap();
        assert_eq!(journal.count(TransactionState::Committed), 1);
        assert_eq!(journal.count(TransactionState::Aborted), 1);

        let all = journal.transactions();
        assert_eq!(all[0].op, "create");
        assert_eq!(all[1].state, TransactionState::Aborted);
    }

    #[test]
    fn test_finish_twice_is_refused() {
        let journal = MemoryJournal::new();
        let txn = journal.begin("write").unwrap();
        journal.commit(txn).unwrap();
        assert!(journal.commit(txn).is_err());
        assert!(journal.abort(txn).is_err());
        assert!(matches!(journal.commit(999), Err(Error::NotFound)));
    }
}
