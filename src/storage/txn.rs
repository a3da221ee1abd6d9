use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{Result, TreeError, Version};

/// Identifier of a transaction, unique within a [`TxnContext`].
pub type TxnId = u64;

/// Source of transaction identifiers shared by the trees that cooperate on them.
#[derive(Debug)]
pub struct TxnContext {
    next_id: AtomicU64,
}

impl Default for TxnContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnContext {
    /// Starts numbering at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Hands out the next identifier.
    pub fn next_id(&self) -> TxnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Lifecycle of a transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting operations.
    Active,
    /// Committed; carries the commit version (the read version for readers).
    Committed(Version),
    /// Rolled back.
    Aborted,
}

/// A unit of work against a transactional tree.
///
/// Terminated exactly once by commit or abort.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    read_version: Version,
    read_only: bool,
    state: TxnState,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, read_version: Version, read_only: bool) -> Self {
        Self {
            id,
            read_version,
            read_only,
            state: TxnState::Active,
        }
    }

    /// Transaction identifier.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Version the transaction reads at.
    pub fn read_version(&self) -> Version {
        self.read_version
    }

    /// Returns `true` for read-only transactions.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Commit version, once committed.
    pub fn commit_version(&self) -> Option<Version> {
        match self.state {
            TxnState::Committed(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            _ => Err(TreeError::TransactionClosed),
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.read_only {
            return Err(TreeError::ReadOnlyTransaction);
        }
        Ok(())
    }

    pub(crate) fn finish(&mut self, state: TxnState) {
        debug_assert_eq!(self.state, TxnState::Active);
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let ctx = TxnContext::new();
        let a = ctx.next_id();
        let b = ctx.next_id();
        assert!(b > a);
    }

    #[test]
    fn terminated_transactions_reject_use() {
        let mut txn = Transaction::new(1, 0, false);
        txn.ensure_writable().unwrap();
        txn.finish(TxnState::Committed(4));
        assert_eq!(txn.commit_version(), Some(4));
        assert!(matches!(
            txn.ensure_active(),
            Err(TreeError::TransactionClosed)
        ));
        let reader = Transaction::new(2, 3, true);
        assert!(matches!(
            reader.ensure_writable(),
            Err(TreeError::ReadOnlyTransaction)
        ));
    }
}
