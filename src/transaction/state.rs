// ============================================================================
// Unit-of-work transaction state
// ============================================================================
//
// State machine of one session transaction:
//
// ```text
// NotActive ──begin──> Active ──commit──> Committing ──> Committed
//                        │  │                  │
//                        │  └─mark_rollback_only─> MarkedRollback
//                        │                     │          │
//                        └─────rollback────────┴──────────┴──> RolledBack
// ```
//
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{OrmError, Result};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotActive,
    Active,
    MarkedRollback,
    Committing,
    RolledBack,
    Committed,
}

impl TransactionState {
    /// Work may still run inside the transaction.
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active | TransactionState::MarkedRollback)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::NotActive => write!(f, "NOT_ACTIVE"),
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::MarkedRollback => write!(f, "MARKED_ROLLBACK"),
            TransactionState::Committing => write!(f, "COMMITTING"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
            TransactionState::Committed => write!(f, "COMMITTED"),
        }
    }
}

/// Session-side view of one transaction.
#[derive(Debug)]
pub struct Transaction {
    id: Option<TransactionId>,
    state: TransactionState,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: None,
            state: TransactionState::NotActive,
        }
    }

    pub fn id(&self) -> Option<TransactionId> {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state == TransactionState::MarkedRollback
    }

    /// # Errors
    /// Returns error if a transaction is already in progress
    pub fn begin(&mut self) -> Result<TransactionId> {
        if self.state.is_active() || self.state == TransactionState::Committing {
            return Err(OrmError::Transaction(format!(
                "Cannot begin: transaction {} is {}",
                self.describe(),
                self.state
            )));
        }
        let id = TransactionId::new();
        self.id = Some(id);
        self.state = TransactionState::Active;
        Ok(id)
    }

    pub fn mark_rollback_only(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(OrmError::Transaction(format!(
                "Cannot mark for rollback: transaction {} is {}",
                self.describe(),
                self.state
            )));
        }
        self.state = TransactionState::MarkedRollback;
        Ok(())
    }

    /// Enter the commit window.
    ///
    /// # Errors
    /// Returns error if the transaction is not active or was marked rollback-only
    pub fn start_commit(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {
                self.state = TransactionState::Committing;
                Ok(())
            }
            TransactionState::MarkedRollback => Err(OrmError::Transaction(format!(
                "Transaction {} was marked for rollback only",
                self.describe()
            ))),
            other => Err(OrmError::Transaction(format!(
                "Cannot commit: transaction {} is {}",
                self.describe(),
                other
            ))),
        }
    }

    /// Record how the transaction ended.
    pub fn complete(&mut self, successful: bool) {
        self.state = if successful {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        };
    }

    pub fn can_rollback(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Active | TransactionState::MarkedRollback | TransactionState::Committing
        )
    }

    fn describe(&self) -> String {
        self.id.map_or_else(|| "<none>".to_string(), |id| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_generation() {
        let id1 = TransactionId::new();
        let id2 = TransactionId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_commit_lifecycle() {
        let mut txn = Transaction::new();
        assert_eq!(txn.state(), TransactionState::NotActive);
        txn.begin().unwrap();
        assert!(txn.is_active());
        assert!(txn.begin().is_err());
        txn.start_commit().unwrap();
        assert_eq!(txn.state(), TransactionState::Committing);
        txn.complete(true);
        assert!(txn.state().is_terminal());
        // a finished transaction may be followed by a new one
        txn.begin().unwrap();
    }

    #[test]
    fn test_rollback_only_blocks_commit() {
        let mut txn = Transaction::new();
        txn.begin().unwrap();
        txn.mark_rollback_only().unwrap();
        assert!(txn.is_active());
        assert!(matches!(txn.start_commit(), Err(OrmError::Transaction(_))));
        assert!(txn.can_rollback());
        txn.complete(false);
        assert_eq!(txn.state(), TransactionState::RolledBack);
        assert!(txn.mark_rollback_only().is_err());
    }
}
