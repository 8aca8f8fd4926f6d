// ============================================================================
// JTA boundary: status values, synchronizations and an in-process platform
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use log::{debug, warn};
use tracing::{Level, event};

use crate::core::{OrmError, Result};

use super::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JtaStatus {
    Active,
    MarkedRollback,
    Preparing,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Unknown,
    NoTransaction,
}

impl JtaStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JtaStatus::Active)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, JtaStatus::Committed)
    }

    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            JtaStatus::MarkedRollback | JtaStatus::RollingBack | JtaStatus::RolledBack
        )
    }
}

impl fmt::Display for JtaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JtaStatus::Active => "ACTIVE",
            JtaStatus::MarkedRollback => "MARKED_ROLLBACK",
            JtaStatus::Preparing => "PREPARING",
            JtaStatus::Committing => "COMMITTING",
            JtaStatus::Committed => "COMMITTED",
            JtaStatus::RollingBack => "ROLLING_BACK",
            JtaStatus::RolledBack => "ROLLED_BACK",
            JtaStatus::Unknown => "UNKNOWN",
            JtaStatus::NoTransaction => "NO_TRANSACTION",
        };
        f.write_str(name)
    }
}

/// Callback object registered with a JTA transaction. The platform calls
/// `before_completion` then `after_completion(status)`, possibly from a
/// thread other than the one that registered it.
pub trait Synchronization: Send + Sync {
    fn before_completion(&self) -> Result<()>;

    fn after_completion(&self, status: JtaStatus) -> Result<()>;
}

/// Access to the transaction manager of the environment.
pub trait JtaPlatform: Send + Sync {
    /// Transaction bound to the calling thread.
    fn current_transaction(&self) -> Option<TransactionId>;

    fn status(&self, transaction: TransactionId) -> Result<JtaStatus>;

    fn register_synchronization(&self, transaction: TransactionId, synchronization: Arc<dyn Synchronization>)
    -> Result<()>;

    fn set_rollback_only(&self, transaction: TransactionId) -> Result<()>;
}

struct JtaTransaction {
    status: JtaStatus,
    synchronizations: Vec<Arc<dyn Synchronization>>,
}

/// In-process transaction manager. Transactions are bound to the thread
/// that begins them; any thread may complete them, as a reaper would.
#[derive(Default)]
pub struct LocalJtaPlatform {
    transactions: Mutex<HashMap<TransactionId, JtaTransaction>>,
    bound: Mutex<HashMap<ThreadId, TransactionId>>,
}

impl fmt::Debug for LocalJtaPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalJtaPlatform").finish_non_exhaustive()
    }
}

impl LocalJtaPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction bound to the calling thread.
    pub fn begin(&self) -> Result<TransactionId> {
        let thread = thread::current().id();
        let mut bound = self.bound.lock()?;
        if bound.contains_key(&thread) {
            return Err(OrmError::Transaction("Thread is already associated with a transaction".into()));
        }
        let id = TransactionId::new();
        self.transactions.lock()?.insert(
            id,
            JtaTransaction {
                status: JtaStatus::Active,
                synchronizations: Vec::new(),
            },
        );
        bound.insert(thread, id);
        debug!("Began JTA transaction {}", id);
        Ok(id)
    }

    /// Run the two-phase completion: before-completion callbacks, then
    /// after-completion with the final status. A failing callback turns the
    /// commit into a rollback and the failure is returned.
    pub fn commit(&self, transaction: TransactionId) -> Result<()> {
        let (status, synchronizations) = self.take(transaction)?;
        if status == JtaStatus::MarkedRollback {
            self.finish(transaction, JtaStatus::RolledBack, &synchronizations)?;
            return Err(OrmError::Transaction(format!(
                "Transaction {} was marked for rollback only",
                transaction
            )));
        }
        self.set_status(transaction, JtaStatus::Preparing)?;

        let mut failure = None;
        for synchronization in &synchronizations {
            if let Err(err) = synchronization.before_completion() {
                event!(Level::ERROR, error = %err, transaction = %transaction, "before_completion failed");
                failure = Some(err);
                break;
            }
        }
        let outcome = if failure.is_some() {
            JtaStatus::RolledBack
        } else {
            JtaStatus::Committed
        };
        let after = self.finish(transaction, outcome, &synchronizations);
        match failure {
            Some(err) => Err(err),
            None => after,
        }
    }

    /// Roll back from whichever thread calls this.
    pub fn rollback(&self, transaction: TransactionId) -> Result<()> {
        let (_, synchronizations) = self.take(transaction)?;
        self.set_status(transaction, JtaStatus::RollingBack)?;
        self.finish(transaction, JtaStatus::RolledBack, &synchronizations)
    }

    fn take(&self, transaction: TransactionId) -> Result<(JtaStatus, Vec<Arc<dyn Synchronization>>)> {
        let transactions = self.transactions.lock()?;
        let txn = transactions
            .get(&transaction)
            .ok_or_else(|| OrmError::TransactionStatusCheck(format!("Unknown transaction {}", transaction)))?;
        if !matches!(txn.status, JtaStatus::Active | JtaStatus::MarkedRollback) {
            return Err(OrmError::Transaction(format!(
                "Transaction {} is {}",
                transaction, txn.status
            )));
        }
        Ok((txn.status, txn.synchronizations.clone()))
    }

    fn set_status(&self, transaction: TransactionId, status: JtaStatus) -> Result<()> {
        if let Some(txn) = self.transactions.lock()?.get_mut(&transaction) {
            txn.status = status;
        }
        Ok(())
    }

    /// Every synchronization sees after-completion even when one fails;
    /// the first failure is returned.
    fn finish(
        &self,
        transaction: TransactionId,
        status: JtaStatus,
        synchronizations: &[Arc<dyn Synchronization>],
    ) -> Result<()> {
        self.set_status(transaction, status)?;
        self.bound.lock()?.retain(|_, bound| *bound != transaction);
        self.transactions.lock()?.remove(&transaction);

        let mut first_error = None;
        for synchronization in synchronizations {
            if let Err(err) = synchronization.after_completion(status) {
                warn!("after_completion failed for {}: {}", transaction, err);
                first_error.get_or_insert(err);
            }
        }
        event!(Level::DEBUG, transaction = %transaction, status = %status, "JTA transaction completed");
        first_error.map_or(Ok(()), Err)
    }
}

impl JtaPlatform for LocalJtaPlatform {
    fn current_transaction(&self) -> Option<TransactionId> {
        let thread = thread::current().id();
        self.bound.lock().ok().and_then(|bound| bound.get(&thread).copied())
    }

    fn status(&self, transaction: TransactionId) -> Result<JtaStatus> {
        Ok(self
            .transactions
            .lock()?
            .get(&transaction)
            .map_or(JtaStatus::NoTransaction, |txn| txn.status))
    }

    fn register_synchronization(
        &self,
        transaction: TransactionId,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<()> {
        let mut transactions = self.transactions.lock()?;
        let txn = transactions
            .get_mut(&transaction)
            .ok_or_else(|| OrmError::TransactionStatusCheck(format!("Unknown transaction {}", transaction)))?;
        if !matches!(txn.status, JtaStatus::Active | JtaStatus::MarkedRollback) {
            return Err(OrmError::Transaction(format!(
                "Cannot register a synchronization with {} transaction {}",
                txn.status, transaction
            )));
        }
        txn.synchronizations.push(synchronization);
        Ok(())
    }

    fn set_rollback_only(&self, transaction: TransactionId) -> Result<()> {
        let mut transactions = self.transactions.lock()?;
        let txn = transactions
            .get_mut(&transaction)
            .ok_or_else(|| OrmError::TransactionStatusCheck(format!("Unknown transaction {}", transaction)))?;
        txn.status = JtaStatus::MarkedRollback;
        Ok(())
    }
}
