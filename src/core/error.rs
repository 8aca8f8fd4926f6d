use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrmError {
    // ========================================================================
    // Configuration / boot
    // ========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Sequence increment mismatch: {0}")]
    SequenceMismatch(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown collection role: {0}")]
    UnknownCollection(String),

    #[error("Unknown property '{0}' on '{1}'")]
    UnknownProperty(String, String),

    // ========================================================================
    // Data consistency
    // ========================================================================
    #[error("More than one row with the given identifier was found: {0}")]
    DuplicateRow(String),

    #[error("No row with the given identifier exists: {0}")]
    ObjectNotFound(String),

    #[error("Query compilation error: {0}")]
    QueryCompilation(String),

    #[error("A different object with the same identifier value was already associated with the session: {0}")]
    NonUniqueObject(String),

    #[error("Row was updated or deleted by another transaction: {0}")]
    StaleObjectState(String),

    // ========================================================================
    // Transactions
    // ========================================================================
    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction was rolled back in a different thread!")]
    TransactionRolledBackOnDifferentThread,

    #[error("Managed flush failed: {0}")]
    ManagedFlush(String),

    #[error("Could not determine transaction status: {0}")]
    TransactionStatusCheck(String),

    // ========================================================================
    // JDBC
    // ========================================================================
    #[error("JDBC error: {0}")]
    Jdbc(String),

    #[error("Query timeout: {0}")]
    QueryTimeout(String),

    // ========================================================================
    // Other
    // ========================================================================
    #[error("Could not initialize proxy: {0}")]
    LazyInitialization(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, OrmError>;

impl OrmError {
    /// Errors after which the current unit of work must be rolled back.
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRow(_)
                | Self::NonUniqueObject(_)
                | Self::StaleObjectState(_)
                | Self::Transaction(_)
                | Self::TransactionRolledBackOnDifferentThread
                | Self::ManagedFlush(_)
                | Self::TransactionStatusCheck(_)
                | Self::Jdbc(_)
                | Self::QueryTimeout(_)
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Mapping(_)
                | Self::SequenceMismatch(_)
                | Self::UnknownEntity(_)
                | Self::UnknownCollection(_)
                | Self::UnknownProperty(_, _)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for OrmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(OrmError::Mapping("x".into()).is_configuration());
        assert!(!OrmError::Mapping("x".into()).requires_rollback());
        assert!(OrmError::DuplicateRow("Order#1".into()).requires_rollback());
        assert!(OrmError::TransactionRolledBackOnDifferentThread.requires_rollback());
    }

    #[test]
    fn test_poison_maps_to_lock_error() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();
        let err: OrmError = lock.lock().unwrap_err().into();
        assert!(matches!(err, OrmError::LockError(_)));
    }
}
