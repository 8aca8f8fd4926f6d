// ============================================================================
// Transaction Coordination Module
// ============================================================================
//
// Session transaction state, the JTA boundary and the coordinators that
// route completion callbacks back into a session.
//
// ============================================================================

pub mod jta;
pub mod state;
pub mod synchronization;

pub use jta::{JtaPlatform, JtaStatus, LocalJtaPlatform, Synchronization};
pub use state::{Transaction, TransactionId, TransactionState};
pub use synchronization::{
    CallbackTarget, ExceptionMapper, ManagedFlushChecker, NonTrackingCoordinator, RegisteredSynchronization,
    StandardExceptionMapper, StandardManagedFlushChecker, SynchronizationCallbackCoordinator, TrackingCoordinator,
};
