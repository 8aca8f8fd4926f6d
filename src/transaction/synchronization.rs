// ============================================================================
// Synchronization callback coordination
// ============================================================================

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use tracing::{Level, event};

use crate::config::FlushMode;
use crate::core::{OrmError, Result};

use super::jta::{JtaStatus, Synchronization};

static NEXT_THREAD_NUMBER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_NUMBER: Cell<u64> = const { Cell::new(0) };
}

/// Small stable number for the calling thread, usable in an atomic.
pub fn current_thread_number() -> u64 {
    THREAD_NUMBER.with(|n| {
        if n.get() == 0 {
            n.set(NEXT_THREAD_NUMBER.fetch_add(1, Ordering::Relaxed));
        }
        n.get()
    })
}

/// Engine side of a JTA transaction: the session the callbacks act on.
pub trait CallbackTarget: Send + Sync {
    /// Still joined and open.
    fn is_active(&self) -> Result<bool>;

    fn flush_mode(&self) -> FlushMode;

    fn is_closed(&self) -> bool;

    /// Asks the transaction manager; a failed status check is returned.
    fn is_rollback_only(&self) -> Result<bool>;

    fn mark_for_rollback_only(&self) -> Result<()>;

    /// Flush as part of before-completion.
    fn managed_flush(&self) -> Result<()>;

    fn before_completion(&self) -> Result<()>;

    /// `delayed` is set when the completion ran late on the owning thread.
    fn after_completion(&self, successful: bool, delayed: bool) -> Result<()>;
}

/// Translates transaction-boundary failures into engine errors.
pub trait ExceptionMapper: Send + Sync {
    fn map_status_check_failure(&self, message: &str, cause: OrmError) -> OrmError;

    fn map_managed_flush_failure(&self, message: &str, cause: OrmError) -> OrmError;
}

#[derive(Debug, Default)]
pub struct StandardExceptionMapper;

impl ExceptionMapper for StandardExceptionMapper {
    fn map_status_check_failure(&self, message: &str, cause: OrmError) -> OrmError {
        OrmError::TransactionStatusCheck(format!("{}: {}", message, cause))
    }

    fn map_managed_flush_failure(&self, message: &str, cause: OrmError) -> OrmError {
        match cause {
            // optimistic lock failures keep their identity
            OrmError::StaleObjectState(_) => cause,
            other => OrmError::ManagedFlush(format!("{}: {}", message, other)),
        }
    }
}

/// Decides whether before-completion flushes the session.
pub trait ManagedFlushChecker: Send + Sync {
    fn should_do_managed_flush(&self, target: &dyn CallbackTarget) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct StandardManagedFlushChecker;

impl ManagedFlushChecker for StandardManagedFlushChecker {
    fn should_do_managed_flush(&self, target: &dyn CallbackTarget) -> Result<bool> {
        if target.is_closed() || target.flush_mode() == FlushMode::Manual {
            return Ok(false);
        }
        Ok(!target.is_rollback_only()?)
    }
}

/// Routes JTA completion callbacks into the engine.
pub trait SynchronizationCallbackCoordinator: Send + Sync {
    fn synchronization_registered(&self);

    fn before_completion(&self) -> Result<()>;

    fn after_completion(&self, status: JtaStatus) -> Result<()>;

    /// Must run on the owning thread before the session is reused.
    fn process_any_delayed_after_completion(&self) -> Result<()>;
}

pub struct NonTrackingCoordinator {
    target: Arc<dyn CallbackTarget>,
    exception_mapper: Arc<dyn ExceptionMapper>,
    flush_checker: Arc<dyn ManagedFlushChecker>,
}

impl NonTrackingCoordinator {
    pub fn new(
        target: Arc<dyn CallbackTarget>,
        exception_mapper: Arc<dyn ExceptionMapper>,
        flush_checker: Arc<dyn ManagedFlushChecker>,
    ) -> Self {
        Self {
            target,
            exception_mapper,
            flush_checker,
        }
    }

    fn do_before_completion(&self) -> Result<()> {
        let should_flush = match self.managed_flush_decision() {
            Ok(None) => return Ok(()),
            Ok(Some(flush)) => flush,
            Err(err) => {
                let mapped = self
                    .exception_mapper
                    .map_status_check_failure("could not determine transaction status in before_completion", err);
                self.mark_rollback_only(&mapped);
                return Err(mapped);
            }
        };
        let result = (|| {
            if should_flush {
                self.target
                    .managed_flush()
                    .map_err(|e| self.exception_mapper.map_managed_flush_failure("error during managed flush", e))?;
            }
            self.target.before_completion()
        })();
        if let Err(err) = &result {
            self.mark_rollback_only(err);
        }
        result
    }

    /// `None` when the target is no longer joined.
    fn managed_flush_decision(&self) -> Result<Option<bool>> {
        if !self.target.is_active()? {
            return Ok(None);
        }
        self.flush_checker.should_do_managed_flush(self.target.as_ref()).map(Some)
    }

    fn mark_rollback_only(&self, cause: &OrmError) {
        event!(Level::ERROR, error = %cause, "before_completion failed, marking rollback only");
        if let Err(err) = self.target.mark_for_rollback_only() {
            event!(Level::ERROR, error = %err, "could not mark transaction rollback only");
        }
    }

    fn do_after_completion(&self, successful: bool, delayed: bool) -> Result<()> {
        debug!("after_completion (successful={}, delayed={})", successful, delayed);
        self.target.after_completion(successful, delayed)
    }
}

impl SynchronizationCallbackCoordinator for NonTrackingCoordinator {
    fn synchronization_registered(&self) {}

    fn before_completion(&self) -> Result<()> {
        self.do_before_completion()
    }

    fn after_completion(&self, status: JtaStatus) -> Result<()> {
        self.do_after_completion(status.is_committed(), false)
    }

    fn process_any_delayed_after_completion(&self) -> Result<()> {
        Ok(())
    }
}

/// Remembers the registering thread. A rollback completed from any other
/// thread is deferred until the owner calls
/// `process_any_delayed_after_completion`.
pub struct TrackingCoordinator {
    delegate: NonTrackingCoordinator,
    registration_thread: AtomicU64,
    delayed_completion: AtomicBool,
}

impl TrackingCoordinator {
    pub fn new(
        target: Arc<dyn CallbackTarget>,
        exception_mapper: Arc<dyn ExceptionMapper>,
        flush_checker: Arc<dyn ManagedFlushChecker>,
    ) -> Self {
        Self {
            delegate: NonTrackingCoordinator::new(target, exception_mapper, flush_checker),
            registration_thread: AtomicU64::new(0),
            delayed_completion: AtomicBool::new(false),
        }
    }

    pub fn has_delayed_completion(&self) -> bool {
        self.delayed_completion.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.registration_thread.store(0, Ordering::Release);
    }
}

impl SynchronizationCallbackCoordinator for TrackingCoordinator {
    fn synchronization_registered(&self) {
        self.delayed_completion.store(false, Ordering::Release);
        self.registration_thread.store(current_thread_number(), Ordering::Release);
    }

    fn before_completion(&self) -> Result<()> {
        self.delegate.do_before_completion()
    }

    fn after_completion(&self, status: JtaStatus) -> Result<()> {
        let registered = self.registration_thread.load(Ordering::Acquire);
        let is_registration_thread = registered == 0 || registered == current_thread_number();
        if status.is_rollback() && !is_registration_thread {
            warn!(
                "Transaction afterCompletion called by a background thread; delaying rollback handling until the owning thread resumes (status {})",
                status
            );
            self.delayed_completion.store(true, Ordering::Release);
            return Ok(());
        }
        let result = self.delegate.do_after_completion(status.is_committed(), false);
        self.reset();
        result
    }

    fn process_any_delayed_after_completion(&self) -> Result<()> {
        if self.delayed_completion.swap(false, Ordering::AcqRel) {
            let cleanup = self.delegate.do_after_completion(false, true);
            self.reset();
            cleanup?;
            return Err(OrmError::TransactionRolledBackOnDifferentThread);
        }
        Ok(())
    }
}

/// Synchronization handed to the JTA platform; forwards to a coordinator.
pub struct RegisteredSynchronization {
    coordinator: Arc<dyn SynchronizationCallbackCoordinator>,
}

impl RegisteredSynchronization {
    pub fn new(coordinator: Arc<dyn SynchronizationCallbackCoordinator>) -> Self {
        coordinator.synchronization_registered();
        Self { coordinator }
    }
}

impl Synchronization for RegisteredSynchronization {
    fn before_completion(&self) -> Result<()> {
        self.coordinator.before_completion()
    }

    fn after_completion(&self, status: JtaStatus) -> Result<()> {
        self.coordinator.after_completion(status)
    }
}
