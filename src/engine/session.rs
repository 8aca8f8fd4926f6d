// ============================================================================
// Session: unit of work over one connection and one persistence context
// ============================================================================

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};
use tracing::{Level, event, info_span};

use crate::config::FlushMode;
use crate::core::{OrmError, Result};
use crate::id::Identifier;
use crate::jdbc::{JdbcConnection, PreparedStatement, ResultCursor};
use crate::loadplan::LoadQueryInfluencers;
use crate::result::ResultValue;
use crate::sql::{ParameterBindings, RenderedStatement};
use crate::transaction::{
    CallbackTarget, JtaStatus, NonTrackingCoordinator, RegisteredSynchronization, SynchronizationCallbackCoordinator,
    TrackingCoordinator, Transaction, TransactionId,
};

use super::action::{ActionQueue, CacheCompletion, run_completions};
use super::batch::BatchFetchQueue;
use super::context::{EntityStatus, PersistenceContext};
use super::entity::{CollectionHandle, EntityHandle};
use super::factory::FactoryInner;
use super::query::{Restriction, SelectionQuery};

/// Mutable per-session state; every operation runs with this locked.
pub(crate) struct SessionState {
    pub(super) factory: Arc<FactoryInner>,
    pub(super) context: PersistenceContext,
    pub(super) batch: BatchFetchQueue,
    pub(super) actions: ActionQueue,
    connection: Option<Box<dyn JdbcConnection>>,
    pub(super) transaction: Transaction,
    pub(super) influencers: LoadQueryInfluencers,
    /// Start of the current unit of work, in cache timestamp units
    pub(super) tx_timestamp: i64,
    pub(super) completions: Vec<CacheCompletion>,
    pub(super) jta_transaction: Option<TransactionId>,
    pub(super) closed: bool,
    pub(super) flush_mode: FlushMode,
}

impl SessionState {
    fn new(factory: Arc<FactoryInner>) -> Self {
        let tx_timestamp = factory.regions.next_timestamp();
        let flush_mode = factory.settings.flush_mode;
        Self {
            factory,
            context: PersistenceContext::new(),
            batch: BatchFetchQueue::new(),
            actions: ActionQueue::new(),
            connection: None,
            transaction: Transaction::new(),
            influencers: LoadQueryInfluencers::new(),
            tx_timestamp,
            completions: Vec::new(),
            jta_transaction: None,
            closed: false,
            flush_mode,
        }
    }

    fn connection(&mut self) -> Result<&mut Box<dyn JdbcConnection>> {
        if self.connection.is_none() {
            debug!("Acquiring JDBC connection");
            self.connection = Some(self.factory.provider.get_connection()?);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| OrmError::IllegalState("No connection available".into()))
    }

    /// Inside a local or JTA transaction.
    pub(super) fn in_transaction(&self) -> bool {
        self.transaction.can_rollback() || self.jta_transaction.is_some()
    }

    fn prepare(&mut self, rendered: &Arc<RenderedStatement>, bindings: ParameterBindings) -> Result<PreparedStatement> {
        let factory = self.factory.clone();
        let connection = self.connection()?;
        let statement = factory.wrap(connection.as_mut(), rendered)?;
        factory.statistics.statement_prepared();
        PreparedStatement::prepare(statement, bindings, factory.settings.query_timeout)
    }

    pub(super) fn query(
        &mut self,
        rendered: &Arc<RenderedStatement>,
        bindings: ParameterBindings,
    ) -> Result<Box<dyn ResultCursor>> {
        let statement = self.prepare(rendered, bindings)?;
        let factory = self.factory.clone();
        debug!("{}", statement.sql());
        self.connection()?
            .execute_query(&statement)
            .map_err(|e| factory.exception_converter.convert(e, statement.sql()))
    }

    pub(super) fn update(&mut self, rendered: &Arc<RenderedStatement>, bindings: ParameterBindings) -> Result<usize> {
        let statement = self.prepare(rendered, bindings)?;
        let factory = self.factory.clone();
        debug!("{}", statement.sql());
        self.connection()?
            .execute_update(&statement)
            .map_err(|e| factory.exception_converter.convert(e, statement.sql()))
    }

    /// Deferred until completion inside a transaction, immediate otherwise.
    pub(super) fn register_completion(&mut self, completion: CacheCompletion) -> Result<()> {
        if self.in_transaction() {
            self.completions.push(completion);
            Ok(())
        } else {
            completion.run(true)
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(OrmError::IllegalState("Session is closed".into()));
        }
        Ok(())
    }

    fn begin_connection_transaction(&mut self) -> Result<()> {
        let connection = self.connection()?;
        if !connection.in_transaction() {
            connection.begin()?;
        }
        self.tx_timestamp = self.factory.regions.next_timestamp();
        Ok(())
    }

    fn end_connection_transaction(&mut self, successful: bool) -> Result<()> {
        if let Some(connection) = self.connection.as_mut() {
            if connection.in_transaction() {
                if successful {
                    connection.commit()?;
                } else {
                    connection.rollback()?;
                }
            }
        }
        Ok(())
    }

    fn finish_transaction(&mut self, successful: bool) -> Result<()> {
        let completions = std::mem::take(&mut self.completions);
        let statistics = &self.factory.statistics;
        statistics.transaction_completed();
        if successful {
            statistics.transaction_succeeded();
        }
        run_completions(completions, successful)
    }

    // ========================================================================
    // Local transactions
    // ========================================================================

    fn begin(&mut self) -> Result<TransactionId> {
        if self.jta_transaction.is_some() {
            return Err(OrmError::Transaction(
                "Session is joined to a JTA transaction".into(),
            ));
        }
        let id = self.transaction.begin()?;
        if let Err(err) = self.begin_connection_transaction() {
            self.transaction.complete(false);
            return Err(err);
        }
        info!("Began transaction {}", id);
        Ok(id)
    }

    fn commit(&mut self) -> Result<()> {
        self.transaction.start_commit()?;
        let _span = info_span!("commit").entered();
        let outcome = (|| {
            if self.flush_mode != FlushMode::Manual {
                self.flush()?;
            }
            self.end_connection_transaction(true)
        })();
        match outcome {
            Ok(()) => {
                self.transaction.complete(true);
                self.finish_transaction(true)
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "Commit failed, rolling back");
                if let Err(rollback) = self.end_connection_transaction(false) {
                    warn!("Rollback after failed commit also failed: {}", rollback);
                }
                self.transaction.complete(false);
                self.finish_transaction(false)?;
                Err(err)
            }
        }
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.transaction.can_rollback() {
            return Err(OrmError::Transaction(format!(
                "Cannot roll back: transaction is {}",
                self.transaction.state()
            )));
        }
        let result = self.end_connection_transaction(false);
        self.transaction.complete(false);
        self.actions.clear();
        self.finish_transaction(false)?;
        result
    }

    // ========================================================================
    // JTA completion
    // ========================================================================

    fn after_jta_completion(&mut self, successful: bool, delayed: bool) -> Result<()> {
        let ended = self.end_connection_transaction(successful);
        self.jta_transaction = None;
        self.actions.clear();
        let finished = self.finish_transaction(successful);
        if delayed {
            debug!("Clearing persistence context after a rollback on another thread");
            self.clear();
        }
        ended.and(finished)
    }

    fn is_jta_rollback_only(&self) -> Result<bool> {
        match (&self.factory.jta_platform, self.jta_transaction) {
            (Some(platform), Some(id)) => Ok(platform.status(id)? == JtaStatus::MarkedRollback),
            _ => Ok(false),
        }
    }

    fn mark_jta_rollback_only(&self) -> Result<()> {
        match (&self.factory.jta_platform, self.jta_transaction) {
            (Some(platform), Some(id)) => platform.set_rollback_only(id),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Context management
    // ========================================================================

    pub(super) fn clear(&mut self) {
        self.context.clear();
        self.batch.clear();
        self.actions.clear();
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.transaction.can_rollback() {
            warn!("Closing session with an active transaction; rolling back");
            self.rollback()?;
        }
        if self.jta_transaction.is_none() {
            self.connection = None;
        }
        self.clear();
        self.closed = true;
        self.factory.statistics.session_closed();
        Ok(())
    }

    fn contains(&self, handle: &EntityHandle) -> bool {
        match self.context.key_of(handle).and_then(|key| self.context.entity(&key)) {
            Some(entry) => matches!(entry.status, EntityStatus::Managed | EntityStatus::Loading),
            None => false,
        }
    }
}

pub(crate) struct SessionShared {
    factory: Arc<FactoryInner>,
    state: Mutex<SessionState>,
    coordinator: Arc<dyn SynchronizationCallbackCoordinator>,
}

/// Callback target handed to the synchronization coordinator.
struct SessionCallbacks {
    shared: Weak<SessionShared>,
}

impl SessionCallbacks {
    fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> Result<T>) -> Result<T> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| OrmError::IllegalState("Session no longer exists".into()))?;
        let mut state = shared.state.lock()?;
        f(&mut state)
    }
}

impl CallbackTarget for SessionCallbacks {
    fn is_active(&self) -> Result<bool> {
        self.with_state(|s| Ok(s.jta_transaction.is_some()))
    }

    fn flush_mode(&self) -> FlushMode {
        self.with_state(|s| Ok(s.flush_mode)).unwrap_or(FlushMode::Manual)
    }

    fn is_closed(&self) -> bool {
        self.with_state(|s| Ok(s.closed)).unwrap_or(true)
    }

    fn is_rollback_only(&self) -> Result<bool> {
        self.with_state(|s| s.is_jta_rollback_only())
    }

    fn mark_for_rollback_only(&self) -> Result<()> {
        self.with_state(|s| s.mark_jta_rollback_only())
    }

    fn managed_flush(&self) -> Result<()> {
        self.with_state(|s| s.flush())
    }

    fn before_completion(&self) -> Result<()> {
        Ok(())
    }

    fn after_completion(&self, successful: bool, delayed: bool) -> Result<()> {
        self.with_state(|s| s.after_jta_completion(successful, delayed))
    }
}

/// A single-threaded unit of work. Cloning shares the same session.
///
/// A session joins the calling thread's JTA transaction, when a platform is
/// configured, on its first operation inside it.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.state.try_lock() {
            Ok(state) => f
                .debug_struct("Session")
                .field("entities", &state.context.entity_count())
                .field("collections", &state.context.collection_count())
                .field("closed", &state.closed)
                .finish(),
            Err(_) => f.write_str("Session(<busy>)"),
        }
    }
}

impl Session {
    pub(crate) fn open(factory: Arc<FactoryInner>) -> Result<Session> {
        let state = SessionState::new(factory.clone());
        let shared = Arc::new_cyclic(|weak: &Weak<SessionShared>| {
            let target: Arc<dyn CallbackTarget> = Arc::new(SessionCallbacks { shared: weak.clone() });
            let mapper = factory.exception_mapper.clone();
            let checker = factory.flush_checker.clone();
            let coordinator: Arc<dyn SynchronizationCallbackCoordinator> = if factory.settings.jta_track_by_thread {
                Arc::new(TrackingCoordinator::new(target, mapper, checker))
            } else {
                Arc::new(NonTrackingCoordinator::new(target, mapper, checker))
            };
            SessionShared {
                factory,
                state: Mutex::new(state),
                coordinator,
            }
        });
        debug!("Opened session");
        Ok(Session { shared })
    }

    fn ensure_open(&self) -> Result<()> {
        self.shared.state.lock()?.ensure_open()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        let state = self.shared.state.lock()?;
        state.ensure_open()?;
        Ok(state)
    }

    /// Process a rollback completed on another thread, then join the
    /// current JTA transaction if there is one. Runs without the state lock.
    fn pulse(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.coordinator.process_any_delayed_after_completion()?;
        self.join_jta()
    }

    fn join_jta(&self) -> Result<()> {
        let Some(platform) = self.shared.factory.jta_platform.clone() else {
            return Ok(());
        };
        let Some(current) = platform.current_transaction() else {
            return Ok(());
        };
        {
            let mut state = self.lock()?;
            if state.jta_transaction == Some(current) {
                return Ok(());
            }
            if state.transaction.can_rollback() {
                return Err(OrmError::Transaction(
                    "Cannot join a JTA transaction while a local transaction is active".into(),
                ));
            }
            state.jta_transaction = Some(current);
            state.begin_connection_transaction()?;
        }
        let synchronization = Arc::new(RegisteredSynchronization::new(self.shared.coordinator.clone()));
        if let Err(err) = platform.register_synchronization(current, synchronization) {
            let mut state = self.shared.state.lock()?;
            state.jta_transaction = None;
            state.end_connection_transaction(false)?;
            return Err(err);
        }
        debug!("Joined JTA transaction {}", current);
        Ok(())
    }

    fn run<T>(&self, f: impl FnOnce(&mut SessionState) -> Result<T>) -> Result<T> {
        self.pulse()?;
        let mut state = self.lock()?;
        f(&mut state)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Initialized instance for `id`, or `None` when no row exists.
    pub fn get(&self, entity: &str, id: impl Into<Identifier>) -> Result<Option<EntityHandle>> {
        let id = id.into();
        self.run(|s| s.get(entity, id))
    }

    /// Reference to `id` without reading the database; a proxy unless the
    /// instance is already managed.
    pub fn load(&self, entity: &str, id: impl Into<Identifier>) -> Result<EntityHandle> {
        let id = id.into();
        self.run(|s| s.load(entity, id))
    }

    /// Every instance of `entity` matching all `restrictions`.
    pub fn find_all(&self, entity: &str, restrictions: &[Restriction]) -> Result<Vec<EntityHandle>> {
        self.run(|s| s.find_all(entity, restrictions))
    }

    /// Initialize a proxy; fails with `ObjectNotFound` when its row is gone.
    pub fn initialize(&self, handle: &EntityHandle) -> Result<()> {
        self.run(|s| s.initialize_entity(handle))
    }

    pub fn initialize_collection(&self, collection: &CollectionHandle) -> Result<()> {
        self.run(|s| s.initialize_collection(collection))
    }

    /// Re-read the state of `handle` and its refresh-cascaded associations.
    pub fn refresh(&self, handle: &EntityHandle) -> Result<()> {
        self.run(|s| s.refresh(handle))
    }

    pub fn execute_query(&self, query: &SelectionQuery) -> Result<Vec<ResultValue>> {
        self.run(|s| s.execute_query(query))
    }

    pub fn enable_fetch_profile(&self, name: &str) -> Result<()> {
        self.run(|s| {
            let factory = s.factory.clone();
            s.influencers.enable_fetch_profile(&factory.registry, name)
        })
    }

    pub fn disable_fetch_profile(&self, name: &str) -> Result<bool> {
        self.run(|s| Ok(s.influencers.disable_fetch_profile(name)))
    }

    pub fn is_fetch_profile_enabled(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.influencers.is_fetch_profile_enabled(name))
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Make a transient instance managed; its row is inserted at flush.
    pub fn persist(&self, handle: &EntityHandle) -> Result<()> {
        self.run(|s| s.persist(handle))
    }

    /// Copy the state of `handle` onto the managed instance with the same
    /// identifier and return that instance.
    pub fn merge(&self, handle: &EntityHandle) -> Result<EntityHandle> {
        self.run(|s| s.merge(handle))
    }

    /// Schedule a managed instance for deletion at flush.
    pub fn remove(&self, handle: &EntityHandle) -> Result<()> {
        self.run(|s| s.remove(handle))
    }

    pub fn flush(&self) -> Result<()> {
        self.run(|s| s.flush())
    }

    pub fn is_dirty(&self) -> Result<bool> {
        self.run(|s| s.is_dirty())
    }

    pub fn flush_mode(&self) -> Result<FlushMode> {
        Ok(self.lock()?.flush_mode)
    }

    pub fn set_flush_mode(&self, mode: FlushMode) -> Result<()> {
        self.lock()?.flush_mode = mode;
        Ok(())
    }

    // ========================================================================
    // Context
    // ========================================================================

    /// Detach `handle` and what it cascades evict to.
    pub fn evict(&self, handle: &EntityHandle) -> Result<()> {
        self.run(|s| s.evict(handle))
    }

    pub fn clear(&self) -> Result<()> {
        self.run(|s| {
            s.clear();
            Ok(())
        })
    }

    pub fn contains(&self, handle: &EntityHandle) -> Result<bool> {
        Ok(self.lock()?.contains(handle))
    }

    pub fn identifier(&self, handle: &EntityHandle) -> Result<Identifier> {
        let state = self.lock()?;
        state
            .context
            .key_of(handle)
            .map(|key| key.id)
            .ok_or_else(|| OrmError::IllegalState("Instance is not associated with this session".into()))
    }

    pub fn managed_entity_count(&self) -> Result<usize> {
        Ok(self.lock()?.context.entity_count())
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().is_ok_and(|s| !s.closed)
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        state.close()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a resource-local transaction.
    pub fn begin(&self) -> Result<TransactionId> {
        self.run(|s| s.begin())
    }

    /// Flush (unless flush mode is manual) and commit the local transaction.
    pub fn commit(&self) -> Result<()> {
        self.run(|s| s.commit())
    }

    pub fn rollback(&self) -> Result<()> {
        self.run(|s| s.rollback())
    }

    pub fn mark_rollback_only(&self) -> Result<()> {
        self.run(|s| {
            if s.jta_transaction.is_some() {
                s.mark_jta_rollback_only()
            } else {
                s.transaction.mark_rollback_only()
            }
        })
    }

    pub fn is_transaction_active(&self) -> Result<bool> {
        Ok(self.lock()?.in_transaction())
    }

    pub fn is_joined_to_jta(&self) -> Result<bool> {
        Ok(self.lock()?.jta_transaction.is_some())
    }
}
