/// JTA coordination tests
///
/// Tests for joining JTA transactions, managed flush and completion from other threads
/// Run with: cargo test --test jta_coordination_tests

#[path = "fixtures.rs"]
mod fixtures;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use fixtures::*;
use ormkit::jdbc::MemoryDatabase;
use ormkit::transaction::{JtaPlatform, JtaStatus, LocalJtaPlatform, Synchronization, TransactionId};
use ormkit::{Identifier, OrmError, SessionFactory, Settings, Value};

fn jta_factory(db: &MemoryDatabase, platform: &Arc<LocalJtaPlatform>, track_by_thread: bool) -> SessionFactory {
    SessionFactory::builder(order_model())
        .settings(Settings::new().jta_track_by_thread(track_by_thread))
        .connection_provider(Arc::new(db.clone()))
        .jta_platform(platform.clone())
        .build()
        .unwrap()
}

fn persist_customer(factory: &SessionFactory, session: &ormkit::Session, id: i64, name: &str) {
    let customer = factory.instantiate("Customer").unwrap();
    customer.set_identifier(Some(Identifier::simple(id))).unwrap();
    customer.set("name", name).unwrap();
    session.persist(&customer).unwrap();
}

#[test]
fn test_session_joins_and_commit_flushes() {
    let db = database();
    let platform = Arc::new(LocalJtaPlatform::new());
    let factory = jta_factory(&db, &platform, true);
    let session = open(&factory);

    let txn = platform.begin().unwrap();
    persist_customer(&factory, &session, 400, "Joined");
    assert!(session.is_joined_to_jta().unwrap());
    assert!(session.is_transaction_active().unwrap());

    platform.commit(txn).unwrap();
    assert!(!session.is_joined_to_jta().unwrap());
    assert_eq!(row_by_id(&db, "customer", 400).unwrap()[1], Value::from("Joined"));
    assert_eq!(factory.statistics().successful_transaction_count(), 1);
}

#[test]
fn test_local_begin_refused_while_joined() {
    let db = database();
    let platform = Arc::new(LocalJtaPlatform::new());
    let factory = jta_factory(&db, &platform, true);
    let session = open(&factory);

    let txn = platform.begin().unwrap();
    session.get("Customer", 100).unwrap();
    assert!(matches!(session.begin(), Err(OrmError::Transaction(_))));
    platform.rollback(txn).unwrap();
}

#[test]
fn test_rollback_only_turns_commit_into_rollback() {
    let db = database();
    let platform = Arc::new(LocalJtaPlatform::new());
    let factory = jta_factory(&db, &platform, true);
    let session = open(&factory);

    let txn = platform.begin().unwrap();
    persist_customer(&factory, &session, 401, "Doomed");
    session.mark_rollback_only().unwrap();
    assert_eq!(platform.status(txn).unwrap(), JtaStatus::MarkedRollback);

    assert!(platform.commit(txn).is_err());
    assert!(row_by_id(&db, "customer", 401).is_none());
}

#[test]
fn test_rollback_from_other_thread_is_delayed_until_owner_resumes() {
    let db = database();
    let platform = Arc::new(LocalJtaPlatform::new());
    let factory = jta_factory(&db, &platform, true);
    let session = open(&factory);

    let txn = platform.begin().unwrap();
    persist_customer(&factory, &session, 402, "Reaped");
    session.flush().unwrap();
    assert_eq!(session.managed_entity_count().unwrap(), 1);

    let reaper = platform.clone();
    thread::spawn(move || reaper.rollback(txn).unwrap()).join().unwrap();

    // nothing ran on the owning thread yet
    assert!(session.is_joined_to_jta().unwrap());
    assert_eq!(session.managed_entity_count().unwrap(), 1);

    assert!(matches!(
        session.is_dirty(),
        Err(OrmError::TransactionRolledBackOnDifferentThread)
    ));
    // the error is raised once; the session is usable again
    assert!(!session.is_dirty().unwrap());
    assert!(!session.is_joined_to_jta().unwrap());
    assert_eq!(session.managed_entity_count().unwrap(), 0);
    assert!(row_by_id(&db, "customer", 402).is_none());
    assert_eq!(factory.statistics().transaction_count(), 1);
}

#[test]
fn test_non_tracking_coordinator_completes_immediately() {
    let db = database();
    let platform = Arc::new(LocalJtaPlatform::new());
    let factory = jta_factory(&db, &platform, false);
    let session = open(&factory);

    let txn = platform.begin().unwrap();
    session.get("Customer", 100).unwrap().unwrap();

    let reaper = platform.clone();
    thread::spawn(move || reaper.rollback(txn).unwrap()).join().unwrap();

    assert!(!session.is_joined_to_jta().unwrap());
    assert_eq!(session.managed_entity_count().unwrap(), 1);
}

#[test]
fn test_commit_on_other_thread_is_not_delayed() {
    let db = database();
    let platform = Arc::new(LocalJtaPlatform::new());
    let factory = jta_factory(&db, &platform, true);
    let session = open(&factory);

    let txn = platform.begin().unwrap();
    persist_customer(&factory, &session, 403, "Remote");

    let committer = platform.clone();
    thread::spawn(move || committer.commit(txn).unwrap()).join().unwrap();

    assert!(!session.is_joined_to_jta().unwrap());
    assert_eq!(row_by_id(&db, "customer", 403).unwrap()[1], Value::from("Remote"));
}

/// Transaction manager whose status lookup can be switched to fail.
#[derive(Default)]
struct UnreachableStatusPlatform {
    inner: LocalJtaPlatform,
    failing: AtomicBool,
}

impl JtaPlatform for UnreachableStatusPlatform {
    fn current_transaction(&self) -> Option<TransactionId> {
        self.inner.current_transaction()
    }

    fn status(&self, transaction: TransactionId) -> ormkit::Result<JtaStatus> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OrmError::Jdbc("transaction manager unreachable".into()));
        }
        self.inner.status(transaction)
    }

    fn register_synchronization(
        &self,
        transaction: TransactionId,
        synchronization: Arc<dyn Synchronization>,
    ) -> ormkit::Result<()> {
        self.inner.register_synchronization(transaction, synchronization)
    }

    fn set_rollback_only(&self, transaction: TransactionId) -> ormkit::Result<()> {
        self.inner.set_rollback_only(transaction)
    }
}

#[test]
fn test_failed_status_check_rolls_back_instead_of_flushing() {
    let db = database();
    let platform = Arc::new(UnreachableStatusPlatform::default());
    let factory = SessionFactory::builder(order_model())
        .connection_provider(Arc::new(db.clone()))
        .jta_platform(platform.clone())
        .build()
        .unwrap();
    let session = open(&factory);

    let txn = platform.inner.begin().unwrap();
    persist_customer(&factory, &session, 900, "Unchecked");
    assert!(session.is_joined_to_jta().unwrap());

    platform.failing.store(true, Ordering::SeqCst);
    assert!(matches!(
        platform.inner.commit(txn),
        Err(OrmError::TransactionStatusCheck(_))
    ));
    assert!(row_by_id(&db, "customer", 900).is_none());
    assert!(!session.is_joined_to_jta().unwrap());
}
