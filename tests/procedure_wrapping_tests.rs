/// Procedure wrapping tests
///
/// Tests for sending generated statements through stored routines
/// Run with: cargo test --test procedure_wrapping_tests

#[path = "fixtures.rs"]
mod fixtures;

use std::sync::Arc;

use fixtures::*;
use ormkit::jdbc::MemoryDatabase;
use ormkit::sql::{AnsiDialect, Dialect, MySqlDialect, PostgreSqlDialect};
use ormkit::{Identifier, OrmError, SessionFactory, Settings, Value};

fn wrapped_factory(db: &MemoryDatabase, dialect: Arc<dyn Dialect>) -> ormkit::Result<SessionFactory> {
    SessionFactory::builder(order_model())
        .settings(Settings::new().use_stored_procedures(true))
        .dialect(dialect)
        .connection_provider(Arc::new(db.clone()))
        .build()
}

#[test]
fn test_load_goes_through_generated_routine() {
    let db = database();
    let factory = wrapped_factory(&db, Arc::new(MySqlDialect)).unwrap();
    let session = open(&factory);

    let order = session.get("Order", 1).unwrap().unwrap();
    assert_eq!(order.get("status").unwrap(), Value::from("NEW"));
    assert_eq!(
        order.reference("payment").unwrap().unwrap().get("amount").unwrap(),
        Value::Float(99.5)
    );

    assert_eq!(db.routine_names().unwrap(), vec!["orm_orders_select".to_string()]);
    let statements = db.statements().unwrap();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].starts_with("create procedure orm_orders_select(in p1 "));
    assert!(statements[0].contains(" left outer join payment "));
    assert_eq!(statements[1], "call orm_orders_select(?)");
}

#[test]
fn test_routine_is_created_once_per_statement_shape() {
    let db = database();
    let factory = wrapped_factory(&db, Arc::new(MySqlDialect)).unwrap();

    open(&factory).get("Order", 1).unwrap().unwrap();
    let second = open(&factory);
    let order = second.get("Order", 2).unwrap().unwrap();
    assert!(order.reference("payment").unwrap().is_none());

    assert_eq!(db.count_statements("create procedure").unwrap(), 1);
    assert_eq!(db.count_statements("call orm_orders_select").unwrap(), 2);
}

#[test]
fn test_writes_are_wrapped() {
    let db = database();
    let factory = wrapped_factory(&db, Arc::new(MySqlDialect)).unwrap();
    let session = open(&factory);

    let customer = session.get("Customer", 100).unwrap().unwrap();
    customer.set("name", "Grace").unwrap();
    let other = factory.instantiate("Customer").unwrap();
    other.set_identifier(Some(Identifier::simple(101))).unwrap();
    other.set("name", "Linus").unwrap();
    session.persist(&other).unwrap();
    session.flush().unwrap();

    assert_eq!(
        db.routine_names().unwrap(),
        vec![
            "orm_customer_insert".to_string(),
            "orm_customer_select".to_string(),
            "orm_customer_update".to_string(),
        ]
    );
    assert_eq!(row_by_id(&db, "customer", 100).unwrap()[1], Value::from("Grace"));
    assert_eq!(row_by_id(&db, "customer", 101).unwrap()[1], Value::from("Linus"));
    assert_eq!(db.count_statements("update").unwrap(), 0);
    assert_eq!(db.count_statements("insert").unwrap(), 0);
}

#[test]
fn test_versioned_update_through_routine() {
    let db = database();
    let factory = wrapped_factory(&db, Arc::new(PostgreSqlDialect)).unwrap();
    let session = open(&factory);

    let order = session.get("Order", 2).unwrap().unwrap();
    order.set("status", "SHIPPED").unwrap();
    session.flush().unwrap();

    let row = row_by_id(&db, "orders", 2).unwrap();
    assert_eq!(row[1], Value::from("SHIPPED"));
    assert_eq!(row[2], Value::Integer(1));
    assert_eq!(db.count_statements("select orm_orders_update(").unwrap(), 1);
}

#[test]
fn test_dialect_without_procedures_is_rejected() {
    let db = database();
    let err = wrapped_factory(&db, Arc::new(AnsiDialect)).unwrap_err();
    assert!(matches!(err, OrmError::Configuration(_)));
}
