/// Identifier generation tests
///
/// Tests for optimizers, sequence-backed generators and generated ids on persist
/// Run with: cargo test --test identifier_generation_tests

#[path = "fixtures.rs"]
mod fixtures;

use fixtures::*;
use ormkit::config::SequenceMismatchStrategy;
use ormkit::core::Result as OrmResult;
use ormkit::id::OptimizerDescriptor;
use ormkit::{Identifier, OrmError, SessionFactory, Settings, Value};
use proptest::prelude::*;

/// Database sequence stand-in: starts at 1 and advances by `step`.
struct Source {
    next: i64,
    step: i64,
    calls: usize,
}

impl Source {
    fn new(step: i64) -> Self {
        Self { next: 1, step, calls: 0 }
    }

    fn take(&mut self) -> OrmResult<i64> {
        let value = self.next;
        self.next += self.step;
        self.calls += 1;
        Ok(value)
    }
}

fn arb_descriptor() -> impl Strategy<Value = OptimizerDescriptor> {
    prop_oneof![
        Just(OptimizerDescriptor::None),
        Just(OptimizerDescriptor::HiLo),
        Just(OptimizerDescriptor::Pooled),
        Just(OptimizerDescriptor::PooledLo),
    ]
}

proptest! {
    #[test]
    fn prop_optimizers_hand_out_consecutive_ids(
        descriptor in arb_descriptor(),
        increment in 1i64..25,
        count in 1usize..120,
    ) {
        let optimizer = descriptor.build(increment, 1).unwrap();
        let step = if descriptor.applies_increment_to_source() { increment } else { 1 };
        let mut source = Source::new(step);

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let mut callback = || source.take();
            ids.push(optimizer.generate(&mut callback).unwrap());
        }

        prop_assert!(ids[0] >= 1);
        for pair in ids.windows(2) {
            prop_assert_eq!(pair[1], pair[0] + 1);
        }

        let blocks = (count as i64 + increment - 1) / increment;
        match descriptor {
            OptimizerDescriptor::None => prop_assert_eq!(source.calls, count),
            OptimizerDescriptor::HiLo | OptimizerDescriptor::PooledLo => {
                prop_assert_eq!(source.calls as i64, blocks)
            }
            OptimizerDescriptor::Pooled => prop_assert!(source.calls as i64 <= blocks + 1),
        }
        prop_assert!(optimizer.last_source_value().is_some());
    }

    #[test]
    fn prop_shared_optimizer_never_repeats(
        descriptor in arb_descriptor(),
        increment in 1i64..10,
        count in 1usize..60,
    ) {
        let optimizer = std::sync::Arc::from(descriptor.build(increment, 1).unwrap());
        let step = if descriptor.applies_increment_to_source() { increment } else { 1 };
        let source = std::sync::Arc::new(std::sync::Mutex::new(Source::new(step)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let optimizer: std::sync::Arc<dyn ormkit::id::Optimizer> = std::sync::Arc::clone(&optimizer);
                let source = source.clone();
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..count {
                        let mut callback = || source.lock().unwrap().take();
                        ids.push(optimizer.generate(&mut callback).unwrap());
                    }
                    ids
                })
            })
            .collect();

        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        prop_assert_eq!(all.len(), total);
    }
}

#[test]
fn test_optimizer_names() {
    assert_eq!(OptimizerDescriptor::from_name("pooled-lo").unwrap(), OptimizerDescriptor::PooledLo);
    assert_eq!(OptimizerDescriptor::from_name("HILO").unwrap(), OptimizerDescriptor::HiLo);
    assert!(matches!(
        OptimizerDescriptor::from_name("legacy"),
        Err(OrmError::Configuration(_))
    ));
    assert!(OptimizerDescriptor::Pooled.build(0, 1).is_err());
}

fn generated_factory(optimizer: &str, increment: i64, settings: Settings) -> (ormkit::MemoryDatabase, SessionFactory) {
    let db = database();
    let factory = factory_with(generated_model(optimizer, increment), settings, &db);
    (db, factory)
}

fn persist_lines(factory: &SessionFactory, count: usize) -> Vec<i64> {
    let session = open(factory);
    let order = session.get("Order", 2).unwrap().unwrap();
    let mut ids = Vec::new();
    for n in 0..count {
        let line = factory.instantiate("LineItem").unwrap();
        line.set("product", format!("item-{}", n)).unwrap();
        line.set("quantity", 1).unwrap();
        line.set_reference("order", Some(&order)).unwrap();
        session.persist(&line).unwrap();
        match session.identifier(&line).unwrap() {
            Identifier::Simple(Value::Integer(id)) => ids.push(id),
            other => panic!("unexpected identifier {:?}", other),
        }
    }
    session.flush().unwrap();
    ids
}

fn sequence_reads(db: &ormkit::MemoryDatabase) -> usize {
    db.statements()
        .unwrap()
        .iter()
        .filter(|sql| sql.contains("line_item_seq"))
        .count()
}

#[test]
fn test_pooled_sequence_generates_block_of_ids() {
    let (db, factory) = generated_factory("pooled", 3, Settings::new());
    db.create_sequence("line_item_seq", 1, 3).unwrap();

    let ids = persist_lines(&factory, 5);
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(sequence_reads(&db), 3);

    let rows = db.rows("line_item").unwrap();
    assert_eq!(rows.len(), 7);
    assert!(rows.iter().any(|row| row[0] == Value::Integer(5) && row[3] == Value::Integer(2)));
}

#[test]
fn test_hilo_multiplies_source_values() {
    let (db, factory) = generated_factory("hilo", 3, Settings::new());
    db.create_sequence("line_item_seq", 1, 1).unwrap();

    let ids = persist_lines(&factory, 4);
    assert_eq!(ids, vec![3, 4, 5, 6]);
    assert_eq!(sequence_reads(&db), 2);
}

#[test]
fn test_generator_reads_outside_session_transaction() {
    let (db, factory) = generated_factory("pooled", 3, Settings::new());
    db.create_sequence("line_item_seq", 1, 3).unwrap();

    let session = open(&factory);
    session.begin().unwrap();
    let line = factory.instantiate("LineItem").unwrap();
    line.set("product", "kept-id").unwrap();
    session.persist(&line).unwrap();
    session.rollback().unwrap();

    // the rolled back transaction did not give the values back
    let ids = persist_lines(&factory, 1);
    assert_eq!(ids, vec![2]);
}

#[test]
fn test_sequence_increment_mismatch() {
    let (db, factory) = generated_factory("pooled", 5, Settings::new());
    db.create_sequence("line_item_seq", 1, 3).unwrap();
    let session = open(&factory);
    let line = factory.instantiate("LineItem").unwrap();
    assert!(matches!(session.persist(&line), Err(OrmError::SequenceMismatch(_))));

    let (db, factory) = generated_factory(
        "pooled",
        5,
        Settings::new().sequence_mismatch_strategy(SequenceMismatchStrategy::Fix),
    );
    db.create_sequence("line_item_seq", 1, 3).unwrap();
    let ids = persist_lines(&factory, 4);
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[test]
fn test_persisting_generated_instance_with_identifier_is_detached() {
    let (db, factory) = generated_factory("pooled", 3, Settings::new());
    db.create_sequence("line_item_seq", 1, 3).unwrap();
    let session = open(&factory);

    let line = factory.instantiate("LineItem").unwrap();
    line.set_identifier(Some(Identifier::simple(77))).unwrap();
    assert!(session.persist(&line).is_err());
    assert!(!session.contains(&line).unwrap());
}
