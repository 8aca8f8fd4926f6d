/// Identifier mapping tests
///
/// Tests for identifier round trips through flat maps, query parameters and entities
/// Run with: cargo test --test identifier_mapping_tests

#[path = "fixtures.rs"]
mod fixtures;

use fixtures::*;
use ormkit::id::{IdComponent, IdProperty, IdentifierMapper};
use ormkit::{Identifier, SqlType, Value};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Shape {
    Single,
    Embedded,
    Multiple,
}

fn column(name: &str, sql_type: SqlType) -> IdComponent {
    IdComponent::Column(IdProperty::new(name, format!("{}_col", name), sql_type))
}

/// Leaf types in declaration order, with the mapper holding them.
fn mapper(shape: Shape) -> (IdentifierMapper, Vec<SqlType>) {
    match shape {
        Shape::Single => {
            let mut mapper = IdentifierMapper::single();
            mapper.add(column("id", SqlType::Integer)).unwrap();
            (mapper, vec![SqlType::Integer])
        }
        Shape::Embedded => {
            let mut mapper = IdentifierMapper::embedded("key");
            mapper.add(column("region", SqlType::Text)).unwrap();
            mapper
                .add(IdComponent::Nested {
                    name: "serial".into(),
                    parts: vec![column("year", SqlType::Integer), column("number", SqlType::Integer)],
                })
                .unwrap();
            (mapper, vec![SqlType::Text, SqlType::Integer, SqlType::Integer])
        }
        Shape::Multiple => {
            let mut mapper = IdentifierMapper::multiple();
            mapper.add(column("tenant", SqlType::Text)).unwrap();
            mapper.add(column("code", SqlType::Integer)).unwrap();
            (mapper, vec![SqlType::Text, SqlType::Integer])
        }
    }
}

fn arb_value(sql_type: SqlType) -> BoxedStrategy<Value> {
    match sql_type {
        SqlType::Text => "[a-z]{1,8}".prop_map(Value::Text).boxed(),
        _ => any::<i64>().prop_map(Value::Integer).boxed(),
    }
}

fn arb_identifier() -> impl Strategy<Value = (Shape, Vec<Value>)> {
    prop_oneof![Just(Shape::Single), Just(Shape::Embedded), Just(Shape::Multiple)].prop_flat_map(|shape| {
        let (_, types) = mapper(shape);
        let values: Vec<_> = types.into_iter().map(arb_value).collect();
        (Just(shape), values)
    })
}

proptest! {
    #[test]
    fn prop_identifier_round_trips_through_flat_map((shape, values) in arb_identifier()) {
        let (mapper, _) = mapper(shape);
        let id = mapper.id_from_values(values.clone()).unwrap().unwrap();
        prop_assert_eq!(id.values(), values.clone());

        let map = mapper.map_to_map_from_id(&id).unwrap();
        prop_assert_eq!(map.keys().cloned().collect::<Vec<_>>(), mapper.property_paths().unwrap());
        prop_assert_eq!(mapper.map_to_id_from_map(&map).unwrap(), Some(id.clone()));

        let parameters = mapper.map_to_query_parameters_from_id(&id).unwrap();
        prop_assert_eq!(
            parameters.iter().map(|p| p.value.clone()).collect::<Vec<_>>(),
            values
        );
        prop_assert_eq!(
            parameters.iter().map(|p| p.column.clone()).collect::<Vec<_>>(),
            mapper.columns().unwrap().into_iter().map(|c| c.name).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_entity_identifier_round_trip() {
    let db = database();
    let factory = factory(&db);
    let mapper = factory.registry().entity("Customer").unwrap().identifier_mapper().clone();

    let source = factory.instantiate("Customer").unwrap();
    source.set_identifier(Some(Identifier::simple(42))).unwrap();
    let map = mapper.map_to_map_from_entity(&source).unwrap();

    let target = factory.instantiate("Customer").unwrap();
    mapper.map_to_entity_from_map(&target, &map).unwrap();
    assert_eq!(target.identifier().unwrap(), Some(Identifier::simple(42)));
}

#[test]
fn test_proxy_identifier_is_read_without_initialization() {
    let db = database();
    let factory = factory(&db);
    let session = open(&factory);
    let mapper = factory.registry().entity("Order").unwrap().identifier_mapper().clone();

    let proxy = session.load("Order", 1).unwrap();
    assert_eq!(mapper.map_to_id_from_entity(&proxy).unwrap(), Some(Identifier::simple(1)));
    assert!(!proxy.is_initialized().unwrap());
    assert!(db.statements().unwrap().is_empty());
}

#[test]
fn test_transient_instance_maps_to_nulls() {
    let db = database();
    let factory = factory(&db);
    let mapper = factory.registry().entity("Customer").unwrap().identifier_mapper().clone();

    let transient = factory.instantiate("Customer").unwrap();
    let map = mapper.map_to_map_from_entity(&transient).unwrap();
    assert_eq!(map.get("id"), Some(&Value::Null));
    assert_eq!(mapper.map_to_id_from_map(&map).unwrap(), None);
}
