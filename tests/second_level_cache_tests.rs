/// Second-level cache tests
///
/// Tests for entity and collection caching across sessions and access strategies
/// Run with: cargo test --test second_level_cache_tests

#[path = "fixtures.rs"]
mod fixtures;

use fixtures::*;
use ormkit::cache::{AccessType, CacheKey};
use ormkit::metadata::{AttributeMapping, MappingModel};
use ormkit::{Identifier, OrmError, Settings, SqlType, Value};

fn customer_cached(access: AccessType) -> MappingModel {
    let mut model = cached(order_model(), "Customer", access);
    for entity in &mut model.entities {
        if entity.name == "Customer" {
            entity.attributes[1] =
                AttributeMapping::element_collection("tags", "customer_tags", "customer_id", "tag", SqlType::Text)
                    .cached(access);
        }
    }
    model
}

#[test]
fn test_entity_is_served_from_cache_in_next_session() {
    let db = database();
    let factory = factory_with(customer_cached(AccessType::ReadWrite), Settings::new(), &db);

    let first = open(&factory);
    first.get("Customer", 100).unwrap().unwrap();
    assert_eq!(db.count_statements("select").unwrap(), 1);
    assert_eq!(factory.statistics().second_level_cache_put_count(), 1);
    first.close().unwrap();

    let second = open(&factory);
    let customer = second.get("Customer", 100).unwrap().unwrap();
    assert_eq!(customer.get("name").unwrap(), Value::from("Ada"));
    assert_eq!(db.count_statements("select").unwrap(), 1);
    assert_eq!(factory.statistics().second_level_cache_hit_count(), 1);

    let access = factory.entity_cache("Customer").unwrap();
    assert_eq!(access.access_type(), AccessType::ReadWrite);
    assert!(
        access
            .storage()
            .contains(&CacheKey::entity("Customer", Identifier::simple(100)))
            .unwrap()
    );
}

#[test]
fn test_collection_is_served_from_cache() {
    let db = database();
    let factory = factory_with(customer_cached(AccessType::ReadWrite), Settings::new(), &db);

    let first = open(&factory);
    let customer = first.get("Customer", 100).unwrap().unwrap();
    first.initialize_collection(&customer.collection("tags").unwrap()).unwrap();
    assert_eq!(db.count_statements("select").unwrap(), 2);

    let second = open(&factory);
    let customer = second.get("Customer", 100).unwrap().unwrap();
    let tags = customer.collection("tags").unwrap();
    second.initialize_collection(&tags).unwrap();
    assert_eq!(tags.len().unwrap(), 2);
    assert_eq!(db.count_statements("select").unwrap(), 2);
}

#[test]
fn test_read_write_update_is_visible_after_commit() {
    let db = database();
    let factory = factory_with(customer_cached(AccessType::ReadWrite), Settings::new(), &db);

    let writer = open(&factory);
    writer.begin().unwrap();
    let customer = writer.get("Customer", 100).unwrap().unwrap();
    customer.set("name", "Grace").unwrap();
    writer.flush().unwrap();

    // soft-locked until the writer completes
    let reader = open(&factory);
    let seen = reader.get("Customer", 100).unwrap().unwrap();
    assert_eq!(seen.get("name").unwrap(), Value::from("Ada"));
    assert_eq!(db.count_statements("select").unwrap(), 2);

    writer.commit().unwrap();

    let later = open(&factory);
    let fresh = later.get("Customer", 100).unwrap().unwrap();
    assert_eq!(fresh.get("name").unwrap(), Value::from("Grace"));
    assert_eq!(db.count_statements("select").unwrap(), 2);
}

#[test]
fn test_read_write_rollback_keeps_key_unreadable() {
    let db = database();
    let factory = factory_with(customer_cached(AccessType::ReadWrite), Settings::new(), &db);

    let writer = open(&factory);
    writer.begin().unwrap();
    let customer = writer.get("Customer", 100).unwrap().unwrap();
    customer.set("name", "Grace").unwrap();
    writer.flush().unwrap();
    writer.rollback().unwrap();

    let reader = open(&factory);
    let seen = reader.get("Customer", 100).unwrap().unwrap();
    assert_eq!(seen.get("name").unwrap(), Value::from("Ada"));
    assert_eq!(db.count_statements("select").unwrap(), 2);
}

#[test]
fn test_nonstrict_update_evicts() {
    let db = database();
    let factory = factory_with(customer_cached(AccessType::NonstrictReadWrite), Settings::new(), &db);

    let session = open(&factory);
    let customer = session.get("Customer", 100).unwrap().unwrap();
    customer.set("name", "Grace").unwrap();
    session.flush().unwrap();

    let key = CacheKey::entity("Customer", Identifier::simple(100));
    let access = factory.entity_cache("Customer").unwrap();
    assert!(!access.storage().contains(&key).unwrap());

    let next = open(&factory);
    let fresh = next.get("Customer", 100).unwrap().unwrap();
    assert_eq!(fresh.get("name").unwrap(), Value::from("Grace"));
    assert_eq!(db.count_statements("select").unwrap(), 2);
}

#[test]
fn test_read_only_region_rejects_updates() {
    let db = database();
    let factory = factory_with(customer_cached(AccessType::ReadOnly), Settings::new(), &db);

    let session = open(&factory);
    let customer = session.get("Customer", 100).unwrap().unwrap();
    customer.set("name", "Grace").unwrap();
    assert!(matches!(session.flush(), Err(OrmError::UnsupportedOperation(_))));
}

#[test]
fn test_refresh_bypasses_cache() {
    let db = database();
    let factory = factory_with(customer_cached(AccessType::ReadWrite), Settings::new(), &db);

    let session = open(&factory);
    let customer = session.get("Customer", 100).unwrap().unwrap();
    session.refresh(&customer).unwrap();
    assert_eq!(db.count_statements("select").unwrap(), 2);
}

#[test]
fn test_cache_disabled_by_setting() {
    let db = database();
    let factory = factory_with(
        customer_cached(AccessType::ReadWrite),
        Settings::new().use_second_level_cache(false),
        &db,
    );
    assert!(factory.entity_cache("Customer").is_none());

    open(&factory).get("Customer", 100).unwrap();
    open(&factory).get("Customer", 100).unwrap();
    assert_eq!(db.count_statements("select").unwrap(), 2);
}

#[test]
fn test_evict_all_regions() {
    let db = database();
    let factory = factory_with(customer_cached(AccessType::ReadWrite), Settings::new(), &db);

    open(&factory).get("Customer", 100).unwrap();
    factory.evict_all_regions().unwrap();
    open(&factory).get("Customer", 100).unwrap();
    assert_eq!(db.count_statements("select").unwrap(), 2);
}
