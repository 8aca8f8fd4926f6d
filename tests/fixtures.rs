#![allow(dead_code)]

use std::sync::Arc;

use ormkit::cache::AccessType;
use ormkit::jdbc::MemoryDatabase;
use ormkit::loadplan::{FetchStyle, FetchTiming};
use ormkit::metadata::{
    AttributeMapping, CascadeType, EntityMapping, FetchOverrideMapping, FetchProfileMapping, GeneratorMapping,
    IdentifierMapping, MappingModel,
};
use ormkit::{Session, SessionFactory, Settings, SqlType, Value};

/// Orders with an eagerly joined payment, lazy line items and a lazy customer.
pub fn order_model() -> MappingModel {
    MappingModel {
        entities: vec![
            EntityMapping::new("Customer", "customer", IdentifierMapping::single("id", "id", SqlType::Integer))
                .attribute(AttributeMapping::basic("name", "name", SqlType::Text))
                .attribute(AttributeMapping::element_collection(
                    "tags",
                    "customer_tags",
                    "customer_id",
                    "tag",
                    SqlType::Text,
                )),
            EntityMapping::new("Payment", "payment", IdentifierMapping::single("id", "id", SqlType::Integer))
                .attribute(AttributeMapping::basic("amount", "amount", SqlType::Float)),
            EntityMapping::new("Order", "orders", IdentifierMapping::single("id", "id", SqlType::Integer))
                .version("version")
                .attribute(AttributeMapping::basic("status", "status", SqlType::Text))
                .attribute(
                    AttributeMapping::many_to_one("payment", "Payment", "payment_id")
                        .fetch(FetchTiming::Immediate, FetchStyle::Join)
                        .cascade(&[CascadeType::Persist, CascadeType::Merge]),
                )
                .attribute(AttributeMapping::many_to_one("customer", "Customer", "customer_id"))
                .attribute(
                    AttributeMapping::one_to_many("lines", "LineItem", "order_id")
                        .inverse()
                        .cascade(&[CascadeType::All])
                        .orphan_removal()
                        .order_by("id"),
                ),
            EntityMapping::new("LineItem", "line_item", IdentifierMapping::single("id", "id", SqlType::Integer))
                .attribute(AttributeMapping::basic("product", "product", SqlType::Text))
                .attribute(AttributeMapping::basic("quantity", "quantity", SqlType::Integer))
                .attribute(AttributeMapping::many_to_one("order", "Order", "order_id")),
        ],
        fetch_profiles: vec![FetchProfileMapping {
            name: "order-with-lines".into(),
            overrides: vec![FetchOverrideMapping {
                entity: "Order".into(),
                association: "lines".into(),
                style: FetchStyle::Join,
            }],
        }],
    }
}

/// `order_model` with a sequence-generated line item id.
pub fn generated_model(optimizer: &str, increment_size: i64) -> MappingModel {
    let mut model = order_model();
    for entity in &mut model.entities {
        if entity.name == "LineItem" {
            entity.identifier = IdentifierMapping::single("id", "id", SqlType::Integer).generated(
                GeneratorMapping::Sequence {
                    sequence_name: "line_item_seq".into(),
                    initial_value: 1,
                    increment_size,
                    optimizer: Some(optimizer.into()),
                },
            );
        }
    }
    model
}

/// Mark `entity` cacheable with `access`.
pub fn cached(mut model: MappingModel, entity: &str, access: AccessType) -> MappingModel {
    for mapping in &mut model.entities {
        if mapping.name == entity {
            mapping.cache = Some(access);
        }
    }
    model
}

pub fn create_schema(db: &MemoryDatabase) {
    db.create_table("customer", &["id", "name"]).unwrap();
    db.create_table("customer_tags", &["customer_id", "tag"]).unwrap();
    db.create_table("payment", &["id", "amount"]).unwrap();
    db.create_table("orders", &["id", "status", "version", "payment_id", "customer_id"])
        .unwrap();
    db.create_table("line_item", &["id", "product", "quantity", "order_id"]).unwrap();
}

/// Customer 100 with two tags, order 1 paid by payment 10 with two lines,
/// and order 2 without payment or lines.
pub fn seed(db: &MemoryDatabase) {
    db.insert_row("customer", vec![Value::Integer(100), Value::from("Ada")]).unwrap();
    db.insert_row("customer_tags", vec![Value::Integer(100), Value::from("gold")]).unwrap();
    db.insert_row("customer_tags", vec![Value::Integer(100), Value::from("early")]).unwrap();
    db.insert_row("payment", vec![Value::Integer(10), Value::Float(99.5)]).unwrap();
    db.insert_row(
        "orders",
        vec![
            Value::Integer(1),
            Value::from("NEW"),
            Value::Integer(0),
            Value::Integer(10),
            Value::Integer(100),
        ],
    )
    .unwrap();
    db.insert_row(
        "orders",
        vec![
            Value::Integer(2),
            Value::from("NEW"),
            Value::Integer(0),
            Value::Null,
            Value::Integer(100),
        ],
    )
    .unwrap();
    for (id, product, quantity) in [(1, "apple", 2), (2, "pear", 1)] {
        db.insert_row(
            "line_item",
            vec![
                Value::Integer(id),
                Value::from(product),
                Value::Integer(quantity),
                Value::Integer(1),
            ],
        )
        .unwrap();
    }
}

pub fn database() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    create_schema(&db);
    seed(&db);
    db.clear_statements().unwrap();
    db
}

pub fn factory_with(model: MappingModel, settings: Settings, db: &MemoryDatabase) -> SessionFactory {
    SessionFactory::builder(model)
        .settings(settings)
        .connection_provider(Arc::new(db.clone()))
        .build()
        .unwrap()
}

pub fn factory(db: &MemoryDatabase) -> SessionFactory {
    factory_with(order_model(), Settings::new(), db)
}

pub fn open(factory: &SessionFactory) -> Session {
    factory.open_session().unwrap()
}

/// Rows of `table` whose first column equals `id`.
pub fn row_by_id(db: &MemoryDatabase, table: &str, id: i64) -> Option<Vec<Value>> {
    db.rows(table)
        .unwrap()
        .into_iter()
        .find(|row| row.first() == Some(&Value::Integer(id)))
}
