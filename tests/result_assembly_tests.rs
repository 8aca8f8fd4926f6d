/// Result assembly tests
///
/// Tests for projected queries: scalars, entity references and dynamic instantiation
/// Run with: cargo test --test result_assembly_tests

#[path = "fixtures.rs"]
mod fixtures;

use std::sync::Arc;

use fixtures::*;
use ormkit::jdbc::MemoryDatabase;
use ormkit::result::{
    ArgType, ClassDescriptor, DomainResult, InstantiationArgument, InstantiationRegistry, InstantiationTarget,
    ParameterDescriptor, ResultValue,
};
use ormkit::sql::{Expr, FromClause, QuerySpec, SortSpecification, TableReference};
use ormkit::{OrmError, SelectionQuery, SessionFactory, SqlType, Value};

fn registry() -> InstantiationRegistry {
    let mut registry = InstantiationRegistry::new();
    registry.register(
        ClassDescriptor::new("LineSummary")
            .constructor(vec![
                ParameterDescriptor::new("product", ArgType::Text),
                ParameterDescriptor::new("quantity", ArgType::Float),
            ])
            .constructor(vec![
                ParameterDescriptor::new("product", ArgType::Text),
                ParameterDescriptor::new("quantity", ArgType::Integer),
            ]),
    );
    registry.register(
        ClassDescriptor::new("LineBean")
            .field("product", ArgType::Text)
            .field("quantity", ArgType::Integer)
            .field("note", ArgType::Text),
    );
    registry
}

fn projection_factory(db: &MemoryDatabase) -> SessionFactory {
    SessionFactory::builder(order_model())
        .connection_provider(Arc::new(db.clone()))
        .instantiations(registry())
        .build()
        .unwrap()
}

/// select li.id, li.product, li.quantity from line_item li order by li.id
fn line_spec() -> QuerySpec {
    let mut spec = QuerySpec::new(FromClause::new(TableReference::new("line_item", "li")));
    spec.add_selection(Expr::column(Some("li"), "id"), None, SqlType::Integer);
    spec.add_selection(Expr::column(Some("li"), "product"), None, SqlType::Text);
    spec.add_selection(Expr::column(Some("li"), "quantity"), None, SqlType::Integer);
    spec.order_by.push(SortSpecification {
        expr: Expr::column(Some("li"), "id"),
        descending: false,
    });
    spec
}

#[test]
fn test_scalar_and_entity_results() {
    let db = database();
    let factory = projection_factory(&db);
    let session = open(&factory);

    let query = SelectionQuery::new(line_spec())
        .result(DomainResult::entity("LineItem", vec![0]))
        .result(DomainResult::scalar(2, SqlType::Integer));
    let rows = session.execute_query(&query).unwrap();
    assert_eq!(rows.len(), 2);

    match &rows[0] {
        ResultValue::Composite(parts) => {
            let line = parts[0].as_entity().unwrap();
            assert_eq!(line.get("product").unwrap(), Value::from("apple"));
            assert_eq!(parts[1].as_scalar(), Some(&Value::Integer(2)));
            assert!(session.contains(line).unwrap());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(factory.statistics().query_execution_count(), 1);
}

#[test]
fn test_query_results_share_managed_instances() {
    let db = database();
    let factory = projection_factory(&db);
    let session = open(&factory);

    let pear = session.get("LineItem", 2).unwrap().unwrap();
    let query = SelectionQuery::new(line_spec()).result(DomainResult::entity("LineItem", vec![0]));
    let rows = session.execute_query(&query).unwrap();
    assert!(rows[1].as_entity().unwrap().ptr_eq(&pear));
}

#[test]
fn test_positional_parameter() {
    let db = database();
    let factory = projection_factory(&db);
    let session = open(&factory);

    let mut spec = line_spec();
    spec.restrict(Expr::eq(
        Expr::column(Some("li"), "product"),
        Expr::positional(0, SqlType::Text),
    ));
    let query = SelectionQuery::new(spec)
        .result(DomainResult::scalar(2, SqlType::Integer))
        .bind("pear");
    let rows = session.execute_query(&query).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].as_scalar(), Some(&Value::Integer(1)));
}

#[test]
fn test_constructor_instantiation_prefers_exact_types() {
    let db = database();
    let factory = projection_factory(&db);
    let session = open(&factory);

    let query = SelectionQuery::new(line_spec()).result(DomainResult::instantiation(
        InstantiationTarget::Class("LineSummary".into()),
        vec![
            InstantiationArgument::new(DomainResult::scalar(1, SqlType::Text)),
            InstantiationArgument::new(DomainResult::scalar(2, SqlType::Integer)),
        ],
    ));
    let rows = session.execute_query(&query).unwrap();
    match &rows[0] {
        ResultValue::Object { type_name, fields } => {
            assert_eq!(type_name, "LineSummary");
            assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["product", "quantity"]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rows[0].field("quantity").unwrap().as_scalar(), Some(&Value::Integer(2)));
}

#[test]
fn test_field_injection_by_alias() {
    let db = database();
    let factory = projection_factory(&db);
    let session = open(&factory);

    let query = SelectionQuery::new(line_spec()).result(DomainResult::instantiation(
        InstantiationTarget::Class("LineBean".into()),
        vec![
            InstantiationArgument::aliased(DomainResult::scalar(2, SqlType::Integer), "quantity"),
            InstantiationArgument::aliased(DomainResult::scalar(1, SqlType::Text), "product"),
        ],
    ));
    let rows = session.execute_query(&query).unwrap();
    let bean = &rows[1];
    assert_eq!(bean.field("product").unwrap().as_scalar(), Some(&Value::from("pear")));
    assert_eq!(bean.field("quantity").unwrap().as_scalar(), Some(&Value::Integer(1)));
    assert_eq!(bean.field("note").unwrap().as_scalar(), Some(&Value::Null));
}

#[test]
fn test_map_and_list_instantiation() {
    let db = database();
    let factory = projection_factory(&db);
    let session = open(&factory);

    let map = SelectionQuery::new(line_spec()).result(DomainResult::instantiation(
        InstantiationTarget::Map,
        vec![
            InstantiationArgument::aliased(DomainResult::scalar(1, SqlType::Text), "name"),
            InstantiationArgument::aliased(DomainResult::scalar(2, SqlType::Integer), "qty"),
        ],
    ));
    let rows = session.execute_query(&map).unwrap();
    assert_eq!(rows[0].field("name").unwrap().as_scalar(), Some(&Value::from("apple")));

    let list = SelectionQuery::new(line_spec()).result(DomainResult::instantiation(
        InstantiationTarget::List,
        vec![
            InstantiationArgument::new(DomainResult::scalar(1, SqlType::Text)),
            InstantiationArgument::aliased(DomainResult::scalar(2, SqlType::Integer), "ignored"),
        ],
    ));
    match &session.execute_query(&list).unwrap()[0] {
        ResultValue::List(items) => assert_eq!(items.len(), 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_invalid_instantiations_fail_before_execution() {
    let db = database();
    let factory = projection_factory(&db);
    let session = open(&factory);

    let cases = vec![
        DomainResult::instantiation(InstantiationTarget::Class("Nope".into()), vec![]),
        DomainResult::instantiation(
            InstantiationTarget::Map,
            vec![InstantiationArgument::new(DomainResult::scalar(1, SqlType::Text))],
        ),
        DomainResult::instantiation(
            InstantiationTarget::Map,
            vec![
                InstantiationArgument::aliased(DomainResult::scalar(1, SqlType::Text), "x"),
                InstantiationArgument::aliased(DomainResult::scalar(2, SqlType::Integer), "x"),
            ],
        ),
        DomainResult::instantiation(
            InstantiationTarget::Class("LineBean".into()),
            vec![InstantiationArgument::aliased(DomainResult::scalar(1, SqlType::Text), "quantity")],
        ),
        DomainResult::instantiation(
            InstantiationTarget::Class("LineBean".into()),
            vec![InstantiationArgument::aliased(DomainResult::scalar(1, SqlType::Text), "missing")],
        ),
        DomainResult::entity("LineItem", vec![0, 1]),
    ];
    for result in cases {
        let query = SelectionQuery::new(line_spec()).result(result);
        assert!(matches!(
            session.execute_query(&query),
            Err(OrmError::QueryCompilation(_))
        ));
    }
    assert!(matches!(
        session.execute_query(&SelectionQuery::new(line_spec())),
        Err(OrmError::QueryCompilation(_))
    ));
    assert_eq!(db.count_statements("select").unwrap(), 0);
}
