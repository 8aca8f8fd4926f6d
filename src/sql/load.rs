// ============================================================================
// Load query construction: LoadPlan -> SELECT + selection layout
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{Column, OrmError, Result, SqlType};
use crate::loadplan::{Fetch, FetchStrategy, LoadPlan, Return};
use crate::persister::{AttributeDefinition, AttributeKind, CollectionElementKind, EntityPersister, PersisterRegistry};

use super::ast::{Expr, FromClause, JoinKind, QuerySpec, SortSpecification, Statement, TableJoin, TableReference};
use super::dialect::Dialect;
use super::render::{RenderedStatement, SqlAstRenderer};

/// How an attribute of an entity space is read from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeLayout {
    Basic(usize),
    Composite(Vec<AttributeLayout>),
    ToOne {
        columns: Vec<usize>,
        strategy: FetchStrategy,
        /// Uid of the joined entity space
        joined: Option<usize>,
    },
    Collection {
        strategy: FetchStrategy,
        /// Uid of the joined collection space
        joined: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySpaceLayout {
    pub uid: usize,
    pub entity_name: String,
    pub alias: String,
    pub id: Vec<usize>,
    pub version: Option<usize>,
    pub attributes: Vec<AttributeLayout>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementLayout {
    Entity { uid: usize },
    Basic(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpaceLayout {
    pub uid: usize,
    pub role: String,
    pub alias: String,
    /// Owning entity space; `None` when the collection is the root
    pub owner_uid: Option<usize>,
    pub key: Vec<usize>,
    pub element: ElementLayout,
}

/// Result-set offsets of every space of a load query, computed once.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectionLayout {
    pub entities: BTreeMap<usize, EntitySpaceLayout>,
    pub collections: BTreeMap<usize, CollectionSpaceLayout>,
    pub column_types: Vec<SqlType>,
}

impl SelectionLayout {
    pub fn entity(&self, uid: usize) -> Result<&EntitySpaceLayout> {
        self.entities
            .get(&uid)
            .ok_or_else(|| OrmError::IllegalState(format!("No entity space with uid {}", uid)))
    }

    pub fn collection(&self, uid: usize) -> Result<&CollectionSpaceLayout> {
        self.collections
            .get(&uid)
            .ok_or_else(|| OrmError::IllegalState(format!("No collection space with uid {}", uid)))
    }

    pub fn has_joined_collection(&self) -> bool {
        self.collections.values().any(|c| c.owner_uid.is_some())
    }
}

/// Restriction applied to the root key of a load query.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRestriction {
    None,
    /// `key = ?`
    Id,
    /// `key in (?, ...)` for this many keys
    Batch(usize),
    /// `key in (<subquery>)`
    Subselect(Box<QuerySpec>),
    /// Arbitrary predicate over the root alias
    Filter(Expr),
}

#[derive(Debug, Clone)]
pub struct LoadQuery {
    pub rendered: Arc<RenderedStatement>,
    pub layout: Arc<SelectionLayout>,
}

pub struct LoadQueryBuilder<'a> {
    registry: &'a PersisterRegistry,
    dialect: &'a dyn Dialect,
}

struct SpaceBuilder<'a> {
    registry: &'a PersisterRegistry,
    spec: QuerySpec,
    layout: SelectionLayout,
}

impl<'a> LoadQueryBuilder<'a> {
    pub fn new(registry: &'a PersisterRegistry, dialect: &'a dyn Dialect) -> Self {
        Self { registry, dialect }
    }

    pub fn build(&self, plan: &LoadPlan, restriction: KeyRestriction) -> Result<LoadQuery> {
        let (spec, layout) = self.build_spec(plan, restriction)?;
        let rendered = SqlAstRenderer::render(&Statement::Select(spec), self.dialect)?;
        Ok(LoadQuery {
            rendered: Arc::new(rendered),
            layout: Arc::new(layout),
        })
    }

    pub fn build_spec(&self, plan: &LoadPlan, restriction: KeyRestriction) -> Result<(QuerySpec, SelectionLayout)> {
        let (table, key_columns) = match plan.root() {
            Return::Entity(r) => {
                let persister = self.registry.entity(&r.entity)?;
                (persister.table().to_string(), persister.id_columns().to_vec())
            }
            Return::Collection(r) => {
                let collection = self.registry.collection(&r.role)?;
                (collection.table().to_string(), collection.key_columns().to_vec())
            }
        };
        let alias = plan.root_alias().to_string();
        let mut builder = SpaceBuilder {
            registry: self.registry,
            spec: QuerySpec::new(FromClause::new(TableReference::new(table, alias.clone()))),
            layout: SelectionLayout::default(),
        };

        match plan.root() {
            Return::Entity(r) => {
                let persister = self.registry.entity(&r.entity)?.clone();
                builder.entity_space(&persister, &r.space.alias, r.space.uid, &r.fetches, false)?;
            }
            Return::Collection(r) => {
                let collection = self.registry.collection(&r.role)?.clone();
                let key = builder.select_columns(&r.space.alias, collection.key_columns(), r.space.uid);
                let element = match (collection.element(), &r.element) {
                    (CollectionElementKind::Entity { target }, Some(element)) => {
                        let persister = self.registry.entity(target)?.clone();
                        builder.entity_space(&persister, &r.space.alias, element.uid, &r.fetches, false)?;
                        ElementLayout::Entity { uid: element.uid }
                    }
                    (CollectionElementKind::Basic { column }, _) => {
                        ElementLayout::Basic(builder.select_column(&r.space.alias, column, r.space.uid, 0))
                    }
                    (CollectionElementKind::Entity { .. }, None) => {
                        return Err(OrmError::IllegalState(format!(
                            "Collection return {} has no element space",
                            r.role
                        )));
                    }
                };
                if let Some(order_by) = collection.order_by() {
                    builder.spec.order_by.push(SortSpecification {
                        expr: Expr::column(Some(&r.space.alias), order_by),
                        descending: false,
                    });
                }
                builder.layout.collections.insert(
                    r.space.uid,
                    CollectionSpaceLayout {
                        uid: r.space.uid,
                        role: r.role.clone(),
                        alias: r.space.alias.clone(),
                        owner_uid: None,
                        key,
                        element,
                    },
                );
            }
        }

        let key_exprs: Vec<Expr> = key_columns
            .iter()
            .map(|c| Expr::column(Some(&alias), c.name.clone()))
            .collect();
        match restriction {
            KeyRestriction::None => {}
            KeyRestriction::Id => {
                let items = key_columns
                    .iter()
                    .zip(key_exprs)
                    .enumerate()
                    .map(|(i, (column, expr))| Expr::eq(expr, Expr::positional(i, column.sql_type)))
                    .collect();
                builder.spec.restrict(Expr::and(items));
            }
            KeyRestriction::Batch(count) => {
                let width = key_columns.len();
                let list = (0..count)
                    .map(|k| {
                        Expr::tuple_or_single(
                            key_columns
                                .iter()
                                .enumerate()
                                .map(|(i, column)| Expr::positional(k * width + i, column.sql_type))
                                .collect(),
                        )
                    })
                    .collect();
                builder.spec.restrict(Expr::InList {
                    expr: Box::new(Expr::tuple_or_single(key_exprs)),
                    list,
                    negated: false,
                });
            }
            KeyRestriction::Subselect(subquery) => builder.spec.restrict(Expr::InSubquery {
                expr: Box::new(Expr::tuple_or_single(key_exprs)),
                subquery,
                negated: false,
            }),
            KeyRestriction::Filter(predicate) => builder.spec.restrict(predicate),
        }

        builder.layout.column_types = builder.spec.column_types();
        Ok((builder.spec, builder.layout))
    }
}

/// `select <id columns> from <table> <alias> where <restriction>`, used to
/// re-select the owners of a query for subselect fetching.
pub fn key_subquery(persister: &EntityPersister, alias: &str, restriction: Option<Expr>) -> QuerySpec {
    let mut spec = QuerySpec::new(FromClause::new(TableReference::new(persister.table(), alias)));
    for column in persister.id_columns() {
        spec.add_selection(Expr::column(Some(alias), column.name.clone()), None, column.sql_type);
    }
    spec.selection = restriction;
    spec
}

/// Column characters kept in a generated result alias.
const ALIAS_STEM_LENGTH: usize = 10;

impl SpaceBuilder<'_> {
    fn select_column(&mut self, alias: &str, column: &Column, uid: usize, ordinal: usize) -> usize {
        let stem: String = column
            .name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(ALIAS_STEM_LENGTH)
            .collect();
        self.spec.add_selection(
            Expr::column(Some(alias), column.name.clone()),
            Some(format!("{}{}_{}_", stem, ordinal, uid)),
            column.sql_type,
        )
    }

    fn select_columns(&mut self, alias: &str, columns: &[Column], uid: usize) -> Vec<usize> {
        columns
            .iter()
            .map(|column| {
                let ordinal = self.ordinal(uid);
                self.select_column(alias, column, uid, ordinal)
            })
            .collect()
    }

    /// Number of columns already selected for the space `uid`.
    fn ordinal(&self, uid: usize) -> usize {
        let suffix = format!("_{}_", uid);
        self.spec
            .select
            .items
            .iter()
            .filter(|item| item.alias.as_deref().is_some_and(|a| a.ends_with(&suffix)))
            .count()
    }

    fn entity_space(
        &mut self,
        persister: &EntityPersister,
        alias: &str,
        uid: usize,
        fetches: &[Fetch],
        outer: bool,
    ) -> Result<()> {
        let id = self.select_columns(alias, persister.id_columns(), uid);
        let version = match persister.version_column() {
            Some(column) => {
                let ordinal = self.ordinal(uid);
                Some(self.select_column(alias, column, uid, ordinal))
            }
            None => None,
        };
        let attributes = self.attributes(persister, persister.attributes(), alias, uid, fetches, outer)?;
        self.layout.entities.insert(
            uid,
            EntitySpaceLayout {
                uid,
                entity_name: persister.name().to_string(),
                alias: alias.to_string(),
                id,
                version,
                attributes,
            },
        );
        Ok(())
    }

    fn attributes(
        &mut self,
        owner: &EntityPersister,
        attributes: &[AttributeDefinition],
        alias: &str,
        uid: usize,
        fetches: &[Fetch],
        outer: bool,
    ) -> Result<Vec<AttributeLayout>> {
        let mut layouts = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            let layout = match &attribute.kind {
                AttributeKind::Basic { column } => {
                    let ordinal = self.ordinal(uid);
                    AttributeLayout::Basic(self.select_column(alias, column, uid, ordinal))
                }
                AttributeKind::Component { parts } => {
                    let nested = match find_fetch(fetches, &attribute.name) {
                        Some(Fetch::Composite(composite)) => composite.fetches.as_slice(),
                        _ => &[],
                    };
                    AttributeLayout::Composite(self.attributes(owner, parts, alias, uid, nested, outer)?)
                }
                AttributeKind::ToOne {
                    target,
                    columns,
                    ..
                } => {
                    let offsets = self.select_columns(alias, columns, uid);
                    let Some(Fetch::Entity(fetch)) = find_fetch(fetches, &attribute.name) else {
                        return Err(missing_fetch(owner, &attribute.name));
                    };
                    let joined = match &fetch.join {
                        Some(space) => {
                            let persister = self.registry.entity(target)?.clone();
                            let kind = if outer || attribute.nullable {
                                JoinKind::LeftOuter
                            } else {
                                JoinKind::Inner
                            };
                            let predicate = join_predicate(alias, columns, &space.alias, persister.id_columns());
                            self.push_join(kind, persister.table(), &space.alias, predicate);
                            self.entity_space(&persister, &space.alias, space.uid, &fetch.fetches, kind == JoinKind::LeftOuter)?;
                            Some(space.uid)
                        }
                        None => None,
                    };
                    AttributeLayout::ToOne {
                        columns: offsets,
                        strategy: fetch.strategy,
                        joined,
                    }
                }
                AttributeKind::Collection { role } => {
                    let Some(Fetch::Collection(fetch)) = find_fetch(fetches, &attribute.name) else {
                        return Err(missing_fetch(owner, &attribute.name));
                    };
                    let joined = match &fetch.join {
                        Some(space) => {
                            let collection = self.registry.collection(role)?.clone();
                            let predicate = join_predicate(alias, owner.id_columns(), &space.alias, collection.key_columns());
                            self.push_join(JoinKind::LeftOuter, collection.table(), &space.alias, predicate);
                            let key = self.select_columns(&space.alias, collection.key_columns(), space.uid);
                            let element = match (collection.element(), &fetch.element) {
                                (CollectionElementKind::Entity { target }, Some(element)) => {
                                    let persister = self.registry.entity(target)?.clone();
                                    self.entity_space(&persister, &space.alias, element.uid, &fetch.fetches, true)?;
                                    ElementLayout::Entity { uid: element.uid }
                                }
                                (CollectionElementKind::Basic { column }, _) => {
                                    let ordinal = self.ordinal(space.uid);
                                    ElementLayout::Basic(self.select_column(&space.alias, column, space.uid, ordinal))
                                }
                                (CollectionElementKind::Entity { .. }, None) => {
                                    return Err(missing_fetch(owner, &attribute.name));
                                }
                            };
                            if let Some(order_by) = collection.order_by() {
                                self.spec.order_by.push(SortSpecification {
                                    expr: Expr::column(Some(&space.alias), order_by),
                                    descending: false,
                                });
                            }
                            self.layout.collections.insert(
                                space.uid,
                                CollectionSpaceLayout {
                                    uid: space.uid,
                                    role: role.clone(),
                                    alias: space.alias.clone(),
                                    owner_uid: Some(uid),
                                    key,
                                    element,
                                },
                            );
                            Some(space.uid)
                        }
                        None => None,
                    };
                    AttributeLayout::Collection {
                        strategy: fetch.strategy,
                        joined,
                    }
                }
            };
            layouts.push(layout);
        }
        Ok(layouts)
    }

    fn push_join(&mut self, kind: JoinKind, table: &str, alias: &str, predicate: Expr) {
        if let Some(from) = self.spec.from.as_mut() {
            from.joins.push(TableJoin {
                kind,
                table: TableReference::new(table, alias),
                predicate,
            });
        }
    }
}

fn find_fetch<'f>(fetches: &'f [Fetch], attribute: &str) -> Option<&'f Fetch> {
    fetches.iter().find(|fetch| match fetch {
        Fetch::Entity(f) => f.attribute == attribute,
        Fetch::Collection(f) => f.attribute == attribute,
        Fetch::Composite(f) => f.attribute == attribute,
    })
}

fn missing_fetch(owner: &EntityPersister, attribute: &str) -> OrmError {
    OrmError::IllegalState(format!("Load plan has no fetch for {}.{}", owner.name(), attribute))
}

fn join_predicate(left_alias: &str, left: &[Column], right_alias: &str, right: &[Column]) -> Expr {
    Expr::and(
        left.iter()
            .zip(right)
            .map(|(l, r)| {
                Expr::eq(
                    Expr::column(Some(left_alias), l.name.clone()),
                    Expr::column(Some(right_alias), r.name.clone()),
                )
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::loadplan::{FetchStyle, FetchTiming, LoadPlanBuilder, LoadQueryInfluencers};
    use crate::metadata::{AttributeMapping, EntityMapping, IdentifierMapping, MappingModel};
    use crate::sql::AnsiDialect;

    fn registry() -> PersisterRegistry {
        let id = || IdentifierMapping::single("id", "id", SqlType::Integer);
        let model = MappingModel {
            entities: vec![
                EntityMapping::new("Order", "orders", id())
                    .attribute(AttributeMapping::basic("status", "status", SqlType::Text))
                    .attribute(
                        AttributeMapping::many_to_one("payment", "Payment", "payment_id")
                            .fetch(FetchTiming::Immediate, FetchStyle::Join),
                    )
                    .attribute(AttributeMapping::one_to_many("lines", "LineItem", "order_id").inverse().order_by("id")),
                EntityMapping::new("Payment", "payments", id())
                    .attribute(AttributeMapping::basic("amount", "amount", SqlType::Float)),
                EntityMapping::new("LineItem", "line_items", id())
                    .attribute(AttributeMapping::many_to_one("order", "Order", "order_id")),
            ],
            fetch_profiles: Vec::new(),
        };
        PersisterRegistry::build(&model, &Settings::default(), &AnsiDialect).unwrap()
    }

    #[test]
    fn test_entity_load_joins_payment() {
        let registry = registry();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::entity_plan(&registry, &influencers, None, "Order").unwrap();
        let query = LoadQueryBuilder::new(&registry, &AnsiDialect)
            .build(&plan, KeyRestriction::Id)
            .unwrap();
        assert_eq!(
            query.rendered.sql,
            "select orders0_.id as id0_0_, orders0_.status as status1_0_, orders0_.payment_id as paymentid2_0_, \
             payments1_.id as id0_1_, payments1_.amount as amount1_1_ \
             from orders orders0_ left outer join payments payments1_ on orders0_.payment_id=payments1_.id \
             where orders0_.id=?"
        );
        let root = query.layout.entity(0).unwrap();
        assert_eq!(root.id, vec![0]);
        assert!(matches!(root.attributes[1], AttributeLayout::ToOne { joined: Some(1), .. }));
        assert!(matches!(root.attributes[2], AttributeLayout::Collection { joined: None, .. }));
    }

    #[test]
    fn test_collection_batch_load() {
        let registry = registry();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::collection_plan(&registry, &influencers, None, "Order.lines").unwrap();
        let query = LoadQueryBuilder::new(&registry, &AnsiDialect)
            .build(&plan, KeyRestriction::Batch(2))
            .unwrap();
        assert_eq!(
            query.rendered.sql,
            "select line_items0_.order_id as orderid0_0_, line_items0_.id as id0_1_, line_items0_.order_id as orderid1_1_ \
             from line_items line_items0_ where line_items0_.order_id in (?, ?) order by line_items0_.id"
        );
        let collection = query.layout.collection(0).unwrap();
        assert_eq!(collection.element, ElementLayout::Entity { uid: 1 });
        assert_eq!(collection.owner_uid, None);
    }
}
