use std::sync::Arc;

use crate::core::{Column, Result, Value};
use crate::persister::{CollectionElementKind, CollectionPersister, EntityPersister, PersisterRegistry};

use super::ast::{
    Assignment, DeleteStatement, Expr, FromClause, InsertStatement, QuerySpec, Statement, TableReference,
    UpdateStatement,
};
use super::dialect::Dialect;
use super::render::{RenderedStatement, SqlAstRenderer};

/// Write statements of one entity.
///
/// Parameter order:
/// - insert: id, version, properties
/// - update: properties, new version, id, old version
/// - delete: id, old version
/// - exists: id
#[derive(Debug, Clone)]
pub struct EntityMutationSql {
    pub insert: Arc<RenderedStatement>,
    /// Absent for immutable entities
    pub update: Option<Arc<RenderedStatement>>,
    pub delete: Arc<RenderedStatement>,
    /// Selects the first id column of the row, if there is one
    pub exists: Arc<RenderedStatement>,
}

/// Write statements of one owning collection.
///
/// `insert_row` and `delete_row` take key then element; `remove` takes key.
#[derive(Debug, Clone)]
pub struct CollectionMutationSql {
    pub insert_row: Arc<RenderedStatement>,
    pub delete_row: Arc<RenderedStatement>,
    pub remove: Arc<RenderedStatement>,
}

pub struct MutationSqlBuilder<'a> {
    dialect: &'a dyn Dialect,
}

struct Params {
    next: usize,
}

impl Params {
    fn next(&mut self, column: &Column) -> Expr {
        let expr = Expr::positional(self.next, column.sql_type);
        self.next += 1;
        expr
    }

    fn restrict(&mut self, columns: &[Column]) -> Vec<Expr> {
        columns
            .iter()
            .map(|c| Expr::eq(Expr::column(None, c.name.clone()), self.next(c)))
            .collect()
    }
}

impl<'a> MutationSqlBuilder<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self { dialect }
    }

    fn render(&self, statement: Statement) -> Result<Arc<RenderedStatement>> {
        Ok(Arc::new(SqlAstRenderer::render(&statement, self.dialect)?))
    }

    pub fn entity(&self, persister: &EntityPersister) -> Result<EntityMutationSql> {
        let properties = persister.property_columns();
        let version = persister.version_column();

        let mut columns: Vec<Column> = persister.id_columns().to_vec();
        columns.extend(version.cloned());
        columns.extend(properties.iter().cloned());
        let mut params = Params { next: 0 };
        let insert = self.render(Statement::Insert(InsertStatement {
            table: persister.table().to_string(),
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            values: columns.iter().map(|c| params.next(c)).collect(),
        }))?;

        let update = if persister.is_mutable() {
            let mut params = Params { next: 0 };
            let mut assignments: Vec<Assignment> = properties
                .iter()
                .map(|c| Assignment {
                    column: c.name.clone(),
                    value: params.next(c),
                })
                .collect();
            if let Some(column) = version {
                assignments.push(Assignment {
                    column: column.name.clone(),
                    value: params.next(column),
                });
            }
            let mut restriction = params.restrict(persister.id_columns());
            if let Some(column) = version {
                restriction.extend(params.restrict(std::slice::from_ref(column)));
            }
            Some(self.render(Statement::Update(UpdateStatement {
                table: persister.table().to_string(),
                assignments,
                selection: Some(Expr::and(restriction)),
            }))?)
        } else {
            None
        };

        let mut params = Params { next: 0 };
        let mut restriction = params.restrict(persister.id_columns());
        if let Some(column) = version {
            restriction.extend(params.restrict(std::slice::from_ref(column)));
        }
        let delete = self.render(Statement::Delete(DeleteStatement {
            table: persister.table().to_string(),
            selection: Some(Expr::and(restriction)),
        }))?;

        let alias = "e";
        let mut spec = QuerySpec::new(FromClause::new(TableReference::new(persister.table(), alias)));
        if let Some(first) = persister.id_columns().first() {
            spec.add_selection(Expr::column(Some(alias), first.name.clone()), None, first.sql_type);
        }
        let mut params = Params { next: 0 };
        let restriction = persister
            .id_columns()
            .iter()
            .map(|c| Expr::eq(Expr::column(Some(alias), c.name.clone()), params.next(c)))
            .collect();
        spec.restrict(Expr::and(restriction));
        let exists = self.render(Statement::Select(spec))?;

        Ok(EntityMutationSql {
            insert,
            update,
            delete,
            exists,
        })
    }

    /// `None` for inverse collections, whose rows are written by the element side.
    pub fn collection(
        &self,
        persister: &CollectionPersister,
        registry: &PersisterRegistry,
    ) -> Result<Option<CollectionMutationSql>> {
        if persister.is_inverse() {
            return Ok(None);
        }
        let table = persister.table().to_string();
        let key = persister.key_columns();
        let sql = match persister.element() {
            CollectionElementKind::Entity { target } => {
                let element = registry.entity(target)?.id_columns().to_vec();

                let mut params = Params { next: 0 };
                let assignments = key
                    .iter()
                    .map(|c| Assignment {
                        column: c.name.clone(),
                        value: params.next(c),
                    })
                    .collect();
                let insert_row = self.render(Statement::Update(UpdateStatement {
                    table: table.clone(),
                    assignments,
                    selection: Some(Expr::and(params.restrict(&element))),
                }))?;

                let mut params = Params { next: 0 };
                let mut restriction = params.restrict(key);
                restriction.extend(params.restrict(&element));
                let delete_row = self.render(Statement::Update(UpdateStatement {
                    table: table.clone(),
                    assignments: unlink(key),
                    selection: Some(Expr::and(restriction)),
                }))?;

                let mut params = Params { next: 0 };
                let remove = self.render(Statement::Update(UpdateStatement {
                    table,
                    assignments: unlink(key),
                    selection: Some(Expr::and(params.restrict(key))),
                }))?;
                CollectionMutationSql {
                    insert_row,
                    delete_row,
                    remove,
                }
            }
            CollectionElementKind::Basic { column } => {
                let mut columns = key.to_vec();
                columns.push(column.clone());

                let mut params = Params { next: 0 };
                let insert_row = self.render(Statement::Insert(InsertStatement {
                    table: table.clone(),
                    columns: columns.iter().map(|c| c.name.clone()).collect(),
                    values: columns.iter().map(|c| params.next(c)).collect(),
                }))?;

                let mut params = Params { next: 0 };
                let delete_row = self.render(Statement::Delete(DeleteStatement {
                    table: table.clone(),
                    selection: Some(Expr::and(params.restrict(&columns))),
                }))?;

                let mut params = Params { next: 0 };
                let remove = self.render(Statement::Delete(DeleteStatement {
                    table,
                    selection: Some(Expr::and(params.restrict(key))),
                }))?;
                CollectionMutationSql {
                    insert_row,
                    delete_row,
                    remove,
                }
            }
        };
        Ok(Some(sql))
    }
}

fn unlink(key: &[Column]) -> Vec<Assignment> {
    key.iter()
        .map(|c| Assignment {
            column: c.name.clone(),
            value: Expr::Literal(Value::Null),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::core::SqlType;
    use crate::metadata::{AttributeMapping, EntityMapping, IdentifierMapping, MappingModel};
    use crate::sql::AnsiDialect;

    fn registry() -> PersisterRegistry {
        let id = || IdentifierMapping::single("id", "id", SqlType::Integer);
        let model = MappingModel {
            entities: vec![
                EntityMapping::new("Order", "orders", id())
                    .version("version")
                    .attribute(AttributeMapping::basic("status", "status", SqlType::Text))
                    .attribute(AttributeMapping::one_to_many("lines", "LineItem", "order_id"))
                    .attribute(AttributeMapping::element_collection("tags", "order_tags", "order_id", "tag", SqlType::Text)),
                EntityMapping::new("LineItem", "line_items", id()),
            ],
            fetch_profiles: Vec::new(),
        };
        PersisterRegistry::build(&model, &Settings::default(), &AnsiDialect).unwrap()
    }

    #[test]
    fn test_entity_statements() {
        let registry = registry();
        let sql = MutationSqlBuilder::new(&AnsiDialect)
            .entity(registry.entity("Order").unwrap())
            .unwrap();
        assert_eq!(sql.insert.sql, "insert into orders (id, version, status) values (?, ?, ?)");
        assert_eq!(
            sql.update.unwrap().sql,
            "update orders set status=?, version=? where (id=? and version=?)"
        );
        assert_eq!(sql.delete.sql, "delete from orders where (id=? and version=?)");
        assert_eq!(sql.exists.sql, "select e.id from orders e where e.id=?");
    }

    #[test]
    fn test_collection_statements() {
        let registry = registry();
        let builder = MutationSqlBuilder::new(&AnsiDialect);
        let lines = builder
            .collection(registry.collection("Order.lines").unwrap(), &registry)
            .unwrap()
            .unwrap();
        assert_eq!(lines.insert_row.sql, "update line_items set order_id=? where id=?");
        assert_eq!(lines.remove.sql, "update line_items set order_id=null where order_id=?");

        let tags = builder
            .collection(registry.collection("Order.tags").unwrap(), &registry)
            .unwrap()
            .unwrap();
        assert_eq!(tags.delete_row.sql, "delete from order_tags where (order_id=? and tag=?)");
    }
}
