// ============================================================================
// Queries: property restrictions and projected selections
// ============================================================================

use std::sync::Arc;

use log::debug;

use crate::core::{OrmError, Result, SqlType, Value};
use crate::id::{EntityKey, Identifier};
use crate::persister::{AttributeDefinition, AttributeKind, EntityPersister};
use crate::result::{Assembler, DomainResult, EntityResolver, ResultValue};
use crate::sql::{ParameterBindings, QuerySpec, SqlAstRenderer, Statement};

use super::entity::EntityHandle;
use super::session::SessionState;

/// Equality restriction on a mapped property of the queried entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Restriction {
    /// Dotted path; component parts and single-column references are allowed
    pub property: String,
    pub value: Value,
}

impl Restriction {
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            value: value.into(),
        }
    }

    /// Column the property maps to in the entity's table.
    pub fn column(&self, persister: &EntityPersister) -> Result<(String, SqlType)> {
        let unknown = || OrmError::UnknownProperty(persister.name().to_string(), self.property.clone());

        if let Ok(paths) = persister.identifier_mapper().property_paths() {
            if let Some(index) = paths.iter().position(|p| *p == self.property) {
                let column = persister.id_columns().get(index).ok_or_else(unknown)?;
                return Ok((column.name.clone(), column.sql_type));
            }
        }

        let mut parts = self.property.split('.');
        let first = parts.next().ok_or_else(unknown)?;
        let mut definition: &AttributeDefinition = persister.attribute(first)?;
        for part in parts {
            definition = match &definition.kind {
                AttributeKind::Component { parts } => parts.iter().find(|p| p.name == part).ok_or_else(unknown)?,
                _ => return Err(unknown()),
            };
        }
        match &definition.kind {
            AttributeKind::Basic { column } => Ok((column.name.clone(), column.sql_type)),
            AttributeKind::ToOne { columns, .. } if columns.len() == 1 => {
                Ok((columns[0].name.clone(), columns[0].sql_type))
            }
            _ => Err(OrmError::QueryCompilation(format!(
                "Property {}.{} cannot be restricted by a single value",
                persister.name(),
                self.property
            ))),
        }
    }
}

/// A SELECT with the domain results read from each row.
#[derive(Debug, Clone)]
pub struct SelectionQuery {
    pub spec: QuerySpec,
    pub results: Vec<DomainResult>,
    pub bindings: ParameterBindings,
}

impl SelectionQuery {
    pub fn new(spec: QuerySpec) -> Self {
        Self {
            spec,
            results: Vec::new(),
            bindings: ParameterBindings::new(),
        }
    }

    pub fn result(mut self, result: DomainResult) -> Self {
        self.results.push(result);
        self
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.bindings.push(value.into());
        self
    }

    pub fn bind_named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.set_named(name, value.into());
        self
    }
}

impl SessionState {
    pub(super) fn execute_query(&mut self, query: &SelectionQuery) -> Result<Vec<ResultValue>> {
        if query.results.is_empty() {
            return Err(OrmError::QueryCompilation("Query declares no results".into()));
        }
        let assemblers = query
            .results
            .iter()
            .map(|r| Assembler::build(r, &self.factory.registry, &self.factory.instantiations))
            .collect::<Result<Vec<_>>>()?;

        self.auto_flush_if_required()?;
        let statement = Statement::Select(query.spec.clone());
        let rendered = Arc::new(SqlAstRenderer::render(&statement, self.factory.dialect.as_ref())?);
        let mut cursor = self.query(&rendered, query.bindings.clone())?;
        self.factory.statistics.query_executed();

        let mut rows = Vec::new();
        while cursor.next_row()? {
            let mut values = Vec::with_capacity(assemblers.len());
            for assembler in &assemblers {
                values.push(assembler.assemble(cursor.as_ref(), &mut *self)?);
            }
            rows.push(if values.len() == 1 {
                values.remove(0)
            } else {
                ResultValue::Composite(values)
            });
        }
        debug!("Query returned {} row(s)", rows.len());
        Ok(rows)
    }
}

impl EntityResolver for SessionState {
    fn resolve(&mut self, entity: &str, id: Identifier) -> Result<EntityHandle> {
        let key = EntityKey::new(entity, id.clone());
        if let Some(entry) = self.context.entity(&key) {
            return Ok(entry.handle.clone());
        }
        self.internal_load(entity, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::metadata::{AttributeMapping, EntityMapping, IdentifierMapping, MappingModel};
    use crate::persister::PersisterRegistry;
    use crate::sql::AnsiDialect;

    fn registry() -> PersisterRegistry {
        let model = MappingModel {
            entities: vec![
                EntityMapping::new("Customer", "customers", IdentifierMapping::single("id", "id", SqlType::Integer))
                    .attribute(AttributeMapping::basic("name", "name", SqlType::Text)),
                EntityMapping::new("Order", "orders", IdentifierMapping::single("id", "id", SqlType::Integer))
                    .attribute(AttributeMapping::component(
                        "shipping",
                        vec![AttributeMapping::basic("city", "ship_city", SqlType::Text)],
                    ))
                    .attribute(AttributeMapping::many_to_one("customer", "Customer", "customer_id")),
            ],
            fetch_profiles: Vec::new(),
        };
        PersisterRegistry::build(&model, &Settings::default(), &AnsiDialect).unwrap()
    }

    #[test]
    fn test_restriction_columns() {
        let registry = registry();
        let order = registry.entity("Order").unwrap();

        assert_eq!(Restriction::eq("id", 1).column(order).unwrap().0, "id");
        assert_eq!(Restriction::eq("shipping.city", "Oslo").column(order).unwrap().0, "ship_city");
        let (column, sql_type) = Restriction::eq("customer", 7).column(order).unwrap();
        assert_eq!(column, "customer_id");
        assert_eq!(sql_type, SqlType::Integer);
    }

    #[test]
    fn test_unknown_restriction_path() {
        let registry = registry();
        let order = registry.entity("Order").unwrap();
        assert!(Restriction::eq("shipping.zip", "x").column(order).is_err());
        assert!(matches!(
            Restriction::eq("shipping", "x").column(order),
            Err(OrmError::QueryCompilation(_))
        ));
    }
}
