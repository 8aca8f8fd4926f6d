use std::sync::Arc;

use indexmap::IndexMap;

use crate::core::{OrmError, Result, SqlType, Value};
use crate::engine::EntityHandle;
use crate::id::Identifier;
use crate::jdbc::ResultCursor;
use crate::persister::{EntityPersister, PersisterRegistry};

use super::instantiation::{CompiledInstantiation, InstantiationRegistry};
use super::{DomainResult, ResultValue};

/// Turns an identifier read from a row into the session's managed instance.
pub trait EntityResolver {
    fn resolve(&mut self, entity: &str, id: Identifier) -> Result<EntityHandle>;
}

/// Reader bound to fixed column offsets, built once per query execution.
#[derive(Debug, Clone)]
pub enum Assembler {
    Scalar {
        offset: usize,
        sql_type: SqlType,
    },
    Composite(Vec<Assembler>),
    Entity {
        persister: Arc<EntityPersister>,
        id_offsets: Vec<usize>,
    },
    Instantiation {
        compiled: CompiledInstantiation,
        arguments: Vec<Assembler>,
    },
}

impl Assembler {
    /// Compile a domain result. Instantiation targets are validated here,
    /// so alias and constructor errors surface before any statement runs.
    pub fn build(
        result: &DomainResult,
        registry: &PersisterRegistry,
        instantiations: &InstantiationRegistry,
    ) -> Result<Self> {
        match result {
            DomainResult::Scalar { offset, sql_type } => Ok(Assembler::Scalar {
                offset: *offset,
                sql_type: *sql_type,
            }),
            DomainResult::Composite { parts } => Ok(Assembler::Composite(
                parts
                    .iter()
                    .map(|p| Assembler::build(p, registry, instantiations))
                    .collect::<Result<_>>()?,
            )),
            DomainResult::EntityReference { entity, id_offsets } => {
                let persister = Arc::clone(registry.entity(entity)?);
                if persister.id_columns().len() != id_offsets.len() {
                    return Err(OrmError::QueryCompilation(format!(
                        "Entity result {} binds {} identifier columns, mapping declares {}",
                        entity,
                        id_offsets.len(),
                        persister.id_columns().len()
                    )));
                }
                Ok(Assembler::Entity {
                    persister,
                    id_offsets: id_offsets.clone(),
                })
            }
            DomainResult::Instantiation { target, arguments } => {
                let compiled = instantiations.compile(target, arguments)?;
                let arguments = arguments
                    .iter()
                    .map(|a| Assembler::build(&a.result, registry, instantiations))
                    .collect::<Result<_>>()?;
                Ok(Assembler::Instantiation { compiled, arguments })
            }
        }
    }

    /// Read the current row.
    pub fn assemble(&self, cursor: &dyn ResultCursor, resolver: &mut dyn EntityResolver) -> Result<ResultValue> {
        match self {
            Assembler::Scalar { offset, sql_type } => Ok(ResultValue::Scalar(cursor.get(*offset, *sql_type)?)),
            Assembler::Composite(parts) => Ok(ResultValue::Composite(
                parts
                    .iter()
                    .map(|p| p.assemble(cursor, resolver))
                    .collect::<Result<_>>()?,
            )),
            Assembler::Entity { persister, id_offsets } => {
                let values = id_offsets
                    .iter()
                    .zip(persister.id_columns())
                    .map(|(offset, column)| cursor.get(*offset, column.sql_type))
                    .collect::<Result<Vec<_>>>()?;
                match persister.identifier_mapper().id_from_values(values)? {
                    Some(id) => Ok(ResultValue::Entity(resolver.resolve(persister.name(), id)?)),
                    None => Ok(ResultValue::Scalar(Value::Null)),
                }
            }
            Assembler::Instantiation { compiled, arguments } => {
                let values = arguments
                    .iter()
                    .map(|a| a.assemble(cursor, resolver))
                    .collect::<Result<Vec<_>>>()?;
                Ok(instantiate(compiled, values))
            }
        }
    }
}

fn instantiate(compiled: &CompiledInstantiation, values: Vec<ResultValue>) -> ResultValue {
    match compiled {
        CompiledInstantiation::List => ResultValue::List(values),
        CompiledInstantiation::Map { keys } => ResultValue::Map(keys.iter().cloned().zip(values).collect()),
        CompiledInstantiation::Constructor { type_name, names } => ResultValue::Object {
            type_name: type_name.clone(),
            fields: names.iter().cloned().zip(values).collect(),
        },
        CompiledInstantiation::Injection {
            type_name,
            fields,
            targets,
        } => {
            // Fields the projection does not set stay null
            let mut object: IndexMap<String, ResultValue> = fields
                .iter()
                .map(|f| (f.clone(), ResultValue::Scalar(Value::Null)))
                .collect();
            for (target, value) in targets.iter().zip(values) {
                object.insert(target.clone(), value);
            }
            ResultValue::Object {
                type_name: type_name.clone(),
                fields: object,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;
    use crate::jdbc::RowsCursor;
    use crate::result::{ArgType, ClassDescriptor, InstantiationArgument, InstantiationTarget, ParameterDescriptor};

    struct NoEntities;

    impl EntityResolver for NoEntities {
        fn resolve(&mut self, entity: &str, _id: Identifier) -> Result<EntityHandle> {
            Err(OrmError::UnknownEntity(entity.to_string()))
        }
    }

    fn cursor() -> RowsCursor {
        let row: Row = vec![Value::Integer(7), Value::Text("PAID".into()), Value::Integer(120)];
        RowsCursor::new(vec![row], 3)
    }

    #[test]
    fn test_constructor_projection() {
        let mut instantiations = InstantiationRegistry::new();
        instantiations.register(ClassDescriptor::new("OrderView").constructor(vec![
            ParameterDescriptor::new("id", ArgType::Integer),
            ParameterDescriptor::new("total", ArgType::Float),
        ]));
        let result = DomainResult::instantiation(
            InstantiationTarget::Class("OrderView".into()),
            vec![
                InstantiationArgument::new(DomainResult::scalar(0, SqlType::Integer)),
                InstantiationArgument::new(DomainResult::scalar(2, SqlType::Integer)),
            ],
        );
        let assembler = Assembler::build(&result, &PersisterRegistry::default(), &instantiations).unwrap();

        let mut cursor = cursor();
        assert!(cursor.next_row().unwrap());
        let value = assembler.assemble(&cursor, &mut NoEntities).unwrap();
        assert_eq!(value.field("id").and_then(ResultValue::as_scalar), Some(&Value::Integer(7)));
        assert_eq!(value.field("total").and_then(ResultValue::as_scalar), Some(&Value::Integer(120)));
    }

    #[test]
    fn test_map_and_list_projection() {
        let instantiations = InstantiationRegistry::new();
        let arguments = vec![
            InstantiationArgument::aliased(DomainResult::scalar(0, SqlType::Integer), "id"),
            InstantiationArgument::aliased(DomainResult::scalar(1, SqlType::Text), "status"),
        ];
        let registry = PersisterRegistry::default();
        let map = Assembler::build(
            &DomainResult::instantiation(InstantiationTarget::Map, arguments.clone()),
            &registry,
            &instantiations,
        )
        .unwrap();
        let list = Assembler::build(
            &DomainResult::instantiation(InstantiationTarget::List, arguments),
            &registry,
            &instantiations,
        )
        .unwrap();

        let mut cursor = cursor();
        cursor.next_row().unwrap();
        let map = map.assemble(&cursor, &mut NoEntities).unwrap();
        assert_eq!(
            map.field("status").and_then(ResultValue::as_scalar),
            Some(&Value::Text("PAID".into()))
        );
        match list.assemble(&cursor, &mut NoEntities).unwrap() {
            ResultValue::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected a list, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_entity_fails_at_build() {
        let err = Assembler::build(
            &DomainResult::entity("Order", vec![0]),
            &PersisterRegistry::default(),
            &InstantiationRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::UnknownEntity(_)));
    }
}
