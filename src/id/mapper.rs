// ============================================================================
// Identifier mappers: entity <-> flat map <-> query parameters
// ============================================================================

use crate::core::{Column, OrmError, Result, SqlType, Value};
use crate::engine::EntityHandle;
use crate::sql::{ComparisonOperator, Expr, JunctionKind, PredicateBuilder};

use super::identifier::{FlatMap, Identifier};

#[derive(Debug, Clone, PartialEq)]
pub struct IdProperty {
    pub name: String,
    pub column: String,
    pub sql_type: SqlType,
}

impl IdProperty {
    pub fn new(name: impl Into<String>, column: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            sql_type,
        }
    }
}

/// One registered identifier property, possibly a nested component.
#[derive(Debug, Clone, PartialEq)]
pub enum IdComponent {
    Column(IdProperty),
    Nested { name: String, parts: Vec<IdComponent> },
}

impl IdComponent {
    pub fn name(&self) -> &str {
        match self {
            IdComponent::Column(p) => &p.name,
            IdComponent::Nested { name, .. } => name,
        }
    }
}

/// A single (property path, column, value) triple of a flattened identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameterData {
    pub property_path: String,
    pub column: String,
    pub sql_type: SqlType,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SingleIdMapper {
    property: Option<IdProperty>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedIdMapper {
    property: String,
    parts: Vec<IdComponent>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultipleIdMapper {
    parts: Vec<IdComponent>,
}

/// Maps identifiers of one entity between their representations.
///
/// - `Single`: one property, one column
/// - `Embedded`: a component-valued id property; paths are `prop.part`
/// - `Multiple`: several id properties declared on the entity itself
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifierMapper {
    Single(SingleIdMapper),
    Embedded(EmbeddedIdMapper),
    Multiple(MultipleIdMapper),
}

struct Leaf<'a> {
    path: String,
    id_path: Vec<&'a str>,
    property: &'a IdProperty,
}

impl IdentifierMapper {
    pub fn single() -> Self {
        IdentifierMapper::Single(SingleIdMapper::default())
    }

    pub fn embedded(property: impl Into<String>) -> Self {
        IdentifierMapper::Embedded(EmbeddedIdMapper {
            property: property.into(),
            parts: Vec::new(),
        })
    }

    pub fn multiple() -> Self {
        IdentifierMapper::Multiple(MultipleIdMapper::default())
    }

    /// Register an identifier property.
    pub fn add(&mut self, component: IdComponent) -> Result<()> {
        match self {
            IdentifierMapper::Single(mapper) => {
                if let Some(existing) = &mapper.property {
                    return Err(OrmError::Configuration(format!(
                        "Single identifier mapper already has property '{}', cannot add '{}'",
                        existing.name,
                        component.name()
                    )));
                }
                match component {
                    IdComponent::Column(property) => {
                        mapper.property = Some(property);
                        Ok(())
                    }
                    IdComponent::Nested { name, .. } => Err(OrmError::Configuration(format!(
                        "Single identifier mapper cannot map component '{}'",
                        name
                    ))),
                }
            }
            IdentifierMapper::Embedded(EmbeddedIdMapper { parts, .. })
            | IdentifierMapper::Multiple(MultipleIdMapper { parts }) => {
                if parts.iter().any(|p| p.name() == component.name()) {
                    return Err(OrmError::Configuration(format!(
                        "Identifier property '{}' registered twice",
                        component.name()
                    )));
                }
                parts.push(component);
                Ok(())
            }
        }
    }

    pub fn is_composite(&self) -> bool {
        !matches!(self, IdentifierMapper::Single(_))
    }

    /// Name of the id property on the entity, if the id is one property.
    pub fn property_name(&self) -> Option<&str> {
        match self {
            IdentifierMapper::Single(m) => m.property.as_ref().map(|p| p.name.as_str()),
            IdentifierMapper::Embedded(m) => Some(&m.property),
            IdentifierMapper::Multiple(_) => None,
        }
    }

    fn leaves(&self) -> Result<Vec<Leaf<'_>>> {
        fn walk<'a>(
            parts: &'a [IdComponent],
            prefix: Option<&str>,
            id_prefix: &[&'a str],
            out: &mut Vec<Leaf<'a>>,
        ) {
            for part in parts {
                let path = match prefix {
                    Some(p) => format!("{}.{}", p, part.name()),
                    None => part.name().to_string(),
                };
                let mut id_path = id_prefix.to_vec();
                id_path.push(part.name());
                match part {
                    IdComponent::Column(property) => out.push(Leaf {
                        path,
                        id_path,
                        property,
                    }),
                    IdComponent::Nested { parts, .. } => walk(parts, Some(&path), &id_path, out),
                }
            }
        }

        let mut out = Vec::new();
        match self {
            IdentifierMapper::Single(mapper) => {
                let property = mapper.property.as_ref().ok_or_else(|| {
                    OrmError::Configuration("Single identifier mapper has no property".into())
                })?;
                out.push(Leaf {
                    path: property.name.clone(),
                    id_path: Vec::new(),
                    property,
                });
            }
            IdentifierMapper::Embedded(mapper) => {
                walk(&mapper.parts, Some(&mapper.property), &[], &mut out)
            }
            IdentifierMapper::Multiple(mapper) => walk(&mapper.parts, None, &[], &mut out),
        }
        if out.is_empty() {
            return Err(OrmError::Configuration("Identifier mapper has no properties".into()));
        }
        Ok(out)
    }

    pub fn columns(&self) -> Result<Vec<Column>> {
        Ok(self
            .leaves()?
            .iter()
            .map(|leaf| Column::new(&leaf.property.column, leaf.property.sql_type))
            .collect())
    }

    pub fn property_paths(&self) -> Result<Vec<String>> {
        Ok(self.leaves()?.into_iter().map(|leaf| leaf.path).collect())
    }

    // ========================================================================
    // Identifier <-> flat map
    // ========================================================================

    /// Fails when `id` lacks a value for one of the mapped properties.
    pub fn validate_shape(&self, id: &Identifier) -> Result<()> {
        for leaf in self.leaves()? {
            if navigate(id, &leaf.id_path).is_none() {
                return Err(shape_mismatch(id, &leaf.path));
            }
        }
        Ok(())
    }

    pub fn map_to_map_from_id(&self, id: &Identifier) -> Result<FlatMap> {
        let mut map = FlatMap::new();
        for leaf in self.leaves()? {
            let value = navigate(id, &leaf.id_path)
                .ok_or_else(|| shape_mismatch(id, &leaf.path))?;
            map.insert(leaf.path, value.clone());
        }
        Ok(map)
    }

    /// Rebuild an identifier; `None` when every value is null.
    pub fn map_to_id_from_map(&self, map: &FlatMap) -> Result<Option<Identifier>> {
        let leaves = self.leaves()?;
        let mut values = Vec::with_capacity(leaves.len());
        for leaf in &leaves {
            let value = map.get(&leaf.path).ok_or_else(|| {
                OrmError::IllegalState(format!("Identifier property '{}' missing from map", leaf.path))
            })?;
            values.push(value.clone());
        }
        self.id_from_values(values)
    }

    /// Rebuild an identifier from column values in mapper column order.
    pub fn id_from_values(&self, values: Vec<Value>) -> Result<Option<Identifier>> {
        if values.iter().all(Value::is_null) {
            return Ok(None);
        }
        let mut values = values.into_iter();
        let id = match self {
            IdentifierMapper::Single(_) => {
                let value = values
                    .next()
                    .ok_or_else(|| OrmError::IllegalState("No identifier value".into()))?;
                Identifier::Simple(value)
            }
            IdentifierMapper::Embedded(EmbeddedIdMapper { parts, .. })
            | IdentifierMapper::Multiple(MultipleIdMapper { parts }) => build_composite(parts, &mut values)?,
        };
        Ok(Some(id))
    }

    // ========================================================================
    // Entity side
    // ========================================================================

    /// Identifier of an instance; proxies answer from their lazy initializer.
    pub fn map_to_id_from_entity(&self, entity: &EntityHandle) -> Result<Option<Identifier>> {
        match entity.identifier()? {
            Some(id) => {
                self.validate_shape(&id)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn map_to_map_from_entity(&self, entity: &EntityHandle) -> Result<FlatMap> {
        match self.map_to_id_from_entity(entity)? {
            Some(id) => self.map_to_map_from_id(&id),
            None => Ok(self
                .leaves()?
                .into_iter()
                .map(|leaf| (leaf.path, Value::Null))
                .collect()),
        }
    }

    pub fn map_to_entity_from_map(&self, entity: &EntityHandle, map: &FlatMap) -> Result<()> {
        match self.map_to_id_from_map(map)? {
            Some(id) => entity.set_identifier(Some(id)),
            None => entity.set_identifier(None),
        }
    }

    pub fn map_to_query_parameters_from_id(&self, id: &Identifier) -> Result<Vec<QueryParameterData>> {
        self.leaves()?
            .into_iter()
            .map(|leaf| {
                let value = navigate(id, &leaf.id_path).ok_or_else(|| shape_mismatch(id, &leaf.path))?;
                Ok(QueryParameterData {
                    column: leaf.property.column.clone(),
                    sql_type: leaf.property.sql_type,
                    value: value.clone(),
                    property_path: leaf.path,
                })
            })
            .collect()
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    /// `a.col = b.col` for every id column
    pub fn add_ids_equal_to_query(&self, builder: &mut PredicateBuilder, alias_a: &str, alias_b: &str) -> Result<()> {
        for column in self.columns()? {
            builder.add_where_columns(
                Some(alias_a),
                &column.name,
                ComparisonOperator::Equal,
                Some(alias_b),
                &column.name,
            );
        }
        Ok(())
    }

    /// Id columns equal (or, negated, not equal) to the given identifier.
    pub fn add_id_equals_to_query(
        &self,
        builder: &mut PredicateBuilder,
        id: Option<&Identifier>,
        alias: Option<&str>,
        equals: bool,
    ) -> Result<()> {
        let parameters = match id {
            Some(id) => self.map_to_query_parameters_from_id(id)?,
            None => self
                .leaves()?
                .into_iter()
                .map(|leaf| QueryParameterData {
                    column: leaf.property.column.clone(),
                    sql_type: leaf.property.sql_type,
                    value: Value::Null,
                    property_path: leaf.path,
                })
                .collect(),
        };

        let op = if equals {
            ComparisonOperator::Equal
        } else {
            ComparisonOperator::NotEqual
        };
        let add_all = |target: &mut PredicateBuilder| {
            for p in &parameters {
                target.add_where_with_param(alias, &p.column, op, p.value.clone(), p.sql_type);
            }
        };
        if equals || parameters.len() == 1 {
            add_all(builder);
        } else {
            builder.add_sub_group(JunctionKind::Or, add_all);
        }
        Ok(())
    }

    /// Same as `add_id_equals_to_query` with named parameters keyed by property path.
    pub fn add_named_id_equals_to_query(
        &self,
        builder: &mut PredicateBuilder,
        alias: Option<&str>,
        equals: bool,
    ) -> Result<()> {
        let leaves = self.leaves()?;
        let op = if equals {
            ComparisonOperator::Equal
        } else {
            ComparisonOperator::NotEqual
        };
        let add_all = |target: &mut PredicateBuilder| {
            for leaf in &leaves {
                target.add_where_with_named_param(alias, &leaf.property.column, op, &leaf.path, leaf.property.sql_type);
            }
        };
        if equals || leaves.len() == 1 {
            add_all(builder);
        } else {
            builder.add_sub_group(JunctionKind::Or, add_all);
        }
        Ok(())
    }

    /// Column expression (single column or row value) for IN-list restrictions.
    pub fn key_expression(&self, alias: Option<&str>) -> Result<Expr> {
        Ok(Expr::tuple_or_single(
            self.columns()?
                .into_iter()
                .map(|c| Expr::column(alias, c.name))
                .collect(),
        ))
    }
}

fn navigate<'a>(id: &'a Identifier, path: &[&str]) -> Option<&'a Value> {
    let mut current = id;
    for name in path {
        current = current.part(name)?;
    }
    current.as_value()
}

fn shape_mismatch(id: &Identifier, path: &str) -> OrmError {
    OrmError::IllegalState(format!(
        "Identifier {} does not provide property '{}'",
        id, path
    ))
}

fn build_composite(parts: &[IdComponent], values: &mut impl Iterator<Item = Value>) -> Result<Identifier> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        let id = match part {
            IdComponent::Column(property) => Identifier::Simple(values.next().ok_or_else(|| {
                OrmError::IllegalState(format!("No value for identifier property '{}'", property.name))
            })?),
            IdComponent::Nested { parts, .. } => build_composite(parts, values)?,
        };
        out.push((part.name().to_string(), id));
    }
    Ok(Identifier::Composite(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{DeleteStatement, SqlAstRenderer, Statement, dialect::AnsiDialect};

    fn single() -> IdentifierMapper {
        let mut mapper = IdentifierMapper::single();
        mapper
            .add(IdComponent::Column(IdProperty::new("id", "id", SqlType::Integer)))
            .unwrap();
        mapper
    }

    fn embedded() -> IdentifierMapper {
        let mut mapper = IdentifierMapper::embedded("key");
        mapper
            .add(IdComponent::Column(IdProperty::new("order_no", "order_no", SqlType::Integer)))
            .unwrap();
        mapper
            .add(IdComponent::Nested {
                name: "line".into(),
                parts: vec![
                    IdComponent::Column(IdProperty::new("number", "line_no", SqlType::Integer)),
                    IdComponent::Column(IdProperty::new("kind", "line_kind", SqlType::Text)),
                ],
            })
            .unwrap();
        mapper
    }

    fn render(predicate: Expr) -> String {
        let statement = Statement::Delete(DeleteStatement {
            table: "t".into(),
            selection: Some(predicate),
        });
        SqlAstRenderer::render(&statement, &AnsiDialect).unwrap().sql
    }

    #[test]
    fn test_single_mapper_rejects_second_property() {
        let mut mapper = single();
        let err = mapper
            .add(IdComponent::Column(IdProperty::new("other", "other", SqlType::Integer)))
            .unwrap_err();
        assert!(matches!(err, OrmError::Configuration(_)));
    }

    #[test]
    fn test_embedded_paths_and_parameters() {
        let mapper = embedded();
        assert_eq!(
            mapper.property_paths().unwrap(),
            vec!["key.order_no", "key.line.number", "key.line.kind"]
        );

        let id = mapper
            .id_from_values(vec![Value::Integer(7), Value::Integer(2), "A".into()])
            .unwrap()
            .unwrap();
        let params = mapper.map_to_query_parameters_from_id(&id).unwrap();
        assert_eq!(params[1].column, "line_no");
        assert_eq!(params[2].value, Value::Text("A".into()));

        let map = mapper.map_to_map_from_id(&id).unwrap();
        assert_eq!(mapper.map_to_id_from_map(&map).unwrap(), Some(id));
    }

    #[test]
    fn test_all_null_values_mean_no_identifier() {
        assert_eq!(single().id_from_values(vec![Value::Null]).unwrap(), None);
    }

    #[test]
    fn test_wrong_shape_is_reported() {
        assert!(embedded().map_to_map_from_id(&Identifier::from(1)).is_err());
        assert!(embedded().validate_shape(&Identifier::from(1)).is_err());
        assert!(single().validate_shape(&Identifier::from(1)).is_ok());
    }

    #[test]
    fn test_negated_composite_equality_is_disjunction() {
        let mapper = embedded();
        let id = mapper
            .id_from_values(vec![Value::Integer(7), Value::Integer(2), "A".into()])
            .unwrap()
            .unwrap();

        let mut builder = PredicateBuilder::conjunction();
        mapper.add_id_equals_to_query(&mut builder, Some(&id), Some("e"), false).unwrap();
        let (predicate, bindings) = builder.build();
        assert_eq!(
            render(predicate.unwrap()),
            "delete from t where (e.order_no<>? or e.line_no<>? or e.line_kind<>?)"
        );
        assert_eq!(bindings.positional_len(), 3);

        let mut builder = PredicateBuilder::conjunction();
        mapper.add_named_id_equals_to_query(&mut builder, None, true).unwrap();
        let (predicate, _) = builder.build();
        assert_eq!(
            render(predicate.unwrap()),
            "delete from t where (order_no=? and line_no=? and line_kind=?)"
        );
    }

    #[test]
    fn test_ids_equal_between_aliases() {
        let mut builder = PredicateBuilder::conjunction();
        single().add_ids_equal_to_query(&mut builder, "a", "b").unwrap();
        let (predicate, _) = builder.build();
        assert_eq!(render(predicate.unwrap()), "delete from t where a.id=b.id");
    }
}
