use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;

use crate::config::Settings;
use crate::core::{Column, OrmError, Result, SqlType};
use crate::id::{IdComponent, IdProperty, IdentifierGenerator, IdentifierMapper};
use crate::loadplan::{FetchStrategy, FetchStyle};
use crate::metadata::{AttributeMapping, EntityMapping, FetchMapping, GeneratorMapping, IdPartMapping, IdentifierMapping, MappingModel};
use crate::sql::Dialect;

use super::{AttributeDefinition, AttributeKind, CascadeStyle, CollectionElementKind, CollectionPersister, EntityPersister};

/// Named set of association fetch-style overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchProfile {
    name: String,
    overrides: HashMap<(String, String), FetchStyle>,
}

impl FetchProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overrides: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_override(mut self, entity: &str, association: &str, style: FetchStyle) -> Self {
        self.overrides
            .insert((entity.to_string(), association.to_string()), style);
        self
    }

    pub fn style_for(&self, entity: &str, association: &str) -> Option<FetchStyle> {
        self.overrides
            .get(&(entity.to_string(), association.to_string()))
            .copied()
    }
}

/// Registry of all persisters built at boot.
///
/// Immutable once built; `with_*` return a new registry sharing the
/// untouched maps.
#[derive(Debug, Clone, Default)]
pub struct PersisterRegistry {
    entities: Arc<IndexMap<String, Arc<EntityPersister>>>,
    collections: Arc<IndexMap<String, Arc<CollectionPersister>>>,
    profiles: Arc<HashMap<String, FetchProfile>>,
}

impl PersisterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two-phase boot: identifier mappers first, then attributes and
    /// collections, which need the identifier columns of their targets.
    pub fn build(model: &MappingModel, settings: &Settings, dialect: &dyn Dialect) -> Result<Self> {
        let mut mappers: HashMap<&str, (IdentifierMapper, Vec<Column>)> = HashMap::new();
        for entity in &model.entities {
            if mappers.contains_key(entity.name.as_str()) {
                return Err(OrmError::Mapping(format!("Entity '{}' is mapped twice", entity.name)));
            }
            let mapper = build_identifier_mapper(entity)?;
            let columns = mapper.columns()?;
            mappers.insert(entity.name.as_str(), (mapper, columns));
        }

        let mut registry = Self::new();
        for entity in &model.entities {
            let (mapper, id_columns) = mappers
                .get(entity.name.as_str())
                .cloned()
                .ok_or_else(|| OrmError::UnknownEntity(entity.name.clone()))?;
            let generator = build_generator(entity, dialect, settings)?;

            let mut attributes = Vec::with_capacity(entity.attributes.len());
            for (index, mapping) in entity.attributes.iter().enumerate() {
                let context = AttributeContext {
                    model,
                    mappers: &mappers,
                    owner: entity,
                    owner_id_columns: &id_columns,
                    settings,
                };
                let (attribute, collection) = context.build(mapping, index)?;
                if let Some(collection) = collection {
                    registry = registry.with_collection(collection)?;
                }
                attributes.push(attribute);
            }

            let version = entity
                .version
                .as_ref()
                .map(|v| Column::new(v.column.clone(), SqlType::Integer));
            let persister = EntityPersister::new(
                entity.name.clone(),
                entity.table.clone(),
                mapper,
                generator,
                attributes,
                version,
                entity.cache,
                entity.batch_size.unwrap_or(settings.default_batch_fetch_size),
                entity.mutable,
            )?;
            registry = registry.with_entity(persister)?;
        }

        for profile in &model.fetch_profiles {
            let mut built = FetchProfile::new(profile.name.clone());
            for item in &profile.overrides {
                let persister = registry.entity(&item.entity)?;
                let attribute = persister.attribute(&item.association)?;
                if !attribute.is_association() {
                    return Err(OrmError::Mapping(format!(
                        "Fetch profile '{}' overrides non-association {}.{}",
                        profile.name, item.entity, item.association
                    )));
                }
                built = built.with_override(&item.entity, &item.association, item.style);
            }
            registry = registry.with_profile(built)?;
        }

        debug!(
            "persister registry built: {} entities, {} collections, {} fetch profiles",
            registry.entities.len(),
            registry.collections.len(),
            registry.profiles.len()
        );
        Ok(registry)
    }

    pub fn with_entity(self, persister: EntityPersister) -> Result<Self> {
        let name = persister.name().to_string();
        if self.entities.contains_key(&name) {
            return Err(OrmError::Mapping(format!("Entity '{}' is mapped twice", name)));
        }
        let mut entities = (*self.entities).clone();
        entities.insert(name, Arc::new(persister));
        Ok(Self {
            entities: Arc::new(entities),
            ..self
        })
    }

    pub fn with_collection(self, persister: CollectionPersister) -> Result<Self> {
        let role = persister.role().to_string();
        if self.collections.contains_key(&role) {
            return Err(OrmError::Mapping(format!("Collection role '{}' is mapped twice", role)));
        }
        let mut collections = (*self.collections).clone();
        collections.insert(role, Arc::new(persister));
        Ok(Self {
            collections: Arc::new(collections),
            ..self
        })
    }

    pub fn with_profile(self, profile: FetchProfile) -> Result<Self> {
        if self.profiles.contains_key(profile.name()) {
            return Err(OrmError::Mapping(format!("Fetch profile '{}' is defined twice", profile.name())));
        }
        let mut profiles = (*self.profiles).clone();
        profiles.insert(profile.name().to_string(), profile);
        Ok(Self {
            profiles: Arc::new(profiles),
            ..self
        })
    }

    pub fn entity(&self, name: &str) -> Result<&Arc<EntityPersister>> {
        self.entities
            .get(name)
            .ok_or_else(|| OrmError::UnknownEntity(name.to_string()))
    }

    pub fn collection(&self, role: &str) -> Result<&Arc<CollectionPersister>> {
        self.collections
            .get(role)
            .ok_or_else(|| OrmError::UnknownCollection(role.to_string()))
    }

    pub fn profile(&self, name: &str) -> Result<&FetchProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| OrmError::Configuration(format!("Unknown fetch profile '{}'", name)))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityPersister>> {
        self.entities.values()
    }

    pub fn collections(&self) -> impl Iterator<Item = &Arc<CollectionPersister>> {
        self.collections.values()
    }
}

fn build_identifier_mapper(entity: &EntityMapping) -> Result<IdentifierMapper> {
    let mut mapper = match &entity.identifier {
        IdentifierMapping::Single {
            property,
            column,
            sql_type,
            ..
        } => {
            let mut mapper = IdentifierMapper::single();
            mapper.add(IdComponent::Column(IdProperty::new(property.clone(), column.clone(), *sql_type)))?;
            return Ok(mapper);
        }
        IdentifierMapping::Embedded { property, .. } => IdentifierMapper::embedded(property.clone()),
        IdentifierMapping::Multiple { .. } => IdentifierMapper::multiple(),
    };
    let parts = match &entity.identifier {
        IdentifierMapping::Embedded { parts, .. } | IdentifierMapping::Multiple { parts } => parts,
        IdentifierMapping::Single { .. } => return Ok(mapper),
    };
    if parts.is_empty() {
        return Err(OrmError::Mapping(format!("Composite identifier of '{}' has no parts", entity.name)));
    }
    for part in parts {
        mapper.add(id_component(part))?;
    }
    Ok(mapper)
}

fn id_component(part: &IdPartMapping) -> IdComponent {
    match part {
        IdPartMapping::Column {
            property,
            column,
            sql_type,
        } => IdComponent::Column(IdProperty::new(property.clone(), column.clone(), *sql_type)),
        IdPartMapping::Component { property, parts } => IdComponent::Nested {
            name: property.clone(),
            parts: parts.iter().map(id_component).collect(),
        },
    }
}

fn build_generator(entity: &EntityMapping, dialect: &dyn Dialect, settings: &Settings) -> Result<IdentifierGenerator> {
    match &entity.identifier {
        IdentifierMapping::Single { generator, sql_type, .. } => {
            if *generator != GeneratorMapping::Assigned && *sql_type != SqlType::Integer {
                return Err(OrmError::Mapping(format!(
                    "Generated identifier of '{}' must be an integer, not {}",
                    entity.name, sql_type
                )));
            }
            IdentifierGenerator::from_mapping(&entity.name, generator, dialect, settings)
        }
        _ => Ok(IdentifierGenerator::Assigned),
    }
}

struct AttributeContext<'a> {
    model: &'a MappingModel,
    mappers: &'a HashMap<&'a str, (IdentifierMapper, Vec<Column>)>,
    owner: &'a EntityMapping,
    owner_id_columns: &'a [Column],
    settings: &'a Settings,
}

impl AttributeContext<'_> {
    fn build(&self, mapping: &AttributeMapping, index: usize) -> Result<(AttributeDefinition, Option<CollectionPersister>)> {
        let owner = &self.owner.name;
        let definition = match mapping {
            AttributeMapping::Basic {
                name,
                column,
                sql_type,
                nullable,
            } => AttributeDefinition {
                name: name.clone(),
                index,
                kind: AttributeKind::Basic {
                    column: Column::new(column.clone(), *sql_type),
                },
                nullable: *nullable,
                cascade: CascadeStyle::none(),
                fetch: FetchStrategy::immediate_join(),
            },
            AttributeMapping::Component { name, attributes } => {
                let mut parts = Vec::with_capacity(attributes.len());
                for (i, part) in attributes.iter().enumerate() {
                    if !matches!(
                        part,
                        AttributeMapping::Basic { .. } | AttributeMapping::Component { .. } | AttributeMapping::ManyToOne { .. }
                    ) {
                        return Err(OrmError::Mapping(format!(
                            "Component {}.{} cannot contain the collection '{}'",
                            owner,
                            name,
                            part.name()
                        )));
                    }
                    parts.push(self.build(part, i)?.0);
                }
                AttributeDefinition {
                    name: name.clone(),
                    index,
                    kind: AttributeKind::Component { parts },
                    nullable: true,
                    cascade: CascadeStyle::none(),
                    fetch: FetchStrategy::immediate_join(),
                }
            }
            AttributeMapping::ManyToOne {
                name,
                target,
                columns,
                fetch,
                cascade,
                nullable,
            } => {
                let target_columns = self.target_id_columns(name, target)?;
                let columns = typed_columns(owner, name, columns, target_columns)?;
                let column_names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
                AttributeDefinition {
                    name: name.clone(),
                    index,
                    kind: AttributeKind::ToOne {
                        target: target.clone(),
                        back_reference: self.inverse_role_for(target, &column_names),
                        columns,
                    },
                    nullable: *nullable,
                    cascade: CascadeStyle::from_types(cascade),
                    fetch: declared_fetch(fetch),
                }
            }
            AttributeMapping::OneToMany {
                name,
                target,
                key_columns,
                inverse,
                fetch,
                cascade,
                orphan_removal,
                batch_size,
                order_by,
                cache,
            } => {
                let target_mapping = self.model.entities.iter().find(|e| &e.name == target).ok_or_else(|| {
                    OrmError::Mapping(format!("Association {}.{} targets unknown entity '{}'", owner, name, target))
                })?;
                let key_columns = typed_columns(owner, name, key_columns, self.owner_id_columns)?;
                let fetch = declared_fetch(fetch);
                let persister = CollectionPersister::new(
                    owner,
                    name,
                    target_mapping.table.clone(),
                    key_columns,
                    CollectionElementKind::Entity { target: target.clone() },
                    *inverse,
                    *orphan_removal,
                    fetch,
                    CascadeStyle::from_types(cascade),
                    batch_size.unwrap_or(self.settings.default_batch_fetch_size),
                    order_by.clone(),
                    *cache,
                );
                return Ok((
                    AttributeDefinition {
                        name: name.clone(),
                        index,
                        kind: AttributeKind::Collection {
                            role: persister.role().to_string(),
                        },
                        nullable: true,
                        cascade: CascadeStyle::from_types(cascade),
                        fetch,
                    },
                    Some(persister),
                ));
            }
            AttributeMapping::ElementCollection {
                name,
                table,
                key_columns,
                element_column,
                element_type,
                fetch,
                batch_size,
                order_by,
                cache,
            } => {
                let key_columns = typed_columns(owner, name, key_columns, self.owner_id_columns)?;
                let fetch = declared_fetch(fetch);
                let persister = CollectionPersister::new(
                    owner,
                    name,
                    table.clone(),
                    key_columns,
                    CollectionElementKind::Basic {
                        column: Column::new(element_column.clone(), *element_type),
                    },
                    false,
                    false,
                    fetch,
                    CascadeStyle::none(),
                    batch_size.unwrap_or(self.settings.default_batch_fetch_size),
                    order_by.clone(),
                    *cache,
                );
                return Ok((
                    AttributeDefinition {
                        name: name.clone(),
                        index,
                        kind: AttributeKind::Collection {
                            role: persister.role().to_string(),
                        },
                        nullable: true,
                        cascade: CascadeStyle::none(),
                        fetch,
                    },
                    Some(persister),
                ));
            }
        };
        Ok((definition, None))
    }

    fn target_id_columns(&self, attribute: &str, target: &str) -> Result<&[Column]> {
        self.mappers
            .get(target)
            .map(|(_, columns)| columns.as_slice())
            .ok_or_else(|| {
                OrmError::Mapping(format!(
                    "Association {}.{} targets unknown entity '{}'",
                    self.owner.name, attribute, target
                ))
            })
    }

    /// Role of the inverse collection on `target` whose key is `columns`.
    fn inverse_role_for(&self, target: &str, columns: &[&str]) -> Option<String> {
        let target_mapping = self.model.entities.iter().find(|e| e.name == target)?;
        target_mapping.attributes.iter().find_map(|attribute| match attribute {
            AttributeMapping::OneToMany {
                name,
                target: element,
                key_columns,
                inverse: true,
                ..
            } if element == &self.owner.name && key_columns.iter().map(String::as_str).eq(columns.iter().copied()) => {
                Some(CollectionPersister::role_name(target, name))
            }
            _ => None,
        })
    }
}

fn declared_fetch(fetch: &Option<FetchMapping>) -> FetchStrategy {
    match fetch {
        Some(mapping) => FetchStrategy::declared(mapping.timing, mapping.style),
        None => FetchStrategy::delayed_select(),
    }
}

/// Give foreign-key columns the types of the key they reference.
fn typed_columns(owner: &str, attribute: &str, names: &[String], referenced: &[Column]) -> Result<Vec<Column>> {
    if names.len() != referenced.len() {
        return Err(OrmError::Mapping(format!(
            "{}.{} declares {} key column(s) but the referenced identifier has {}",
            owner,
            attribute,
            names.len(),
            referenced.len()
        )));
    }
    Ok(names
        .iter()
        .zip(referenced)
        .map(|(name, column)| Column::new(name.clone(), column.sql_type))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CascadeType;
    use crate::sql::AnsiDialect;

    fn model() -> MappingModel {
        MappingModel {
            entities: vec![
                EntityMapping::new("Order", "orders", IdentifierMapping::single("id", "id", SqlType::Integer))
                    .attribute(AttributeMapping::basic("status", "status", SqlType::Text))
                    .attribute(AttributeMapping::many_to_one("payment", "Payment", "payment_id"))
                    .attribute(
                        AttributeMapping::one_to_many("lines", "LineItem", "order_id")
                            .inverse()
                            .cascade(&[CascadeType::All]),
                    ),
                EntityMapping::new("Payment", "payments", IdentifierMapping::single("id", "id", SqlType::Integer)),
                EntityMapping::new("LineItem", "line_items", IdentifierMapping::single("id", "id", SqlType::Integer))
                    .attribute(AttributeMapping::many_to_one("order", "Order", "order_id")),
            ],
            fetch_profiles: Vec::new(),
        }
    }

    #[test]
    fn test_build_registry() {
        let registry = PersisterRegistry::build(&model(), &Settings::default(), &AnsiDialect).unwrap();
        let order = registry.entity("Order").unwrap();
        assert_eq!(order.property_columns().len(), 2);
        let lines = registry.collection("Order.lines").unwrap();
        assert!(lines.is_inverse());
        assert_eq!(lines.table(), "line_items");
        assert_eq!(lines.key_columns()[0].sql_type, SqlType::Integer);

        let item = registry.entity("LineItem").unwrap();
        match &item.attribute("order").unwrap().kind {
            AttributeKind::ToOne { back_reference, .. } => {
                assert_eq!(back_reference.as_deref(), Some("Order.lines"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(registry.entity("Nope"), Err(OrmError::UnknownEntity(_))));
    }

    #[test]
    fn test_unknown_target_is_a_mapping_error() {
        let mut model = model();
        model.entities[0]
            .attributes
            .push(AttributeMapping::many_to_one("customer", "Customer", "customer_id"));
        let err = PersisterRegistry::build(&model, &Settings::default(), &AnsiDialect).unwrap_err();
        assert!(matches!(err, OrmError::Mapping(_)));
    }

    #[test]
    fn test_key_column_count_must_match() {
        let mut model = model();
        model.entities[2].attributes[0] = AttributeMapping::ManyToOne {
            name: "order".into(),
            target: "Order".into(),
            columns: vec!["a".into(), "b".into()],
            fetch: None,
            cascade: Vec::new(),
            nullable: true,
        };
        assert!(PersisterRegistry::build(&model, &Settings::default(), &AnsiDialect).is_err());
    }

    #[test]
    fn test_copy_on_write() {
        let registry = PersisterRegistry::new();
        let with_profile = registry.clone().with_profile(FetchProfile::new("p")).unwrap();
        assert!(registry.profile("p").is_err());
        assert!(with_profile.profile("p").is_ok());
        assert!(with_profile.with_profile(FetchProfile::new("p")).is_err());
    }
}
