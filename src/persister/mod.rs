// ============================================================================
// Persisters: immutable, boot-time descriptors of mapped entities and collections
// ============================================================================

pub mod accessor;
pub mod registry;

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::AccessType;
use crate::core::{Column, OrmError, Result, Value};
use crate::engine::{EntityHandle, StateValue};
use crate::id::{Identifier, IdentifierGenerator, IdentifierMapper};
use crate::loadplan::FetchStrategy;
use crate::metadata::CascadeType;

pub use accessor::{Accessor, AccessorTable};
pub use registry::{FetchProfile, PersisterRegistry};

/// Operation propagated along associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadingAction {
    Persist,
    /// Persist reached through flush-time reachability
    PersistOnFlush,
    Merge,
    Delete,
    Refresh,
    Evict,
}

impl CascadingAction {
    pub fn name(&self) -> &'static str {
        match self {
            CascadingAction::Persist => "persist",
            CascadingAction::PersistOnFlush => "persist-on-flush",
            CascadingAction::Merge => "merge",
            CascadingAction::Delete => "delete",
            CascadingAction::Refresh => "refresh",
            CascadingAction::Evict => "evict",
        }
    }
}

/// Which cascading actions an association propagates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeStyle {
    types: HashSet<CascadeType>,
}

impl CascadeStyle {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_types(types: &[CascadeType]) -> Self {
        Self {
            types: types.iter().copied().collect(),
        }
    }

    pub fn does_cascade(&self, action: CascadingAction) -> bool {
        if self.types.contains(&CascadeType::All) {
            return true;
        }
        let required = match action {
            CascadingAction::Persist | CascadingAction::PersistOnFlush => CascadeType::Persist,
            CascadingAction::Merge => CascadeType::Merge,
            CascadingAction::Delete => CascadeType::Remove,
            CascadingAction::Refresh => CascadeType::Refresh,
            CascadingAction::Evict => CascadeType::Evict,
        };
        self.types.contains(&required)
    }

    pub fn is_none(&self) -> bool {
        self.types.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeKind {
    Basic { column: Column },
    Component { parts: Vec<AttributeDefinition> },
    /// Many-to-one; `back_reference` names the inverse collection role when
    /// this is the non-owning half of a bidirectional pair.
    ToOne {
        target: String,
        columns: Vec<Column>,
        back_reference: Option<String>,
    },
    Collection { role: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDefinition {
    pub name: String,
    /// Slot index within the owner (or the enclosing component)
    pub index: usize,
    pub kind: AttributeKind,
    pub nullable: bool,
    pub cascade: CascadeStyle,
    pub fetch: FetchStrategy,
}

impl AttributeDefinition {
    pub fn is_association(&self) -> bool {
        matches!(self.kind, AttributeKind::ToOne { .. } | AttributeKind::Collection { .. })
    }

    /// Columns this attribute occupies in the owner's table.
    pub fn columns(&self) -> Vec<Column> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<Column>) {
        match &self.kind {
            AttributeKind::Basic { column } => out.push(column.clone()),
            AttributeKind::Component { parts } => parts.iter().for_each(|p| p.collect_columns(out)),
            AttributeKind::ToOne { columns, .. } => out.extend(columns.iter().cloned()),
            AttributeKind::Collection { .. } => {}
        }
    }
}

pub struct EntityPersister {
    name: String,
    table: String,
    identifier: IdentifierMapper,
    id_columns: Vec<Column>,
    generator: IdentifierGenerator,
    attributes: Vec<AttributeDefinition>,
    accessors: Arc<AccessorTable>,
    version: Option<Column>,
    cache: Option<AccessType>,
    batch_size: usize,
    mutable: bool,
}

impl std::fmt::Debug for EntityPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityPersister")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("attributes", &self.attributes.len())
            .finish()
    }
}

impl EntityPersister {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        table: String,
        identifier: IdentifierMapper,
        generator: IdentifierGenerator,
        attributes: Vec<AttributeDefinition>,
        version: Option<Column>,
        cache: Option<AccessType>,
        batch_size: usize,
        mutable: bool,
    ) -> Result<Self> {
        let id_columns = identifier.columns()?;
        let accessors = Arc::new(AccessorTable::build(&name, &attributes));
        Ok(Self {
            name,
            table,
            identifier,
            id_columns,
            generator,
            attributes,
            accessors,
            version,
            cache,
            batch_size,
            mutable,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn identifier_mapper(&self) -> &IdentifierMapper {
        &self.identifier
    }

    pub fn id_columns(&self) -> &[Column] {
        &self.id_columns
    }

    pub fn generator(&self) -> &IdentifierGenerator {
        &self.generator
    }

    pub fn attributes(&self) -> &[AttributeDefinition] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Result<&AttributeDefinition> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| OrmError::UnknownProperty(self.name.clone(), name.to_string()))
    }

    pub fn accessors(&self) -> Arc<AccessorTable> {
        self.accessors.clone()
    }

    pub fn version_column(&self) -> Option<&Column> {
        self.version.as_ref()
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    pub fn cache_access(&self) -> Option<AccessType> {
        self.cache
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn instantiate(&self) -> EntityHandle {
        EntityHandle::new(&self.name, self.accessors.clone())
    }

    pub fn create_proxy(&self, id: Identifier) -> EntityHandle {
        EntityHandle::proxy(&self.name, self.accessors.clone(), id)
    }

    /// Columns written by insert and update, excluding identifier and version.
    pub fn property_columns(&self) -> Vec<Column> {
        self.attributes.iter().flat_map(|a| a.columns()).collect()
    }

    /// Column values of `state`, aligned with `property_columns`.
    pub fn dehydrate(&self, state: &[StateValue]) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        for (attribute, value) in self.attributes.iter().zip(state) {
            dehydrate_attribute(attribute, value, &mut values)?;
        }
        Ok(values)
    }

    /// Indexes of the attributes whose state differs.
    pub fn find_dirty(&self, current: &[StateValue], loaded: &[StateValue]) -> Vec<usize> {
        self.attributes
            .iter()
            .zip(current.iter().zip(loaded))
            .filter(|(attribute, (now, then))| {
                !matches!(attribute.kind, AttributeKind::Collection { .. }) && now != then
            })
            .map(|(attribute, _)| attribute.index)
            .collect()
    }

    pub fn next_version(current: Option<&Value>) -> Value {
        match current.and_then(Value::as_i64) {
            Some(v) => Value::Integer(v + 1),
            None => Value::Integer(0),
        }
    }
}

fn dehydrate_attribute(attribute: &AttributeDefinition, value: &StateValue, out: &mut Vec<Value>) -> Result<()> {
    match (&attribute.kind, value) {
        (AttributeKind::Basic { .. }, StateValue::Basic(v)) => out.push(v.clone()),
        (AttributeKind::Component { parts }, StateValue::Component(values)) => {
            for (part, v) in parts.iter().zip(values) {
                dehydrate_attribute(part, v, out)?;
            }
        }
        (AttributeKind::ToOne { columns, .. }, StateValue::Reference(target)) => match target {
            Some(id) => {
                let values = id.values();
                if values.len() != columns.len() {
                    return Err(OrmError::IllegalState(format!(
                        "Reference '{}' has {} key value(s) for {} column(s)",
                        attribute.name,
                        values.len(),
                        columns.len()
                    )));
                }
                out.extend(values);
            }
            None => out.extend(std::iter::repeat_n(Value::Null, columns.len())),
        },
        (AttributeKind::Collection { .. }, _) => {}
        (_, other) => {
            return Err(OrmError::IllegalState(format!(
                "State {:?} does not fit attribute '{}'",
                other, attribute.name
            )));
        }
    }
    Ok(())
}

/// What a collection holds.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionElementKind {
    /// One-to-many: elements are rows of the target entity's table
    Entity { target: String },
    /// Element collection: values stored in the collection table
    Basic { column: Column },
}

#[derive(Debug)]
pub struct CollectionPersister {
    role: String,
    owner_entity: String,
    attribute: String,
    table: String,
    key_columns: Vec<Column>,
    element: CollectionElementKind,
    inverse: bool,
    orphan_removal: bool,
    fetch: FetchStrategy,
    cascade: CascadeStyle,
    batch_size: usize,
    order_by: Option<String>,
    cache: Option<AccessType>,
}

impl CollectionPersister {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        owner_entity: &str,
        attribute: &str,
        table: String,
        key_columns: Vec<Column>,
        element: CollectionElementKind,
        inverse: bool,
        orphan_removal: bool,
        fetch: FetchStrategy,
        cascade: CascadeStyle,
        batch_size: usize,
        order_by: Option<String>,
        cache: Option<AccessType>,
    ) -> Self {
        Self {
            role: Self::role_name(owner_entity, attribute),
            owner_entity: owner_entity.to_string(),
            attribute: attribute.to_string(),
            table,
            key_columns,
            element,
            inverse,
            orphan_removal,
            fetch,
            cascade,
            batch_size,
            order_by,
            cache,
        }
    }

    pub fn role_name(owner_entity: &str, attribute: &str) -> String {
        format!("{}.{}", owner_entity, attribute)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn owner_entity(&self) -> &str {
        &self.owner_entity
    }

    pub fn attribute_name(&self) -> &str {
        &self.attribute
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key_columns(&self) -> &[Column] {
        &self.key_columns
    }

    pub fn element(&self) -> &CollectionElementKind {
        &self.element
    }

    pub fn element_entity(&self) -> Option<&str> {
        match &self.element {
            CollectionElementKind::Entity { target } => Some(target),
            CollectionElementKind::Basic { .. } => None,
        }
    }

    pub fn is_inverse(&self) -> bool {
        self.inverse
    }

    pub fn is_one_to_many(&self) -> bool {
        matches!(self.element, CollectionElementKind::Entity { .. })
    }

    pub fn orphan_removal(&self) -> bool {
        self.orphan_removal
    }

    pub fn fetch(&self) -> FetchStrategy {
        self.fetch
    }

    pub fn cascade(&self) -> &CascadeStyle {
        &self.cascade
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    pub fn cache_access(&self) -> Option<AccessType> {
        self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_style() {
        let all = CascadeStyle::from_types(&[CascadeType::All]);
        assert!(all.does_cascade(CascadingAction::Delete));
        let persist = CascadeStyle::from_types(&[CascadeType::Persist]);
        assert!(persist.does_cascade(CascadingAction::PersistOnFlush));
        assert!(!persist.does_cascade(CascadingAction::Delete));
        assert!(CascadeStyle::none().is_none());
    }

    #[test]
    fn test_next_version() {
        assert_eq!(EntityPersister::next_version(None), Value::Integer(0));
        assert_eq!(EntityPersister::next_version(Some(&Value::Integer(4))), Value::Integer(5));
    }
}
