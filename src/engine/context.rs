// ============================================================================
// Persistence context: the per-session identity map
// ============================================================================

use std::sync::Arc;

use indexmap::IndexMap;

use crate::core::{OrmError, Result, Value};
use crate::id::{CollectionKey, EntityKey};
use crate::persister::{CollectionPersister, EntityPersister};

use super::entity::{CollectionHandle, Element, EntityHandle, StateValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    /// Being hydrated by a running load
    Loading,
    Managed,
    /// Scheduled for deletion
    Deleted,
    /// Deleted and flushed
    Gone,
}

#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub handle: EntityHandle,
    pub persister: Arc<EntityPersister>,
    pub status: EntityStatus,
    /// State as last read from or written to the database; `None` for
    /// uninitialized proxies and pending inserts
    pub loaded_state: Option<Vec<StateValue>>,
    pub version: Option<Value>,
    pub exists_in_database: bool,
}

impl EntityEntry {
    pub fn is_initialized(&self) -> Result<bool> {
        self.handle.is_initialized()
    }
}

#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub handle: CollectionHandle,
    pub persister: Arc<CollectionPersister>,
    pub owner: EntityKey,
    /// Elements as last loaded or flushed; `None` for new or uninitialized collections
    pub snapshot: Option<Vec<Element>>,
}

/// Identity map guaranteeing one instance per (entity, identifier).
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entities: IndexMap<EntityKey, EntityEntry>,
    collections: IndexMap<CollectionKey, CollectionEntry>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entities.get(key)
    }

    pub fn entity_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entities.get_mut(key)
    }

    /// Register an entry; a different instance under the same key is rejected.
    pub fn add_entity(&mut self, key: EntityKey, entry: EntityEntry) -> Result<()> {
        if let Some(existing) = self.entities.get(&key) {
            if !existing.handle.ptr_eq(&entry.handle) {
                return Err(OrmError::NonUniqueObject(key.to_string()));
            }
        }
        self.entities.insert(key, entry);
        Ok(())
    }

    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityEntry> {
        self.entities.shift_remove(key)
    }

    /// Key under which this exact instance is managed.
    pub fn key_of(&self, handle: &EntityHandle) -> Option<EntityKey> {
        self.entities
            .iter()
            .find(|(_, entry)| entry.handle.ptr_eq(handle))
            .map(|(key, _)| key.clone())
    }

    pub fn contains_instance(&self, handle: &EntityHandle) -> bool {
        self.key_of(handle).is_some()
    }

    pub fn entity_keys(&self) -> Vec<EntityKey> {
        self.entities.keys().cloned().collect()
    }

    pub fn entities(&self) -> impl Iterator<Item = (&EntityKey, &EntityEntry)> {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn collection(&self, key: &CollectionKey) -> Option<&CollectionEntry> {
        self.collections.get(key)
    }

    pub fn collection_mut(&mut self, key: &CollectionKey) -> Option<&mut CollectionEntry> {
        self.collections.get_mut(key)
    }

    pub fn add_collection(&mut self, key: CollectionKey, entry: CollectionEntry) {
        self.collections.insert(key, entry);
    }

    pub fn remove_collection(&mut self, key: &CollectionKey) -> Option<CollectionEntry> {
        self.collections.shift_remove(key)
    }

    /// Key of this exact collection instance.
    pub fn collection_key_of(&self, handle: &CollectionHandle) -> Option<CollectionKey> {
        self.collections
            .iter()
            .find(|(_, entry)| entry.handle.ptr_eq(handle))
            .map(|(key, _)| key.clone())
    }

    pub fn collection_keys(&self) -> Vec<CollectionKey> {
        self.collections.keys().cloned().collect()
    }

    /// Collections owned by `owner`.
    pub fn collections_of(&self, owner: &EntityKey) -> Vec<CollectionKey> {
        self.collections
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.collections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::AccessorTable;

    fn handle(id: i64) -> EntityHandle {
        let handle = EntityHandle::new("Order", Arc::new(AccessorTable::build("Order", &[])));
        handle.set_identifier(Some(id.into())).unwrap();
        handle
    }

    #[test]
    fn test_identity_is_enforced() {
        use crate::config::Settings;
        use crate::core::SqlType;
        use crate::metadata::{EntityMapping, IdentifierMapping, MappingModel};
        use crate::persister::PersisterRegistry;
        use crate::sql::AnsiDialect;

        let model = MappingModel {
            entities: vec![EntityMapping::new(
                "Order",
                "orders",
                IdentifierMapping::single("id", "id", SqlType::Integer),
            )],
            fetch_profiles: Vec::new(),
        };
        let registry = PersisterRegistry::build(&model, &Settings::default(), &AnsiDialect).unwrap();
        let persister = registry.entity("Order").unwrap().clone();

        let mut context = PersistenceContext::new();
        let first = handle(1);
        let entry = |h: &EntityHandle| EntityEntry {
            handle: h.clone(),
            persister: persister.clone(),
            status: EntityStatus::Managed,
            loaded_state: Some(Vec::new()),
            version: None,
            exists_in_database: true,
        };
        let key = EntityKey::new("Order", 1i64.into());
        context.add_entity(key.clone(), entry(&first)).unwrap();
        // the same instance may be re-registered
        context.add_entity(key.clone(), entry(&first)).unwrap();

        let second = handle(1);
        let err = context.add_entity(key.clone(), entry(&second)).unwrap_err();
        assert!(matches!(err, OrmError::NonUniqueObject(_)));
        assert_eq!(context.key_of(&first), Some(key));
        assert!(!context.contains_instance(&second));
    }
}
