// ============================================================================
// Flush: dirty checking, action scheduling and ordered execution
// ============================================================================

use std::sync::Arc;

use log::{debug, warn};
use tracing::{Level, event, info_span};

use crate::cache::{CacheKey, CacheValue, CachedElement, CollectionCacheEntry, EntityCacheEntry};
use crate::config::FlushMode;
use crate::core::{OrmError, Result, Value};
use crate::id::{CollectionKey, EntityKey, Identifier};
use crate::persister::{CascadingAction, CollectionPersister, EntityPersister};
use crate::sql::{ParameterBindings, RenderedStatement};

use super::action::{
    CacheCompletion, CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction, EntityDeleteAction,
    EntityInsertAction, EntityUpdateAction,
};
use super::cascade::Visited;
use super::context::{CollectionEntry, EntityStatus};
use super::entity::{AttributeValue, CollectionHandle, Element, EntityHandle};
use super::session::SessionState;

/// Collection handles reachable from an instance's attributes, with their roles.
fn collect_collections(attributes: &[AttributeValue], out: &mut Vec<CollectionHandle>) {
    for value in attributes {
        match value {
            AttributeValue::Collection(handle) => out.push(handle.clone()),
            AttributeValue::Component(parts) => collect_collections(parts, out),
            _ => {}
        }
    }
}

/// Referenced instances, collection elements excluded.
fn collect_references(attributes: &[AttributeValue], out: &mut Vec<EntityHandle>) {
    for value in attributes {
        match value {
            AttributeValue::ToOne(Some(target)) => out.push(target.clone()),
            AttributeValue::Component(parts) => collect_references(parts, out),
            _ => {}
        }
    }
}

fn element_values(element: &Element) -> Result<Vec<Value>> {
    match element {
        Element::Value(value) => Ok(vec![value.clone()]),
        Element::Entity(handle) => handle
            .identifier()?
            .map(|id| id.values())
            .ok_or_else(|| OrmError::IllegalState("Collection element has no identifier".into())),
    }
}

fn stale(key: &EntityKey) -> OrmError {
    OrmError::StaleObjectState(format!("[{}]", key))
}

impl SessionState {
    pub(super) fn flush(&mut self) -> Result<()> {
        let _span = info_span!("flush", entities = self.context.entity_count()).entered();
        self.cascade_on_flush()?;
        self.schedule_collections()?;
        self.schedule_entities()?;
        if self.actions.is_empty() {
            debug!("Nothing to flush");
        } else if let Err(err) = self.execute_actions() {
            event!(Level::ERROR, error = %err, "Flush failed");
            self.actions.clear();
            return Err(err);
        }
        self.post_flush()?;
        self.factory.statistics.flushed();
        Ok(())
    }

    /// Flush before a query when pending changes could affect its results.
    pub(super) fn auto_flush_if_required(&mut self) -> Result<()> {
        if self.flush_mode == FlushMode::Auto && self.in_transaction() && self.is_dirty()? {
            debug!("Auto-flushing before query");
            self.flush()?;
        }
        Ok(())
    }

    /// Whether a flush would write anything.
    pub(super) fn is_dirty(&self) -> Result<bool> {
        for (_, entry) in self.context.entities() {
            match entry.status {
                EntityStatus::Deleted if entry.exists_in_database => return Ok(true),
                EntityStatus::Managed if !entry.exists_in_database => return Ok(true),
                EntityStatus::Managed => {}
                _ => continue,
            }
            if !entry.handle.is_initialized()? {
                continue;
            }
            if let Some(loaded) = &entry.loaded_state {
                if !entry.persister.find_dirty(&entry.handle.state()?, loaded).is_empty() {
                    return Ok(true);
                }
            }
            let mut collections = Vec::new();
            collect_collections(&entry.handle.attribute_values()?, &mut collections);
            for handle in collections {
                match self.context.collection_key_of(&handle) {
                    Some(_) if handle.is_dirty()? => return Ok(true),
                    Some(_) => {}
                    None if !handle.is_empty()? => return Ok(true),
                    None => {}
                }
            }
        }
        Ok(false)
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Persist instances newly reachable through persist-cascaded associations.
    fn cascade_on_flush(&mut self) -> Result<()> {
        let mut visited = Visited::default();
        let managed: Vec<EntityHandle> = self
            .context
            .entities()
            .filter(|(_, entry)| entry.status == EntityStatus::Managed)
            .map(|(_, entry)| entry.handle.clone())
            .collect();
        for handle in managed {
            if handle.is_initialized()? {
                self.persist_with(&handle, CascadingAction::PersistOnFlush, &mut visited)?;
            }
        }
        Ok(())
    }

    /// Referenced instances must be managed or detached. With assigned
    /// identifiers only the database can tell a detached instance from a
    /// transient one.
    fn check_transient(&mut self, owner: &EntityKey, target: &EntityHandle) -> Result<()> {
        if self.context.contains_instance(target) {
            return Ok(());
        }
        let transient = match target.entity_key()? {
            None => true,
            Some(key) if self.context.entity(&key).is_some() || target.is_proxy()? => false,
            Some(key) => {
                let persister = self.factory.registry.entity(&key.entity)?.clone();
                persister.generator().is_assigned() && !self.row_exists(&persister, &key.id)?
            }
        };
        if transient {
            return Err(OrmError::IllegalState(format!(
                "[{}] references an unsaved transient instance of {}; persist it before flushing",
                owner,
                target.entity_name()?
            )));
        }
        Ok(())
    }

    fn row_exists(&mut self, persister: &EntityPersister, id: &Identifier) -> Result<bool> {
        let exists = self.factory.entity_sql(persister.name())?.exists.clone();
        let mut bindings = ParameterBindings::new();
        for value in id.values() {
            bindings.push(value);
        }
        let mut cursor = self.query(&exists, bindings)?;
        let found = cursor.next_row()?;
        debug!("[{}#{}] exists in database: {}", persister.name(), id, found);
        Ok(found)
    }

    fn schedule_collections(&mut self) -> Result<()> {
        let owners: Vec<(EntityKey, EntityHandle, EntityStatus)> = self
            .context
            .entities()
            .filter(|(_, entry)| matches!(entry.status, EntityStatus::Managed | EntityStatus::Deleted))
            .map(|(key, entry)| (key.clone(), entry.handle.clone(), entry.status))
            .collect();

        for (owner, handle, status) in owners {
            if status == EntityStatus::Deleted {
                for key in self.context.collections_of(&owner) {
                    if let Some(entry) = self.context.collection(&key) {
                        let persister = entry.persister.clone();
                        self.schedule_remove(key, persister);
                    }
                }
                continue;
            }
            if !handle.is_initialized()? {
                continue;
            }
            let mut collections = Vec::new();
            collect_collections(&handle.attribute_values()?, &mut collections);
            for collection in collections {
                self.schedule_collection(&owner, collection)?;
            }
        }
        Ok(())
    }

    fn schedule_collection(&mut self, owner: &EntityKey, handle: CollectionHandle) -> Result<()> {
        let role = handle.role()?;
        let persister = self.factory.registry.collection(&role)?.clone();
        let key = CollectionKey::new(role, owner.id.clone());

        if handle.is_initialized()? {
            for element in handle.entities()? {
                self.check_transient(owner, &element)?;
            }
        }

        let existing = self.context.collection(&key).map(|e| (e.handle.clone(), e.snapshot.clone()));
        match existing {
            Some((current, snapshot)) if current.ptr_eq(&handle) => {
                if !handle.is_initialized()? {
                    return Ok(());
                }
                let Some(snapshot) = snapshot else {
                    let elements = handle.elements()?;
                    self.schedule_recreate(key, persister, elements);
                    return Ok(());
                };
                if !handle.is_dirty()? {
                    return Ok(());
                }
                let elements = handle.elements()?;
                let removed: Vec<Element> = snapshot.iter().filter(|e| !elements.contains(e)).cloned().collect();
                let added: Vec<Element> = elements.iter().filter(|e| !snapshot.contains(e)).cloned().collect();
                self.remove_orphans(&persister, &removed, &elements)?;
                if self.factory.collection_sql(&key.role).is_some() && !(removed.is_empty() && added.is_empty()) {
                    debug!("Scheduling update of collection [{}]", key);
                    self.actions.collection_updates.push(CollectionUpdateAction {
                        key,
                        persister,
                        removed,
                        added,
                    });
                }
            }
            Some((replaced, snapshot)) => {
                debug!("Collection [{}] was replaced", key);
                if persister.orphan_removal() {
                    let old = match snapshot {
                        Some(elements) => elements,
                        None => {
                            if !replaced.is_initialized()? {
                                self.initialize_collection(&replaced)?;
                            }
                            replaced.elements()?
                        }
                    };
                    let elements = if handle.is_initialized()? { handle.elements()? } else { Vec::new() };
                    self.remove_orphans(&persister, &old, &elements)?;
                }
                self.context.remove_collection(&key);
                self.schedule_remove(key.clone(), persister.clone());
                self.register_new_collection(key, handle, persister)?;
            }
            None => self.register_new_collection(key, handle, persister)?,
        }
        Ok(())
    }

    fn register_new_collection(
        &mut self,
        key: CollectionKey,
        handle: CollectionHandle,
        persister: Arc<CollectionPersister>,
    ) -> Result<()> {
        handle.set_key(Some(key.owner.clone()))?;
        self.context.add_collection(
            key.clone(),
            CollectionEntry {
                handle: handle.clone(),
                persister: persister.clone(),
                owner: EntityKey::new(persister.owner_entity(), key.owner.clone()),
                snapshot: None,
            },
        );
        if handle.is_initialized()? {
            let elements = handle.elements()?;
            self.schedule_recreate(key, persister, elements);
        }
        Ok(())
    }

    fn schedule_recreate(&mut self, key: CollectionKey, persister: Arc<CollectionPersister>, elements: Vec<Element>) {
        if elements.is_empty() || self.factory.collection_sql(&key.role).is_none() {
            return;
        }
        debug!("Scheduling recreation of collection [{}]", key);
        self.actions.collection_creations.push(CollectionRecreateAction {
            key,
            persister,
            elements,
        });
    }

    fn schedule_remove(&mut self, key: CollectionKey, persister: Arc<CollectionPersister>) {
        if self.factory.collection_sql(&key.role).is_none() {
            return;
        }
        if self.actions.collection_removals.iter().any(|a| a.key == key) {
            return;
        }
        debug!("Scheduling removal of collection [{}]", key);
        self.actions.collection_removals.push(CollectionRemoveAction { key, persister });
    }

    /// Delete entities dropped from an orphan-removal collection.
    fn remove_orphans(&mut self, persister: &CollectionPersister, removed: &[Element], remaining: &[Element]) -> Result<()> {
        if !persister.orphan_removal() {
            return Ok(());
        }
        for element in removed {
            if let Element::Entity(orphan) = element {
                if remaining.contains(element) || !self.context.contains_instance(orphan) {
                    continue;
                }
                debug!("Removing orphan of collection {}", persister.role());
                self.remove(orphan)?;
            }
        }
        Ok(())
    }

    fn schedule_entities(&mut self) -> Result<()> {
        let keys = self.context.entity_keys();
        for key in keys {
            let Some(entry) = self.context.entity(&key) else {
                continue;
            };
            let handle = entry.handle.clone();
            let persister = entry.persister.clone();
            let status = entry.status;
            let exists = entry.exists_in_database;
            let version = entry.version.clone();
            let loaded = entry.loaded_state.clone();

            match status {
                EntityStatus::Deleted if exists => {
                    debug!("Scheduling deletion of [{}]", key);
                    self.actions.deletions.push(EntityDeleteAction { key, persister, version });
                }
                EntityStatus::Managed if !exists => {
                    let mut references = Vec::new();
                    collect_references(&handle.attribute_values()?, &mut references);
                    for target in &references {
                        self.check_transient(&key, target)?;
                    }
                    let state = handle.state()?;
                    let version = persister.is_versioned().then(|| EntityPersister::next_version(None));
                    debug!("Scheduling insertion of [{}]", key);
                    self.actions.insertions.push(EntityInsertAction {
                        key,
                        handle,
                        persister,
                        state,
                        version,
                    });
                }
                EntityStatus::Managed => {
                    let Some(loaded) = loaded else {
                        continue;
                    };
                    if !handle.is_initialized()? {
                        continue;
                    }
                    let mut references = Vec::new();
                    collect_references(&handle.attribute_values()?, &mut references);
                    for target in &references {
                        self.check_transient(&key, target)?;
                    }
                    let state = handle.state()?;
                    let dirty = persister.find_dirty(&state, &loaded);
                    let collection_changed = persister.is_versioned() && self.owned_collection_changed(&key);
                    if dirty.is_empty() && !collection_changed {
                        continue;
                    }
                    if !persister.is_mutable() {
                        warn!("Ignoring modification of immutable [{}]", key);
                        continue;
                    }
                    let next_version = persister
                        .is_versioned()
                        .then(|| EntityPersister::next_version(version.as_ref()));
                    debug!("Scheduling update of [{}], dirty attributes {:?}", key, dirty);
                    self.actions.updates.push(EntityUpdateAction {
                        key,
                        handle,
                        persister,
                        state,
                        dirty,
                        previous_version: version,
                        next_version,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn owned_collection_changed(&self, owner: &EntityKey) -> bool {
        let owns = |key: &CollectionKey, role_owner: &str| key.owner == owner.id && role_owner == owner.entity;
        self.actions
            .collection_updates
            .iter()
            .any(|a| owns(&a.key, a.persister.owner_entity()))
            || self
                .actions
                .collection_removals
                .iter()
                .any(|a| owns(&a.key, a.persister.owner_entity()))
            || self
                .actions
                .collection_creations
                .iter()
                .any(|a| owns(&a.key, a.persister.owner_entity()))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn execute_actions(&mut self) -> Result<()> {
        let actions = std::mem::take(&mut self.actions);
        for action in actions.insertions {
            self.execute_insert(action)?;
        }
        for action in actions.updates {
            self.execute_update(action)?;
        }
        for action in actions.collection_removals {
            self.execute_collection_remove(action)?;
        }
        for action in actions.collection_updates {
            self.execute_collection_update(action)?;
        }
        for action in actions.collection_creations {
            self.execute_collection_recreate(action)?;
        }
        for action in actions.deletions {
            self.execute_delete(action)?;
        }
        Ok(())
    }

    fn execute_insert(&mut self, action: EntityInsertAction) -> Result<()> {
        let sql = self.factory.entity_sql(action.persister.name())?.insert.clone();
        let mut values = action.key.id.values();
        values.extend(action.version.clone());
        values.extend(action.persister.dehydrate(&action.state)?);
        self.update(&sql, ParameterBindings::from_positional(values))?;
        self.factory.statistics.entity_inserted();

        action.handle.set_version(action.version.clone())?;
        if let Some(entry) = self.context.entity_mut(&action.key) {
            entry.loaded_state = Some(action.state.clone());
            entry.version = action.version.clone();
            entry.exists_in_database = true;
        }

        if let Some(access) = self.factory.entity_cache(action.persister.name()).cloned() {
            let key = CacheKey::Entity(action.key);
            let value = CacheValue::Entity(EntityCacheEntry {
                state: action.state,
                version: action.version.clone(),
            });
            if access.insert(&key, &value, action.version.as_ref())? {
                self.factory.statistics.cache_put();
            }
            self.register_completion(CacheCompletion::Insert {
                access,
                key,
                value,
                version: action.version,
            })?;
        }
        Ok(())
    }

    fn execute_update(&mut self, action: EntityUpdateAction) -> Result<()> {
        let sql = self
            .factory
            .entity_sql(action.persister.name())?
            .update
            .clone()
            .ok_or_else(|| OrmError::IllegalState(format!("{} is immutable", action.persister.name())))?;
        let versioned = action.persister.is_versioned();
        let mut values = action.persister.dehydrate(&action.state)?;
        if versioned {
            values.push(action.next_version.clone().unwrap_or(Value::Null));
        }
        values.extend(action.key.id.values());
        if versioned {
            values.push(action.previous_version.clone().unwrap_or(Value::Null));
        }

        let access = self.factory.entity_cache(action.persister.name()).cloned();
        let cache_key = CacheKey::Entity(action.key.clone());
        let lock = match &access {
            Some(access) => access.lock_item(&cache_key, action.previous_version.as_ref())?,
            None => None,
        };

        let rows = self.update(&sql, ParameterBindings::from_positional(values))?;
        if rows == 0 {
            self.factory.statistics.optimistic_failure();
            if let Some(access) = &access {
                access.unlock_item(&cache_key, lock.as_ref())?;
            }
            return Err(stale(&action.key));
        }
        self.factory.statistics.entity_updated();

        action.handle.set_version(action.next_version.clone())?;
        if let Some(entry) = self.context.entity_mut(&action.key) {
            entry.loaded_state = Some(action.state.clone());
            entry.version = action.next_version.clone();
        }

        if let Some(access) = access {
            let value = CacheValue::Entity(EntityCacheEntry {
                state: action.state,
                version: action.next_version.clone(),
            });
            if access.update(
                &cache_key,
                &value,
                action.next_version.as_ref(),
                action.previous_version.as_ref(),
            )? {
                self.factory.statistics.cache_put();
            }
            self.register_completion(CacheCompletion::Update {
                access,
                key: cache_key,
                value,
                current_version: action.next_version,
                previous_version: action.previous_version,
                lock,
            })?;
        }
        Ok(())
    }

    fn execute_delete(&mut self, action: EntityDeleteAction) -> Result<()> {
        let sql = self.factory.entity_sql(action.persister.name())?.delete.clone();
        let mut values = action.key.id.values();
        if action.persister.is_versioned() {
            values.push(action.version.clone().unwrap_or(Value::Null));
        }

        let access = self.factory.entity_cache(action.persister.name()).cloned();
        let cache_key = CacheKey::Entity(action.key.clone());
        let lock = match &access {
            Some(access) => access.lock_item(&cache_key, action.version.as_ref())?,
            None => None,
        };

        let rows = self.update(&sql, ParameterBindings::from_positional(values))?;
        if rows == 0 {
            self.factory.statistics.optimistic_failure();
            if let Some(access) = &access {
                access.unlock_item(&cache_key, lock.as_ref())?;
            }
            return Err(stale(&action.key));
        }
        self.factory.statistics.entity_deleted();
        if let Some(entry) = self.context.entity_mut(&action.key) {
            entry.status = EntityStatus::Gone;
            entry.exists_in_database = false;
        }

        if let Some(access) = access {
            access.remove(&cache_key)?;
            self.register_completion(CacheCompletion::Unlock {
                access,
                key: cache_key,
                lock,
            })?;
        }
        Ok(())
    }

    fn execute_collection_remove(&mut self, action: CollectionRemoveAction) -> Result<()> {
        let Some(sql) = self.factory.collection_sql(&action.key.role).map(|sql| sql.remove.clone()) else {
            return Ok(());
        };
        self.invalidate_collection(&action.key, || {
            let bindings = ParameterBindings::from_positional(action.key.owner.values());
            Ok((sql, vec![bindings]))
        })?;
        self.factory.statistics.collection_removed();
        Ok(())
    }

    fn execute_collection_update(&mut self, action: CollectionUpdateAction) -> Result<()> {
        let Some(sql) = self.factory.collection_sql(&action.key.role) else {
            return Ok(());
        };
        let (delete_row, insert_row) = (sql.delete_row.clone(), sql.insert_row.clone());
        let mut deletes = Vec::new();
        for element in &action.removed {
            let mut values = action.key.owner.values();
            values.extend(element_values(element)?);
            deletes.push(ParameterBindings::from_positional(values));
        }
        let mut inserts = Vec::new();
        for element in &action.added {
            let mut values = action.key.owner.values();
            values.extend(element_values(element)?);
            inserts.push(ParameterBindings::from_positional(values));
        }
        self.invalidate_collection(&action.key, || Ok((delete_row, deletes)))?;
        for bindings in inserts {
            self.update(&insert_row, bindings)?;
        }
        self.factory.statistics.collection_updated();
        debug!(
            "Updated collection {} [{}]: {} removed, {} added",
            action.persister.role(),
            action.key.owner,
            action.removed.len(),
            action.added.len()
        );
        Ok(())
    }

    fn execute_collection_recreate(&mut self, action: CollectionRecreateAction) -> Result<()> {
        let Some(sql) = self.factory.collection_sql(&action.key.role).map(|sql| sql.insert_row.clone()) else {
            return Ok(());
        };
        let mut inserts = Vec::new();
        for element in &action.elements {
            let mut values = action.key.owner.values();
            values.extend(element_values(element)?);
            inserts.push(ParameterBindings::from_positional(values));
        }
        self.invalidate_collection(&action.key, || Ok((sql, inserts)))?;
        self.factory.statistics.collection_recreated();
        Ok(())
    }

    /// Run collection statements with the cached copy locked and removed.
    fn invalidate_collection(
        &mut self,
        key: &CollectionKey,
        statements: impl FnOnce() -> Result<(Arc<RenderedStatement>, Vec<ParameterBindings>)>,
    ) -> Result<()> {
        let access = self.factory.collection_cache(&key.role).cloned();
        let cache_key = CacheKey::Collection(key.clone());
        let lock = match &access {
            Some(access) => access.lock_item(&cache_key, None)?,
            None => None,
        };
        let (sql, all_bindings) = statements()?;
        for bindings in all_bindings {
            self.update(&sql, bindings)?;
        }
        if let Some(access) = access {
            access.remove(&cache_key)?;
            self.register_completion(CacheCompletion::Unlock {
                access,
                key: cache_key,
                lock,
            })?;
        }
        Ok(())
    }

    // ========================================================================
    // After execution
    // ========================================================================

    fn post_flush(&mut self) -> Result<()> {
        let gone: Vec<EntityKey> = self
            .context
            .entities()
            .filter(|(_, entry)| entry.status == EntityStatus::Gone)
            .map(|(key, _)| key.clone())
            .collect();
        for key in gone {
            self.forget(&key);
        }
        for key in self.context.collection_keys() {
            if let Some(entry) = self.context.collection_mut(&key) {
                if entry.handle.is_initialized()? {
                    entry.snapshot = Some(entry.handle.elements_unchecked()?);
                    entry.handle.clear_dirty()?;
                }
            }
        }
        Ok(())
    }
}

/// Cached form of collection elements.
pub(super) fn cached_elements(elements: &[Element]) -> Result<CollectionCacheEntry> {
    let elements = elements
        .iter()
        .map(|element| match element {
            Element::Entity(handle) => handle
                .identifier()?
                .map(CachedElement::Entity)
                .ok_or_else(|| OrmError::IllegalState("Collection element has no identifier".into())),
            Element::Value(value) => Ok(CachedElement::Value(value.clone())),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CollectionCacheEntry { elements })
}
