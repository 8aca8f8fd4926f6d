// ============================================================================
// Cascades: persist, merge, remove, refresh and evict along associations
// ============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;

use crate::core::{OrmError, Result};
use crate::id::{EntityKey, Identifier};
use crate::loadplan::LoadQueryInfluencers;
use crate::persister::{AttributeDefinition, AttributeKind, CascadingAction, EntityPersister};

use super::context::{EntityEntry, EntityStatus};
use super::entity::{AttributeValue, CollectionHandle, Element, EntityHandle};
use super::factory::{LoadTarget, RestrictionShape};
use super::loader::{LoadMode, bind_ids};
use super::session::SessionState;

/// Association reached from an instance during a cascade.
enum Reached {
    Entity(EntityHandle),
    Collection(CollectionHandle),
}

/// Associations of `attributes` that propagate `action`. Back-references
/// never cascade.
fn cascade_targets(
    definitions: &[AttributeDefinition],
    attributes: &[AttributeValue],
    action: CascadingAction,
    out: &mut Vec<Reached>,
) {
    for (definition, value) in definitions.iter().zip(attributes) {
        match (&definition.kind, value) {
            (AttributeKind::Component { parts }, AttributeValue::Component(nested)) => {
                cascade_targets(parts, nested, action, out)
            }
            (AttributeKind::ToOne { back_reference: None, .. }, AttributeValue::ToOne(Some(target)))
                if definition.cascade.does_cascade(action) =>
            {
                out.push(Reached::Entity(target.clone()))
            }
            (AttributeKind::Collection { .. }, AttributeValue::Collection(handle))
                if definition.cascade.does_cascade(action) =>
            {
                out.push(Reached::Collection(handle.clone()))
            }
            _ => {}
        }
    }
}

/// Identity set over entity handles.
#[derive(Default)]
pub(super) struct Visited(Vec<EntityHandle>);

impl Visited {
    /// Returns `false` when `handle` was already visited.
    fn insert(&mut self, handle: &EntityHandle) -> bool {
        if self.0.iter().any(|h| h.ptr_eq(handle)) {
            return false;
        }
        self.0.push(handle.clone());
        true
    }
}

/// Detached-to-managed pairs of one merge.
#[derive(Default)]
struct MergeCopies(Vec<(EntityHandle, EntityHandle)>);

impl MergeCopies {
    fn get(&self, detached: &EntityHandle) -> Option<EntityHandle> {
        self.0.iter().find(|(d, _)| d.ptr_eq(detached)).map(|(_, m)| m.clone())
    }
}

impl SessionState {
    fn entity_persister(&self, handle: &EntityHandle) -> Result<Arc<EntityPersister>> {
        Ok(self.factory.registry.entity(&handle.entity_name()?)?.clone())
    }

    /// Associations of an initialized instance that propagate `action`.
    fn reached(&self, handle: &EntityHandle, action: CascadingAction) -> Result<Vec<Reached>> {
        if !handle.is_initialized()? {
            return Ok(Vec::new());
        }
        let persister = self.entity_persister(handle)?;
        let attributes = handle.attribute_values()?;
        let mut out = Vec::new();
        cascade_targets(persister.attributes(), &attributes, action, &mut out);
        Ok(out)
    }

    /// Entity elements of a collection; uninitialized collections contribute
    /// nothing unless `initialize` is set.
    fn collection_entities(&mut self, handle: &CollectionHandle, initialize: bool) -> Result<Vec<EntityHandle>> {
        if !handle.is_initialized()? {
            if !initialize {
                return Ok(Vec::new());
            }
            self.initialize_collection(handle)?;
        }
        handle.entities()
    }

    // ========================================================================
    // Persist
    // ========================================================================

    pub(super) fn persist(&mut self, handle: &EntityHandle) -> Result<()> {
        let mut visited = Visited::default();
        self.persist_with(handle, CascadingAction::Persist, &mut visited)
    }

    pub(super) fn persist_with(
        &mut self,
        handle: &EntityHandle,
        action: CascadingAction,
        visited: &mut Visited,
    ) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        if let Some(key) = self.context.key_of(handle) {
            if let Some(entry) = self.context.entity_mut(&key) {
                match entry.status {
                    EntityStatus::Deleted if action == CascadingAction::Persist => {
                        entry.status = EntityStatus::Managed
                    }
                    EntityStatus::Deleted => return Ok(()),
                    EntityStatus::Gone => {
                        return Err(OrmError::IllegalState(format!("[{}] was already deleted", key)));
                    }
                    _ => {}
                }
            }
            return self.cascade_persist(handle, action, visited);
        }

        let persister = self.entity_persister(handle)?;
        if !persister.generator().is_assigned() && handle.identifier()?.is_some() {
            if action == CascadingAction::Persist {
                return Err(OrmError::IllegalState(format!(
                    "Detached instance of {} passed to persist",
                    persister.name()
                )));
            }
            return Ok(());
        }
        let targets = self.reached(handle, action)?;
        for target in &targets {
            if let Reached::Entity(target) = target {
                self.persist_with(target, action, visited)?;
            }
        }

        let id = self.assign_identifier(&persister, handle)?;
        let key = EntityKey::new(persister.name(), id);
        debug!("Persisting [{}]", key);
        self.context.add_entity(
            key,
            EntityEntry {
                handle: handle.clone(),
                persister,
                status: EntityStatus::Managed,
                loaded_state: None,
                version: None,
                exists_in_database: false,
            },
        )?;

        for target in &targets {
            if let Reached::Collection(collection) = target {
                for element in self.collection_entities(collection, false)? {
                    self.persist_with(&element, action, visited)?;
                }
            }
        }
        Ok(())
    }

    fn cascade_persist(&mut self, handle: &EntityHandle, action: CascadingAction, visited: &mut Visited) -> Result<()> {
        for target in self.reached(handle, action)? {
            match target {
                Reached::Entity(target) => self.persist_with(&target, action, visited)?,
                Reached::Collection(collection) => {
                    for element in self.collection_entities(&collection, false)? {
                        self.persist_with(&element, action, visited)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn assign_identifier(&mut self, persister: &EntityPersister, handle: &EntityHandle) -> Result<Identifier> {
        let generator = persister.generator();
        if generator.is_assigned() {
            return persister.identifier_mapper().map_to_id_from_entity(handle)?.ok_or_else(|| {
                OrmError::IllegalState(format!(
                    "Identifier of {} must be assigned before persist",
                    persister.name()
                ))
            });
        }
        let value = generator
            .generate(self.factory.provider.as_ref())?
            .ok_or_else(|| OrmError::IllegalState(format!("Generator of {} produced no value", persister.name())))?;
        let id = persister
            .identifier_mapper()
            .id_from_values(vec![value])?
            .ok_or_else(|| OrmError::IllegalState(format!("Generator of {} produced null", persister.name())))?;
        handle.set_identifier(Some(id.clone()))?;
        Ok(id)
    }

    // ========================================================================
    // Remove
    // ========================================================================

    pub(super) fn remove(&mut self, handle: &EntityHandle) -> Result<()> {
        let mut visited = Visited::default();
        self.remove_with(handle, &mut visited)
    }

    fn remove_with(&mut self, handle: &EntityHandle, visited: &mut Visited) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let key = self
            .context
            .key_of(handle)
            .ok_or_else(|| OrmError::IllegalState("Removing a detached instance".into()))?;
        if !handle.is_initialized()? {
            self.initialize_entity(handle)?;
        }
        match self.context.entity(&key).map(|e| e.status) {
            Some(EntityStatus::Deleted) | Some(EntityStatus::Gone) => return Ok(()),
            _ => {}
        }

        for target in self.reached(handle, CascadingAction::Delete)? {
            match target {
                Reached::Entity(target) => {
                    if self.context.contains_instance(&target) {
                        self.remove_with(&target, visited)?;
                    }
                }
                Reached::Collection(collection) => {
                    for element in self.collection_entities(&collection, true)? {
                        if self.context.contains_instance(&element) {
                            self.remove_with(&element, visited)?;
                        }
                    }
                }
            }
        }

        let exists = self.context.entity(&key).is_some_and(|e| e.exists_in_database);
        if exists {
            debug!("Scheduling deletion of [{}]", key);
            if let Some(entry) = self.context.entity_mut(&key) {
                entry.status = EntityStatus::Deleted;
            }
        } else {
            debug!("Discarding unflushed [{}]", key);
            self.forget(&key);
        }
        Ok(())
    }

    /// Drop an entity and its collections from the context.
    pub(super) fn forget(&mut self, key: &EntityKey) {
        self.context.remove_entity(key);
        for collection in self.context.collections_of(key) {
            self.context.remove_collection(&collection);
        }
        self.batch.remove_batch_loadable_entity(&key.entity, &key.id);
    }

    // ========================================================================
    // Evict
    // ========================================================================

    pub(super) fn evict(&mut self, handle: &EntityHandle) -> Result<()> {
        let mut visited = Visited::default();
        self.evict_with(handle, &mut visited)
    }

    fn evict_with(&mut self, handle: &EntityHandle, visited: &mut Visited) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let Some(key) = self.context.key_of(handle) else {
            return Ok(());
        };
        let targets = self.reached(handle, CascadingAction::Evict)?;
        debug!("Evicting [{}]", key);
        self.forget(&key);
        for target in targets {
            match target {
                Reached::Entity(target) => self.evict_with(&target, visited)?,
                Reached::Collection(collection) => {
                    for element in self.collection_entities(&collection, false)? {
                        self.evict_with(&element, visited)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    pub(super) fn refresh(&mut self, handle: &EntityHandle) -> Result<()> {
        let mut refreshed = HashSet::new();
        let mut visited = Visited::default();
        self.refresh_with(handle, &mut refreshed, &mut visited)
    }

    fn refresh_with(
        &mut self,
        handle: &EntityHandle,
        refreshed: &mut HashSet<EntityKey>,
        visited: &mut Visited,
    ) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let Some(key) = self.context.key_of(handle) else {
            return Err(OrmError::IllegalState("Cannot refresh an instance that is not managed".into()));
        };
        if !refreshed.contains(&key) {
            let outcome = self.refresh_one(handle)?;
            refreshed.extend(outcome.hydrated);
        }
        for target in self.reached(handle, CascadingAction::Refresh)? {
            match target {
                Reached::Entity(target) => {
                    if target.is_initialized()? && self.context.contains_instance(&target) {
                        self.refresh_with(&target, refreshed, visited)?;
                    }
                }
                Reached::Collection(collection) => {
                    for element in self.collection_entities(&collection, false)? {
                        if self.context.contains_instance(&element) {
                            self.refresh_with(&element, refreshed, visited)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Merge
    // ========================================================================

    pub(super) fn merge(&mut self, handle: &EntityHandle) -> Result<EntityHandle> {
        let mut copies = MergeCopies::default();
        self.merge_with(handle, &mut copies)
    }

    fn merge_with(&mut self, detached: &EntityHandle, copies: &mut MergeCopies) -> Result<EntityHandle> {
        if let Some(managed) = copies.get(detached) {
            return Ok(managed);
        }
        if self.context.contains_instance(detached) {
            copies.0.push((detached.clone(), detached.clone()));
            for target in self.reached(detached, CascadingAction::Merge)? {
                match target {
                    Reached::Entity(target) => {
                        self.merge_with(&target, copies)?;
                    }
                    Reached::Collection(collection) => {
                        for element in self.collection_entities(&collection, false)? {
                            self.merge_with(&element, copies)?;
                        }
                    }
                }
            }
            return Ok(detached.clone());
        }
        if !detached.is_initialized()? {
            return Err(OrmError::LazyInitialization(
                "cannot merge an uninitialized proxy of another session".into(),
            ));
        }

        let persister = self.entity_persister(detached)?;
        let managed = match persister.identifier_mapper().map_to_id_from_entity(detached)? {
            Some(id) => self.managed_for_merge(&persister, id)?,
            None => None,
        };
        let (managed, transient) = match managed {
            Some(managed) => {
                if persister.is_versioned() {
                    let detached_version = detached.version()?;
                    let managed_version = managed.version()?;
                    if detached_version.is_some() && detached_version != managed_version {
                        self.factory.statistics.optimistic_failure();
                        let key = self.context.key_of(&managed);
                        return Err(OrmError::StaleObjectState(match key {
                            Some(key) => format!("[{}]", key),
                            None => format!("[{}]", persister.name()),
                        }));
                    }
                }
                (managed, false)
            }
            None => {
                let copy = persister.instantiate();
                if persister.generator().is_assigned() {
                    copy.set_identifier(detached.identifier()?)?;
                }
                (copy, true)
            }
        };
        copies.0.push((detached.clone(), managed.clone()));

        let values = detached.attribute_values()?;
        let merged = self.merge_attributes(persister.attributes(), &values, &managed, copies)?;
        let current = managed.attribute_values_unchecked()?;
        let replaced = replace_attributes(current, merged)?;
        let version = managed.version()?;
        managed.hydrate(replaced, version)?;

        if transient {
            let mut visited = Visited::default();
            self.persist_with(&managed, CascadingAction::Merge, &mut visited)?;
        }
        Ok(managed)
    }

    /// Managed instance for a merge, loaded with merge-cascaded associations.
    fn managed_for_merge(&mut self, persister: &Arc<EntityPersister>, id: Identifier) -> Result<Option<EntityHandle>> {
        let key = EntityKey::new(persister.name(), id.clone());
        if let Some(entry) = self.context.entity(&key) {
            let handle = entry.handle.clone();
            if !handle.is_initialized()? {
                self.initialize_entity(&handle)?;
            }
            return Ok(Some(handle));
        }
        let prepared = self.factory.prepared_load(
            &LoadTarget::Cascade(persister.name().to_string(), CascadingAction::Merge),
            &LoadQueryInfluencers::new(),
            RestrictionShape::Id,
        )?;
        let outcome = self.run_load(&prepared.query, bind_ids([&id]), LoadMode::default())?;
        Ok(outcome.roots.into_iter().next())
    }

    /// Merged values for every attribute; `None` keeps the managed slot.
    fn merge_attributes(
        &mut self,
        definitions: &[AttributeDefinition],
        values: &[AttributeValue],
        managed: &EntityHandle,
        copies: &mut MergeCopies,
    ) -> Result<Vec<Option<AttributeValue>>> {
        let mut merged = Vec::with_capacity(definitions.len());
        for (definition, value) in definitions.iter().zip(values) {
            let result = match (&definition.kind, value) {
                (AttributeKind::Basic { .. }, AttributeValue::Basic(v)) => Some(AttributeValue::Basic(v.clone())),
                (AttributeKind::Component { parts }, AttributeValue::Component(nested)) => {
                    let parts = self.merge_attributes(parts, nested, managed, copies)?;
                    Some(AttributeValue::Component(
                        parts
                            .into_iter()
                            .zip(nested)
                            .map(|(merged, original)| merged.unwrap_or_else(|| original.clone()))
                            .collect(),
                    ))
                }
                (AttributeKind::ToOne { .. }, AttributeValue::ToOne(target)) => Some(AttributeValue::ToOne(
                    match target {
                        Some(target) => Some(self.merge_reference(definition, target, copies)?),
                        None => None,
                    },
                )),
                (AttributeKind::ToOne { .. }, AttributeValue::BackReference(target)) => {
                    let target = target.as_ref().and_then(|weak| weak.upgrade());
                    Some(AttributeValue::BackReference(match target {
                        Some(target) => Some(self.merge_reference(definition, &target, copies)?.downgrade()),
                        None => None,
                    }))
                }
                (AttributeKind::Collection { role }, AttributeValue::Collection(detached)) => {
                    if !detached.is_initialized()? {
                        None
                    } else {
                        let mut elements = Vec::new();
                        for element in detached.elements()? {
                            elements.push(match element {
                                Element::Entity(target) => Element::Entity(self.merge_reference(definition, &target, copies)?),
                                Element::Value(v) => Element::Value(v),
                            });
                        }
                        Some(AttributeValue::Collection(self.merged_collection(role, managed, elements)?))
                    }
                }
                _ => {
                    return Err(OrmError::IllegalState(format!(
                        "Attribute {} has state of the wrong kind",
                        definition.name
                    )));
                }
            };
            merged.push(result);
        }
        Ok(merged)
    }

    fn merge_reference(
        &mut self,
        definition: &AttributeDefinition,
        target: &EntityHandle,
        copies: &mut MergeCopies,
    ) -> Result<EntityHandle> {
        let back_reference = matches!(definition.kind, AttributeKind::ToOne { back_reference: Some(_), .. });
        if definition.cascade.does_cascade(CascadingAction::Merge) && !back_reference {
            return self.merge_with(target, copies);
        }
        if let Some(managed) = copies.get(target) {
            return Ok(managed);
        }
        if self.context.contains_instance(target) {
            return Ok(target.clone());
        }
        let persister = self.entity_persister(target)?;
        match persister.identifier_mapper().map_to_id_from_entity(target)? {
            Some(id) => self.load(persister.name(), id),
            None => Err(OrmError::IllegalState(format!(
                "Merged instance references an unsaved transient instance of {}",
                persister.name()
            ))),
        }
    }

    /// Replace the contents of the managed collection with merged elements.
    fn merged_collection(&mut self, role: &str, managed: &EntityHandle, elements: Vec<Element>) -> Result<CollectionHandle> {
        let existing = managed.attribute_values_unchecked()?.into_iter().find_map(|value| match value {
            AttributeValue::Collection(handle) if handle.role().ok().as_deref() == Some(role) => Some(handle),
            _ => None,
        });
        let handle = match existing {
            Some(handle) => {
                if !handle.is_initialized()? {
                    self.initialize_collection(&handle)?;
                }
                handle
            }
            None => CollectionHandle::new(role),
        };
        if handle.elements()? != elements {
            handle.clear()?;
            for element in elements {
                handle.add(element)?;
            }
        }
        Ok(handle)
    }
}

/// Overlay merged top-level slots onto the managed slots.
fn replace_attributes(current: Vec<AttributeValue>, merged: Vec<Option<AttributeValue>>) -> Result<Vec<AttributeValue>> {
    if current.len() != merged.len() {
        return Err(OrmError::IllegalState("Merged state does not match the managed instance".into()));
    }
    Ok(current
        .into_iter()
        .zip(merged)
        .map(|(current, merged)| merged.unwrap_or(current))
        .collect())
}
