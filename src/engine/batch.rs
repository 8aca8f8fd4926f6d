// ============================================================================
// Batch and subselect fetch bookkeeping
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::id::{EntityKey, Identifier};
use crate::sql::{ParameterBindings, QuerySpec};

/// Owners selected by one query, for initializing a SUBSELECT collection of
/// all of them at once.
#[derive(Debug)]
pub struct SubselectFetch {
    pub role: String,
    /// `select <owner id> from <owner table> where <original restriction>`
    pub owner_query: QuerySpec,
    pub bindings: ParameterBindings,
    pub owners: Vec<Identifier>,
}

/// Uninitialized proxies and collections waiting to be loaded together.
#[derive(Debug, Default)]
pub struct BatchFetchQueue {
    entities: IndexMap<String, IndexSet<Identifier>>,
    collections: IndexMap<String, IndexSet<Identifier>>,
    subselects: HashMap<(String, EntityKey), Arc<SubselectFetch>>,
}

impl BatchFetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch_loadable_entity(&mut self, entity: &str, id: Identifier) {
        self.entities.entry(entity.to_string()).or_default().insert(id);
    }

    pub fn remove_batch_loadable_entity(&mut self, entity: &str, id: &Identifier) {
        if let Some(ids) = self.entities.get_mut(entity) {
            ids.shift_remove(id);
        }
    }

    /// `id` followed by up to `batch_size - 1` other queued ids of `entity`.
    pub fn entity_batch(&self, entity: &str, id: &Identifier, batch_size: usize) -> Vec<Identifier> {
        batch(self.entities.get(entity), id, batch_size)
    }

    pub fn add_batch_loadable_collection(&mut self, role: &str, owner: Identifier) {
        self.collections.entry(role.to_string()).or_default().insert(owner);
    }

    pub fn remove_batch_loadable_collection(&mut self, role: &str, owner: &Identifier) {
        if let Some(owners) = self.collections.get_mut(role) {
            owners.shift_remove(owner);
        }
    }

    pub fn collection_batch(&self, role: &str, owner: &Identifier, batch_size: usize) -> Vec<Identifier> {
        batch(self.collections.get(role), owner, batch_size)
    }

    pub fn add_subselect(&mut self, owner: EntityKey, fetch: Arc<SubselectFetch>) {
        self.subselects.insert((fetch.role.clone(), owner), fetch);
    }

    pub fn subselect(&self, role: &str, owner: &EntityKey) -> Option<Arc<SubselectFetch>> {
        self.subselects.get(&(role.to_string(), owner.clone())).cloned()
    }

    /// Forget a subselect once every owner collection of it was initialized.
    pub fn remove_subselect(&mut self, fetch: &Arc<SubselectFetch>) {
        self.subselects.retain(|_, f| !Arc::ptr_eq(f, fetch));
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.collections.clear();
        self.subselects.clear();
    }
}

fn batch(queued: Option<&IndexSet<Identifier>>, id: &Identifier, batch_size: usize) -> Vec<Identifier> {
    let mut ids = vec![id.clone()];
    if let Some(queued) = queued {
        ids.extend(
            queued
                .iter()
                .filter(|queued| *queued != id)
                .take(batch_size.saturating_sub(1))
                .cloned(),
        );
    }
    ids
}
