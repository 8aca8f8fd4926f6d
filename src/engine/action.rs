// ============================================================================
// Action queue: flush-time work units, executed in a fixed order
// ============================================================================

use std::sync::Arc;

use log::warn;

use crate::cache::{CacheKey, CacheValue, DomainDataAccess, SoftLock};
use crate::core::{Result, Value};
use crate::id::{CollectionKey, EntityKey};
use crate::persister::{CollectionPersister, EntityPersister};

use super::entity::{Element, EntityHandle, StateValue};

#[derive(Debug)]
pub(crate) struct EntityInsertAction {
    pub key: EntityKey,
    pub handle: EntityHandle,
    pub persister: Arc<EntityPersister>,
    pub state: Vec<StateValue>,
    pub version: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct EntityUpdateAction {
    pub key: EntityKey,
    pub handle: EntityHandle,
    pub persister: Arc<EntityPersister>,
    pub state: Vec<StateValue>,
    pub dirty: Vec<usize>,
    pub previous_version: Option<Value>,
    pub next_version: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct EntityDeleteAction {
    pub key: EntityKey,
    pub persister: Arc<EntityPersister>,
    pub version: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct CollectionRemoveAction {
    pub key: CollectionKey,
    pub persister: Arc<CollectionPersister>,
}

#[derive(Debug)]
pub(crate) struct CollectionUpdateAction {
    pub key: CollectionKey,
    pub persister: Arc<CollectionPersister>,
    pub removed: Vec<Element>,
    pub added: Vec<Element>,
}

#[derive(Debug)]
pub(crate) struct CollectionRecreateAction {
    pub key: CollectionKey,
    pub persister: Arc<CollectionPersister>,
    pub elements: Vec<Element>,
}

/// Pending work of one flush.
///
/// Executed as: inserts, updates, collection removals, collection updates,
/// collection recreates, deletes.
#[derive(Debug, Default)]
pub(crate) struct ActionQueue {
    pub insertions: Vec<EntityInsertAction>,
    pub updates: Vec<EntityUpdateAction>,
    pub collection_removals: Vec<CollectionRemoveAction>,
    pub collection_updates: Vec<CollectionUpdateAction>,
    pub collection_creations: Vec<CollectionRecreateAction>,
    pub deletions: Vec<EntityDeleteAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty()
            && self.updates.is_empty()
            && self.collection_removals.is_empty()
            && self.collection_updates.is_empty()
            && self.collection_creations.is_empty()
            && self.deletions.is_empty()
    }

    pub fn has_deletion(&self, key: &EntityKey) -> bool {
        self.deletions.iter().any(|d| &d.key == key)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Second-level cache work deferred until the transaction completes.
#[derive(Debug)]
pub(crate) enum CacheCompletion {
    Insert {
        access: Arc<dyn DomainDataAccess>,
        key: CacheKey,
        value: CacheValue,
        version: Option<Value>,
    },
    Update {
        access: Arc<dyn DomainDataAccess>,
        key: CacheKey,
        value: CacheValue,
        current_version: Option<Value>,
        previous_version: Option<Value>,
        lock: Option<SoftLock>,
    },
    Unlock {
        access: Arc<dyn DomainDataAccess>,
        key: CacheKey,
        lock: Option<SoftLock>,
    },
}

impl CacheCompletion {
    pub fn run(self, successful: bool) -> Result<()> {
        match self {
            CacheCompletion::Insert {
                access,
                key,
                value,
                version,
            } => {
                if successful {
                    access.after_insert(&key, &value, version.as_ref())?;
                } else {
                    access.evict(&key)?;
                }
            }
            CacheCompletion::Update {
                access,
                key,
                value,
                current_version,
                previous_version,
                lock,
            } => {
                if successful {
                    access.after_update(
                        &key,
                        &value,
                        current_version.as_ref(),
                        previous_version.as_ref(),
                        lock.as_ref(),
                    )?;
                } else {
                    access.unlock_item(&key, lock.as_ref())?;
                }
            }
            CacheCompletion::Unlock { access, key, lock } => access.unlock_item(&key, lock.as_ref())?,
        }
        Ok(())
    }
}

/// Run every completion; the first failure is reported after all have run.
pub(crate) fn run_completions(completions: Vec<CacheCompletion>, successful: bool) -> Result<()> {
    let mut first_error = None;
    for completion in completions {
        if let Err(err) = completion.run(successful) {
            warn!("Cache completion failed: {}", err);
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}
