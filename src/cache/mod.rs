// ============================================================================
// Second-level cache: regions, entries and access strategies
// ============================================================================

pub mod access;
pub mod region;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Value;
use crate::engine::StateValue;
use crate::id::{CollectionKey, EntityKey, Identifier};

pub use access::{
    DomainDataAccess, NonstrictReadWriteAccess, ReadOnlyAccess, ReadWriteAccess, SoftLock, TransactionalAccess,
    build_access,
};
pub use region::{CachedItem, DomainDataStorage, RegionFactory, StorageEntry};

/// Concurrency discipline of a cache region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessType {
    ReadOnly,
    ReadWrite,
    NonstrictReadWrite,
    Transactional,
}

impl AccessType {
    pub fn name(&self) -> &'static str {
        match self {
            AccessType::ReadOnly => "read-only",
            AccessType::ReadWrite => "read-write",
            AccessType::NonstrictReadWrite => "nonstrict-read-write",
            AccessType::Transactional => "transactional",
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Entity(EntityKey),
    Collection(CollectionKey),
}

impl CacheKey {
    pub fn entity(entity: &str, id: Identifier) -> Self {
        CacheKey::Entity(EntityKey::new(entity, id))
    }

    pub fn collection(role: &str, owner: Identifier) -> Self {
        CacheKey::Collection(CollectionKey::new(role, owner))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Entity(key) => write!(f, "{}", key),
            CacheKey::Collection(key) => write!(f, "{}", key),
        }
    }
}

/// Disassembled entity state; references are kept as identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCacheEntry {
    pub state: Vec<StateValue>,
    pub version: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedElement {
    Entity(Identifier),
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionCacheEntry {
    pub elements: Vec<CachedElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Entity(EntityCacheEntry),
    Collection(CollectionCacheEntry),
}
