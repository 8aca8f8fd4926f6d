use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::debug;
use lru::LruCache;

use crate::core::{Result, Value};

use super::access::SoftLock;
use super::{CacheKey, CacheValue};

/// Counter bits below the millisecond part of a timestamp.
const TIMESTAMP_SHIFT: u32 = 12;

/// Stored state for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEntry {
    Item(CachedItem),
    Lock(SoftLock),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedItem {
    pub value: CacheValue,
    pub version: Option<Value>,
    pub timestamp: i64,
}

/// Bounded storage of one region.
#[derive(Debug)]
pub struct DomainDataStorage {
    name: String,
    entries: Mutex<LruCache<CacheKey, StorageEntry>>,
}

impl DomainDataStorage {
    pub fn new(name: &str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.to_string(),
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<StorageEntry>> {
        Ok(self.entries.lock()?.get(key).cloned())
    }

    pub fn put(&self, key: CacheKey, entry: StorageEntry) -> Result<()> {
        self.entries.lock()?.put(key, entry);
        Ok(())
    }

    pub fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entries.lock()?.contains(key))
    }

    pub fn evict(&self, key: &CacheKey) -> Result<()> {
        self.entries.lock()?.pop(key);
        Ok(())
    }

    pub fn evict_all(&self) -> Result<()> {
        self.entries.lock()?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Builds regions and issues cache timestamps for one session factory.
#[derive(Debug)]
pub struct RegionFactory {
    region_size: usize,
    lock_timeout: Duration,
    regions: Mutex<HashMap<String, Arc<DomainDataStorage>>>,
    last_timestamp: AtomicI64,
}

impl RegionFactory {
    pub fn new(region_size: usize, lock_timeout: Duration) -> Self {
        Self {
            region_size,
            lock_timeout,
            regions: Mutex::new(HashMap::new()),
            last_timestamp: AtomicI64::new(0),
        }
    }

    /// Storage for `name`, created on first use.
    pub fn build_region(&self, name: &str) -> Result<Arc<DomainDataStorage>> {
        let mut regions = self.regions.lock()?;
        let region = regions.entry(name.to_string()).or_insert_with(|| {
            debug!("Building cache region '{}' ({} entries)", name, self.region_size);
            Arc::new(DomainDataStorage::new(name, self.region_size))
        });
        Ok(Arc::clone(region))
    }

    pub fn region(&self, name: &str) -> Result<Option<Arc<DomainDataStorage>>> {
        Ok(self.regions.lock()?.get(name).cloned())
    }

    /// Milliseconds shifted left with a counter in the low bits;
    /// strictly increasing across calls.
    pub fn next_timestamp(&self) -> i64 {
        let base = Utc::now().timestamp_millis() << TIMESTAMP_SHIFT;
        let mut current = self.last_timestamp.load(Ordering::Acquire);
        loop {
            let next = if base > current { base } else { current + 1 };
            match self
                .last_timestamp
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Soft-lock timeout in timestamp units.
    pub fn lock_timeout(&self) -> i64 {
        (self.lock_timeout.as_millis() as i64) << TIMESTAMP_SHIFT
    }

    pub fn evict_all(&self) -> Result<()> {
        for region in self.regions.lock()?.values() {
            region.evict_all()?;
        }
        Ok(())
    }
}

/// Millisecond part of a cache timestamp.
pub fn timestamp_millis(timestamp: i64) -> i64 {
    timestamp >> TIMESTAMP_SHIFT
}
