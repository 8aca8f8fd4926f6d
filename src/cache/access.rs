use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use uuid::Uuid;

use crate::core::{OrmError, Result, Value};

use super::region::{CachedItem, DomainDataStorage, RegionFactory, StorageEntry};
use super::{AccessType, CacheKey, CacheValue};

/// Lock entry standing in for an item while a write is in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftLock {
    source: Uuid,
    lock_id: u64,
    timeout: i64,
    version: Option<Value>,
    unlock_timestamp: i64,
    concurrent: bool,
    multiplicity: u32,
}

impl SoftLock {
    fn new(timeout: i64, source: Uuid, lock_id: u64, version: Option<Value>) -> Self {
        Self {
            source,
            lock_id,
            timeout,
            version,
            unlock_timestamp: -1,
            concurrent: false,
            multiplicity: 1,
        }
    }

    /// Same lock as `other`: same issuing access and lock id.
    pub fn matches(&self, other: &SoftLock) -> bool {
        self.source == other.source && self.lock_id == other.lock_id
    }

    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    pub fn was_locked_concurrently(&self) -> bool {
        self.concurrent
    }

    fn relock(&mut self, timeout: i64) {
        self.concurrent = true;
        self.multiplicity += 1;
        self.timeout = timeout;
    }

    fn unlock(&mut self, timestamp: i64) {
        self.multiplicity = self.multiplicity.saturating_sub(1);
        if self.multiplicity == 0 {
            self.unlock_timestamp = timestamp;
        }
    }

    fn is_writeable(&self, tx_timestamp: i64, new_version: Option<&Value>) -> bool {
        if tx_timestamp > self.timeout {
            return true;
        }
        if self.multiplicity > 0 {
            return false;
        }
        match (&self.version, new_version) {
            (Some(current), Some(new)) => is_older(current, new),
            _ => tx_timestamp > self.unlock_timestamp,
        }
    }
}

fn is_older(current: &Value, new: &Value) -> bool {
    matches!(current.compare(new), Ok(CmpOrdering::Less))
}

impl CachedItem {
    fn is_readable(&self, tx_timestamp: i64) -> bool {
        tx_timestamp > self.timestamp
    }

    fn is_writeable(&self, new_version: Option<&Value>) -> bool {
        match (&self.version, new_version) {
            (Some(current), Some(new)) => is_older(current, new),
            _ => false,
        }
    }
}

/// Cache access for one entity or collection region.
///
/// The write protocol mirrors a transaction: `insert`/`update`/`lock_item`
/// run while flushing, `after_insert`/`after_update`/`unlock_item` after the
/// transaction completes.
pub trait DomainDataAccess: Send + Sync + fmt::Debug {
    fn access_type(&self) -> AccessType;

    fn storage(&self) -> &Arc<DomainDataStorage>;

    /// Cached value visible to a transaction that started at `tx_timestamp`.
    fn get(&self, key: &CacheKey, tx_timestamp: i64) -> Result<Option<CacheValue>>;

    /// Offer a freshly loaded value. `minimal_put` skips the write when an entry exists.
    fn put_from_load(
        &self,
        key: CacheKey,
        value: CacheValue,
        tx_timestamp: i64,
        version: Option<&Value>,
        minimal_put: bool,
    ) -> Result<bool>;

    fn lock_item(&self, key: &CacheKey, version: Option<&Value>) -> Result<Option<SoftLock>>;

    fn unlock_item(&self, key: &CacheKey, lock: Option<&SoftLock>) -> Result<()>;

    fn insert(&self, key: &CacheKey, value: &CacheValue, version: Option<&Value>) -> Result<bool>;

    fn after_insert(&self, key: &CacheKey, value: &CacheValue, version: Option<&Value>) -> Result<bool>;

    fn update(
        &self,
        key: &CacheKey,
        value: &CacheValue,
        current_version: Option<&Value>,
        previous_version: Option<&Value>,
    ) -> Result<bool>;

    fn after_update(
        &self,
        key: &CacheKey,
        value: &CacheValue,
        current_version: Option<&Value>,
        previous_version: Option<&Value>,
        lock: Option<&SoftLock>,
    ) -> Result<bool>;

    fn remove(&self, key: &CacheKey) -> Result<()>;

    fn evict(&self, key: &CacheKey) -> Result<()> {
        self.storage().evict(key)
    }

    fn evict_all(&self) -> Result<()> {
        self.storage().evict_all()
    }
}

/// Build the access strategy for `access_type` over a region.
pub fn build_access(
    access_type: AccessType,
    storage: Arc<DomainDataStorage>,
    factory: Arc<RegionFactory>,
) -> Arc<dyn DomainDataAccess> {
    match access_type {
        AccessType::ReadOnly => Arc::new(ReadOnlyAccess::new(storage, factory)),
        AccessType::ReadWrite => Arc::new(ReadWriteAccess::new(storage, factory)),
        AccessType::NonstrictReadWrite => Arc::new(NonstrictReadWriteAccess::new(storage, factory)),
        AccessType::Transactional => Arc::new(TransactionalAccess::new(storage, factory)),
    }
}

fn item_value(entry: Option<StorageEntry>) -> Option<CacheValue> {
    match entry {
        Some(StorageEntry::Item(item)) => Some(item.value),
        _ => None,
    }
}

fn put_item(
    storage: &DomainDataStorage,
    factory: &RegionFactory,
    key: CacheKey,
    value: CacheValue,
    version: Option<&Value>,
) -> Result<()> {
    storage.put(
        key,
        StorageEntry::Item(CachedItem {
            value,
            version: version.cloned(),
            timestamp: factory.next_timestamp(),
        }),
    )
}

fn minimal_put_skipped(storage: &DomainDataStorage, key: &CacheKey, minimal_put: bool) -> Result<bool> {
    if minimal_put && storage.contains(key)? {
        trace!("Item already cached: {}", key);
        return Ok(true);
    }
    Ok(false)
}

// ============================================================================
// read-only
// ============================================================================

#[derive(Debug)]
pub struct ReadOnlyAccess {
    storage: Arc<DomainDataStorage>,
    factory: Arc<RegionFactory>,
}

impl ReadOnlyAccess {
    pub fn new(storage: Arc<DomainDataStorage>, factory: Arc<RegionFactory>) -> Self {
        Self { storage, factory }
    }
}

impl DomainDataAccess for ReadOnlyAccess {
    fn access_type(&self) -> AccessType {
        AccessType::ReadOnly
    }

    fn storage(&self) -> &Arc<DomainDataStorage> {
        &self.storage
    }

    fn get(&self, key: &CacheKey, _tx_timestamp: i64) -> Result<Option<CacheValue>> {
        Ok(item_value(self.storage.get(key)?))
    }

    fn put_from_load(
        &self,
        key: CacheKey,
        value: CacheValue,
        _tx_timestamp: i64,
        version: Option<&Value>,
        minimal_put: bool,
    ) -> Result<bool> {
        if minimal_put_skipped(&self.storage, &key, minimal_put)? {
            return Ok(false);
        }
        put_item(&self.storage, &self.factory, key, value, version)?;
        Ok(true)
    }

    fn lock_item(&self, _key: &CacheKey, _version: Option<&Value>) -> Result<Option<SoftLock>> {
        Ok(None)
    }

    fn unlock_item(&self, key: &CacheKey, _lock: Option<&SoftLock>) -> Result<()> {
        self.storage.evict(key)
    }

    fn insert(&self, _key: &CacheKey, _value: &CacheValue, _version: Option<&Value>) -> Result<bool> {
        Ok(false)
    }

    fn after_insert(&self, key: &CacheKey, value: &CacheValue, version: Option<&Value>) -> Result<bool> {
        put_item(&self.storage, &self.factory, key.clone(), value.clone(), version)?;
        Ok(true)
    }

    fn update(
        &self,
        key: &CacheKey,
        _value: &CacheValue,
        _current_version: Option<&Value>,
        _previous_version: Option<&Value>,
    ) -> Result<bool> {
        Err(OrmError::UnsupportedOperation(format!("Can't update read-only cached object {}", key)))
    }

    fn after_update(
        &self,
        key: &CacheKey,
        _value: &CacheValue,
        _current_version: Option<&Value>,
        _previous_version: Option<&Value>,
        _lock: Option<&SoftLock>,
    ) -> Result<bool> {
        Err(OrmError::UnsupportedOperation(format!("Can't update read-only cached object {}", key)))
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        self.storage.evict(key)
    }
}

// ============================================================================
// read-write
// ============================================================================

/// Soft-locking access: a written key is replaced by a lock entry until the
/// transaction completes, so no session reads a value that may be stale.
///
/// Every read-modify-write of an entry runs under the write side of
/// `entry_lock`; reads take the read side.
#[derive(Debug)]
pub struct ReadWriteAccess {
    storage: Arc<DomainDataStorage>,
    factory: Arc<RegionFactory>,
    source: Uuid,
    next_lock_id: AtomicU64,
    entry_lock: RwLock<()>,
}

impl ReadWriteAccess {
    pub fn new(storage: Arc<DomainDataStorage>, factory: Arc<RegionFactory>) -> Self {
        Self {
            storage,
            factory,
            source: Uuid::new_v4(),
            next_lock_id: AtomicU64::new(0),
            entry_lock: RwLock::new(()),
        }
    }

    fn next_lock_id(&self) -> u64 {
        self.next_lock_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_unlockable(entry: &Option<StorageEntry>, lock: Option<&SoftLock>) -> bool {
        match (entry, lock) {
            (Some(StorageEntry::Lock(current)), Some(lock)) => current.matches(lock),
            _ => false,
        }
    }

    fn decrement_lock(&self, key: &CacheKey, mut lock: SoftLock) -> Result<()> {
        lock.unlock(self.factory.next_timestamp());
        self.storage.put(key.clone(), StorageEntry::Lock(lock))
    }

    /// The lock expired or was replaced: keep the key unreadable until a
    /// fresh timeout passes.
    fn handle_lock_expiry(&self, key: &CacheKey) -> Result<()> {
        debug!("Cache lock expired for {}; blocking the key until timeout", key);
        let timestamp = self.factory.next_timestamp() + self.factory.lock_timeout();
        let mut lock = SoftLock::new(timestamp, self.source, self.next_lock_id(), None);
        lock.unlock(timestamp);
        self.storage.put(key.clone(), StorageEntry::Lock(lock))
    }
}

impl DomainDataAccess for ReadWriteAccess {
    fn access_type(&self) -> AccessType {
        AccessType::ReadWrite
    }

    fn storage(&self) -> &Arc<DomainDataStorage> {
        &self.storage
    }

    fn get(&self, key: &CacheKey, tx_timestamp: i64) -> Result<Option<CacheValue>> {
        let _read = self.entry_lock.read()?;
        match self.storage.get(key)? {
            Some(StorageEntry::Item(item)) if item.is_readable(tx_timestamp) => Ok(Some(item.value)),
            Some(_) => {
                trace!("Cached item {} is locked or newer than the transaction", key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put_from_load(
        &self,
        key: CacheKey,
        value: CacheValue,
        tx_timestamp: i64,
        version: Option<&Value>,
        minimal_put: bool,
    ) -> Result<bool> {
        let _write = self.entry_lock.write()?;
        if minimal_put_skipped(&self.storage, &key, minimal_put)? {
            return Ok(false);
        }
        let writeable = match self.storage.get(&key)? {
            None => true,
            Some(StorageEntry::Item(item)) => item.is_writeable(version),
            Some(StorageEntry::Lock(lock)) => lock.is_writeable(tx_timestamp, version),
        };
        if !writeable {
            trace!("Cached item {} was not writeable", key);
            return Ok(false);
        }
        put_item(&self.storage, &self.factory, key, value, version)?;
        Ok(true)
    }

    fn lock_item(&self, key: &CacheKey, version: Option<&Value>) -> Result<Option<SoftLock>> {
        let _write = self.entry_lock.write()?;
        let timeout = self.factory.next_timestamp() + self.factory.lock_timeout();
        let lock = match self.storage.get(key)? {
            Some(StorageEntry::Lock(mut existing)) => {
                existing.relock(timeout);
                existing
            }
            Some(StorageEntry::Item(item)) => {
                SoftLock::new(timeout, self.source, self.next_lock_id(), item.version.or_else(|| version.cloned()))
            }
            None => SoftLock::new(timeout, self.source, self.next_lock_id(), version.cloned()),
        };
        self.storage.put(key.clone(), StorageEntry::Lock(lock.clone()))?;
        Ok(Some(lock))
    }

    fn unlock_item(&self, key: &CacheKey, lock: Option<&SoftLock>) -> Result<()> {
        let _write = self.entry_lock.write()?;
        let entry = self.storage.get(key)?;
        if Self::is_unlockable(&entry, lock) {
            if let Some(StorageEntry::Lock(current)) = entry {
                return self.decrement_lock(key, current);
            }
        }
        self.handle_lock_expiry(key)
    }

    fn insert(&self, _key: &CacheKey, _value: &CacheValue, _version: Option<&Value>) -> Result<bool> {
        Ok(false)
    }

    fn after_insert(&self, key: &CacheKey, value: &CacheValue, version: Option<&Value>) -> Result<bool> {
        let _write = self.entry_lock.write()?;
        if self.storage.get(key)?.is_some() {
            return Ok(false);
        }
        put_item(&self.storage, &self.factory, key.clone(), value.clone(), version)?;
        Ok(true)
    }

    fn update(
        &self,
        _key: &CacheKey,
        _value: &CacheValue,
        _current_version: Option<&Value>,
        _previous_version: Option<&Value>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn after_update(
        &self,
        key: &CacheKey,
        value: &CacheValue,
        current_version: Option<&Value>,
        _previous_version: Option<&Value>,
        lock: Option<&SoftLock>,
    ) -> Result<bool> {
        let _write = self.entry_lock.write()?;
        let entry = self.storage.get(key)?;
        if !Self::is_unlockable(&entry, lock) {
            self.handle_lock_expiry(key)?;
            return Ok(false);
        }
        match entry {
            Some(StorageEntry::Lock(current)) if current.was_locked_concurrently() => {
                self.decrement_lock(key, current)?;
                Ok(false)
            }
            _ => {
                put_item(&self.storage, &self.factory, key.clone(), value.clone(), current_version)?;
                Ok(true)
            }
        }
    }

    fn remove(&self, _key: &CacheKey) -> Result<()> {
        // the soft lock taken before the delete covers it
        Ok(())
    }
}

// ============================================================================
// nonstrict-read-write
// ============================================================================

/// Invalidating access: writes evict, so readers may briefly see stale data.
#[derive(Debug)]
pub struct NonstrictReadWriteAccess {
    storage: Arc<DomainDataStorage>,
    factory: Arc<RegionFactory>,
}

impl NonstrictReadWriteAccess {
    pub fn new(storage: Arc<DomainDataStorage>, factory: Arc<RegionFactory>) -> Self {
        Self { storage, factory }
    }
}

impl DomainDataAccess for NonstrictReadWriteAccess {
    fn access_type(&self) -> AccessType {
        AccessType::NonstrictReadWrite
    }

    fn storage(&self) -> &Arc<DomainDataStorage> {
        &self.storage
    }

    fn get(&self, key: &CacheKey, _tx_timestamp: i64) -> Result<Option<CacheValue>> {
        Ok(item_value(self.storage.get(key)?))
    }

    fn put_from_load(
        &self,
        key: CacheKey,
        value: CacheValue,
        _tx_timestamp: i64,
        version: Option<&Value>,
        minimal_put: bool,
    ) -> Result<bool> {
        if minimal_put_skipped(&self.storage, &key, minimal_put)? {
            return Ok(false);
        }
        put_item(&self.storage, &self.factory, key, value, version)?;
        Ok(true)
    }

    fn lock_item(&self, _key: &CacheKey, _version: Option<&Value>) -> Result<Option<SoftLock>> {
        Ok(None)
    }

    fn unlock_item(&self, key: &CacheKey, _lock: Option<&SoftLock>) -> Result<()> {
        self.storage.evict(key)
    }

    fn insert(&self, _key: &CacheKey, _value: &CacheValue, _version: Option<&Value>) -> Result<bool> {
        Ok(false)
    }

    fn after_insert(&self, _key: &CacheKey, _value: &CacheValue, _version: Option<&Value>) -> Result<bool> {
        Ok(false)
    }

    fn update(
        &self,
        key: &CacheKey,
        _value: &CacheValue,
        _current_version: Option<&Value>,
        _previous_version: Option<&Value>,
    ) -> Result<bool> {
        self.storage.evict(key)?;
        Ok(false)
    }

    fn after_update(
        &self,
        key: &CacheKey,
        _value: &CacheValue,
        _current_version: Option<&Value>,
        _previous_version: Option<&Value>,
        lock: Option<&SoftLock>,
    ) -> Result<bool> {
        self.unlock_item(key, lock)?;
        Ok(false)
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        self.storage.evict(key)
    }
}

// ============================================================================
// transactional
// ============================================================================

/// Writes go straight to the region inside the transaction; the provider
/// is trusted to make them transactional.
#[derive(Debug)]
pub struct TransactionalAccess {
    storage: Arc<DomainDataStorage>,
    factory: Arc<RegionFactory>,
}

impl TransactionalAccess {
    pub fn new(storage: Arc<DomainDataStorage>, factory: Arc<RegionFactory>) -> Self {
        Self { storage, factory }
    }
}

impl DomainDataAccess for TransactionalAccess {
    fn access_type(&self) -> AccessType {
        AccessType::Transactional
    }

    fn storage(&self) -> &Arc<DomainDataStorage> {
        &self.storage
    }

    fn get(&self, key: &CacheKey, _tx_timestamp: i64) -> Result<Option<CacheValue>> {
        Ok(item_value(self.storage.get(key)?))
    }

    fn put_from_load(
        &self,
        key: CacheKey,
        value: CacheValue,
        _tx_timestamp: i64,
        version: Option<&Value>,
        minimal_put: bool,
    ) -> Result<bool> {
        if minimal_put_skipped(&self.storage, &key, minimal_put)? {
            return Ok(false);
        }
        put_item(&self.storage, &self.factory, key, value, version)?;
        Ok(true)
    }

    fn lock_item(&self, _key: &CacheKey, _version: Option<&Value>) -> Result<Option<SoftLock>> {
        Ok(None)
    }

    fn unlock_item(&self, _key: &CacheKey, _lock: Option<&SoftLock>) -> Result<()> {
        Ok(())
    }

    fn insert(&self, key: &CacheKey, value: &CacheValue, version: Option<&Value>) -> Result<bool> {
        put_item(&self.storage, &self.factory, key.clone(), value.clone(), version)?;
        Ok(true)
    }

    fn after_insert(&self, _key: &CacheKey, _value: &CacheValue, _version: Option<&Value>) -> Result<bool> {
        Ok(false)
    }

    fn update(
        &self,
        key: &CacheKey,
        value: &CacheValue,
        current_version: Option<&Value>,
        _previous_version: Option<&Value>,
    ) -> Result<bool> {
        put_item(&self.storage, &self.factory, key.clone(), value.clone(), current_version)?;
        Ok(true)
    }

    fn after_update(
        &self,
        _key: &CacheKey,
        _value: &CacheValue,
        _current_version: Option<&Value>,
        _previous_version: Option<&Value>,
        _lock: Option<&SoftLock>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        self.storage.evict(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCacheEntry;
    use crate::engine::StateValue;
    use std::time::Duration;

    fn entry(status: &str, version: i64) -> CacheValue {
        CacheValue::Entity(EntityCacheEntry {
            state: vec![StateValue::Basic(Value::Text(status.into()))],
            version: Some(Value::Integer(version)),
        })
    }

    fn access(access_type: AccessType) -> (Arc<RegionFactory>, Arc<dyn DomainDataAccess>) {
        let factory = Arc::new(RegionFactory::new(64, Duration::from_secs(60)));
        let storage = factory.build_region("Order").unwrap();
        let access = build_access(access_type, storage, Arc::clone(&factory));
        (factory, access)
    }

    #[test]
    fn test_read_write_soft_lock_blocks_reads() {
        let (factory, access) = access(AccessType::ReadWrite);
        let key = CacheKey::entity("Order", 1i64.into());
        let v0 = Value::Integer(0);
        let v1 = Value::Integer(1);

        let tx = factory.next_timestamp();
        assert!(access.put_from_load(key.clone(), entry("NEW", 0), tx, Some(&v0), false).unwrap());
        let reader = factory.next_timestamp();
        assert_eq!(access.get(&key, reader).unwrap(), Some(entry("NEW", 0)));
        // a transaction older than the put must not see it
        assert_eq!(access.get(&key, tx).unwrap(), None);

        let lock = access.lock_item(&key, Some(&v0)).unwrap();
        assert!(lock.is_some());
        assert!(!access.update(&key, &entry("PAID", 1), Some(&v1), Some(&v0)).unwrap());
        assert_eq!(access.get(&key, factory.next_timestamp()).unwrap(), None);
        // a concurrent load cannot overwrite a locked key
        assert!(!access
            .put_from_load(key.clone(), entry("NEW", 0), factory.next_timestamp(), Some(&v0), false)
            .unwrap());

        assert!(access
            .after_update(&key, &entry("PAID", 1), Some(&v1), Some(&v0), lock.as_ref())
            .unwrap());
        assert_eq!(access.get(&key, factory.next_timestamp()).unwrap(), Some(entry("PAID", 1)));
    }

    #[test]
    fn test_read_write_concurrent_lock_defers_update() {
        let (factory, access) = access(AccessType::ReadWrite);
        let key = CacheKey::entity("Order", 2i64.into());
        let v0 = Value::Integer(0);
        let v1 = Value::Integer(1);
        access
            .put_from_load(key.clone(), entry("NEW", 0), factory.next_timestamp(), Some(&v0), false)
            .unwrap();

        let first = access.lock_item(&key, Some(&v0)).unwrap();
        let second = access.lock_item(&key, Some(&v0)).unwrap();
        assert!(!access
            .after_update(&key, &entry("PAID", 1), Some(&v1), Some(&v0), first.as_ref())
            .unwrap());
        assert_eq!(access.get(&key, factory.next_timestamp()).unwrap(), None);
        access.unlock_item(&key, second.as_ref()).unwrap();
        assert!(matches!(access.storage().get(&key).unwrap(), Some(StorageEntry::Lock(_))));
        // a newer version may be loaded once every lock is released
        assert!(access
            .put_from_load(key.clone(), entry("PAID", 1), factory.next_timestamp(), Some(&v1), false)
            .unwrap());
    }

    #[test]
    fn test_read_write_lock_survives_concurrent_loads() {
        let (factory, access) = access(AccessType::ReadWrite);
        let key = CacheKey::entity("Order", 1i64.into());
        let v0 = Value::Integer(0);

        let loaders: Vec<_> = (0..4)
            .map(|_| {
                let (factory, access, key) = (Arc::clone(&factory), Arc::clone(&access), key.clone());
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let tx = factory.next_timestamp();
                        access
                            .put_from_load(key.clone(), entry("NEW", 0), tx, Some(&Value::Integer(0)), false)
                            .unwrap();
                    }
                })
            })
            .collect();
        let lock = access.lock_item(&key, Some(&v0)).unwrap().unwrap();
        for loader in loaders {
            loader.join().unwrap();
        }

        match access.storage().get(&key).unwrap() {
            Some(StorageEntry::Lock(current)) => assert!(current.matches(&lock)),
            other => panic!("stale load replaced the soft lock: {:?}", other),
        }
    }

    #[test]
    fn test_read_only_rejects_updates() {
        let (_factory, access) = access(AccessType::ReadOnly);
        let key = CacheKey::entity("Order", 3i64.into());
        assert!(access.after_insert(&key, &entry("NEW", 0), None).unwrap());
        let err = access.update(&key, &entry("PAID", 1), None, None).unwrap_err();
        assert!(matches!(err, OrmError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_nonstrict_update_invalidates() {
        let (factory, access) = access(AccessType::NonstrictReadWrite);
        let key = CacheKey::entity("Order", 4i64.into());
        access
            .put_from_load(key.clone(), entry("NEW", 0), factory.next_timestamp(), None, false)
            .unwrap();
        assert!(access.lock_item(&key, None).unwrap().is_none());
        access.update(&key, &entry("PAID", 1), None, None).unwrap();
        assert_eq!(access.get(&key, factory.next_timestamp()).unwrap(), None);
        assert!(access.put_from_load(key.clone(), entry("NEW", 0), 0, None, false).unwrap());
        assert!(!access.put_from_load(key.clone(), entry("NEW", 0), 0, None, true).unwrap());
    }

    #[test]
    fn test_transactional_writes_through() {
        let (factory, access) = access(AccessType::Transactional);
        let key = CacheKey::entity("Order", 5i64.into());
        assert!(access.insert(&key, &entry("NEW", 0), None).unwrap());
        assert!(access.update(&key, &entry("PAID", 1), None, None).unwrap());
        assert_eq!(access.get(&key, factory.next_timestamp()).unwrap(), Some(entry("PAID", 1)));
        access.remove(&key).unwrap();
        assert_eq!(access.get(&key, factory.next_timestamp()).unwrap(), None);
    }
}
