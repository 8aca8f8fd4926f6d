// ============================================================================
// Managed object model: entity instances, proxies and persistent collections
// ============================================================================

use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use crate::core::{OrmError, Result, Value};
use crate::id::{EntityKey, Identifier};
use crate::persister::AccessorTable;

/// Value held in one attribute slot of an entity.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Basic(Value),
    Component(Vec<AttributeValue>),
    ToOne(Option<EntityHandle>),
    /// Inverse side of a bidirectional pair; never owns its target
    BackReference(Option<WeakEntityHandle>),
    Collection(CollectionHandle),
}

/// Detached, comparable form of an attribute value used for snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Basic(Value),
    Component(Vec<StateValue>),
    Reference(Option<Identifier>),
    Collection,
}

impl StateValue {
    /// Column values this state occupies, in column order.
    pub fn flatten_into(&self, out: &mut Vec<Value>) {
        match self {
            StateValue::Basic(v) => out.push(v.clone()),
            StateValue::Component(parts) => parts.iter().for_each(|p| p.flatten_into(out)),
            StateValue::Reference(Some(id)) => out.extend(id.values()),
            StateValue::Reference(None) | StateValue::Collection => {}
        }
    }
}

/// Identifier holder of an uninitialized proxy.
#[derive(Debug, Clone)]
pub struct LazyInitializer {
    pub identifier: Identifier,
    pub initialized: bool,
}

pub struct EntityInstance {
    entity_name: String,
    accessors: Arc<AccessorTable>,
    identifier: Option<Identifier>,
    version: Option<Value>,
    attributes: Vec<AttributeValue>,
    lazy: Option<LazyInitializer>,
}

impl EntityInstance {
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn attributes(&self) -> &[AttributeValue] {
        &self.attributes
    }

    fn check_initialized(&self) -> Result<()> {
        match &self.lazy {
            Some(lazy) if !lazy.initialized => Err(OrmError::LazyInitialization(format!(
                "could not initialize proxy [{}#{}] - access it through its session",
                self.entity_name, lazy.identifier
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityInstance")
            .field("entity", &self.entity_name)
            .field("identifier", &self.identifier)
            .field("version", &self.version)
            .field("proxy", &self.lazy.is_some())
            .finish()
    }
}

/// Shared reference to a managed or transient entity instance.
#[derive(Clone)]
pub struct EntityHandle(Arc<RwLock<EntityInstance>>);

#[derive(Clone)]
pub struct WeakEntityHandle(Weak<RwLock<EntityInstance>>);

impl WeakEntityHandle {
    pub fn upgrade(&self) -> Option<EntityHandle> {
        self.0.upgrade().map(EntityHandle)
    }
}

impl fmt::Debug for WeakEntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakEntityHandle")
    }
}

impl EntityHandle {
    /// Fresh, fully initialized instance with default attribute values.
    pub fn new(entity_name: &str, accessors: Arc<AccessorTable>) -> Self {
        let attributes = accessors.instantiate_attributes();
        EntityHandle(Arc::new(RwLock::new(EntityInstance {
            entity_name: entity_name.to_string(),
            accessors,
            identifier: None,
            version: None,
            attributes,
            lazy: None,
        })))
    }

    /// Uninitialized instance standing in for the row identified by `identifier`.
    pub fn proxy(entity_name: &str, accessors: Arc<AccessorTable>, identifier: Identifier) -> Self {
        let attributes = accessors.instantiate_attributes();
        EntityHandle(Arc::new(RwLock::new(EntityInstance {
            entity_name: entity_name.to_string(),
            accessors,
            identifier: None,
            version: None,
            attributes,
            lazy: Some(LazyInitializer {
                identifier,
                initialized: false,
            }),
        })))
    }

    pub fn downgrade(&self) -> WeakEntityHandle {
        WeakEntityHandle(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &EntityHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn entity_name(&self) -> Result<String> {
        Ok(self.0.read()?.entity_name.clone())
    }

    /// Identifier without triggering initialization of a proxy.
    pub fn identifier(&self) -> Result<Option<Identifier>> {
        let instance = self.0.read()?;
        Ok(match &instance.lazy {
            Some(lazy) => Some(lazy.identifier.clone()),
            None => instance.identifier.clone(),
        })
    }

    pub fn set_identifier(&self, identifier: Option<Identifier>) -> Result<()> {
        let mut instance = self.0.write()?;
        if let (Some(lazy), Some(id)) = (instance.lazy.as_mut(), identifier.as_ref()) {
            lazy.identifier = id.clone();
        }
        instance.identifier = identifier;
        Ok(())
    }

    pub fn entity_key(&self) -> Result<Option<EntityKey>> {
        let name = self.entity_name()?;
        Ok(self.identifier()?.map(|id| EntityKey::new(name, id)))
    }

    pub fn version(&self) -> Result<Option<Value>> {
        Ok(self.0.read()?.version.clone())
    }

    pub fn set_version(&self, version: Option<Value>) -> Result<()> {
        self.0.write()?.version = version;
        Ok(())
    }

    pub fn is_proxy(&self) -> Result<bool> {
        Ok(self.0.read()?.lazy.is_some())
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.0.read()?.lazy.as_ref().is_none_or(|lazy| lazy.initialized))
    }

    /// Basic value at a property path such as `status` or `address.city`.
    pub fn get(&self, path: &str) -> Result<Value> {
        let instance = self.0.read()?;
        instance.check_initialized()?;
        let accessor = instance.accessors.accessor(path)?;
        match accessor.get(&instance.attributes)? {
            AttributeValue::Basic(value) => Ok(value.clone()),
            other => Err(OrmError::IllegalState(format!(
                "Property '{}' of {} is not a basic value ({})",
                path,
                instance.entity_name,
                kind_name(other)
            ))),
        }
    }

    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let mut guard = self.0.write()?;
        let instance = &mut *guard;
        instance.check_initialized()?;
        let accessor = instance.accessors.accessor(path)?;
        match accessor.get_mut(&mut instance.attributes)? {
            AttributeValue::Basic(slot) => {
                *slot = value.into();
                Ok(())
            }
            other => Err(OrmError::IllegalState(format!(
                "Property '{}' is not a basic value ({})",
                path,
                kind_name(other)
            ))),
        }
    }

    /// Target of a to-one association; `None` when unset or when a back-reference target is gone.
    pub fn reference(&self, path: &str) -> Result<Option<EntityHandle>> {
        let instance = self.0.read()?;
        instance.check_initialized()?;
        match instance.accessors.accessor(path)?.get(&instance.attributes)? {
            AttributeValue::ToOne(target) => Ok(target.clone()),
            AttributeValue::BackReference(target) => Ok(target.as_ref().and_then(WeakEntityHandle::upgrade)),
            other => Err(OrmError::IllegalState(format!(
                "Property '{}' is not a to-one association ({})",
                path,
                kind_name(other)
            ))),
        }
    }

    pub fn set_reference(&self, path: &str, target: Option<&EntityHandle>) -> Result<()> {
        let mut guard = self.0.write()?;
        let instance = &mut *guard;
        instance.check_initialized()?;
        let accessor = instance.accessors.accessor(path)?;
        match accessor.get_mut(&mut instance.attributes)? {
            AttributeValue::ToOne(slot) => *slot = target.cloned(),
            AttributeValue::BackReference(slot) => *slot = target.map(EntityHandle::downgrade),
            other => {
                return Err(OrmError::IllegalState(format!(
                    "Property '{}' is not a to-one association ({})",
                    path,
                    kind_name(other)
                )));
            }
        }
        Ok(())
    }

    pub fn collection(&self, path: &str) -> Result<CollectionHandle> {
        let instance = self.0.read()?;
        instance.check_initialized()?;
        match instance.accessors.accessor(path)?.get(&instance.attributes)? {
            AttributeValue::Collection(handle) => Ok(handle.clone()),
            other => Err(OrmError::IllegalState(format!(
                "Property '{}' is not a collection ({})",
                path,
                kind_name(other)
            ))),
        }
    }

    /// Attribute slots in declaration order, cloned out of the lock.
    pub fn attribute_values(&self) -> Result<Vec<AttributeValue>> {
        let instance = self.0.read()?;
        instance.check_initialized()?;
        Ok(instance.attributes.clone())
    }

    pub(crate) fn attribute_values_unchecked(&self) -> Result<Vec<AttributeValue>> {
        Ok(self.0.read()?.attributes.clone())
    }

    /// Snapshot of the current state, comparable with a loaded state.
    pub fn state(&self) -> Result<Vec<StateValue>> {
        let attributes = self.attribute_values()?;
        attributes.iter().map(to_state).collect()
    }

    /// Install hydrated state and mark a proxy initialized.
    pub(crate) fn hydrate(&self, attributes: Vec<AttributeValue>, version: Option<Value>) -> Result<()> {
        let mut instance = self.0.write()?;
        instance.attributes = attributes;
        instance.version = version;
        if let Some(lazy) = instance.lazy.as_mut() {
            lazy.initialized = true;
            let id = lazy.identifier.clone();
            instance.identifier = Some(id);
        }
        Ok(())
    }

    pub(crate) fn accessors(&self) -> Result<Arc<AccessorTable>> {
        Ok(self.0.read()?.accessors.clone())
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(instance) => fmt::Debug::fmt(&*instance, f),
            Err(_) => f.write_str("EntityHandle(<locked>)"),
        }
    }
}

fn kind_name(value: &AttributeValue) -> &'static str {
    match value {
        AttributeValue::Basic(_) => "basic",
        AttributeValue::Component(_) => "component",
        AttributeValue::ToOne(_) => "to-one",
        AttributeValue::BackReference(_) => "back-reference",
        AttributeValue::Collection(_) => "collection",
    }
}

pub(crate) fn to_state(value: &AttributeValue) -> Result<StateValue> {
    Ok(match value {
        AttributeValue::Basic(v) => StateValue::Basic(v.clone()),
        AttributeValue::Component(parts) => StateValue::Component(parts.iter().map(to_state).collect::<Result<_>>()?),
        AttributeValue::ToOne(target) => StateValue::Reference(match target {
            Some(handle) => handle.identifier()?,
            None => None,
        }),
        AttributeValue::BackReference(target) => StateValue::Reference(match target.as_ref().and_then(WeakEntityHandle::upgrade) {
            Some(handle) => handle.identifier()?,
            None => None,
        }),
        AttributeValue::Collection(_) => StateValue::Collection,
    })
}

/// Element of a persistent collection.
#[derive(Debug, Clone)]
pub enum Element {
    Entity(EntityHandle),
    Value(Value),
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Element::Entity(a), Element::Entity(b)) => a.ptr_eq(b),
            (Element::Value(a), Element::Value(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct PersistentCollection {
    role: String,
    key: Option<Identifier>,
    elements: Vec<Element>,
    initialized: bool,
    dirty: bool,
}

/// Shared reference to a persistent collection wrapper.
#[derive(Clone)]
pub struct CollectionHandle(Arc<RwLock<PersistentCollection>>);

impl CollectionHandle {
    /// Empty, initialized collection of a transient owner.
    pub fn new(role: &str) -> Self {
        CollectionHandle(Arc::new(RwLock::new(PersistentCollection {
            role: role.to_string(),
            key: None,
            elements: Vec::new(),
            initialized: true,
            dirty: false,
        })))
    }

    /// Collection of a loaded owner, populated later.
    pub fn uninitialized(role: &str, key: Identifier) -> Self {
        CollectionHandle(Arc::new(RwLock::new(PersistentCollection {
            role: role.to_string(),
            key: Some(key),
            elements: Vec::new(),
            initialized: false,
            dirty: false,
        })))
    }

    pub fn ptr_eq(&self, other: &CollectionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn role(&self) -> Result<String> {
        Ok(self.0.read()?.role.clone())
    }

    pub fn key(&self) -> Result<Option<Identifier>> {
        Ok(self.0.read()?.key.clone())
    }

    pub(crate) fn set_key(&self, key: Option<Identifier>) -> Result<()> {
        self.0.write()?.key = key;
        Ok(())
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.0.read()?.initialized)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        Ok(self.0.read()?.dirty)
    }

    pub(crate) fn clear_dirty(&self) -> Result<()> {
        self.0.write()?.dirty = false;
        Ok(())
    }

    fn initialized_read(&self) -> Result<std::sync::RwLockReadGuard<'_, PersistentCollection>> {
        let collection = self.0.read()?;
        if !collection.initialized {
            return Err(OrmError::LazyInitialization(format!(
                "failed to lazily initialize a collection of role {} - access it through its session",
                collection.role
            )));
        }
        Ok(collection)
    }

    fn initialized_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, PersistentCollection>> {
        let collection = self.0.write()?;
        if !collection.initialized {
            return Err(OrmError::LazyInitialization(format!(
                "failed to lazily initialize a collection of role {} - access it through its session",
                collection.role
            )));
        }
        Ok(collection)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.initialized_read()?.elements.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn elements(&self) -> Result<Vec<Element>> {
        Ok(self.initialized_read()?.elements.clone())
    }

    pub fn entities(&self) -> Result<Vec<EntityHandle>> {
        Ok(self
            .initialized_read()?
            .elements
            .iter()
            .filter_map(|e| match e {
                Element::Entity(handle) => Some(handle.clone()),
                Element::Value(_) => None,
            })
            .collect())
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        Ok(self
            .initialized_read()?
            .elements
            .iter()
            .filter_map(|e| match e {
                Element::Value(v) => Some(v.clone()),
                Element::Entity(_) => None,
            })
            .collect())
    }

    pub fn add(&self, element: Element) -> Result<()> {
        let mut collection = self.initialized_write()?;
        collection.elements.push(element);
        collection.dirty = true;
        Ok(())
    }

    pub fn add_entity(&self, entity: &EntityHandle) -> Result<()> {
        self.add(Element::Entity(entity.clone()))
    }

    pub fn add_value(&self, value: impl Into<Value>) -> Result<()> {
        self.add(Element::Value(value.into()))
    }

    /// Remove the first occurrence; returns whether anything was removed.
    pub fn remove(&self, element: &Element) -> Result<bool> {
        let mut collection = self.initialized_write()?;
        match collection.elements.iter().position(|e| e == element) {
            Some(index) => {
                collection.elements.remove(index);
                collection.dirty = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_entity(&self, entity: &EntityHandle) -> Result<bool> {
        self.remove(&Element::Entity(entity.clone()))
    }

    pub fn clear(&self) -> Result<()> {
        let mut collection = self.initialized_write()?;
        if !collection.elements.is_empty() {
            collection.elements.clear();
            collection.dirty = true;
        }
        Ok(())
    }

    /// Append loaded elements without marking the collection dirty.
    pub(crate) fn push_loaded(&self, element: Element) -> Result<()> {
        self.0.write()?.elements.push(element);
        Ok(())
    }

    pub(crate) fn contains_loaded(&self, element: &Element) -> Result<bool> {
        Ok(self.0.read()?.elements.contains(element))
    }

    pub(crate) fn begin_load(&self) -> Result<()> {
        let mut collection = self.0.write()?;
        collection.elements.clear();
        collection.initialized = false;
        Ok(())
    }

    pub(crate) fn finish_load(&self) -> Result<()> {
        let mut collection = self.0.write()?;
        collection.initialized = true;
        collection.dirty = false;
        Ok(())
    }

    pub(crate) fn elements_unchecked(&self) -> Result<Vec<Element>> {
        Ok(self.0.read()?.elements.clone())
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(c) => write!(
                f,
                "Collection({}, {} element(s), initialized: {})",
                c.role,
                c.elements.len(),
                c.initialized
            ),
            Err(_) => f.write_str("Collection(<locked>)"),
        }
    }
}
