use indexmap::IndexMap;

use crate::core::{OrmError, Result, Value};
use crate::engine::{AttributeValue, CollectionHandle};

use super::{AttributeDefinition, AttributeKind};

/// Shape of one attribute slot, used to instantiate fresh state.
#[derive(Debug, Clone, PartialEq)]
enum SlotTemplate {
    Basic,
    Component(Vec<SlotTemplate>),
    ToOne,
    BackReference,
    Collection { role: String },
}

/// Getter/setter pair for one property path, resolved to slot indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct Accessor {
    path: String,
    slots: Vec<usize>,
}

impl Accessor {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Top-level attribute index.
    pub fn attribute_index(&self) -> usize {
        self.slots[0]
    }

    pub fn get<'a>(&self, attributes: &'a [AttributeValue]) -> Result<&'a AttributeValue> {
        let mut current = attributes
            .get(self.slots[0])
            .ok_or_else(|| self.broken())?;
        for &slot in &self.slots[1..] {
            current = match current {
                AttributeValue::Component(parts) => parts.get(slot).ok_or_else(|| self.broken())?,
                _ => return Err(self.broken()),
            };
        }
        Ok(current)
    }

    pub fn get_mut<'a>(&self, attributes: &'a mut [AttributeValue]) -> Result<&'a mut AttributeValue> {
        let mut current = attributes
            .get_mut(self.slots[0])
            .ok_or_else(|| self.broken())?;
        for &slot in &self.slots[1..] {
            current = match current {
                AttributeValue::Component(parts) => parts.get_mut(slot).ok_or_else(|| self.broken())?,
                _ => return Err(self.broken()),
            };
        }
        Ok(current)
    }

    fn broken(&self) -> OrmError {
        OrmError::IllegalState(format!("Attribute state does not match accessor '{}'", self.path))
    }
}

/// Property path to slot table of one entity, compiled at boot.
#[derive(Debug, PartialEq)]
pub struct AccessorTable {
    entity: String,
    templates: Vec<SlotTemplate>,
    accessors: IndexMap<String, Accessor>,
}

impl AccessorTable {
    pub fn build(entity: &str, attributes: &[AttributeDefinition]) -> Self {
        let mut accessors = IndexMap::new();
        let templates = attributes
            .iter()
            .map(|attribute| Self::compile(attribute, "", &[], &mut accessors))
            .collect();
        Self {
            entity: entity.to_string(),
            templates,
            accessors,
        }
    }

    fn compile(
        attribute: &AttributeDefinition,
        prefix: &str,
        parent_slots: &[usize],
        accessors: &mut IndexMap<String, Accessor>,
    ) -> SlotTemplate {
        let path = if prefix.is_empty() {
            attribute.name.clone()
        } else {
            format!("{}.{}", prefix, attribute.name)
        };
        let mut slots = parent_slots.to_vec();
        slots.push(attribute.index);
        accessors.insert(
            path.clone(),
            Accessor {
                path: path.clone(),
                slots: slots.clone(),
            },
        );
        match &attribute.kind {
            AttributeKind::Basic { .. } => SlotTemplate::Basic,
            AttributeKind::Component { parts } => SlotTemplate::Component(
                parts
                    .iter()
                    .map(|part| Self::compile(part, &path, &slots, accessors))
                    .collect(),
            ),
            AttributeKind::ToOne { back_reference: None, .. } => SlotTemplate::ToOne,
            AttributeKind::ToOne { back_reference: Some(_), .. } => SlotTemplate::BackReference,
            AttributeKind::Collection { role } => SlotTemplate::Collection { role: role.clone() },
        }
    }

    pub fn accessor(&self, path: &str) -> Result<&Accessor> {
        self.accessors
            .get(path)
            .ok_or_else(|| OrmError::UnknownProperty(self.entity.clone(), path.to_string()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.accessors.keys().map(String::as_str)
    }

    /// Default state: nulls, unset references, empty collections.
    pub fn instantiate_attributes(&self) -> Vec<AttributeValue> {
        self.templates.iter().map(instantiate).collect()
    }
}

fn instantiate(template: &SlotTemplate) -> AttributeValue {
    match template {
        SlotTemplate::Basic => AttributeValue::Basic(Value::Null),
        SlotTemplate::Component(parts) => AttributeValue::Component(parts.iter().map(instantiate).collect()),
        SlotTemplate::ToOne => AttributeValue::ToOne(None),
        SlotTemplate::BackReference => AttributeValue::BackReference(None),
        SlotTemplate::Collection { role } => AttributeValue::Collection(CollectionHandle::new(role)),
    }
}
