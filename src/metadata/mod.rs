// ============================================================================
// Bound metadata model: the input to session factory boot
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::cache::AccessType;
use crate::core::{OrmError, Result, SqlType};
use crate::loadplan::{FetchStyle, FetchTiming};

/// Everything the engine needs to know about the mapped domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingModel {
    pub entities: Vec<EntityMapping>,
    #[serde(default)]
    pub fetch_profiles: Vec<FetchProfileMapping>,
}

impl MappingModel {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn entity(&self, name: &str) -> Result<&EntityMapping> {
        self.entities
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| OrmError::UnknownEntity(name.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMapping {
    pub name: String,
    pub table: String,
    pub identifier: IdentifierMapping,
    #[serde(default)]
    pub attributes: Vec<AttributeMapping>,
    #[serde(default)]
    pub version: Option<VersionMapping>,
    #[serde(default)]
    pub cache: Option<AccessType>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_true")]
    pub mutable: bool,
}

impl EntityMapping {
    pub fn new(name: impl Into<String>, table: impl Into<String>, identifier: IdentifierMapping) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            identifier,
            attributes: Vec::new(),
            version: None,
            cache: None,
            batch_size: None,
            mutable: true,
        }
    }

    pub fn attribute(mut self, attribute: AttributeMapping) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn version(mut self, column: impl Into<String>) -> Self {
        self.version = Some(VersionMapping { column: column.into() });
        self
    }

    pub fn cache(mut self, access: AccessType) -> Self {
        self.cache = Some(access);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentifierMapping {
    Single {
        property: String,
        column: String,
        sql_type: SqlType,
        #[serde(default)]
        generator: GeneratorMapping,
    },
    Embedded {
        property: String,
        parts: Vec<IdPartMapping>,
    },
    /// Identifier properties declared directly on the entity
    Multiple { parts: Vec<IdPartMapping> },
}

impl IdentifierMapping {
    pub fn single(property: &str, column: &str, sql_type: SqlType) -> Self {
        IdentifierMapping::Single {
            property: property.into(),
            column: column.into(),
            sql_type,
            generator: GeneratorMapping::Assigned,
        }
    }

    pub fn generated(mut self, generator: GeneratorMapping) -> Self {
        if let IdentifierMapping::Single { generator: g, .. } = &mut self {
            *g = generator;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdPartMapping {
    Column {
        property: String,
        column: String,
        sql_type: SqlType,
    },
    Component {
        property: String,
        parts: Vec<IdPartMapping>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum GeneratorMapping {
    #[default]
    Assigned,
    Sequence {
        sequence_name: String,
        #[serde(default = "default_one")]
        initial_value: i64,
        #[serde(default = "default_one")]
        increment_size: i64,
        #[serde(default)]
        optimizer: Option<String>,
    },
    Table {
        table: String,
        #[serde(default = "default_segment_column")]
        segment_column: String,
        segment_value: String,
        #[serde(default = "default_value_column")]
        value_column: String,
        #[serde(default = "default_one")]
        initial_value: i64,
        #[serde(default = "default_one")]
        increment_size: i64,
        #[serde(default)]
        optimizer: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMapping {
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeType {
    All,
    Persist,
    Merge,
    Remove,
    Refresh,
    Evict,
}

/// Declared fetch strategy of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMapping {
    #[serde(default)]
    pub timing: Option<FetchTiming>,
    pub style: FetchStyle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeMapping {
    Basic {
        name: String,
        column: String,
        sql_type: SqlType,
        #[serde(default = "default_true")]
        nullable: bool,
    },
    Component {
        name: String,
        attributes: Vec<AttributeMapping>,
    },
    ManyToOne {
        name: String,
        target: String,
        columns: Vec<String>,
        #[serde(default)]
        fetch: Option<FetchMapping>,
        #[serde(default)]
        cascade: Vec<CascadeType>,
        #[serde(default = "default_true")]
        nullable: bool,
    },
    OneToMany {
        name: String,
        target: String,
        key_columns: Vec<String>,
        #[serde(default)]
        inverse: bool,
        #[serde(default)]
        fetch: Option<FetchMapping>,
        #[serde(default)]
        cascade: Vec<CascadeType>,
        #[serde(default)]
        orphan_removal: bool,
        #[serde(default)]
        batch_size: Option<usize>,
        #[serde(default)]
        order_by: Option<String>,
        #[serde(default)]
        cache: Option<AccessType>,
    },
    ElementCollection {
        name: String,
        table: String,
        key_columns: Vec<String>,
        element_column: String,
        element_type: SqlType,
        #[serde(default)]
        fetch: Option<FetchMapping>,
        #[serde(default)]
        batch_size: Option<usize>,
        #[serde(default)]
        order_by: Option<String>,
        #[serde(default)]
        cache: Option<AccessType>,
    },
}

impl AttributeMapping {
    pub fn name(&self) -> &str {
        match self {
            AttributeMapping::Basic { name, .. }
            | AttributeMapping::Component { name, .. }
            | AttributeMapping::ManyToOne { name, .. }
            | AttributeMapping::OneToMany { name, .. }
            | AttributeMapping::ElementCollection { name, .. } => name,
        }
    }

    pub fn basic(name: &str, column: &str, sql_type: SqlType) -> Self {
        AttributeMapping::Basic {
            name: name.into(),
            column: column.into(),
            sql_type,
            nullable: true,
        }
    }

    pub fn component(name: &str, attributes: Vec<AttributeMapping>) -> Self {
        AttributeMapping::Component {
            name: name.into(),
            attributes,
        }
    }

    pub fn many_to_one(name: &str, target: &str, column: &str) -> Self {
        AttributeMapping::ManyToOne {
            name: name.into(),
            target: target.into(),
            columns: vec![column.into()],
            fetch: None,
            cascade: Vec::new(),
            nullable: true,
        }
    }

    pub fn one_to_many(name: &str, target: &str, key_column: &str) -> Self {
        AttributeMapping::OneToMany {
            name: name.into(),
            target: target.into(),
            key_columns: vec![key_column.into()],
            inverse: false,
            fetch: None,
            cascade: Vec::new(),
            orphan_removal: false,
            batch_size: None,
            order_by: None,
            cache: None,
        }
    }

    pub fn element_collection(name: &str, table: &str, key_column: &str, element_column: &str, element_type: SqlType) -> Self {
        AttributeMapping::ElementCollection {
            name: name.into(),
            table: table.into(),
            key_columns: vec![key_column.into()],
            element_column: element_column.into(),
            element_type,
            fetch: None,
            batch_size: None,
            order_by: None,
            cache: None,
        }
    }

    /// Override the declared fetch strategy of an association.
    pub fn fetch(mut self, timing: FetchTiming, style: FetchStyle) -> Self {
        match &mut self {
            AttributeMapping::ManyToOne { fetch, .. }
            | AttributeMapping::OneToMany { fetch, .. }
            | AttributeMapping::ElementCollection { fetch, .. } => {
                *fetch = Some(FetchMapping {
                    timing: Some(timing),
                    style,
                })
            }
            _ => {}
        }
        self
    }

    pub fn cascade(mut self, types: &[CascadeType]) -> Self {
        match &mut self {
            AttributeMapping::ManyToOne { cascade, .. } | AttributeMapping::OneToMany { cascade, .. } => {
                cascade.extend_from_slice(types)
            }
            _ => {}
        }
        self
    }

    pub fn inverse(mut self) -> Self {
        if let AttributeMapping::OneToMany { inverse, .. } = &mut self {
            *inverse = true;
        }
        self
    }

    pub fn orphan_removal(mut self) -> Self {
        if let AttributeMapping::OneToMany { orphan_removal, .. } = &mut self {
            *orphan_removal = true;
        }
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        match &mut self {
            AttributeMapping::OneToMany { batch_size, .. }
            | AttributeMapping::ElementCollection { batch_size, .. } => *batch_size = Some(size),
            _ => {}
        }
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        match &mut self {
            AttributeMapping::OneToMany { order_by, .. }
            | AttributeMapping::ElementCollection { order_by, .. } => *order_by = Some(column.to_string()),
            _ => {}
        }
        self
    }

    pub fn not_null(mut self) -> Self {
        match &mut self {
            AttributeMapping::Basic { nullable, .. } | AttributeMapping::ManyToOne { nullable, .. } => *nullable = false,
            _ => {}
        }
        self
    }

    pub fn cached(mut self, access: AccessType) -> Self {
        match &mut self {
            AttributeMapping::OneToMany { cache, .. } | AttributeMapping::ElementCollection { cache, .. } => {
                *cache = Some(access)
            }
            _ => {}
        }
        self
    }
}

/// Named set of association fetch-style overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchProfileMapping {
    pub name: String,
    pub overrides: Vec<FetchOverrideMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOverrideMapping {
    pub entity: String,
    pub association: String,
    pub style: FetchStyle,
}

fn default_true() -> bool {
    true
}

fn default_one() -> i64 {
    1
}

fn default_segment_column() -> String {
    "sequence_name".to_string()
}

fn default_value_column() -> String {
    "next_val".to_string()
}
