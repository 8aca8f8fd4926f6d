// ============================================================================
// Domain results: typed readers over result-set rows
// ============================================================================

pub mod assembler;
pub mod instantiation;

use std::fmt;

use indexmap::IndexMap;

use crate::core::{SqlType, Value};
use crate::engine::EntityHandle;

pub use assembler::{Assembler, EntityResolver};
pub use instantiation::{
    ClassDescriptor, CompiledInstantiation, ConstructorDescriptor, InstantiationRegistry, InstantiationTarget,
    ParameterDescriptor,
};

/// Static type of a query result or instantiation parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgType {
    Integer,
    Float,
    Text,
    Boolean,
    Entity(String),
    Object(String),
    List,
    Map,
    /// Accepts anything
    Any,
}

impl ArgType {
    pub fn from_sql(sql_type: SqlType) -> Self {
        match sql_type {
            SqlType::Integer => ArgType::Integer,
            SqlType::Float => ArgType::Float,
            SqlType::Text => ArgType::Text,
            SqlType::Boolean => ArgType::Boolean,
        }
    }

    /// Assignment compatibility of a value of type `self` to a parameter of type `target`:
    /// 3 for an exact match, 2 for a widening conversion, 1 for `Any`.
    pub fn score_against(&self, target: &ArgType) -> Option<u32> {
        if self == target {
            return Some(3);
        }
        match (self, target) {
            (ArgType::Integer, ArgType::Float) => Some(2),
            (_, ArgType::Any) => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgType::Integer => f.write_str("integer"),
            ArgType::Float => f.write_str("float"),
            ArgType::Text => f.write_str("text"),
            ArgType::Boolean => f.write_str("boolean"),
            ArgType::Entity(name) => write!(f, "entity {}", name),
            ArgType::Object(name) => write!(f, "{}", name),
            ArgType::List => f.write_str("list"),
            ArgType::Map => f.write_str("map"),
            ArgType::Any => f.write_str("any"),
        }
    }
}

/// Argument of a dynamic instantiation.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantiationArgument {
    pub result: DomainResult,
    pub alias: Option<String>,
}

impl InstantiationArgument {
    pub fn new(result: DomainResult) -> Self {
        Self { result, alias: None }
    }

    pub fn aliased(result: DomainResult, alias: impl Into<String>) -> Self {
        Self {
            result,
            alias: Some(alias.into()),
        }
    }
}

/// What a query produces per row, bound to result-set offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainResult {
    Scalar {
        offset: usize,
        sql_type: SqlType,
    },
    Composite {
        parts: Vec<DomainResult>,
    },
    EntityReference {
        entity: String,
        id_offsets: Vec<usize>,
    },
    Instantiation {
        target: InstantiationTarget,
        arguments: Vec<InstantiationArgument>,
    },
}

impl DomainResult {
    pub fn scalar(offset: usize, sql_type: SqlType) -> Self {
        DomainResult::Scalar { offset, sql_type }
    }

    pub fn entity(entity: impl Into<String>, id_offsets: Vec<usize>) -> Self {
        DomainResult::EntityReference {
            entity: entity.into(),
            id_offsets,
        }
    }

    pub fn instantiation(target: InstantiationTarget, arguments: Vec<InstantiationArgument>) -> Self {
        DomainResult::Instantiation { target, arguments }
    }

    pub fn result_type(&self) -> ArgType {
        match self {
            DomainResult::Scalar { sql_type, .. } => ArgType::from_sql(*sql_type),
            DomainResult::Composite { .. } => ArgType::Any,
            DomainResult::EntityReference { entity, .. } => ArgType::Entity(entity.clone()),
            DomainResult::Instantiation { target, .. } => match target {
                InstantiationTarget::List => ArgType::List,
                InstantiationTarget::Map => ArgType::Map,
                InstantiationTarget::Class(name) => ArgType::Object(name.clone()),
            },
        }
    }
}

/// One assembled result value.
#[derive(Debug, Clone)]
pub enum ResultValue {
    Scalar(Value),
    Entity(EntityHandle),
    Composite(Vec<ResultValue>),
    List(Vec<ResultValue>),
    Map(IndexMap<String, ResultValue>),
    Object {
        type_name: String,
        fields: IndexMap<String, ResultValue>,
    },
}

impl ResultValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ResultValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityHandle> {
        match self {
            ResultValue::Entity(e) => Some(e),
            _ => None,
        }
    }

    /// Field of an object or entry of a map.
    pub fn field(&self, name: &str) -> Option<&ResultValue> {
        match self {
            ResultValue::Object { fields, .. } => fields.get(name),
            ResultValue::Map(entries) => entries.get(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores() {
        assert_eq!(ArgType::Integer.score_against(&ArgType::Integer), Some(3));
        assert_eq!(ArgType::Integer.score_against(&ArgType::Float), Some(2));
        assert_eq!(ArgType::Text.score_against(&ArgType::Any), Some(1));
        assert_eq!(ArgType::Float.score_against(&ArgType::Integer), None);
        assert_eq!(
            ArgType::Entity("Order".into()).score_against(&ArgType::Entity("Payment".into())),
            None
        );
    }
}
