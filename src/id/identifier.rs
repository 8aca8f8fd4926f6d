use std::fmt;

use indexmap::IndexMap;

use crate::core::Value;

/// Ordered property-path -> value view of an identifier.
pub type FlatMap = IndexMap<String, Value>;

/// Identifier of an entity instance: one value or named parts in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Simple(Value),
    Composite(Vec<(String, Identifier)>),
}

impl Identifier {
    pub fn simple(value: impl Into<Value>) -> Self {
        Identifier::Simple(value.into())
    }

    pub fn composite<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = (S, Identifier)>,
        S: Into<String>,
    {
        Identifier::Composite(parts.into_iter().map(|(n, id)| (n.into(), id)).collect())
    }

    pub fn part(&self, name: &str) -> Option<&Identifier> {
        match self {
            Identifier::Simple(_) => None,
            Identifier::Composite(parts) => parts.iter().find(|(n, _)| n == name).map(|(_, id)| id),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Identifier::Simple(value) => Some(value),
            Identifier::Composite(_) => None,
        }
    }

    /// Leaf values in declaration order.
    pub fn values(&self) -> Vec<Value> {
        let mut out = Vec::new();
        self.collect_values(&mut out);
        out
    }

    fn collect_values(&self, out: &mut Vec<Value>) {
        match self {
            Identifier::Simple(value) => out.push(value.clone()),
            Identifier::Composite(parts) => {
                for (_, part) in parts {
                    part.collect_values(out);
                }
            }
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Simple(value) => write!(f, "{}", value),
            Identifier::Composite(parts) => {
                write!(f, "{{")?;
                for (i, (name, part)) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", name, part)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<Value> for Identifier {
    fn from(value: Value) -> Self {
        Identifier::Simple(value)
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Identifier::Simple(Value::Integer(value))
    }
}

impl From<i32> for Identifier {
    fn from(value: i32) -> Self {
        Identifier::Simple(Value::Integer(value as i64))
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::Simple(Value::Text(value.to_string()))
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Identifier::Simple(Value::Text(value))
    }
}

/// Identity of a persistent instance: entity name plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity: String,
    pub id: Identifier,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: Identifier) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Identity of a collection instance: role plus owner identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub role: String,
    pub owner: Identifier,
}

impl CollectionKey {
    pub fn new(role: impl Into<String>, owner: Identifier) -> Self {
        Self {
            role: role.into(),
            owner,
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let id = Identifier::composite([("order_no", Identifier::from(7)), ("line", Identifier::from(2))]);
        assert_eq!(id.to_string(), "{order_no=7, line=2}");
        assert_eq!(EntityKey::new("Order", Identifier::from(1)).to_string(), "Order#1");
    }

    #[test]
    fn test_values_are_in_declaration_order() {
        let id = Identifier::composite([
            ("a", Identifier::from(1)),
            ("b", Identifier::composite([("c", Identifier::from("x")), ("d", Identifier::from(2))])),
        ]);
        assert_eq!(
            id.values(),
            vec![Value::Integer(1), Value::Text("x".into()), Value::Integer(2)]
        );
        assert_eq!(id.part("b").and_then(|b| b.part("d")), Some(&Identifier::from(2)));
    }
}
