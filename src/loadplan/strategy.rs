use std::fmt;

use serde::{Deserialize, Serialize};

/// When an association is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchTiming {
    /// Populated as part of loading the owner
    Immediate,
    /// Populated on first access through a proxy or uninitialized collection
    Delayed,
}

/// How an association is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStyle {
    Join,
    Select,
    Batch,
    Subselect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchStrategy {
    pub timing: FetchTiming,
    pub style: FetchStyle,
}

impl FetchStrategy {
    pub const fn new(timing: FetchTiming, style: FetchStyle) -> Self {
        Self { timing, style }
    }

    pub const fn immediate_join() -> Self {
        Self::new(FetchTiming::Immediate, FetchStyle::Join)
    }

    pub const fn delayed_select() -> Self {
        Self::new(FetchTiming::Delayed, FetchStyle::Select)
    }

    /// Strategy declared by a mapping; JOIN implies IMMEDIATE when no timing is given.
    pub fn declared(timing: Option<FetchTiming>, style: FetchStyle) -> Self {
        let timing = timing.unwrap_or(match style {
            FetchStyle::Join => FetchTiming::Immediate,
            _ => FetchTiming::Delayed,
        });
        Self::new(timing, style)
    }

    pub fn is_join(&self) -> bool {
        self.style == FetchStyle::Join
    }

    /// Same timing, loaded by a separate statement.
    pub fn downgraded(&self) -> Self {
        if self.is_join() {
            Self::new(self.timing, FetchStyle::Select)
        } else {
            *self
        }
    }
}

impl fmt::Display for FetchTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchTiming::Immediate => "IMMEDIATE",
            FetchTiming::Delayed => "DELAYED",
        })
    }
}

impl fmt::Display for FetchStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchStyle::Join => "JOIN",
            FetchStyle::Select => "SELECT",
            FetchStyle::Batch => "BATCH",
            FetchStyle::Subselect => "SUBSELECT",
        })
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.timing, self.style)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_timing_defaults() {
        assert_eq!(FetchStrategy::declared(None, FetchStyle::Join), FetchStrategy::immediate_join());
        assert_eq!(FetchStrategy::declared(None, FetchStyle::Select), FetchStrategy::delayed_select());
        let delayed_join = FetchStrategy::declared(Some(FetchTiming::Delayed), FetchStyle::Join);
        assert_eq!(delayed_join.downgraded(), FetchStrategy::delayed_select());
        assert_eq!(FetchStrategy::immediate_join().to_string(), "IMMEDIATE/JOIN");
    }
}
