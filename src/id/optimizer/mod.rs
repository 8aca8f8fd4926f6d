pub mod hilo;
pub mod noop;
pub mod pooled;
pub mod pooled_lo;

use std::fmt::Debug;

use crate::core::{OrmError, Result};

pub use hilo::HiLoOptimizer;
pub use noop::NoopOptimizer;
pub use pooled::PooledOptimizer;
pub use pooled_lo::PooledLoOptimizer;

/// One round trip to the underlying sequence or table.
pub trait AccessCallback {
    fn next_value(&mut self) -> Result<i64>;
}

impl<F> AccessCallback for F
where
    F: FnMut() -> Result<i64>,
{
    fn next_value(&mut self) -> Result<i64> {
        self()
    }
}

/// Block allocation strategy over a database value source.
pub trait Optimizer: Send + Sync + Debug {
    fn generate(&self, callback: &mut dyn AccessCallback) -> Result<i64>;

    fn increment_size(&self) -> i64;

    /// Most recent value obtained from the database.
    fn last_source_value(&self) -> Option<i64>;

    /// Whether the database source itself advances by the increment size.
    fn applies_increment_to_source(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerDescriptor {
    None,
    HiLo,
    Pooled,
    PooledLo,
}

impl OptimizerDescriptor {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "hilo" => Ok(Self::HiLo),
            "pooled" => Ok(Self::Pooled),
            "pooled-lo" | "pooled_lo" => Ok(Self::PooledLo),
            other => Err(OrmError::Configuration(format!("Unknown optimizer '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::HiLo => "hilo",
            Self::Pooled => "pooled",
            Self::PooledLo => "pooled-lo",
        }
    }

    /// Optimizer used when the mapping names none.
    pub fn default_for(increment_size: i64, prefer_pooled_lo: bool) -> Self {
        if increment_size <= 1 {
            Self::None
        } else if prefer_pooled_lo {
            Self::PooledLo
        } else {
            Self::Pooled
        }
    }

    pub fn applies_increment_to_source(&self) -> bool {
        matches!(self, Self::Pooled | Self::PooledLo)
    }

    pub fn build(&self, increment_size: i64, initial_value: i64) -> Result<Box<dyn Optimizer>> {
        if increment_size < 1 {
            return Err(OrmError::Configuration(format!(
                "Increment size must be >= 1 for optimizer {}, got {}",
                self.name(),
                increment_size
            )));
        }
        Ok(match self {
            Self::None => Box::new(NoopOptimizer::new(increment_size)),
            Self::HiLo => Box::new(HiLoOptimizer::new(increment_size)),
            Self::Pooled => Box::new(PooledOptimizer::new(increment_size, initial_value)),
            Self::PooledLo => Box::new(PooledLoOptimizer::new(increment_size)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_choice() {
        assert_eq!(OptimizerDescriptor::default_for(1, false), OptimizerDescriptor::None);
        assert_eq!(OptimizerDescriptor::default_for(50, false), OptimizerDescriptor::Pooled);
        assert_eq!(OptimizerDescriptor::default_for(50, true), OptimizerDescriptor::PooledLo);
    }

    #[test]
    fn test_names_and_validation() {
        assert_eq!(OptimizerDescriptor::from_name("pooled-lo").unwrap(), OptimizerDescriptor::PooledLo);
        assert!(OptimizerDescriptor::from_name("legacy").is_err());
        assert!(OptimizerDescriptor::Pooled.build(0, 1).is_err());
    }
}
