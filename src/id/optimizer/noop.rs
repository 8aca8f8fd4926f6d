use std::sync::Mutex;

use crate::core::Result;

use super::{AccessCallback, Optimizer};

/// Every id is one database round trip.
#[derive(Debug)]
pub struct NoopOptimizer {
    increment_size: i64,
    last_source_value: Mutex<Option<i64>>,
}

impl NoopOptimizer {
    pub fn new(increment_size: i64) -> Self {
        Self {
            increment_size,
            last_source_value: Mutex::new(None),
        }
    }
}

impl Optimizer for NoopOptimizer {
    fn generate(&self, callback: &mut dyn AccessCallback) -> Result<i64> {
        let mut last = self.last_source_value.lock()?;
        let mut value = callback.next_value()?;
        while value < 1 {
            value = callback.next_value()?;
        }
        *last = Some(value);
        Ok(value)
    }

    fn increment_size(&self) -> i64 {
        self.increment_size
    }

    fn last_source_value(&self) -> Option<i64> {
        self.last_source_value.lock().ok().and_then(|v| *v)
    }

    fn applies_increment_to_source(&self) -> bool {
        false
    }
}
