use std::sync::Mutex;

use crate::core::Result;

use super::{AccessCallback, Optimizer};

#[derive(Debug, Default)]
struct PooledLoState {
    last_source_value: Option<i64>,
    upper_limit: i64,
    value: i64,
}

/// The database value is the lower bound of the block
/// `[value, value + increment)`.
#[derive(Debug)]
pub struct PooledLoOptimizer {
    increment_size: i64,
    state: Mutex<PooledLoState>,
}

impl PooledLoOptimizer {
    pub fn new(increment_size: i64) -> Self {
        Self {
            increment_size,
            state: Mutex::new(PooledLoState::default()),
        }
    }
}

impl Optimizer for PooledLoOptimizer {
    fn generate(&self, callback: &mut dyn AccessCallback) -> Result<i64> {
        let mut state = self.state.lock()?;
        if state.last_source_value.is_none() || state.value >= state.upper_limit {
            let source = callback.next_value()?;
            state.last_source_value = Some(source);
            state.upper_limit = source + self.increment_size;
            state.value = source;
            // sequences starting below one
            while state.value < 1 {
                state.value += 1;
            }
        }
        let id = state.value;
        state.value += 1;
        Ok(id)
    }

    fn increment_size(&self) -> i64 {
        self.increment_size
    }

    fn last_source_value(&self) -> Option<i64> {
        self.state.lock().ok().and_then(|s| s.last_source_value)
    }

    fn applies_increment_to_source(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_start_at_source_value() {
        let optimizer = PooledLoOptimizer::new(5);
        let mut next = 1;
        let mut calls = 0;
        let mut callback = || -> Result<i64> {
            calls += 1;
            let v = next;
            next += 5;
            Ok(v)
        };
        let ids: Vec<i64> = (0..7).map(|_| optimizer.generate(&mut callback).unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        drop(callback);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_source_below_one_is_skipped() {
        let optimizer = PooledLoOptimizer::new(3);
        let mut callback = || -> Result<i64> { Ok(-1) };
        assert_eq!(optimizer.generate(&mut callback).unwrap(), 1);
    }
}
