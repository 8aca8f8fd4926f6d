use std::sync::Mutex;

use log::trace;

use crate::core::Result;

use super::{AccessCallback, Optimizer};

#[derive(Debug, Default)]
struct PooledState {
    hi: Option<i64>,
    value: i64,
}

/// The database value is the upper bound of the block
/// `[hi - increment + 1, hi]`.
///
/// When the first value read equals the initial value the sequence was just
/// created: ids start at that value and the block runs up to the next read.
#[derive(Debug)]
pub struct PooledOptimizer {
    increment_size: i64,
    initial_value: i64,
    state: Mutex<PooledState>,
}

impl PooledOptimizer {
    pub fn new(increment_size: i64, initial_value: i64) -> Self {
        Self {
            increment_size,
            initial_value,
            state: Mutex::new(PooledState::default()),
        }
    }
}

impl Optimizer for PooledOptimizer {
    fn generate(&self, callback: &mut dyn AccessCallback) -> Result<i64> {
        let mut state = self.state.lock()?;
        match state.hi {
            None => {
                let first = callback.next_value()?;
                state.value = first;
                if (self.initial_value == -1 && first < self.increment_size)
                    || first == self.initial_value
                {
                    state.hi = Some(callback.next_value()?);
                } else {
                    state.hi = Some(first);
                    state.value = first - self.increment_size + 1;
                }
                trace!("pooled: first block [{}, {:?}]", state.value, state.hi);
            }
            Some(hi) if state.value > hi => {
                let next = callback.next_value()?;
                state.hi = Some(next);
                state.value = next - self.increment_size + 1;
                trace!("pooled: new block [{}, {}]", state.value, next);
            }
            Some(_) => {}
        }
        let id = state.value;
        state.value += 1;
        Ok(id)
    }

    fn increment_size(&self) -> i64 {
        self.increment_size
    }

    fn last_source_value(&self) -> Option<i64> {
        self.state.lock().ok().and_then(|s| s.hi)
    }

    fn applies_increment_to_source(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(start: i64, step: i64) -> impl FnMut() -> Result<i64> {
        let mut next = start;
        move || {
            let v = next;
            next += step;
            Ok(v)
        }
    }

    #[test]
    fn test_fresh_sequence_with_initial_value() {
        let optimizer = PooledOptimizer::new(20, 1);
        let mut calls = 0;
        let mut seq = sequence(1, 20);
        let mut callback = || -> Result<i64> {
            calls += 1;
            seq()
        };

        let ids: Vec<i64> = (0..21).map(|_| optimizer.generate(&mut callback).unwrap()).collect();
        assert_eq!(ids, (1..=21).collect::<Vec<_>>());
        assert_eq!(optimizer.last_source_value(), Some(21));

        assert_eq!(optimizer.generate(&mut callback).unwrap(), 22);
        drop(callback);
        assert_eq!(calls, 3);
        assert_eq!(optimizer.last_source_value(), Some(41));
    }

    #[test]
    fn test_sequence_already_advanced() {
        let optimizer = PooledOptimizer::new(10, 1);
        let mut callback = sequence(51, 10);
        let ids: Vec<i64> = (0..11).map(|_| optimizer.generate(&mut callback).unwrap()).collect();
        assert_eq!(ids, (42..=52).collect::<Vec<_>>());
    }
}
