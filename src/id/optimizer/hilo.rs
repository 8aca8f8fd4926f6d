use std::sync::Mutex;

use log::trace;

use crate::core::Result;

use super::{AccessCallback, Optimizer};

#[derive(Debug, Default)]
struct HiLoState {
    last_source_value: Option<i64>,
    hi: i64,
    lo: i64,
}

/// Each database value becomes a multiplier: ids are `hi * increment + lo`
/// for `lo` in `[0, increment)`. The very first block skips id 0.
#[derive(Debug)]
pub struct HiLoOptimizer {
    increment_size: i64,
    state: Mutex<HiLoState>,
}

impl HiLoOptimizer {
    pub fn new(increment_size: i64) -> Self {
        Self {
            increment_size,
            state: Mutex::new(HiLoState::default()),
        }
    }
}

impl Optimizer for HiLoOptimizer {
    fn generate(&self, callback: &mut dyn AccessCallback) -> Result<i64> {
        let mut state = self.state.lock()?;
        if state.last_source_value.is_none() || state.lo >= self.increment_size {
            let source = callback.next_value()?;
            state.last_source_value = Some(source);
            state.hi = source * self.increment_size;
            state.lo = if state.hi == 0 { 1 } else { 0 };
            trace!("hilo: new block at hi={}", state.hi);
        }
        let id = state.hi + state.lo;
        state.lo += 1;
        Ok(id)
    }

    fn increment_size(&self) -> i64 {
        self.increment_size
    }

    fn last_source_value(&self) -> Option<i64> {
        self.state.lock().ok().and_then(|s| s.last_source_value)
    }

    fn applies_increment_to_source(&self) -> bool {
        false
    }
}
