//! Schedules decide, step by step, whether a group of callbacks runs.

use crate::elapsed::{Elapsed, Mark, Period};
use crate::error::Result;

/// Decides whether the callbacks attached to it run on the current step.
pub trait Schedule {
    /// Called once per step, after the step's batch was counted.
    fn should_run(&mut self, elapsed: &Elapsed) -> bool;

    /// Checked once before the loop starts.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Fires periodically in steps, samples or wall time.
#[derive(Debug, Clone)]
pub struct Every {
    period: Period,
    steps_offset: u64,
    last: Mark,
}

impl Every {
    #[must_use]
    pub fn new(period: impl Into<Period>) -> Self {
        Self {
            period: period.into(),
            steps_offset: 0,
            last: Mark::default(),
        }
    }

    /// Shifts a step period so it fires on `offset`, `offset + n`, ...
    #[must_use]
    pub fn with_offset(mut self, steps_offset: u64) -> Self {
        self.steps_offset = steps_offset;
        self
    }

    #[must_use]
    pub fn period(&self) -> Period {
        self.period
    }
}

impl Schedule for Every {
    fn should_run(&mut self, elapsed: &Elapsed) -> bool {
        match self.period {
            Period::Steps(0) => false,
            Period::Steps(n) => {
                elapsed.steps >= self.steps_offset && (elapsed.steps - self.steps_offset) % n == 0
            }
            Period::Samples(_) | Period::Time(_) => {
                if elapsed.progress_since(&self.last, &self.period) {
                    self.last = elapsed.mark();
                    true
                } else {
                    false
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        self.period.validate()
    }
}

/// Fires every `steps` steps.
#[must_use]
pub fn every(steps: u64) -> Every {
    Every::new(Period::Steps(steps))
}

/// Fires on every step from `steps` onwards.
#[derive(Debug, Clone, Copy)]
pub struct After {
    steps: u64,
}

impl Schedule for After {
    fn should_run(&mut self, elapsed: &Elapsed) -> bool {
        elapsed.steps >= self.steps
    }
}

#[must_use]
pub fn after(steps: u64) -> After {
    After { steps }
}

/// Never fires. Useful to switch a slot off without rewiring the loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl Schedule for Never {
    fn should_run(&mut self, _elapsed: &Elapsed) -> bool {
        false
    }
}

#[must_use]
pub fn never() -> Never {
    Never
}
