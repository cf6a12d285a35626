use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{CadenceError, Result};

/// Progress of a loop: steps taken, samples consumed and wall time.
#[derive(Debug, Clone, Copy)]
pub struct Elapsed {
    /// Number of batches consumed so far.
    pub steps: u64,
    /// Number of examples consumed so far.
    pub samples: u64,
    start: Instant,
}

impl Elapsed {
    /// Starts a fresh counter at zero steps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            steps: 0,
            samples: 0,
            start: Instant::now(),
        }
    }

    /// Accounts for one consumed batch of `batch_size` examples.
    pub fn update(&mut self, batch_size: usize) {
        self.steps += 1;
        self.samples += batch_size as u64;
    }

    /// Wall time since the loop started.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.start.elapsed()
    }

    /// Wall time since the loop started, in seconds.
    #[must_use]
    pub fn seconds(&self) -> f64 {
        self.duration().as_secs_f64()
    }

    /// Whether at least one `period` has passed since `since`.
    pub(crate) fn progress_since(&self, since: &Mark, period: &Period) -> bool {
        match period {
            Period::Steps(n) => self.steps.saturating_sub(since.steps) >= *n,
            Period::Samples(n) => self.samples.saturating_sub(since.samples) >= *n,
            Period::Time(d) => self.duration().saturating_sub(since.time) >= *d,
        }
    }

    pub(crate) fn mark(&self) -> Mark {
        Mark {
            steps: self.steps,
            samples: self.samples,
            time: self.duration(),
        }
    }
}

impl Default for Elapsed {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "steps={}, samples={}, time={:.1}s",
            self.steps,
            self.samples,
            self.seconds()
        )
    }
}

/// A point in a loop's progress, used to measure distances in a [`Period`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Mark {
    pub steps: u64,
    pub samples: u64,
    pub time: Duration,
}

/// A distance along the loop in one of three units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Steps(u64),
    Samples(u64),
    Time(Duration),
}

impl Period {
    /// Rejects periods that would fire on every check forever.
    pub fn validate(&self) -> Result<()> {
        let zero = match self {
            Self::Steps(n) | Self::Samples(n) => *n == 0,
            Self::Time(d) => d.is_zero(),
        };
        if zero {
            return Err(CadenceError::InvalidSchedule(format!(
                "period must be positive, got {self}"
            )));
        }
        Ok(())
    }
}

impl From<u64> for Period {
    fn from(steps: u64) -> Self {
        Self::Steps(steps)
    }
}

impl From<Duration> for Period {
    fn from(time: Duration) -> Self {
        Self::Time(time)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steps(n) => write!(f, "{n} steps"),
            Self::Samples(n) => write!(f, "{n} samples"),
            Self::Time(d) => write!(f, "{:.3}s", d.as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_counts_steps_and_samples() {
        let mut elapsed = Elapsed::new();
        elapsed.update(32);
        elapsed.update(16);
        assert_eq!(elapsed.steps, 2);
        assert_eq!(elapsed.samples, 48);
    }

    #[test]
    fn zero_periods_are_rejected() {
        assert!(Period::Steps(0).validate().is_err());
        assert!(Period::Samples(0).validate().is_err());
        assert!(Period::Time(Duration::ZERO).validate().is_err());
        assert!(Period::Steps(3).validate().is_ok());
    }

    #[test]
    fn progress_since_mark() {
        let mut elapsed = Elapsed::new();
        let mark = elapsed.mark();
        elapsed.update(10);
        assert!(!elapsed.progress_since(&mark, &Period::Steps(2)));
        elapsed.update(10);
        assert!(elapsed.progress_since(&mark, &Period::Steps(2)));
        assert!(elapsed.progress_since(&mark, &Period::Samples(20)));
        assert!(!elapsed.progress_since(&mark, &Period::Samples(21)));
    }
}
