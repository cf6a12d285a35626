use tracing::{debug, info};

use crate::callback::{Callback, LoopState, Snapshot};
use crate::checkpoint::Mode;
use crate::elapsed::{Elapsed, Mark, Period};
use crate::error::{CadenceError, Result};
use crate::logs::Logs;

/// Stops the loop when a monitored metric stops improving.
///
/// The wait is measured in the unit of `patience` from the last improvement
/// (or from the start of the loop). With `restore_best_weights`, a
/// [`Snapshot`] taken at the best step replaces the current state when
/// stopping.
#[derive(Debug)]
pub struct EarlyStopping<S> {
    monitor: String,
    mode: Mode,
    patience: Period,
    min_delta: f64,
    baseline: Option<f64>,
    restore_best_weights: bool,
    best: Option<f64>,
    best_mark: Mark,
    best_state: Option<S>,
    stopped_at: Option<u64>,
}

impl<S> EarlyStopping<S> {
    #[must_use]
    pub fn new(monitor: impl Into<String>, mode: Mode) -> Self {
        Self {
            monitor: monitor.into(),
            mode,
            patience: Period::Steps(1),
            min_delta: 0.0,
            baseline: None,
            restore_best_weights: false,
            best: None,
            best_mark: Mark::default(),
            best_state: None,
            stopped_at: None,
        }
    }

    #[must_use]
    pub fn patience(mut self, patience: impl Into<Period>) -> Self {
        self.patience = patience.into();
        self
    }

    /// Smallest change that counts as an improvement.
    #[must_use]
    pub fn min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    /// A value the metric has to beat before anything counts as improvement.
    #[must_use]
    pub fn baseline(mut self, baseline: f64) -> Self {
        self.baseline = Some(baseline);
        self
    }

    #[must_use]
    pub fn restore_best_weights(mut self, restore: bool) -> Self {
        self.restore_best_weights = restore;
        self
    }

    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Step at which the stop was requested.
    #[must_use]
    pub fn stopped_at(&self) -> Option<u64> {
        self.stopped_at
    }

    fn reference(&self) -> f64 {
        self.best
            .or(self.baseline)
            .unwrap_or_else(|| self.mode.worst())
    }

    /// Records `value` at `elapsed`. Returns `true` when the loop should stop.
    fn observe(&mut self, value: f64, elapsed: &Elapsed, state: &S) -> Result<bool>
    where
        S: Snapshot,
    {
        if self.mode.improves(value, self.reference(), self.min_delta) {
            debug!(monitor = %self.monitor, value, step = elapsed.steps, "improved");
            self.best = Some(value);
            self.best_mark = elapsed.mark();
            if self.restore_best_weights {
                self.best_state = Some(state.snapshot()?);
            }
            return Ok(false);
        }
        Ok(elapsed.progress_since(&self.best_mark, &self.patience))
    }
}

impl<S: Snapshot, B> Callback<S, B> for EarlyStopping<S> {
    fn call(&mut self, state: &mut S, _batch: &B, ctx: &mut LoopState) -> Result<Logs> {
        self.patience.validate()?;
        let value = ctx
            .logs
            .lookup(&self.monitor)
            .ok_or_else(|| CadenceError::MissingMetric {
                key: self.monitor.clone(),
            })?;

        if self.observe(value, &ctx.elapsed, state)? {
            info!(
                monitor = %self.monitor,
                best = ?self.best,
                step = ctx.elapsed.steps,
                patience = %self.patience,
                "early stopping"
            );
            if let Some(best_state) = self.best_state.take() {
                *state = best_state;
                info!("restored state from the best step");
            }
            self.stopped_at = Some(ctx.elapsed.steps);
            ctx.request_stop();
        }
        Ok(Logs::new())
    }
}
