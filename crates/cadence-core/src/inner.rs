//! Nested loops, e.g. a validation pass run every N training steps.

use tracing::{debug, warn};

use crate::callback::{Callback, LoopState, Snapshot};
use crate::error::Result;
use crate::logs::Logs;
use crate::looping::LoopOutput;

/// Runs a nested loop and reports its final logs under a name suffix.
pub struct InnerLoop<F> {
    name: String,
    run: F,
    output_state: bool,
}

/// Builds an [`InnerLoop`] whose metrics come back as `{metric}_{name}`.
///
/// `run` receives a [`Snapshot`] of the outer state and returns a finished
/// nested loop. The nested loop's final state is dropped unless
/// [`InnerLoop::output_state`] is set, so the outer state is untouched.
pub fn inner_loop<S, F>(name: impl Into<String>, run: F) -> InnerLoop<F>
where
    S: Snapshot,
    F: FnMut(S) -> Result<LoopOutput<S>>,
{
    InnerLoop {
        name: name.into(),
        run,
        output_state: false,
    }
}

impl<F> InnerLoop<F> {
    /// Replaces the outer state with the nested loop's final state.
    #[must_use]
    pub fn output_state(mut self, output_state: bool) -> Self {
        self.output_state = output_state;
        self
    }
}

impl<S, B, F> Callback<S, B> for InnerLoop<F>
where
    S: Snapshot,
    F: FnMut(S) -> Result<LoopOutput<S>>,
{
    fn call(&mut self, state: &mut S, _batch: &B, ctx: &mut LoopState) -> Result<Logs> {
        let output = (self.run)(state.snapshot()?)?;
        debug!(
            name = %self.name,
            outer_steps = ctx.elapsed.steps,
            inner_steps = output.elapsed.steps,
            "inner loop finished"
        );

        let logs = match output.history.last() {
            Some(last) => last.clone().with_suffix(&self.name),
            None => {
                warn!(name = %self.name, "inner loop produced no logs");
                Logs::new()
            }
        };

        if self.output_state {
            *state = output.state;
        }
        Ok(logs)
    }
}
