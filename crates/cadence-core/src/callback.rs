//! The callback interface between the loop and user step code.

use std::marker::PhantomData;

use crate::elapsed::Elapsed;
use crate::error::Result;
use crate::logs::Logs;

/// What a callback can see and influence of the running loop.
#[derive(Debug, Default)]
pub struct LoopState {
    /// Progress including the current batch.
    pub elapsed: Elapsed,
    /// Logs produced so far during the current step.
    pub logs: Logs,
    stop_requested: bool,
}

impl LoopState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends the loop once the current step's callbacks have run.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

/// An independent copy of a loop state.
///
/// Nested loops run on a snapshot, and early stopping keeps one of the best
/// step. Every `Clone` type is its own snapshot; states whose clones would
/// share storage implement this instead of `Clone`.
pub trait Snapshot: Sized {
    fn snapshot(&self) -> anyhow::Result<Self>;
}

impl<T: Clone> Snapshot for T {
    fn snapshot(&self) -> anyhow::Result<Self> {
        Ok(self.clone())
    }
}

/// Work scheduled on the loop's steps.
///
/// `S` is the threaded training state, `B` the batch type of the dataset.
pub trait Callback<S, B> {
    /// Runs on a step where the callback's schedule fired.
    fn call(&mut self, state: &mut S, batch: &B, ctx: &mut LoopState) -> Result<Logs>;

    /// Runs once after the last step.
    fn on_end(&mut self, _state: &mut S, _ctx: &LoopState) -> Result<()> {
        Ok(())
    }
}

impl<S, B> Callback<S, B> for Box<dyn Callback<S, B> + '_> {
    fn call(&mut self, state: &mut S, batch: &B, ctx: &mut LoopState) -> Result<Logs> {
        (**self).call(state, batch, ctx)
    }

    fn on_end(&mut self, state: &mut S, ctx: &LoopState) -> Result<()> {
        (**self).on_end(state, ctx)
    }
}

/// Erases a callback's type so callbacks of one schedule fit in a `Vec`.
pub fn boxed<'a, S, B, C>(callback: C) -> Box<dyn Callback<S, B> + 'a>
where
    C: Callback<S, B> + 'a,
{
    Box::new(callback)
}

/// A step function: takes the state and a batch, may return logs.
pub struct FnCallback<F, S, B> {
    f: F,
    _marker: PhantomData<fn(&mut S, &B)>,
}

impl<F, S, B> Callback<S, B> for FnCallback<F, S, B>
where
    F: FnMut(&mut S, &B, &Elapsed) -> anyhow::Result<Logs>,
{
    fn call(&mut self, state: &mut S, batch: &B, ctx: &mut LoopState) -> Result<Logs> {
        Ok((self.f)(state, batch, &ctx.elapsed)?)
    }
}

/// Wraps a step function such as `train_step` or `eval_step`.
pub fn from_fn<F, S, B>(f: F) -> FnCallback<F, S, B>
where
    F: FnMut(&mut S, &B, &Elapsed) -> anyhow::Result<Logs>,
{
    FnCallback {
        f,
        _marker: PhantomData,
    }
}

/// A state transform that produces no logs, such as resetting metrics.
pub struct StateFnCallback<F, S> {
    f: F,
    _marker: PhantomData<fn(&mut S)>,
}

impl<F, S, B> Callback<S, B> for StateFnCallback<F, S>
where
    F: FnMut(&mut S) -> anyhow::Result<()>,
{
    fn call(&mut self, state: &mut S, _batch: &B, _ctx: &mut LoopState) -> Result<Logs> {
        (self.f)(state)?;
        Ok(Logs::new())
    }
}

pub fn from_state_fn<F, S>(f: F) -> StateFnCallback<F, S>
where
    F: FnMut(&mut S) -> anyhow::Result<()>,
{
    StateFnCallback {
        f,
        _marker: PhantomData,
    }
}

/// A loop-level hook run before the first or after the last step.
pub type Hook<'a, S> = Box<dyn FnMut(&mut S) -> anyhow::Result<()> + 'a>;
