//! The step-scheduled loop driver.

use std::mem;

use tracing::debug;

use crate::callback::{Callback, Hook, LoopState, boxed};
use crate::elapsed::Elapsed;
use crate::error::Result;
use crate::logs::{History, Logs};
use crate::schedule::Schedule;

/// Number of examples in a batch, used to count samples.
pub trait BatchSize {
    fn batch_size(&self) -> usize;
}

impl<T> BatchSize for Vec<T> {
    fn batch_size(&self) -> usize {
        self.len()
    }
}

impl<T> BatchSize for [T] {
    fn batch_size(&self) -> usize {
        self.len()
    }
}

impl<T: BatchSize + ?Sized> BatchSize for &T {
    fn batch_size(&self) -> usize {
        (**self).batch_size()
    }
}

struct Task<'a, S, B> {
    schedule: Box<dyn Schedule + 'a>,
    callbacks: Vec<Box<dyn Callback<S, B> + 'a>>,
}

/// What a finished loop hands back.
#[derive(Debug)]
pub struct LoopOutput<S> {
    pub state: S,
    pub history: History,
    pub elapsed: Elapsed,
}

/// A loop over a dataset that runs callbacks according to their schedules.
///
/// Schedules are checked in registration order on every step, and the
/// callbacks of one schedule run in the order they were given. Logs returned
/// by callbacks are merged into the step's logs, which are stamped with the
/// elapsed counters and appended to the history when non-empty.
///
/// ```
/// use cadence_core::{Loop, Logs, every, from_fn};
///
/// let output = Loop::new()
///     .on(every(1), from_fn(|total: &mut u64, batch: &Vec<u64>, _| {
///         *total += batch.iter().sum::<u64>();
///         Ok(Logs::new())
///     }))
///     .on(every(2), from_fn(|total: &mut u64, _: &Vec<u64>, _| {
///         Ok(Logs::new().with_metrics([("total", *total as f64)], true))
///     }))
///     .stop(4)
///     .run(0u64, std::iter::repeat(vec![1, 2]))
///     .unwrap();
///
/// assert_eq!(output.state, 12);
/// assert_eq!(output.history.len(), 2);
/// ```
pub struct Loop<'a, S, B> {
    tasks: Vec<Task<'a, S, B>>,
    on_start: Vec<Hook<'a, S>>,
    on_end: Vec<Hook<'a, S>>,
    stop: Option<u64>,
}

impl<'a, S, B> Loop<'a, S, B> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            on_start: Vec::new(),
            on_end: Vec::new(),
            stop: None,
        }
    }

    /// Stops after `steps` steps. Without it the loop ends with the dataset.
    #[must_use]
    pub fn stop(mut self, steps: u64) -> Self {
        self.stop = Some(steps);
        self
    }

    /// Runs `callback` whenever `schedule` fires.
    #[must_use]
    pub fn on<Sc, C>(self, schedule: Sc, callback: C) -> Self
    where
        Sc: Schedule + 'a,
        C: Callback<S, B> + 'a,
    {
        self.on_many(schedule, vec![boxed(callback)])
    }

    /// Runs `callbacks`, in order, whenever `schedule` fires.
    #[must_use]
    pub fn on_many<Sc>(mut self, schedule: Sc, callbacks: Vec<Box<dyn Callback<S, B> + 'a>>) -> Self
    where
        Sc: Schedule + 'a,
    {
        self.tasks.push(Task {
            schedule: Box::new(schedule),
            callbacks,
        });
        self
    }

    /// Runs `hook` on the state before the first batch is drawn.
    #[must_use]
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut S) -> anyhow::Result<()> + 'a,
    {
        self.on_start.push(Box::new(hook));
        self
    }

    /// Runs `hook` on the state after the last step.
    #[must_use]
    pub fn on_end<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut S) -> anyhow::Result<()> + 'a,
    {
        self.on_end.push(Box::new(hook));
        self
    }

    /// Drives the loop over `dataset` starting from `state`.
    pub fn run<I>(mut self, mut state: S, dataset: I) -> Result<LoopOutput<S>>
    where
        I: IntoIterator<Item = B>,
        B: BatchSize,
    {
        for task in &self.tasks {
            task.schedule.validate()?;
        }
        for hook in &mut self.on_start {
            hook(&mut state)?;
        }

        let mut ctx = LoopState::new();
        let mut history = History::new();
        let mut batches = dataset.into_iter();

        loop {
            if self.stop.is_some_and(|stop| ctx.elapsed.steps >= stop) {
                debug!(steps = ctx.elapsed.steps, "stop step reached");
                break;
            }
            let Some(batch) = batches.next() else {
                debug!(steps = ctx.elapsed.steps, "dataset exhausted");
                break;
            };

            ctx.elapsed.update(batch.batch_size());
            ctx.logs = Logs::new();

            for task in &mut self.tasks {
                if !task.schedule.should_run(&ctx.elapsed) {
                    continue;
                }
                for callback in &mut task.callbacks {
                    let logs = callback.call(&mut state, &batch, &mut ctx)?;
                    ctx.logs.merge(logs);
                }
            }

            if !ctx.logs.is_empty() {
                let mut logs = mem::take(&mut ctx.logs);
                logs.add_elapsed(&ctx.elapsed);
                history.push(logs);
            }

            if ctx.stop_requested() {
                debug!(steps = ctx.elapsed.steps, "stop requested by callback");
                break;
            }
        }

        for task in &mut self.tasks {
            for callback in &mut task.callbacks {
                callback.on_end(&mut state, &ctx)?;
            }
        }
        for hook in &mut self.on_end {
            hook(&mut state)?;
        }

        Ok(LoopOutput {
            state,
            history,
            elapsed: ctx.elapsed,
        })
    }
}

impl<S, B> Default for Loop<'_, S, B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{from_fn, from_state_fn};
    use crate::schedule::every;

    type Batch = Vec<u32>;

    fn counter(state: &mut Vec<u64>, _: &Batch, elapsed: &Elapsed) -> anyhow::Result<Logs> {
        state.push(elapsed.steps);
        Ok(Logs::new())
    }

    #[test]
    fn stops_at_stop_step() {
        let output = Loop::new()
            .on(every(1), from_fn(counter))
            .stop(5)
            .run(Vec::new(), std::iter::repeat(vec![0u32; 4]))
            .unwrap();
        assert_eq!(output.state, vec![1, 2, 3, 4, 5]);
        assert_eq!(output.elapsed.steps, 5);
        assert_eq!(output.elapsed.samples, 20);
    }

    #[test]
    fn ends_with_dataset() {
        let output = Loop::new()
            .on(every(1), from_fn(counter))
            .run(Vec::new(), vec![vec![1u32], vec![2], vec![3]])
            .unwrap();
        assert_eq!(output.state, vec![1, 2, 3]);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let output = Loop::new()
            .on(
                every(1),
                from_fn(|s: &mut Vec<&'static str>, _: &Batch, _| {
                    s.push("train");
                    Ok(Logs::new())
                }),
            )
            .on_many(
                every(2),
                vec![
                    boxed(from_fn(|s: &mut Vec<&'static str>, _: &Batch, _| {
                        s.push("compute");
                        Ok(Logs::new())
                    })),
                    boxed(from_state_fn(|s: &mut Vec<&'static str>| {
                        s.push("reset");
                        Ok(())
                    })),
                ],
            )
            .stop(2)
            .run(Vec::new(), std::iter::repeat(vec![0u32]))
            .unwrap();
        assert_eq!(output.state, vec!["train", "train", "compute", "reset"]);
    }

    #[test]
    fn history_records_only_steps_with_logs() {
        let output = Loop::new()
            .on(
                every(3),
                from_fn(|_: &mut (), _: &Batch, elapsed: &Elapsed| {
                    Ok(Logs::new().with_metrics([("loss", 1.0 / elapsed.steps as f64)], true))
                }),
            )
            .stop(9)
            .run((), std::iter::repeat(vec![0u32; 2]))
            .unwrap();

        let columns = output.history.collect(&["steps", "samples", "loss"]).unwrap();
        assert_eq!(columns[0], vec![3.0, 6.0, 9.0]);
        assert_eq!(columns[1], vec![6.0, 12.0, 18.0]);
        assert!((columns[2][2] - 1.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn hooks_wrap_the_loop() {
        let output = Loop::new()
            .on_start(|s: &mut Vec<u64>| {
                s.push(100);
                Ok(())
            })
            .on(every(1), from_fn(counter))
            .on_end(|s: &mut Vec<u64>| {
                s.push(200);
                Ok(())
            })
            .stop(2)
            .run(Vec::new(), std::iter::repeat(vec![0u32]))
            .unwrap();
        assert_eq!(output.state, vec![100, 1, 2, 200]);
    }

    #[test]
    fn zero_period_is_rejected_before_running() {
        let result = Loop::new()
            .on(every(0), from_fn(counter))
            .run(Vec::new(), vec![vec![0u32]]);
        assert!(result.is_err());
    }

    #[test]
    fn step_error_aborts_loop() {
        let result = Loop::new()
            .on(
                every(1),
                from_fn(|_: &mut (), _: &Batch, elapsed: &Elapsed| {
                    if elapsed.steps == 2 {
                        anyhow::bail!("loss is NaN");
                    }
                    Ok(Logs::new())
                }),
            )
            .run((), std::iter::repeat(vec![0u32]));
        assert_eq!(result.unwrap_err().to_string(), "loss is NaN");
    }
}
