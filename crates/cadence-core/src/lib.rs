//! # Cadence Core
//!
//! A step-scheduled training loop. Callbacks are attached to schedules
//! (`every(n)` steps, samples or seconds) and run against a threaded
//! training state while a dataset is consumed. Built-in callbacks cover
//! nested evaluation loops, checkpointing on a monitored metric, early
//! stopping and a Keras-style progress bar. Every step that produces logs
//! leaves an entry in the loop's [`History`].
//!
//! ## Quick Start
//!
//! ```rust
//! use cadence_core::{EarlyStopping, Logs, Loop, Mode, Period, every, from_fn};
//!
//! let losses = [0.9, 0.5, 0.4, 0.45, 0.47, 0.5];
//! let output = Loop::new()
//!     .on(every(1), from_fn(|_: &mut (), _: &Vec<u8>, elapsed| {
//!         let loss = losses[(elapsed.steps - 1) as usize];
//!         Ok(Logs::new().with_metrics([("loss", loss)], true))
//!     }))
//!     .on(every(1), EarlyStopping::new("loss", Mode::Min).patience(Period::Steps(2)))
//!     .stop(100)
//!     .run((), std::iter::repeat(vec![0u8; 32]))
//!     .unwrap();
//!
//! assert_eq!(output.elapsed.steps, 5);
//! let columns = output.history.collect(&["steps", "loss"]).unwrap();
//! assert_eq!(columns[0], vec![1.0, 2.0, 3.0, 4.0, 5.0]);
//! ```
pub mod callback;
pub mod checkpoint;
pub mod early_stopping;
pub mod elapsed;
pub mod error;
pub mod inner;
pub mod logs;
pub mod looping;
pub mod metrics;
pub mod progress;
pub mod schedule;

// Re-export primary API
pub use callback::{Callback, LoopState, Snapshot, boxed, from_fn, from_state_fn};
pub use checkpoint::{
    Checkpoint, CheckpointRecord, Checkpointable, Mode, latest_checkpoint, list_checkpoints,
    restore_latest,
};
pub use early_stopping::EarlyStopping;
pub use elapsed::{Elapsed, Period};
pub use error::{CadenceError, Result};
pub use inner::{InnerLoop, inner_loop};
pub use logs::{History, Logs};
pub use looping::{BatchSize, Loop, LoopOutput};
pub use metrics::{Accuracy, Average, Collection, Metric};
pub use progress::KerasBar;
pub use schedule::{After, Every, Never, Schedule, after, every, never};
