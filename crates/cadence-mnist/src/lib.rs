//! # Cadence MNIST
//!
//! A one-layer linear classifier trained on MNIST through the Cadence loop.
//! The training schedule runs a gradient step every step, logs and resets
//! the running metrics every `total_steps / 50` steps and validates every
//! `total_steps / 10` steps, checkpointing the best validation accuracy and
//! stopping early once it stops improving.

pub mod config;
pub mod data;
pub mod model;
pub mod plot;
pub mod trainer;

pub use config::TrainingConfig;
pub use data::{Batch, MnistSplit, Split, download_mnist};
pub use model::LinearClassifier;
pub use plot::plot_curves;
pub use trainer::{
    Curve, Metrics, TrainState, TrainingReport, compute_metrics, eval_step, fit, reset_metrics,
    run_training, train_step,
};
