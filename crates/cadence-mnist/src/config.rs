//! Training run configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

/// Hyperparameters and paths of a training run.
///
/// Every field has a default, so a JSON config only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub eval_batch_size: usize,
    /// Training examples to consume. Steps are derived from this.
    pub total_samples: usize,
    /// Size of the streaming shuffle buffer over the training split.
    pub shuffle_buffer: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub seed: u64,
    /// Runs are written to `{logdir}/{unix_time}`.
    pub logdir: PathBuf,
    /// Where the MNIST files live. Defaults to the user cache directory.
    pub data_dir: Option<PathBuf>,
    /// Caps the number of validation batches per evaluation.
    pub eval_limit: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            eval_batch_size: 32,
            total_samples: 32 * 100,
            shuffle_buffer: 1024,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            seed: 0,
            logdir: PathBuf::from("logdir/mnist_full"),
            data_dir: None,
            eval_limit: None,
        }
    }
}

impl TrainingConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    #[must_use]
    pub fn total_steps(&self) -> u64 {
        (self.total_samples / self.batch_size.max(1)) as u64
    }

    /// Steps between validation passes.
    #[must_use]
    pub fn eval_steps(&self) -> u64 {
        self.total_steps() / 10
    }

    /// Steps between training metric logs.
    #[must_use]
    pub fn log_steps(&self) -> u64 {
        self.total_steps() / 50
    }

    /// Steps without validation improvement before stopping.
    #[must_use]
    pub fn patience(&self) -> u64 {
        self.eval_steps() * 2
    }

    /// Checks that every derived period is usable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            bail!("batch sizes must be positive");
        }
        if self.shuffle_buffer == 0 {
            bail!("shuffle_buffer must be positive");
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if self.log_steps() == 0 {
            bail!(
                "total_samples={} with batch_size={} gives {} steps; at least 50 are needed",
                self.total_samples,
                self.batch_size,
                self.total_steps()
            );
        }
        Ok(())
    }
}
