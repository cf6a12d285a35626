//! Trains the MNIST linear classifier.

use std::path::PathBuf;

use anyhow::Result;
use cadence_mnist::{TrainingConfig, plot_curves, run_training};
use clap::Parser;
use tracing::info;

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train a linear MNIST classifier with periodic validation")]
#[command(version)]
struct Cli {
    /// JSON config; flags below override its values
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding (or receiving) the MNIST files
    #[arg(short = 'D', long, env = "CADENCE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Root directory for run outputs
    #[arg(short, long, env = "CADENCE_LOGDIR")]
    logdir: Option<PathBuf>,

    /// Training examples to consume
    #[arg(long)]
    total_samples: Option<usize>,

    #[arg(short, long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Cap on validation batches per evaluation
    #[arg(long)]
    eval_limit: Option<usize>,

    /// Write loss and accuracy curves to `{run}/curves.svg`
    #[arg(long)]
    plot: bool,
}

impl Cli {
    fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_json_file(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.logdir {
            config.logdir = dir.clone();
        }
        if let Some(n) = self.total_samples {
            config.total_samples = n;
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.eval_limit.is_some() {
            config.eval_limit = self.eval_limit;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = cli.training_config()?;
    let report = run_training(&config)?;

    if cli.plot {
        let path = report.run_dir.join("curves.svg");
        plot_curves(&path, &report.train, &report.valid)?;
        info!(path = %path.display(), "wrote curves");
    }

    println!("Run directory: {}", report.run_dir.display());
    println!("Steps: {}", report.steps);
    if let (Some(loss), Some(accuracy)) = (report.train.loss.last(), report.train.accuracy.last()) {
        println!("Final train loss: {loss:.4}, accuracy: {accuracy:.4}");
    }
    if let Some(best) = &report.best_checkpoint {
        let value = best.value.unwrap_or(f64::NAN);
        println!(
            "Best validation accuracy: {value:.4} at step {} ({})",
            best.step,
            best.path.display()
        );
    }
    Ok(())
}
