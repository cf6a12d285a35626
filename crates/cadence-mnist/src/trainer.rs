//! Training state, step functions and the training schedule.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, ensure};
use cadence_core::{
    Accuracy, Average, Checkpoint, CheckpointRecord, Checkpointable, Collection, EarlyStopping,
    Elapsed, History, KerasBar, Logs, Loop, Metric, Mode, Period, Snapshot, boxed, every,
    from_fn, from_state_fn, inner_loop, latest_checkpoint,
};
use candle_core::{D, DType, Device, Module, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use safetensors::SafeTensors;
use tracing::info;

use crate::config::TrainingConfig;
use crate::data::{Batch, MnistSplit, Split, default_data_dir, download_mnist};
use crate::model::LinearClassifier;

/// Running loss average and accuracy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub loss: Average,
    pub accuracy: Accuracy,
}

impl Metrics {
    /// Metrics of a single batch from the model's output.
    pub fn single_from_model_output(
        loss: &Tensor,
        logits: &Tensor,
        labels: &Tensor,
    ) -> anyhow::Result<Self> {
        let loss = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        let predictions: Vec<u32> = logits.argmax(D::Minus1)?.to_vec1()?;
        let labels: Vec<u32> = labels.to_vec1()?;
        Ok(Self {
            loss: Average::from_value(loss),
            accuracy: Accuracy::from_predictions(&predictions, &labels)?,
        })
    }

    /// Merges the metrics of one more batch.
    pub fn update(&self, loss: &Tensor, logits: &Tensor, labels: &Tensor) -> anyhow::Result<Self> {
        Ok(self.merge(&Self::single_from_model_output(loss, logits, labels)?))
    }
}

impl Collection for Metrics {
    fn merge(&self, other: &Self) -> Self {
        Self {
            loss: self.loss.merge(&other.loss),
            accuracy: self.accuracy.merge(&other.accuracy),
        }
    }

    fn compute(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("loss".to_string(), self.loss.compute()),
            ("accuracy".to_string(), self.accuracy.compute()),
        ])
    }

    fn empty() -> Self {
        Self::default()
    }
}

/// Parameters, optimizer state and running metrics, threaded through the loop.
///
/// Not `Clone`: the model's tensors alias the `VarMap`, so copies go through
/// [`Snapshot`], which duplicates every parameter.
pub struct TrainState {
    pub varmap: VarMap,
    pub model: LinearClassifier,
    optimizer: AdamW,
    params: ParamsAdamW,
    pub metrics: Metrics,
    pub step: u64,
    device: Device,
}

impl TrainState {
    /// Fresh parameters (seeded), an AdamW optimizer and empty metrics.
    pub fn create(config: &TrainingConfig, in_features: usize, device: &Device) -> anyhow::Result<Self> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = LinearClassifier::new(vb, in_features)?;
        LinearClassifier::reseed(&mut varmap, in_features, config.seed, device)?;

        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params.clone())?;

        Ok(Self {
            varmap,
            model,
            optimizer,
            params,
            metrics: Metrics::empty(),
            step: 0,
            device: device.clone(),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    fn forward_loss(&self, batch: &Batch) -> anyhow::Result<(Tensor, Tensor, Tensor)> {
        let (images, labels) = batch.to_tensors(&self.device)?;
        let logits = self.model.forward(&images)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
        Ok((loss, logits, labels))
    }
}

impl Snapshot for TrainState {
    /// Copies every parameter into a fresh `VarMap`. The copy gets its own
    /// optimizer with the same hyperparameters and fresh moment estimates.
    fn snapshot(&self) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        {
            let source = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
            let mut target = varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
            for (name, var) in source.iter() {
                target.insert(name.clone(), Var::from_tensor(&var.as_tensor().copy()?)?);
            }
        }
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let model = LinearClassifier::new(vb, self.model.in_features())?;
        let optimizer = AdamW::new(varmap.all_vars(), self.params.clone())?;

        Ok(Self {
            varmap,
            model,
            optimizer,
            params: self.params.clone(),
            metrics: self.metrics,
            step: self.step,
            device: self.device.clone(),
        })
    }
}

impl Checkpointable for TrainState {
    const EXTENSION: &'static str = "safetensors";

    fn save_checkpoint(&self, path: &Path) -> anyhow::Result<()> {
        let tensors: HashMap<String, Tensor> = {
            let vars = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
            vars.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };
        let metadata = HashMap::from([("step".to_string(), self.step.to_string())]);
        safetensors::tensor::serialize_to_file(tensors, &Some(metadata), path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn load_checkpoint(&mut self, path: &Path) -> anyhow::Result<()> {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let (_, metadata) = SafeTensors::read_metadata(&bytes)?;
        let step = metadata
            .metadata()
            .as_ref()
            .and_then(|meta| meta.get("step"))
            .context("checkpoint has no step metadata")?
            .parse()
            .context("checkpoint step is not a number")?;

        self.varmap.load(path)?;
        self.step = step;
        self.metrics = Metrics::empty();
        Ok(())
    }
}

/// Gradient step on one batch; metrics are updated with the pre-step logits.
///
/// A non-finite batch loss fails the step before the parameters change.
pub fn train_step(state: &mut TrainState, batch: &Batch, _: &Elapsed) -> anyhow::Result<Logs> {
    let (loss, logits, labels) = state.forward_loss(batch)?;
    let batch_metrics = Metrics::single_from_model_output(&loss, &logits, &labels)?;
    ensure!(
        batch_metrics.loss.compute().is_finite(),
        "loss diverged at step {}",
        state.step + 1
    );
    state.optimizer.backward_step(&loss)?;
    state.metrics = state.metrics.merge(&batch_metrics);
    state.step += 1;
    Ok(Logs::new())
}

/// Accumulates validation metrics and reports them.
pub fn eval_step(state: &mut TrainState, batch: &Batch, _: &Elapsed) -> anyhow::Result<Logs> {
    let (loss, logits, labels) = state.forward_loss(batch)?;
    state.metrics = state.metrics.update(&loss, &logits, &labels)?;
    Ok(Logs::new().with_metrics(state.metrics.compute(), true))
}

/// Reports the training metrics accumulated since the last reset.
pub fn compute_metrics(state: &mut TrainState, _: &Batch, _: &Elapsed) -> anyhow::Result<Logs> {
    Ok(Logs::new().with_metrics(state.metrics.compute(), true))
}

pub fn reset_metrics(state: &mut TrainState) -> anyhow::Result<()> {
    state.metrics = Metrics::empty();
    Ok(())
}

/// Steps with their loss and accuracy, as plotted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Curve {
    pub steps: Vec<f64>,
    pub loss: Vec<f64>,
    pub accuracy: Vec<f64>,
}

impl Curve {
    fn collect(history: &History, keys: [&str; 3]) -> anyhow::Result<Self> {
        let mut columns = history.collect(&keys)?.into_iter();
        let mut next = || columns.next().unwrap_or_default();
        Ok(Self {
            steps: next(),
            loss: next(),
            accuracy: next(),
        })
    }
}

/// Outcome of a training run.
pub struct TrainingReport {
    pub run_dir: PathBuf,
    pub steps: u64,
    pub history: History,
    pub train: Curve,
    pub valid: Curve,
    pub best_checkpoint: Option<CheckpointRecord>,
    pub state: TrainState,
}

/// Trains on `train`, validating on `valid`, writing into `run_dir`.
///
/// Schedule, all in steps: a train step every step; metric logging and reset
/// every `log_steps`; a validation pass, a checkpoint on the best
/// `accuracy_valid` and early stopping every `eval_steps`.
pub fn fit(
    config: &TrainingConfig,
    train: &MnistSplit,
    valid: &MnistSplit,
    run_dir: &Path,
    progress: KerasBar,
) -> anyhow::Result<TrainingReport> {
    config.validate()?;
    let device = Device::Cpu;
    let state = TrainState::create(config, train.rows * train.cols, &device)?;

    let total_steps = config.total_steps();
    let eval_steps = config.eval_steps();
    let eval_batch_size = config.eval_batch_size;
    let eval_limit = config.eval_limit.unwrap_or(usize::MAX);
    info!(
        total_steps,
        eval_steps,
        log_steps = config.log_steps(),
        run_dir = %run_dir.display(),
        "starting training"
    );

    let output = Loop::new()
        .on(every(1), from_fn(train_step))
        .on_many(
            every(config.log_steps()),
            vec![boxed(from_fn(compute_metrics)), boxed(from_state_fn(reset_metrics))],
        )
        .on_many(
            every(eval_steps),
            vec![
                boxed(inner_loop("valid", |state: TrainState| {
                    Loop::new()
                        .on_start(reset_metrics)
                        .on(every(1), from_fn(eval_step))
                        .run(state, valid.eval_batches(eval_batch_size).take(eval_limit))
                })),
                boxed(Checkpoint::new(run_dir).monitor("accuracy_valid", Mode::Max)),
                boxed(
                    EarlyStopping::new("accuracy_valid", Mode::Max)
                        .patience(Period::Steps(config.patience())),
                ),
            ],
        )
        .on(every(1), progress)
        .stop(total_steps)
        .run(
            state,
            train.train_batches(config.batch_size, config.shuffle_buffer, config.seed),
        )?;

    fs::create_dir_all(run_dir)?;
    output.history.save_json(run_dir.join("history.json"))?;

    let report = TrainingReport {
        run_dir: run_dir.to_path_buf(),
        steps: output.elapsed.steps,
        train: Curve::collect(&output.history, ["steps", "loss", "accuracy"])?,
        valid: Curve::collect(&output.history, ["steps", "loss_valid", "accuracy_valid"])?,
        best_checkpoint: latest_checkpoint(run_dir)?,
        history: output.history,
        state: output.state,
    };
    info!(
        steps = report.steps,
        elapsed = %output.elapsed,
        best_accuracy_valid = ?report.best_checkpoint.as_ref().and_then(|c| c.value),
        "training finished"
    );
    Ok(report)
}

/// Creates and returns a fresh `{logdir}/{unix_time}` directory. Runs
/// started within the same second get a `-1`, `-2`, ... suffix.
pub fn unique_run_dir(logdir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(logdir)
        .with_context(|| format!("failed to create {}", logdir.display()))?;
    let started = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let mut suffix = 0u32;
    loop {
        let name = match suffix {
            0 => started.to_string(),
            n => format!("{started}-{n}"),
        };
        let candidate = logdir.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create {}", candidate.display()));
            }
        }
    }
}

/// Downloads MNIST if needed and runs [`fit`] into a fresh
/// `{logdir}/{unix_time}` directory.
pub fn run_training(config: &TrainingConfig) -> anyhow::Result<TrainingReport> {
    config.validate()?;
    let data_dir = config.data_dir.clone().unwrap_or_else(default_data_dir);
    download_mnist(&data_dir)?;
    let train = MnistSplit::load(&data_dir, Split::Train)?;
    let valid = MnistSplit::load(&data_dir, Split::Test)?;

    let run_dir = unique_run_dir(&config.logdir)?;

    fit(
        config,
        &train,
        &valid,
        &run_dir,
        KerasBar::new(config.total_steps()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::tiny_split;

    /// Four classes, each a 2x2 image with one lit pixel: linearly separable.
    fn one_hot_split(n: usize) -> MnistSplit {
        let labels: Vec<u8> = (0..n).map(|i| (i % 4) as u8).collect();
        let images = labels
            .iter()
            .flat_map(|&l| {
                let mut img = [0u8; 4];
                img[l as usize] = 255;
                img
            })
            .collect();
        MnistSplit::new(images, labels, 2, 2).unwrap()
    }

    fn test_config() -> TrainingConfig {
        TrainingConfig {
            batch_size: 4,
            eval_batch_size: 4,
            total_samples: 4 * 50,
            shuffle_buffer: 8,
            learning_rate: 0.1,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn metrics_from_model_output() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, 0.0], [0.0, 1.0], [3.0, 0.0]], &device).unwrap();
        let labels = Tensor::new(&[0u32, 1, 1], &device).unwrap();
        let loss = Tensor::new(0.5f32, &device).unwrap();

        let metrics = Metrics::empty().update(&loss, &logits, &labels).unwrap();
        let computed = metrics.compute();
        assert_eq!(computed["loss"], 0.5);
        assert!((computed["accuracy"] - 2.0 / 3.0).abs() < 1e-9);

        let merged = metrics.update(&Tensor::new(1.5f32, &device).unwrap(), &logits, &labels).unwrap();
        assert_eq!(merged.compute()["loss"], 1.0);
        assert_eq!(merged.accuracy.count(), 6);
    }

    #[test]
    fn train_steps_reduce_loss() {
        let config = test_config();
        let split = one_hot_split(16);
        let mut state = TrainState::create(&config, 4, &Device::Cpu).unwrap();
        let elapsed = Elapsed::new();
        let batch = split.batch(&(0..16).collect::<Vec<_>>());

        eval_step(&mut state, &batch, &elapsed).unwrap();
        let before = state.metrics.loss.compute();
        for _ in 0..30 {
            train_step(&mut state, &batch, &elapsed).unwrap();
        }
        reset_metrics(&mut state).unwrap();
        let logs = eval_step(&mut state, &batch, &elapsed).unwrap();

        assert_eq!(state.step, 30);
        assert!(logs.lookup("loss").unwrap() < before);
        assert_eq!(logs.lookup("accuracy"), Some(1.0));
    }

    #[test]
    fn compute_and_reset_metrics() {
        let config = test_config();
        let split = tiny_split(8);
        let mut state = TrainState::create(&config, 4, &Device::Cpu).unwrap();
        let batch = split.batch(&[0, 1, 2, 3]);
        train_step(&mut state, &batch, &Elapsed::new()).unwrap();

        let logs = compute_metrics(&mut state, &batch, &Elapsed::new()).unwrap();
        assert!(logs.lookup("loss").unwrap() > 0.0);
        assert!(logs.lookup("accuracy").is_some());

        reset_metrics(&mut state).unwrap();
        assert_eq!(state.metrics, Metrics::empty());
    }

    #[test]
    fn checkpoint_restores_parameters_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint_3.safetensors");
        let config = test_config();
        let split = one_hot_split(8);
        let batch = split.batch(&[0, 1, 2, 3]);

        let mut trained = TrainState::create(&config, 4, &Device::Cpu).unwrap();
        for _ in 0..3 {
            train_step(&mut trained, &batch, &Elapsed::new()).unwrap();
        }
        trained.save_checkpoint(&path).unwrap();

        let mut restored = TrainState::create(&config, 4, &Device::Cpu).unwrap();
        restored.load_checkpoint(&path).unwrap();
        assert_eq!(restored.step, 3);

        let (images, _) = batch.to_tensors(&Device::Cpu).unwrap();
        let a: Vec<f32> = trained.model.forward(&images).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = restored.model.forward(&images).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    fn logits(state: &TrainState, batch: &Batch) -> Vec<f32> {
        let (images, _) = batch.to_tensors(state.device()).unwrap();
        state.model.forward(&images).unwrap().flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn snapshot_is_unaffected_by_later_training() {
        let split = one_hot_split(8);
        let batch = split.batch(&[0, 1, 2, 3]);
        let mut state = TrainState::create(&test_config(), 4, &Device::Cpu).unwrap();
        train_step(&mut state, &batch, &Elapsed::new()).unwrap();

        let snapshot = state.snapshot().unwrap();
        let frozen = logits(&snapshot, &batch);
        for _ in 0..5 {
            train_step(&mut state, &batch, &Elapsed::new()).unwrap();
        }

        assert_eq!(logits(&snapshot, &batch), frozen);
        assert_ne!(logits(&state, &batch), frozen);
        assert_eq!(snapshot.step, 1);
    }

    #[test]
    fn early_stopping_restores_best_parameters() {
        let config = test_config();
        let split = one_hot_split(8);
        let batch = split.batch(&[0, 1, 2, 3]);
        let accuracies = [0.9, 0.5, 0.4, 0.3];

        let output = Loop::new()
            .on(every(1), from_fn(train_step))
            .on(
                every(1),
                from_fn(move |_: &mut TrainState, _: &Batch, elapsed: &Elapsed| {
                    let accuracy = accuracies[(elapsed.steps - 1) as usize];
                    Ok(Logs::new().with_metrics([("accuracy_valid", accuracy)], true))
                }),
            )
            .on(
                every(1),
                EarlyStopping::new("accuracy_valid", Mode::Max)
                    .patience(Period::Steps(2))
                    .restore_best_weights(true),
            )
            .run(
                TrainState::create(&config, 4, &Device::Cpu).unwrap(),
                std::iter::repeat(batch.clone()),
            )
            .unwrap();
        assert_eq!(output.elapsed.steps, 3);
        assert_eq!(output.state.step, 1);

        let mut reference = TrainState::create(&config, 4, &Device::Cpu).unwrap();
        train_step(&mut reference, &batch, &Elapsed::new()).unwrap();
        assert_eq!(logits(&output.state, &batch), logits(&reference, &batch));
    }

    #[test]
    fn non_finite_loss_leaves_parameters_untouched() {
        let split = one_hot_split(4);
        let batch = split.batch(&[0, 1, 2, 3]);
        let mut state = TrainState::create(&test_config(), 4, &Device::Cpu).unwrap();
        let device = Device::Cpu;
        state
            .varmap
            .set_one("dense.weight", Tensor::full(f32::NAN, (10, 4), &device).unwrap())
            .unwrap();
        state
            .varmap
            .set_one("dense.bias", Tensor::ones(10, DType::F32, &device).unwrap())
            .unwrap();

        let err = train_step(&mut state, &batch, &Elapsed::new()).unwrap_err();
        assert!(err.to_string().contains("diverged at step 1"));
        assert_eq!(state.step, 0);
        assert_eq!(state.metrics, Metrics::empty());

        let bias: Vec<f32> = state.varmap.data().lock().unwrap()["dense.bias"]
            .to_vec1()
            .unwrap();
        assert_eq!(bias, vec![1.0; 10]);
    }

    #[test]
    fn run_dirs_are_unique_within_a_second() {
        let logdir = tempfile::tempdir().unwrap();
        let first = unique_run_dir(logdir.path()).unwrap();
        let second = unique_run_dir(logdir.path()).unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir() && second.is_dir());
    }

    #[test]
    fn fit_runs_the_full_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let config = test_config();
        let report = fit(
            &config,
            &one_hot_split(40),
            &one_hot_split(20),
            &run_dir,
            KerasBar::hidden(config.total_steps()),
        )
        .unwrap();

        assert!(report.steps <= 50);
        assert!(!report.train.steps.is_empty());
        assert!(!report.valid.steps.is_empty());
        assert!(report.valid.steps.iter().all(|s| *s as u64 % config.eval_steps() == 0));
        assert_eq!(report.train.steps.len(), report.train.accuracy.len());
        assert!(run_dir.join("history.json").exists());

        let best = report.best_checkpoint.unwrap();
        assert!(best.path.exists());
        assert_eq!(Some(best.value.unwrap()), report
            .valid
            .accuracy
            .iter()
            .copied()
            .reduce(f64::max));
    }
}
