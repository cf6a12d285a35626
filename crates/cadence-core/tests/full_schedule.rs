//! Drives a toy model through the same kind of schedule a real training run
//! uses: a train step every step, metric logging and reset on a shorter
//! period, and validation with checkpointing and early stopping on a longer one.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use cadence_core::{
    Average, Checkpoint, Checkpointable, EarlyStopping, Elapsed, KerasBar, Logs, Loop,
    LoopOutput, Metric, Mode, Period, boxed, every, from_fn, from_state_fn, inner_loop,
    list_checkpoints,
};

/// Learns a single scalar towards the mean of the batches it sees.
#[derive(Debug, Clone, Default)]
struct ToyState {
    weight: f64,
    loss: Average,
}

impl ToyState {
    fn metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([("loss".to_string(), self.loss.compute())])
    }
}

impl Checkpointable for ToyState {
    const EXTENSION: &'static str = "json";

    fn save_checkpoint(&self, path: &Path) -> anyhow::Result<()> {
        fs::write(path, serde_json::to_string(&self.weight)?)?;
        Ok(())
    }

    fn load_checkpoint(&mut self, path: &Path) -> anyhow::Result<()> {
        self.weight = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(())
    }
}

fn batch_loss(weight: f64, batch: &[f64]) -> f64 {
    batch.iter().map(|x| (x - weight).powi(2)).sum::<f64>() / batch.len() as f64
}

fn train_step(state: &mut ToyState, batch: &Vec<f64>, _: &Elapsed) -> anyhow::Result<Logs> {
    let loss = batch_loss(state.weight, batch);
    let grad = batch.iter().map(|x| state.weight - x).sum::<f64>() * 2.0 / batch.len() as f64;
    state.weight -= 0.1 * grad;
    state.loss = state.loss.merge(&Average::from_value(loss));
    Ok(Logs::new())
}

fn eval_step(state: &mut ToyState, batch: &Vec<f64>, _: &Elapsed) -> anyhow::Result<Logs> {
    let loss = batch_loss(state.weight, batch);
    state.loss = state.loss.merge(&Average::from_value(loss));
    Ok(Logs::new().with_metrics(state.metrics(), true))
}

fn compute_metrics(state: &mut ToyState, _: &Vec<f64>, _: &Elapsed) -> anyhow::Result<Logs> {
    Ok(Logs::new().with_metrics(state.metrics(), true))
}

fn reset_metrics(state: &mut ToyState) -> anyhow::Result<()> {
    state.loss = Average::empty();
    Ok(())
}

#[test]
fn train_validate_checkpoint_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt_dir = dir.path().join("run");
    let valid: Vec<Vec<f64>> = vec![vec![3.0, 3.0], vec![3.0, 3.0]];

    let output = Loop::new()
        .on(every(1), from_fn(train_step))
        .on_many(
            every(2),
            vec![boxed(from_fn(compute_metrics)), boxed(from_state_fn(reset_metrics))],
        )
        .on_many(
            every(5),
            vec![
                boxed(inner_loop("valid", |state: ToyState| {
                    Loop::new()
                        .on_start(reset_metrics)
                        .on(every(1), from_fn(eval_step))
                        .run(state, valid.clone())
                })),
                boxed(Checkpoint::new(&ckpt_dir).monitor("loss_valid", Mode::Min)),
                boxed(
                    EarlyStopping::new("loss_valid", Mode::Min).patience(Period::Steps(10)),
                ),
            ],
        )
        .on(every(1), KerasBar::hidden(50))
        .stop(50)
        .run(ToyState::default(), std::iter::repeat(vec![3.0, 3.0, 3.0, 3.0]))
        .unwrap();

    assert_eq!(output.elapsed.steps, 50);
    assert!((output.state.weight - 3.0).abs() < 1e-3);

    let columns = output.history.collect(&["steps", "loss"]).unwrap();
    assert_eq!(columns[0].len(), 25);
    assert!(columns[1].first().unwrap() > columns[1].last().unwrap());

    let valid_columns = output.history.collect(&["steps", "loss_valid"]).unwrap();
    assert_eq!(valid_columns[0], (1..=10).map(|i| (i * 5) as f64).collect::<Vec<_>>());

    // the validation loss keeps improving, so the last evaluation is the one kept
    let records = list_checkpoints(&ckpt_dir).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].step, 50);
}

#[test]
fn plateau_triggers_early_stop() {
    let valid: Vec<Vec<f64>> = vec![vec![1.0]];
    let evaluate = |state: ToyState| -> cadence_core::Result<LoopOutput<ToyState>> {
        Loop::new()
            .on_start(reset_metrics)
            .on(every(1), from_fn(eval_step))
            .run(state, valid.clone())
    };

    // weight never moves: no train step registered
    let output = Loop::new()
        .on_many(
            every(3),
            vec![
                boxed(inner_loop("valid", evaluate)),
                boxed(EarlyStopping::new("loss_valid", Mode::Min).patience(Period::Steps(6))),
            ],
        )
        .stop(100)
        .run(ToyState::default(), std::iter::repeat(vec![0.0]))
        .unwrap();

    // improvement at step 3 only; 6 steps later the wait is exhausted
    assert_eq!(output.elapsed.steps, 9);
}
