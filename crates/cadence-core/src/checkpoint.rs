//! Saving the training state when a monitored metric improves.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::callback::{Callback, LoopState};
use crate::error::{CadenceError, Result};
use crate::logs::Logs;

const INDEX_FILE: &str = "checkpoints.json";

/// Direction in which a monitored metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Min,
    Max,
}

impl Mode {
    /// Whether `value` beats `best` by more than `min_delta`.
    #[must_use]
    pub fn improves(self, value: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Self::Max => value - min_delta > best,
            Self::Min => value + min_delta < best,
        }
    }

    /// The starting point that any finite value improves on.
    #[must_use]
    pub fn worst(self) -> f64 {
        match self {
            Self::Max => f64::NEG_INFINITY,
            Self::Min => f64::INFINITY,
        }
    }
}

/// State that can be written to and restored from a single file.
pub trait Checkpointable {
    /// File extension of the checkpoint format, without the dot.
    const EXTENSION: &'static str;

    fn save_checkpoint(&self, path: &Path) -> anyhow::Result<()>;

    fn load_checkpoint(&mut self, path: &Path) -> anyhow::Result<()>;
}

/// One retained checkpoint as recorded in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub step: u64,
    pub path: PathBuf,
    pub value: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    monitor: Option<String>,
    mode: Option<Mode>,
    checkpoints: Vec<CheckpointRecord>,
}

impl CheckpointIndex {
    fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(INDEX_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Writes `checkpoint_{step}.{ext}` files into a directory.
///
/// With a monitor, a checkpoint is written only when the metric improves on
/// the best value seen so far. The `keep` most recent checkpoints are
/// retained; older files are deleted.
#[derive(Debug)]
pub struct Checkpoint {
    dir: PathBuf,
    monitor: Option<(String, Mode)>,
    keep: usize,
    overwrite: bool,
    best: Option<f64>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            monitor: None,
            keep: 1,
            overwrite: false,
            best: None,
        }
    }

    /// Saves only when `key` improves in direction `mode`.
    #[must_use]
    pub fn monitor(mut self, key: impl Into<String>, mode: Mode) -> Self {
        self.monitor = Some((key.into(), mode));
        self
    }

    /// Number of checkpoints to retain. Zero is treated as one.
    #[must_use]
    pub fn keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    /// Allows writing a step that is not past the last recorded one.
    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Best monitored value saved so far.
    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Saves `state` for `step`, subject to the monitor. Returns the written
    /// path, or `None` when the metric did not improve.
    pub fn save<S: Checkpointable>(
        &mut self,
        state: &S,
        step: u64,
        logs: &Logs,
    ) -> Result<Option<PathBuf>> {
        let value = match &self.monitor {
            Some((key, mode)) => {
                let value = logs
                    .lookup(key)
                    .ok_or_else(|| CadenceError::MissingMetric { key: key.clone() })?;
                let best = self.best.unwrap_or(mode.worst());
                if !mode.improves(value, best, 0.0) {
                    debug!(monitor = %key, value, best, "no improvement, checkpoint skipped");
                    return Ok(None);
                }
                Some(value)
            }
            None => None,
        };

        fs::create_dir_all(&self.dir)?;
        let mut index = CheckpointIndex::load(&self.dir)?;
        let path = self.dir.join(format!("checkpoint_{step}.{}", S::EXTENSION));

        let rewrites = index
            .checkpoints
            .last()
            .is_some_and(|last| last.step >= step);
        if rewrites && !self.overwrite {
            return Err(CadenceError::CheckpointExists { path });
        }

        state.save_checkpoint(&path)?;

        let mut stale = Vec::new();
        if rewrites {
            let (kept, replaced): (Vec<_>, Vec<_>) = std::mem::take(&mut index.checkpoints)
                .into_iter()
                .partition(|record| record.step < step);
            index.checkpoints = kept;
            stale = replaced;
        }
        index.checkpoints.push(CheckpointRecord {
            step,
            path: path.clone(),
            value,
        });
        let excess = index.checkpoints.len().saturating_sub(self.keep);
        stale.extend(index.checkpoints.drain(..excess));

        index.monitor = self.monitor.as_ref().map(|(key, _)| key.clone());
        index.mode = self.monitor.as_ref().map(|(_, mode)| *mode);
        index.save(&self.dir)?;

        // The index no longer lists these, so files are removed last.
        for record in stale.iter().filter(|record| record.path != path) {
            remove_if_present(&record.path)?;
            debug!(path = ?record.path, "removed old checkpoint");
        }

        if value.is_some() {
            self.best = value;
        }
        info!(path = ?path, step, value, "checkpoint saved");
        Ok(Some(path))
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

impl<S: Checkpointable, B> Callback<S, B> for Checkpoint {
    fn call(&mut self, state: &mut S, _batch: &B, ctx: &mut LoopState) -> Result<Logs> {
        self.save(state, ctx.elapsed.steps, &ctx.logs)?;
        Ok(Logs::new())
    }
}

/// Records of the checkpoints retained in `dir`, oldest first.
pub fn list_checkpoints(dir: impl AsRef<Path>) -> Result<Vec<CheckpointRecord>> {
    Ok(CheckpointIndex::load(dir.as_ref())?.checkpoints)
}

/// The most recently written checkpoint in `dir`, if any.
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> Result<Option<CheckpointRecord>> {
    Ok(list_checkpoints(dir)?.pop())
}

/// Loads the most recent checkpoint of `dir` into `state`.
pub fn restore_latest<S: Checkpointable>(
    dir: impl AsRef<Path>,
    state: &mut S,
) -> Result<Option<CheckpointRecord>> {
    let Some(record) = latest_checkpoint(dir)? else {
        return Ok(None);
    };
    state.load_checkpoint(&record.path)?;
    info!(path = ?record.path, step = record.step, "checkpoint restored");
    Ok(Some(record))
}
