//! Per-step logs and the loop history built from them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::elapsed::Elapsed;
use crate::error::{CadenceError, Result};

/// Metrics that are averaged or replaced by the consumer.
pub const METRICS: &str = "metrics";
/// Metrics that already carry their own accumulation (running averages).
pub const STATEFUL_METRICS: &str = "stateful_metrics";
/// Loop progress stamped on every history entry.
pub const ELAPSED: &str = "elapsed";

const LOOKUP_ORDER: [&str; 3] = [STATEFUL_METRICS, METRICS, ELAPSED];

/// Named values produced during one loop step, grouped by collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Logs {
    collections: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Logs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single value to `collection`, replacing any previous one.
    pub fn add(&mut self, collection: &str, name: impl Into<String>, value: f64) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(name.into(), value);
    }

    pub fn add_metric(&mut self, name: impl Into<String>, value: f64) {
        self.add(METRICS, name, value);
    }

    /// Adds every value of `metrics`, either as plain or stateful metrics.
    pub fn add_metrics<K, I>(&mut self, metrics: I, stateful: bool)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, f64)>,
    {
        let collection = if stateful { STATEFUL_METRICS } else { METRICS };
        for (name, value) in metrics {
            self.add(collection, name, value);
        }
    }

    /// Stamps the loop's progress: `steps`, `samples` and `time` in seconds.
    pub fn add_elapsed(&mut self, elapsed: &Elapsed) {
        self.add(ELAPSED, "steps", elapsed.steps as f64);
        self.add(ELAPSED, "samples", elapsed.samples as f64);
        self.add(ELAPSED, "time", elapsed.seconds());
    }

    /// Builder form of [`Logs::add_metrics`].
    #[must_use]
    pub fn with_metrics<K, I>(mut self, metrics: I, stateful: bool) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, f64)>,
    {
        self.add_metrics(metrics, stateful);
        self
    }

    /// Folds `other` into `self`. Values in `other` win on collisions.
    pub fn merge(&mut self, other: Logs) {
        for (collection, values) in other.collections {
            self.collections.entry(collection).or_default().extend(values);
        }
    }

    /// Finds `key` in the stateful metrics, then the metrics, then elapsed.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<f64> {
        LOOKUP_ORDER.iter().find_map(|collection| {
            self.collections
                .get(*collection)
                .and_then(|values| values.get(key))
                .copied()
        })
    }

    #[must_use]
    pub fn collection(&self, collection: &str) -> Option<&BTreeMap<String, f64>> {
        self.collections.get(collection)
    }

    /// Renames every metric `k` to `k_{suffix}` and drops elapsed values.
    #[must_use]
    pub fn with_suffix(self, suffix: &str) -> Self {
        let collections = self
            .collections
            .into_iter()
            .filter(|(collection, _)| collection != ELAPSED)
            .map(|(collection, values)| {
                let renamed = values
                    .into_iter()
                    .map(|(name, value)| (format!("{name}_{suffix}"), value))
                    .collect();
                (collection, renamed)
            })
            .collect();
        Self { collections }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.values().all(BTreeMap::is_empty)
    }

    /// Metric values across collections, without elapsed values.
    pub fn metric_entries(&self) -> impl Iterator<Item = (&str, f64)> {
        self.collections
            .iter()
            .filter(|(collection, _)| collection.as_str() != ELAPSED)
            .flat_map(|(_, values)| values.iter().map(|(k, v)| (k.as_str(), *v)))
    }
}

/// The logs of every step that produced any, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<Logs>,
}

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `logs` unless they are empty.
    pub fn push(&mut self, logs: Logs) {
        if !logs.is_empty() {
            self.entries.push(logs);
        }
    }

    #[must_use]
    pub fn last(&self) -> Option<&Logs> {
        self.entries.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Logs> {
        self.entries.iter()
    }

    /// Returns one column per key, taken from the entries holding every key.
    pub fn collect(&self, keys: &[&str]) -> Result<Vec<Vec<f64>>> {
        if let Some(missing) = keys
            .iter()
            .find(|key| self.entries.iter().all(|logs| logs.lookup(key).is_none()))
        {
            return Err(CadenceError::MissingHistoryKey {
                key: missing.to_string(),
            });
        }

        let mut columns = vec![Vec::new(); keys.len()];
        for logs in &self.entries {
            let row: Option<Vec<f64>> = keys.iter().map(|key| logs.lookup(key)).collect();
            if let Some(row) = row {
                for (column, value) in columns.iter_mut().zip(row) {
                    column.push(value);
                }
            }
        }
        Ok(columns)
    }

    /// Writes the history as pretty-printed JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl FromIterator<Logs> for History {
    fn from_iter<T: IntoIterator<Item = Logs>>(iter: T) -> Self {
        let mut history = Self::new();
        for logs in iter {
            history.push(logs);
        }
        history
    }
}
