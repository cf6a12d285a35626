//! Mergeable metric accumulators.
//!
//! Metrics are values, not sinks: a step builds a single-batch metric and
//! merges it into the running one. Nothing here depends on a tensor library.

use std::collections::BTreeMap;

use anyhow::anyhow;

use crate::error::Result;

/// A metric that can be accumulated batch by batch.
pub trait Metric: Clone + Default {
    /// Combines two partial accumulations.
    #[must_use]
    fn merge(&self, other: &Self) -> Self;

    /// Final value of the accumulation so far.
    fn compute(&self) -> f64;

    /// An accumulation that has seen nothing.
    #[must_use]
    fn empty() -> Self {
        Self::default()
    }
}

/// Running mean of scalar observations.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Average {
    pub total: f64,
    pub count: u64,
}

impl Average {
    /// One observation of `value`.
    #[must_use]
    pub fn from_value(value: f64) -> Self {
        Self {
            total: value,
            count: 1,
        }
    }

    /// One observation per element of `values`.
    #[must_use]
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            total: values.iter().sum(),
            count: values.len() as u64,
        }
    }
}

impl Metric for Average {
    fn merge(&self, other: &Self) -> Self {
        Self {
            total: self.total + other.total,
            count: self.count + other.count,
        }
    }

    fn compute(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// Fraction of examples whose predicted class equals the label.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accuracy(Average);

impl Accuracy {
    pub fn from_predictions(predictions: &[u32], labels: &[u32]) -> Result<Self> {
        if predictions.len() != labels.len() {
            return Err(anyhow!(
                "accuracy: {} predictions for {} labels",
                predictions.len(),
                labels.len()
            )
            .into());
        }
        let correct = predictions
            .iter()
            .zip(labels)
            .filter(|(p, l)| p == l)
            .count();
        Ok(Self(Average {
            total: correct as f64,
            count: labels.len() as u64,
        }))
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.0.count
    }
}

impl Metric for Accuracy {
    fn merge(&self, other: &Self) -> Self {
        Self(self.0.merge(&other.0))
    }

    fn compute(&self) -> f64 {
        self.0.compute()
    }
}

/// A named group of metrics updated together.
pub trait Collection: Clone {
    #[must_use]
    fn merge(&self, other: &Self) -> Self;

    fn compute(&self) -> BTreeMap<String, f64>;

    #[must_use]
    fn empty() -> Self;
}
