//! Keras-style progress bar.

use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressStyle};

use crate::callback::{Callback, LoopState};
use crate::error::Result;
use crate::logs::Logs;

const TEMPLATE: &str = "{pos}/{len} [{bar:30.cyan/blue}] {elapsed_precise} - {msg}";

/// Progress bar advanced on every step, showing the latest metric values.
///
/// Attach it with `every(1)` after the other callbacks so it sees the logs
/// they produced on the same step.
pub struct KerasBar {
    bar: ProgressBar,
    latest: BTreeMap<String, f64>,
}

impl KerasBar {
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self::with_bar(ProgressBar::new(total))
    }

    /// A bar that tracks progress but draws nothing.
    #[must_use]
    pub fn hidden(total: u64) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_length(total);
        Self::with_bar(bar)
    }

    fn with_bar(bar: ProgressBar) -> Self {
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        Self {
            bar,
            latest: BTreeMap::new(),
        }
    }

    /// Steps drawn so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// The message currently displayed next to the bar.
    #[must_use]
    pub fn message(&self) -> String {
        self.latest
            .iter()
            .map(|(name, value)| format!("{name}: {value:.4}"))
            .collect::<Vec<_>>()
            .join(" - ")
    }
}

impl<S, B> Callback<S, B> for KerasBar {
    fn call(&mut self, _state: &mut S, _batch: &B, ctx: &mut LoopState) -> Result<Logs> {
        let mut changed = false;
        for (name, value) in ctx.logs.metric_entries() {
            self.latest.insert(name.to_string(), value);
            changed = true;
        }
        if changed {
            self.bar.set_message(self.message());
        }
        self.bar.set_position(ctx.elapsed.steps);
        Ok(Logs::new())
    }

    fn on_end(&mut self, _state: &mut S, _ctx: &LoopState) -> Result<()> {
        self.bar.finish();
        Ok(())
    }
}
