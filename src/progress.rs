// src/progress.rs

//! Progress reporting for export and import runs
//!
//! The command loops report through [`ProgressTracker`]; [`for_terminal`] picks
//! an indicatif bar when stderr is a terminal and periodic log lines otherwise,
//! so unattended migrations leave their progress in the workspace log.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Progress of one command loop
pub trait ProgressTracker: Send + Sync {
    /// Name the item currently being processed
    fn set_message(&self, message: &str);

    /// Count `amount` more items as handled
    fn increment(&self, amount: u64);

    /// Extend the total with items discovered during the run
    fn grow(&self, amount: u64);

    fn finish_with_message(&self, message: &str);
}

/// Pick the tracker for the current output: a bar on a terminal, log lines otherwise
pub fn for_terminal(name: &str, length: u64) -> Box<dyn ProgressTracker> {
    if std::io::stderr().is_terminal() {
        Box::new(CliProgress::new(name, length))
    } else {
        Box::new(LogProgress::new(name, length))
    }
}

/// Percentage to report when moving from `old` to `new` crosses a tenth of `length`
fn milestone(old: u64, new: u64, length: u64) -> Option<u64> {
    let step = (length / 10).max(1);
    (length > 0 && new / step > old / step).then(|| (new * 100 / length).min(100))
}

/// Progress written to the log at every tenth of the total
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    position: AtomicU64,
    length: AtomicU64,
}

impl LogProgress {
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            position: AtomicU64::new(0),
            length: AtomicU64::new(length),
        }
    }
}

impl ProgressTracker for LogProgress {
    fn set_message(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }

    fn increment(&self, amount: u64) {
        let old = self.position.fetch_add(amount, Ordering::Relaxed);
        let length = self.length.load(Ordering::Relaxed);
        if let Some(percent) = milestone(old, old + amount, length) {
            info!("{}: {}% ({}/{})", self.name, percent, old + amount, length);
        }
    }

    fn grow(&self, amount: u64) {
        self.length.fetch_add(amount, Ordering::Relaxed);
    }

    fn finish_with_message(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }
}

/// Terminal progress bar
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub fn new(name: &str, length: u64) -> Self {
        let bar = ProgressBar::new(length);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} ({pos}/{len}) [{bar:40.green/dim}] {percent}% {wide_msg}")
                .expect("Invalid progress bar template")
                .progress_chars("##-"),
        );
        bar.set_prefix(name.to_string());
        Self { bar }
    }
}

impl ProgressTracker for CliProgress {
    fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn increment(&self, amount: u64) {
        self.bar.inc(amount);
    }

    fn grow(&self, amount: u64) {
        self.bar.inc_length(amount);
    }

    fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}
