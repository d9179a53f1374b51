// src/telemetry.rs

//! Logging setup, run statistics and severity reporting
//!
//! Every run logs to the console and to a file in the migration workspace. A
//! counting layer tallies WARN and ERROR events for the session summary.
//!
//! Critical failures go through [`Severity::Critical`], which turns into the
//! abort signal unless the operator asked to continue past critical errors.

use crate::{Error, Result};
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{Event, Level, Subscriber, error, warn};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

static ERRORS: AtomicU64 = AtomicU64::new(0);
static WARNINGS: AtomicU64 = AtomicU64::new(0);
static CONTINUE_ON_CRITICAL: AtomicBool = AtomicBool::new(false);

/// Number of ERROR events logged in this process
pub fn errors() -> u64 {
    ERRORS.load(Ordering::Relaxed)
}

/// Number of WARN events logged in this process
pub fn warnings() -> u64 {
    WARNINGS.load(Ordering::Relaxed)
}

/// Continue past critical errors instead of aborting
pub fn set_continue_on_critical(enabled: bool) {
    CONTINUE_ON_CRITICAL.store(enabled, Ordering::Relaxed);
}

/// Counts WARN and ERROR events
struct CountingLayer;

impl<S: Subscriber> Layer<S> for CountingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::ERROR => {
                ERRORS.fetch_add(1, Ordering::Relaxed);
            }
            Level::WARN => {
                WARNINGS.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Map the configured level names to tracing directives
fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "trace" => "trace",
        "warning" | "warn" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

/// Install the global subscriber for a command run
///
/// Returns the log file path. `RUST_LOG` overrides the configured level.
pub fn init(app: &str, workspace: &Path, level: &str, continue_on_critical: bool) -> Result<PathBuf> {
    set_continue_on_critical(continue_on_critical);

    fs::create_dir_all(workspace)?;
    let log_path = workspace.join(format!(
        "{}-{}.log",
        app,
        Local::now().format("%Y%m%d-%H%M%S")
    ));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .with(CountingLayer)
        .try_init()
        .map_err(|e| Error::InitError(format!("Failed to install log subscriber: {e}")))?;

    Ok(log_path)
}

/// Operator-facing severity of a reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Degraded continuation
    Warning,
    /// An operation within a revision failed
    Error,
    /// The run cannot meaningfully continue
    Critical,
}

impl Severity {
    /// Log `message` at this severity
    ///
    /// Critical reports return [`Error::Aborted`] unless continuing on critical
    /// errors was requested.
    pub fn report(self, message: &str) -> Result<()> {
        match self {
            Self::Warning => warn!("{}", message),
            Self::Error => error!("{}", message),
            Self::Critical => {
                error!("[CRITICAL] {}", message);
                if !CONTINUE_ON_CRITICAL.load(Ordering::Relaxed) {
                    return Err(Error::Aborted(message.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Hosting type shown in session banners
pub fn hosting_type(url: &str) -> &'static str {
    let url = url.to_ascii_lowercase();
    if url.contains("dev.azure.com") || url.contains("visualstudio.com") {
        "Cloud"
    } else {
        "Server"
    }
}

/// Format an elapsed duration as `hh:mm:ss`
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Log a session banner as aligned `key : value` lines
pub fn log_banner(title: &str, entries: &[(&str, String)]) {
    let width = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    tracing::info!("===== {} =====", title);
    for (key, value) in entries {
        tracing::info!("{:width$} : {}", key, value, width = width);
    }
}
