// src/lib.rs

//! Work item migration from Jira to Azure DevOps
//!
//! A migration runs in two phases that share a workspace folder:
//!
//! - Export: issues and their changelogs are pulled from Jira, rebuilt into
//!   ordered revisions (`source`), translated into target revisions (`mapper`)
//!   and persisted as one JSON record per item (`model`).
//! - Import: every persisted revision is scheduled by time (`plan`) and replayed
//!   against the target project (`replay`). Progress is recorded in an
//!   append-only journal (`journal`) so an interrupted run resumes where it left
//!   off.

pub mod config;
pub mod context;
mod error;
pub mod journal;
pub mod mapper;
pub mod model;
pub mod plan;
pub mod progress;
pub mod replay;
pub mod source;
pub mod telemetry;

pub use config::ConfigFile;
pub use context::MigrationContext;
pub use error::{Error, Result};
pub use journal::Journal;
pub use plan::{ExecutionItem, ExecutionPlan};
pub use progress::{CliProgress, LogProgress, ProgressTracker};
pub use replay::{Agent, AgentSettings, ImportOutcome};
