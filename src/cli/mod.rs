// src/cli/mod.rs
//! CLI definitions for the work item migrator
//!
//! The actual command implementations are in the `commands` module.
//!
//! - `export` - Pull issues from Jira into the workspace
//! - `import` - Replay the workspace into an Azure DevOps project
//! - `status` - Show workspace and journal counts

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wi-migrate")]
#[command(author = "Work Item Migrator Contributors")]
#[command(version)]
#[command(about = "Migrate Jira issues with their full history into Azure DevOps work items", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Options shared by the export and import runs
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Migration configuration file (JSON, or TOML with a .toml extension)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Ignore previously exported or imported state and start over
    #[arg(short, long)]
    pub force: bool,

    /// Keep going after critical errors
    #[arg(long = "continue")]
    pub continue_on_critical: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export Jira issues, their history and attachments into the workspace
    Export {
        #[command(flatten)]
        run: RunArgs,

        /// Jira base URL
        #[arg(long)]
        url: String,

        /// Jira user name or account email
        #[arg(short, long)]
        user: String,

        /// Jira password or API token
        #[arg(short, long, env = "JIRA_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Replay exported revisions into the target project
    Import {
        #[command(flatten)]
        run: RunArgs,

        /// Azure DevOps collection or organization URL
        #[arg(long)]
        url: String,

        /// Personal access token
        #[arg(short, long, env = "ADO_TOKEN", hide_env_values = true, default_value = "")]
        token: String,

        /// Replay into an in-memory project instead of the remote one
        #[arg(long)]
        dry_run: bool,
    },

    /// Show exported items, planned revisions and journal progress
    Status {
        /// Migration configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}
