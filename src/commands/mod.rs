// src/commands/mod.rs
//! Command handlers for the wi-migrate CLI

mod export;
mod import;
mod status;

pub use export::cmd_export;
pub use import::cmd_import;
pub use status::cmd_status;

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use std::path::Path;
use workitem_migrator::ConfigFile;

/// Load the configuration file named on the command line
pub(crate) fn load_config(path: &Path) -> Result<ConfigFile> {
    ConfigFile::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Ask a yes/no question on the terminal
pub(crate) fn confirm(question: &str) -> bool {
    print!("{question} ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}
