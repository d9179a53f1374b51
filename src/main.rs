// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Export {
            run,
            url,
            user,
            password,
        }) => commands::cmd_export(&run, &url, &user, &password),
        Some(Commands::Import {
            run,
            url,
            token,
            dry_run,
        }) => commands::cmd_import(&run, &url, &token, dry_run),
        Some(Commands::Status { config }) => commands::cmd_status(&config),
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
