use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;

mod args;
mod commands;
mod config;
mod env;
mod logging;
mod ui;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("ODF_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(name = "odf", about = "Bulk import and export for ERP models", version = CLI_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load a CSV or JSONL file into a model
    Import(CLIArgs<commands::import::ImportArgs>),
    /// Write model records to a CSV or JSONL file, resuming interrupted runs
    Export(CLIArgs<commands::export::ExportArgs>),
    /// Inspect or clear saved export progress
    Session(CLIArgs<commands::session::SessionArgs>),
    /// Manage persistent settings
    Config(CLIArgs<config::ConfigArgs>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);

    match cli.command {
        Commands::Import(cmd) => {
            logging::init(&cmd.base)?;
            commands::import::run(cmd.base, cmd.args).await?
        }
        Commands::Export(cmd) => {
            logging::init(&cmd.base)?;
            commands::export::run(cmd.base, cmd.args).await?
        }
        Commands::Session(cmd) => {
            logging::init(&cmd.base)?;
            commands::session::run(cmd.base, cmd.args)?
        }
        Commands::Config(cmd) => {
            logging::init(&cmd.base)?;
            config::run(cmd.base, cmd.args)?
        }
    }

    Ok(())
}
