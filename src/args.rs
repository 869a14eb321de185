use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Increase log detail (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Append logs to this file instead of stderr
    #[arg(long, env = "ODF_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Server URL (or via ODF_URL)
    #[arg(long, env = "ODF_URL", hide_env_values = true, global = true)]
    pub url: Option<String>,

    /// Database name (or via ODF_DATABASE)
    #[arg(long, env = "ODF_DATABASE", hide_env_values = true, global = true)]
    pub database: Option<String>,

    /// Login user (or via ODF_LOGIN)
    #[arg(long, env = "ODF_LOGIN", hide_env_values = true, global = true)]
    pub login: Option<String>,

    /// Password or API key (or via ODF_PASSWORD)
    #[arg(long, env = "ODF_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "ODF_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
