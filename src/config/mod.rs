use anyhow::{anyhow, bail, Result};
use clap::{Args, Subcommand};
use std::{
    env, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::args::BaseArgs;
use crate::ui::{print_command_status, CommandStatus};

mod get;
mod list;
mod set;

const CONFIG_DIR: &str = "odf";
const LOCAL_DIR: &str = ".odf";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub url: Option<String>,
    pub database: Option<String>,
    pub login: Option<String>,
    pub batch_size: Option<usize>,
    pub workers: Option<usize>,
    pub export_batch_size: Option<usize>,
    pub export_workers: Option<usize>,
    pub session_root: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

pub const KNOWN_KEYS: &[&str] = &[
    "url",
    "database",
    "login",
    "batch_size",
    "workers",
    "export_batch_size",
    "export_workers",
    "session_root",
];

impl Config {
    pub fn get_field(&self, key: &str) -> Option<Value> {
        match key {
            "url" => self.url.clone().map(Value::String),
            "database" => self.database.clone().map(Value::String),
            "login" => self.login.clone().map(Value::String),
            "batch_size" => self.batch_size.map(Value::from),
            "workers" => self.workers.map(Value::from),
            "export_batch_size" => self.export_batch_size.map(Value::from),
            "export_workers" => self.export_workers.map(Value::from),
            "session_root" => self.session_root.clone().map(Value::String),
            _ => None,
        }
    }

    /// Sets `key`, parsing counts. Errors on a value the key cannot hold.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        let count = || -> Result<Option<usize>> {
            match value.trim().parse::<usize>() {
                Ok(0) | Err(_) => bail!("{key} must be a positive integer, got {value:?}"),
                Ok(n) => Ok(Some(n)),
            }
        };
        match key {
            "url" => self.url = Some(value.to_string()),
            "database" => self.database = Some(value.to_string()),
            "login" => self.login = Some(value.to_string()),
            "batch_size" => self.batch_size = count()?,
            "workers" => self.workers = count()?,
            "export_batch_size" => self.export_batch_size = count()?,
            "export_workers" => self.export_workers = count()?,
            "session_root" => self.session_root = Some(value.to_string()),
            _ => bail!("Unknown config key: {key}"),
        }
        Ok(())
    }

    pub fn unset_field(&mut self, key: &str) -> bool {
        match key {
            "url" => self.url = None,
            "database" => self.database = None,
            "login" => self.login = None,
            "batch_size" => self.batch_size = None,
            "workers" => self.workers = None,
            "export_batch_size" => self.export_batch_size = None,
            "export_workers" => self.export_workers = None,
            "session_root" => self.session_root = None,
            _ => return false,
        }
        true
    }

    pub fn non_empty_fields(&self) -> Vec<(&'static str, Value)> {
        KNOWN_KEYS
            .iter()
            .filter_map(|&key| self.get_field(key).map(|v| (key, v)))
            .collect()
    }

    fn merge(&self, other: &Config) -> Config {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        Config {
            url: other.url.clone().or_else(|| self.url.clone()),
            database: other.database.clone().or_else(|| self.database.clone()),
            login: other.login.clone().or_else(|| self.login.clone()),
            batch_size: other.batch_size.or(self.batch_size),
            workers: other.workers.or(self.workers),
            export_batch_size: other.export_batch_size.or(self.export_batch_size),
            export_workers: other.export_workers.or(self.export_workers),
            session_root: other.session_root.clone().or_else(|| self.session_root.clone()),
            extra,
        }
    }
}

/// Text form of a config value for plain output.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join(CONFIG_DIR));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join(CONFIG_DIR))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join("config.json"))
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("Warning: unknown config key {} in {}", key, path.display()),
        );
    }

    config
}

pub fn load_global() -> Result<Config> {
    Ok(load_file(&global_path()?))
}

pub fn load() -> Result<Config> {
    let global = load_global().unwrap_or_default();
    let local = match local_path() {
        Some(p) => load_file(&p),
        None => Config::default(),
    };
    Ok(global.merge(&local))
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

pub fn find_local_config_dir() -> Option<PathBuf> {
    let home = dirs::home_dir();
    let mut current_dir = std::env::current_dir().ok()?;

    loop {
        if current_dir.join(LOCAL_DIR).is_dir() {
            return Some(current_dir.join(LOCAL_DIR));
        }
        if current_dir.join(".git").exists() {
            return None;
        }
        if Some(&current_dir) == home.as_ref() {
            return None;
        }
        if !current_dir.pop() {
            return None;
        }
    }
}

pub fn local_path() -> Option<PathBuf> {
    find_local_config_dir().map(|dir| dir.join("config.json"))
}

/// Resolve which config file to write based on --global/--local flags.
///
/// `--local` creates `.odf/` in the current directory when none is found.
pub fn resolve_write_path(global: bool, local: bool) -> Result<PathBuf> {
    if global {
        return global_path();
    }
    match local_path() {
        Some(p) => Ok(p),
        None if local => Ok(std::env::current_dir()?.join(LOCAL_DIR).join("config.json")),
        None => global_path(),
    }
}

/// Directory holding export sessions: `session_root` from config, or the
/// platform cache directory.
pub fn session_root(config: &Config) -> Result<PathBuf> {
    if let Some(root) = config.session_root.as_deref().filter(|r| !r.trim().is_empty()) {
        return Ok(PathBuf::from(root));
    }
    dirs::cache_dir()
        .map(|dir| dir.join(CONFIG_DIR).join("sessions"))
        .ok_or_else(|| anyhow!("no cache directory; set session_root with `odf config set`"))
}

// --- CLI commands ---

#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// Apply to global config (~/.config/odf/config.json)
    #[arg(long, short = 'g', conflicts_with = "local")]
    global: bool,

    /// Apply to local config (.odf/config.json)
    #[arg(long, short = 'l')]
    local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommands {
    /// List config values
    List {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Show config values grouped by source
        #[arg(long)]
        verbose: bool,
    },
    /// Get a config value
    Get {
        /// Config key (url, database, login, batch_size, workers, ...)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set a config value
    Set {
        /// Config key (url, database, login, batch_size, workers, ...)
        key: String,
        /// Value to set
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove a config value
    Unset {
        /// Config key (url, database, login, batch_size, workers, ...)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn validate_key(key: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        bail!(
            "Unknown config key: {key}\nValid keys: {}",
            KNOWN_KEYS.join(", ")
        );
    }
    Ok(())
}

pub fn run(base: BaseArgs, args: ConfigArgs) -> Result<()> {
    match args.command {
        None => list::run(base, false, false, false),
        Some(ConfigCommands::List { scope, verbose }) => {
            list::run(base, scope.global, scope.local, verbose)
        }
        Some(ConfigCommands::Get { key, scope }) => {
            validate_key(&key)?;
            get::run(base, &key, scope.global, scope.local)
        }
        Some(ConfigCommands::Set { key, value, scope }) => {
            validate_key(&key)?;
            set::run(&key, &value, scope.global, scope.local)
        }
        Some(ConfigCommands::Unset { key, scope }) => {
            validate_key(&key)?;
            set::unset(&key, scope.global, scope.local)
        }
    }
}
