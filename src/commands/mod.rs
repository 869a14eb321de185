use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use odf::remote::RemoteStore;
use odf::source::SourceFormat;
use odf::{JsonRpcConfig, JsonRpcStore};
use tracing::debug;

use crate::args::BaseArgs;
use crate::config::Config;

pub mod export;
pub mod import;
pub mod session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Csv,
    Jsonl,
}

impl From<FormatArg> for SourceFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Csv => SourceFormat::Csv,
            FormatArg::Jsonl => SourceFormat::Jsonl,
        }
    }
}

/// Opens the remote store from flags, environment, then config files.
pub fn connect(base: &BaseArgs, config: &Config) -> Result<Arc<dyn RemoteStore>> {
    let url = base.url.clone().or_else(|| config.url.clone());
    let database = base.database.clone().or_else(|| config.database.clone());
    let login = base.login.clone().or_else(|| config.login.clone());
    let Some(url) = url else {
        bail!("no server URL; pass --url, set ODF_URL, or run `odf config set url <url>`");
    };
    let Some(database) = database else {
        bail!("no database; pass --database, set ODF_DATABASE, or run `odf config set database <name>`");
    };
    let Some(login) = login else {
        bail!("no login; pass --login, set ODF_LOGIN, or run `odf config set login <user>`");
    };
    let Some(password) = base.password.clone() else {
        bail!("no password; pass --password or set ODF_PASSWORD");
    };
    debug!(%url, %database, %login, "connecting");
    let store = JsonRpcStore::new(JsonRpcConfig::new(&url, &database, &login, &password))
        .context("failed to set up the remote connection")?;
    Ok(Arc::new(store))
}

/// Flag raised on the first Ctrl+C.
pub fn interrupt_flag() -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted_signal.store(true, Ordering::SeqCst);
        }
    });
    interrupted
}

pub fn parse_separator(value: &str) -> Result<u8> {
    let value = match value {
        "\\t" | "tab" => "\t",
        other => other,
    };
    match value.as_bytes() {
        [byte] => Ok(*byte),
        _ => bail!("separator must be a single ASCII character, got {value:?}"),
    }
}
