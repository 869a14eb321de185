use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use crate::args::BaseArgs;

const LOG_ENV: &str = "ODF_LOG";

fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "odf=info",
        1 => "odf=debug",
        _ => "odf=trace",
    }
}

/// Installs the global subscriber. `ODF_LOG` overrides the `-v` level.
pub fn init(base: &BaseArgs) -> Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives.trim())
            .with_context(|| format!("invalid {LOG_ENV} value"))?,
        _ => EnvFilter::new(default_directive(base.verbose)),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = match &base.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install logger: {err}"))
}
