use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Args;
use comfy_table::Cell;
use odf::coordinator::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_RELATION_LINKS, DEFAULT_WORKERS};
use odf::executor::DEFAULT_MAX_CONSECUTIVE_FAILED_BATCHES;
use odf::failures::write_fail_file;
use odf::source::{self, ColumnTransform, SourceFormat};
use odf::{ImportOptions, MetadataCache, MultiPassCoordinator, TransferReport};
use serde::Serialize;
use tracing::info;

use super::{connect, parse_separator, FormatArg};
use crate::args::BaseArgs;
use crate::config;
use crate::ui::{
    apply_column_padding, bounded_bar, format_duration, format_usize_commas, header,
    print_command_status, styled_table, truncate, CommandStatus,
};

const FAILURE_PREVIEW_ROWS: usize = 20;

#[derive(Debug, Clone, Args)]
pub struct ImportArgs {
    /// Target model, e.g. res.partner
    pub model: String,

    /// File to import
    #[arg(long, short = 'f')]
    pub file: PathBuf,

    /// Input format (defaults to the file extension)
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,

    /// CSV field separator
    #[arg(long, short = 's', default_value = ",")]
    pub separator: String,

    /// Records per write call
    #[arg(long, env = "ODF_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Concurrent write calls
    #[arg(long, short = 'w', env = "ODF_WORKERS")]
    pub workers: Option<usize>,

    /// Column whose equal values are never written concurrently, e.g. parent_id
    #[arg(long)]
    pub partition_key: Option<String>,

    /// Where to write failed rows (defaults to <file>_fail.csv)
    #[arg(long)]
    pub fail_file: Option<PathBuf>,

    /// Linked records per batch when writing to-many relations
    #[arg(long, default_value_t = DEFAULT_MAX_RELATION_LINKS)]
    pub max_relation_links: usize,

    /// Give up on the model when a pass runs longer than this many seconds
    #[arg(long)]
    pub pass_timeout: Option<u64>,

    /// Columns to leave out, comma separated
    #[arg(long, value_delimiter = ',')]
    pub ignore: Vec<String>,

    /// Stop after this many failed batches in a row (0 never stops)
    #[arg(long, default_value_t = DEFAULT_MAX_CONSECUTIVE_FAILED_BATCHES)]
    pub max_failed_batches: usize,
}

#[derive(Serialize)]
struct ImportOutput<'a> {
    #[serde(flatten)]
    report: &'a TransferReport,
    file: String,
    fail_file: Option<String>,
    elapsed_secs: u64,
}

pub async fn run(base: BaseArgs, args: ImportArgs) -> Result<()> {
    let config = config::load()?;
    let separator = parse_separator(&args.separator)?;
    let format = args
        .format
        .map(SourceFormat::from)
        .unwrap_or_else(|| SourceFormat::from_path(&args.file));

    let table = source::read_source(&args.file, format, separator)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    if table.is_empty() {
        print_command_status(
            CommandStatus::Warning,
            &format!("{} has no rows; nothing to import", args.file.display()),
        );
        return Ok(());
    }
    let transform =
        ColumnTransform::new().with_ignored(args.ignore.iter().map(|c| c.trim().to_string()));
    let fields = source::field_names(&table.header, &transform);
    if fields.is_empty() {
        bail!(
            "{} has no columns left to import besides record keys",
            args.file.display()
        );
    }
    let records = source::transform_rows(&table.rows, &transform)?;

    let store = connect(&base, &config)?;
    let cache = Arc::new(MetadataCache::new(Arc::clone(&store)));
    let progress = bounded_bar(records.len() as u64, &args.model, "records", base.json);
    let options = ImportOptions {
        batch_size: args.batch_size.or(config.batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
        workers: args.workers.or(config.workers).unwrap_or(DEFAULT_WORKERS),
        partition_key: args
            .partition_key
            .as_deref()
            .map(|key| key.split('/').next().unwrap_or(key).to_string()),
        max_relation_links: args.max_relation_links,
        pass_timeout: args.pass_timeout.map(Duration::from_secs),
        max_consecutive_failed_batches: (args.max_failed_batches > 0)
            .then_some(args.max_failed_batches),
        progress: progress.clone(),
    };
    info!(
        model = %args.model,
        file = %args.file.display(),
        records = records.len(),
        fields = %fields.join(","),
        batch_size = options.batch_size,
        workers = options.workers,
        "importing"
    );

    let started = Instant::now();
    let result = MultiPassCoordinator::new(store, cache)
        .import_records(records, &args.model, &options)
        .await;
    progress.finish_and_clear();
    let report = result.with_context(|| format!("import into {} failed", args.model))?;

    let fail_file = if report.failures.is_empty() {
        None
    } else {
        let path = args
            .fail_file
            .clone()
            .unwrap_or_else(|| default_fail_file(&args.file));
        let fail_separator = if format == SourceFormat::Csv { separator } else { b',' };
        write_fail_file(&path, &table.header, &table.rows, &report.failures, fail_separator)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Some(path)
    };

    let elapsed_secs = started.elapsed().as_secs();
    if base.json {
        let output = ImportOutput {
            report: &report,
            file: args.file.display().to_string(),
            fail_file: fail_file.as_ref().map(|p| p.display().to_string()),
            elapsed_secs,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        print_report(&report, fail_file.as_deref(), elapsed_secs);
    }

    if let Some(reason) = &report.aborted {
        bail!("import of {} stopped early: {reason}", args.model);
    }
    if !report.failures.is_empty() {
        bail!(
            "{} of {} record(s) failed",
            format_usize_commas(report.failure_count()),
            format_usize_commas(report.total_records)
        );
    }
    Ok(())
}

fn default_fail_file(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "import".to_string());
    input.with_file_name(format!("{stem}_fail.csv"))
}

fn print_report(report: &TransferReport, fail_file: Option<&Path>, elapsed_secs: u64) {
    for warning in &report.warnings {
        print_command_status(CommandStatus::Warning, warning);
    }
    let status = if report.is_complete_success() {
        CommandStatus::Success
    } else {
        CommandStatus::Error
    };
    print_command_status(
        status,
        &format!(
            "Imported {} of {} record(s) into {} in {} ({} pass(es))",
            format_usize_commas(report.success_count),
            format_usize_commas(report.total_records),
            report.model,
            format_duration(elapsed_secs),
            report.passes.len()
        ),
    );
    if report.failures.is_empty() {
        return;
    }

    let mut table = styled_table();
    table.set_header(vec![header("Row"), header("Pass"), header("Tier"), header("Reason")]);
    apply_column_padding(&mut table, (0, 2));
    for failure in report.failures.iter().take(FAILURE_PREVIEW_ROWS) {
        table.add_row(vec![
            // +2: one for the header line, one for 1-based numbering
            Cell::new(failure.row + 2),
            Cell::new(failure.pass + 1),
            Cell::new(failure.tier.as_str()),
            Cell::new(truncate(&failure.reason, 100)),
        ]);
    }
    eprintln!("{table}");
    if report.failures.len() > FAILURE_PREVIEW_ROWS {
        eprintln!(
            "… and {} more",
            format_usize_commas(report.failures.len() - FAILURE_PREVIEW_ROWS)
        );
    }
    if let Some(path) = fail_file {
        print_command_status(
            CommandStatus::Warning,
            &format!("Failed rows written to {}", path.display()),
        );
    }
}
