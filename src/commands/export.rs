use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use odf::export::{DEFAULT_EXPORT_BATCH_SIZE, DEFAULT_EXPORT_WORKERS};
use odf::sink::{CsvSink, JsonlSink, RowSink};
use odf::source::SourceFormat;
use odf::{export_records, ExportOptions, ExportSummary, MetadataCache, SessionManager};
use serde_json::Value;
use tracing::info;

use super::{connect, interrupt_flag, parse_separator, FormatArg};
use crate::args::BaseArgs;
use crate::config;
use crate::ui::{bounded_bar, format_duration, format_usize_commas, print_command_status, CommandStatus};

#[derive(Debug, Clone, Args)]
pub struct ExportArgs {
    /// Source model, e.g. res.partner
    #[arg(required_unless_present = "session")]
    pub model: Option<String>,

    /// File to write
    #[arg(long, short = 'o', required_unless_present = "session")]
    pub output: Option<PathBuf>,

    /// Domain filter as a JSON list, e.g. '[["is_company","=",true]]'
    #[arg(long, default_value = "[]")]
    pub filter: String,

    /// Columns to export, comma separated (id, name, parent_id/.id, ...)
    #[arg(long, value_delimiter = ',', required_unless_present = "session")]
    pub fields: Vec<String>,

    /// Ids per read call
    #[arg(long, env = "ODF_EXPORT_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Concurrent read calls
    #[arg(long, short = 'w', env = "ODF_EXPORT_WORKERS")]
    pub workers: Option<usize>,

    /// Write stored values instead of display labels
    #[arg(long)]
    pub technical: bool,

    /// Resume a saved export by id (see `odf session list`)
    #[arg(long, conflicts_with_all = ["model", "fields", "fresh"])]
    pub session: Option<String>,

    /// Ignore saved progress and start over
    #[arg(long)]
    pub fresh: bool,

    /// CSV field separator
    #[arg(long, short = 's', default_value = ",")]
    pub separator: String,

    /// Output format (defaults to the file extension)
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,
}

struct ExportRequest {
    model: String,
    filter: Value,
    fields: Vec<String>,
    output: PathBuf,
    /// Format the saved session was written in, if any.
    format: Option<SourceFormat>,
}

fn parse_filter(raw: &str) -> Result<Value> {
    let filter: Value = serde_json::from_str(raw).with_context(|| format!("invalid --filter JSON: {raw}"))?;
    if !filter.is_array() {
        bail!("--filter must be a JSON list of conditions");
    }
    Ok(filter)
}

fn resolve_request(args: &ExportArgs, sessions: &SessionManager) -> Result<ExportRequest> {
    if let Some(id) = &args.session {
        let session = sessions.open(id)?;
        let spec = session.spec();
        let output = args
            .output
            .clone()
            .or_else(|| session.state().output_path.as_ref().map(PathBuf::from))
            .ok_or_else(|| anyhow!("session {id} has no output file; pass --output"))?;
        return Ok(ExportRequest {
            model: spec.model.clone(),
            filter: spec.filter.clone(),
            fields: spec.fields.clone(),
            output,
            format: session.state().output_format,
        });
    }

    let model = args.model.clone().ok_or_else(|| anyhow!("a model is required"))?;
    let output = args.output.as_deref().ok_or_else(|| anyhow!("--output is required"))?;
    // Absolute, so a resume from another directory still finds the same file.
    let output = std::path::absolute(output)
        .with_context(|| format!("failed to resolve {}", output.display()))?;
    let fields: Vec<String> = args
        .fields
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.is_empty() {
        bail!("--fields must name at least one column");
    }
    Ok(ExportRequest {
        model,
        filter: parse_filter(&args.filter)?,
        fields,
        output,
        format: None,
    })
}

fn output_format(args: &ExportArgs, request: &ExportRequest) -> SourceFormat {
    args.format
        .map(SourceFormat::from)
        .or(request.format)
        .unwrap_or_else(|| SourceFormat::from_path(&request.output))
}

pub async fn run(base: BaseArgs, args: ExportArgs) -> Result<()> {
    let config = config::load()?;
    let separator = parse_separator(&args.separator)?;
    let sessions = SessionManager::new(config::session_root(&config)?);
    let request = resolve_request(&args, &sessions)?;
    let format = output_format(&args, &request);

    let store = connect(&base, &config)?;
    let cache = Arc::new(MetadataCache::new(store));
    let progress = bounded_bar(0, &request.model, "records", base.json);
    let options = ExportOptions {
        batch_size: args
            .batch_size
            .or(config.export_batch_size)
            .unwrap_or(DEFAULT_EXPORT_BATCH_SIZE),
        workers: args
            .workers
            .or(config.export_workers)
            .unwrap_or(DEFAULT_EXPORT_WORKERS),
        technical: args.technical,
        fresh: args.fresh,
        progress: progress.clone(),
        interrupted: Some(interrupt_flag()),
    };

    let started = Instant::now();
    let mut run = export_records(
        cache,
        &sessions,
        &request.model,
        &request.filter,
        &request.fields,
        options,
    )
    .await
    .with_context(|| format!("failed to prepare export of {}", request.model))?;
    let append = run.appends_to_existing_output();
    if append && !request.output.exists() {
        bail!(
            "session {} expects earlier rows in {}, which no longer exists; rerun with --fresh",
            run.session().id(),
            request.output.display()
        );
    }
    run.bind_output(&request.output, format)?;
    info!(
        model = %request.model,
        session = %run.session().id(),
        remaining = run.remaining(),
        resumed = run.session().is_resumed(),
        "exporting"
    );

    let mut sink: Box<dyn RowSink> = match format {
        SourceFormat::Csv => Box::new(CsvSink::open(&request.output, separator, append)?),
        SourceFormat::Jsonl => Box::new(JsonlSink::open(&request.output, append)?),
    };
    let result = run.drive(sink.as_mut()).await;
    progress.finish_and_clear();
    let summary = result.with_context(|| format!("export of {} failed", request.model))?;

    let elapsed_secs = started.elapsed().as_secs();
    if base.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        print_summary(&summary, &request.output, elapsed_secs);
    }

    if summary.interrupted {
        bail!("export interrupted; resume with `odf export --session {}`", summary.session_id);
    }
    if !summary.failures.is_empty() {
        bail!(
            "{} record(s) could not be exported",
            format_usize_commas(summary.failures.len())
        );
    }
    Ok(())
}

fn print_summary(summary: &ExportSummary, output: &std::path::Path, elapsed_secs: u64) {
    if summary.resumed {
        print_command_status(
            CommandStatus::Warning,
            &format!(
                "Resumed session {} with {} of {} record(s) already written",
                summary.session_id,
                format_usize_commas(summary.previously_completed),
                format_usize_commas(summary.total)
            ),
        );
    }
    if summary.missing > 0 {
        print_command_status(
            CommandStatus::Warning,
            &format!(
                "{} record(s) were deleted before they could be read",
                format_usize_commas(summary.missing)
            ),
        );
    }
    for failure in &summary.failures {
        print_command_status(
            CommandStatus::Error,
            &format!("record {}: {}", failure.id, failure.reason),
        );
    }
    let status = if summary.is_complete() {
        CommandStatus::Success
    } else {
        CommandStatus::Error
    };
    print_command_status(
        status,
        &format!(
            "Exported {} record(s) from {} to {} in {}",
            format_usize_commas(summary.exported),
            summary.model,
            output.display(),
            format_duration(elapsed_secs)
        ),
    );
    if summary.session_retained {
        eprintln!(
            "Progress saved. Resume with: odf export --session {}",
            summary.session_id
        );
    }
}
