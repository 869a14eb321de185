use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use comfy_table::Cell;
use odf::session::SessionSummary;
use odf::SessionManager;

use crate::args::BaseArgs;
use crate::config;
use crate::ui::{
    apply_column_padding, format_usize_commas, header, print_command_status, styled_table, truncate,
    CommandStatus,
};

#[derive(Debug, Clone, Args)]
pub struct SessionArgs {
    #[command(subcommand)]
    command: Option<SessionCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum SessionCommands {
    /// List saved export sessions
    List,
    /// Show one session
    Show {
        /// Session id
        id: String,
    },
    /// Delete saved progress
    Clear {
        /// Session id
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<String>,
        /// Delete every saved session
        #[arg(long)]
        all: bool,
    },
}

pub fn run(base: BaseArgs, args: SessionArgs) -> Result<()> {
    let config = config::load()?;
    let sessions = SessionManager::new(config::session_root(&config)?);
    match args.command {
        None | Some(SessionCommands::List) => run_list(&base, &sessions),
        Some(SessionCommands::Show { id }) => run_show(&base, &sessions, &id),
        Some(SessionCommands::Clear { id, all }) => run_clear(&base, &sessions, id.as_deref(), all),
    }
}

fn progress_cell(summary: &SessionSummary) -> String {
    match summary.target_count {
        Some(total) => format!(
            "{}/{}",
            format_usize_commas(summary.completed_count),
            format_usize_commas(total)
        ),
        None => format_usize_commas(summary.completed_count),
    }
}

fn run_list(base: &BaseArgs, sessions: &SessionManager) -> Result<()> {
    let summaries = sessions.list()?;
    if base.json {
        println!("{}", serde_json::to_string(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        eprintln!("No saved export sessions in {}", sessions.root().display());
        return Ok(());
    }

    let mut table = styled_table();
    table.set_header(vec![
        header("Id"),
        header("Model"),
        header("Status"),
        header("Progress"),
        header("Output"),
        header("Updated"),
    ]);
    apply_column_padding(&mut table, (0, 3));
    for summary in &summaries {
        table.add_row(vec![
            Cell::new(&summary.id),
            Cell::new(&summary.model),
            Cell::new(summary.status.as_str()),
            Cell::new(progress_cell(summary)),
            Cell::new(truncate(summary.output_path.as_deref().unwrap_or("-"), 40)),
            Cell::new(&summary.updated_at),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn run_show(base: &BaseArgs, sessions: &SessionManager, id: &str) -> Result<()> {
    let session = sessions.open(id)?;
    let summary = session.summary();
    if base.json {
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }
    println!("id:       {}", summary.id);
    println!("model:    {}", summary.model);
    println!("fields:   {}", summary.fields.join(","));
    println!("filter:   {}", summary.filter);
    println!("status:   {}", summary.status.as_str());
    println!("progress: {}", progress_cell(&summary));
    println!("output:   {}", summary.output_path.as_deref().unwrap_or("-"));
    println!("updated:  {}", summary.updated_at);
    if let Some(message) = &session.state().message {
        println!("message:  {message}");
    }
    Ok(())
}

fn run_clear(base: &BaseArgs, sessions: &SessionManager, id: Option<&str>, all: bool) -> Result<()> {
    let ids: Vec<String> = if all {
        sessions.list()?.into_iter().map(|s| s.id).collect()
    } else {
        id.map(str::to_string).into_iter().collect()
    };

    let mut removed = Vec::new();
    for id in &ids {
        if sessions.remove(id)? {
            removed.push(id.clone());
        } else if !all {
            bail!("no session {id}");
        }
    }

    if base.json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        print_command_status(
            CommandStatus::Success,
            &format!("Removed {} session(s)", removed.len()),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use odf::session::SessionStatus;
    use serde_json::json;

    fn summary(target_count: Option<usize>, completed_count: usize) -> SessionSummary {
        SessionSummary {
            id: "0123456789abcdef".into(),
            model: "res.partner".into(),
            fields: vec!["id".into()],
            filter: json!([]),
            status: SessionStatus::Interrupted,
            target_count,
            completed_count,
            output_path: None,
            updated_at: "2026-10-16T09:00:00Z".into(),
        }
    }

    #[test]
    fn progress_shows_total_when_known() {
        assert_eq!(progress_cell(&summary(Some(12_000), 1_500)), "1,500/12,000");
        assert_eq!(progress_cell(&summary(None, 0)), "0");
    }
}
