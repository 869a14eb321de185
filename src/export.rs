use std::path::Path;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, Stream, StreamExt};
use indicatif::ProgressBar;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::metadata::{FieldDescriptor, FieldMap, MetadataCache, RelationKind};
use crate::remote::{Filter, RemoteStore};
use crate::session::{ExportSession, SessionManager, SessionStatus};
use crate::sink::RowSink;
use crate::source::SourceFormat;

pub const DEFAULT_EXPORT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_EXPORT_WORKERS: usize = 2;

const TRUTHY: [&str; 4] = ["true", "1", "t", "yes"];

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub batch_size: usize,
    pub workers: usize,
    /// Read stored values instead of display labels for every field.
    pub technical: bool,
    /// Drop any saved progress for this request and start over.
    pub fresh: bool,
    pub progress: ProgressBar,
    /// Checked between batches; when set the run stops and keeps its session.
    pub interrupted: Option<Arc<AtomicBool>>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_EXPORT_BATCH_SIZE,
            workers: DEFAULT_EXPORT_WORKERS,
            technical: false,
            fresh: false,
            progress: ProgressBar::hidden(),
            interrupted: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// `.id` or `id`: the record's internal key.
    RecordId,
    Field(String),
    /// `field/.id`: the internal key of the related record(s).
    RelationId(String),
    /// Not on the model; exported empty.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportColumn {
    pub label: String,
    pub source: ColumnSource,
}

/// Parses export field specifiers without looking at the schema.
pub fn parse_columns(fields: &[String]) -> SyncResult<Vec<ExportColumn>> {
    if fields.is_empty() {
        return Err(SyncError::InvalidArgument("no export fields given".to_string()));
    }
    fields
        .iter()
        .map(|label| {
            let trimmed = label.trim();
            let source = match trimmed.split_once('/') {
                _ if trimmed.is_empty() => {
                    return Err(SyncError::InvalidArgument("empty export field".to_string()));
                }
                None if trimmed == ".id" || trimmed == "id" => ColumnSource::RecordId,
                None => ColumnSource::Field(trimmed.to_string()),
                Some((base, ".id")) if !base.is_empty() => ColumnSource::RelationId(base.to_string()),
                Some(_) => {
                    return Err(SyncError::InvalidArgument(format!(
                        "unsupported export field {trimmed}; only <field>/.id paths are exported"
                    )));
                }
            };
            Ok(ExportColumn {
                label: trimmed.to_string(),
                source,
            })
        })
        .collect()
}

fn resolve_columns(
    model: &str,
    columns: Vec<ExportColumn>,
    descriptors: &FieldMap,
) -> SyncResult<Vec<ExportColumn>> {
    let mut resolved = Vec::with_capacity(columns.len());
    for mut column in columns {
        let base = match &column.source {
            ColumnSource::Field(name) | ColumnSource::RelationId(name) => name.clone(),
            _ => {
                resolved.push(column);
                continue;
            }
        };
        match descriptors.get(&base) {
            None => {
                warn!(model, field = %column.label, "field not on model, exporting an empty column");
                column.source = ColumnSource::Missing;
            }
            Some(descriptor)
                if matches!(column.source, ColumnSource::RelationId(_))
                    && !descriptor.relation.is_relation() =>
            {
                return Err(SyncError::InvalidArgument(format!(
                    "{} is not a relation on {model}",
                    base
                )));
            }
            Some(_) => {}
        }
        resolved.push(column);
    }
    Ok(resolved)
}

/// Rewrites one fetched value for output.
///
/// The remote reports "no value" as `false` for every type, so `false` only
/// survives on boolean fields. Boolean fields also accept loose string forms.
pub fn normalize_value(descriptor: Option<&FieldDescriptor>, value: &Value, raw: bool) -> Value {
    let Some(descriptor) = descriptor else {
        return match value {
            Value::Bool(false) => Value::Null,
            other => other.clone(),
        };
    };
    if descriptor.is_boolean() {
        return match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::String(s) => Value::Bool(TRUTHY.contains(&s.trim().to_lowercase().as_str())),
            Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|n| n != 0.0)),
            _ => Value::Null,
        };
    }
    match descriptor.relation {
        RelationKind::ManyToOne => match value {
            Value::Array(pair) if raw => pair.first().cloned().unwrap_or(Value::Null),
            Value::Array(pair) => pair
                .get(1)
                .or_else(|| pair.first())
                .cloned()
                .unwrap_or(Value::Null),
            Value::Bool(false) | Value::Null => Value::Null,
            other => other.clone(),
        },
        RelationKind::ManyToMany | RelationKind::OneToMany => join_ids(value),
        RelationKind::None => match value {
            Value::Bool(false) => Value::Null,
            other => other.clone(),
        },
    }
}

fn relation_id(descriptor: &FieldDescriptor, value: &Value) -> Value {
    match descriptor.relation {
        RelationKind::ManyToOne => match value {
            Value::Array(pair) => pair.first().cloned().unwrap_or(Value::Null),
            Value::Number(_) => value.clone(),
            _ => Value::Null,
        },
        _ => join_ids(value),
    }
}

fn join_ids(value: &Value) -> Value {
    match value {
        Value::Array(ids) if !ids.is_empty() => Value::String(
            ids.iter()
                .map(|id| match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
        ),
        _ => Value::Null,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportFailure {
    pub id: i64,
    pub reason: String,
}

/// Result of one id batch after bisection.
#[derive(Debug, Clone, Default)]
pub struct ExportBatch {
    /// Normalized rows in ascending id order.
    pub rows: Vec<Vec<Value>>,
    pub fetched: Vec<i64>,
    /// Ids the remote no longer returns.
    pub missing: Vec<i64>,
    pub failures: Vec<ExportFailure>,
    pub splits: usize,
}

impl ExportBatch {
    /// Ids that need no further attempt.
    pub fn settled_ids(&self) -> Vec<i64> {
        let mut ids = self.fetched.clone();
        ids.extend_from_slice(&self.missing);
        ids
    }
}

#[derive(Clone)]
struct BatchFetcher {
    store: Arc<dyn RemoteStore>,
    model: Arc<str>,
    columns: Arc<Vec<ExportColumn>>,
    descriptors: FieldMap,
    fetch_fields: Arc<Vec<String>>,
    raw: bool,
}

impl BatchFetcher {
    /// Fetches `ids`, halving any chunk the remote cannot serve at its size.
    async fn fetch(self, ids: Vec<i64>) -> ExportBatch {
        let mut batch = ExportBatch::default();
        let mut pending = vec![ids];
        while let Some(mut chunk) = pending.pop() {
            let result = self
                .store
                .fetch(&self.model, &chunk, &self.fetch_fields, self.raw)
                .await;
            match result {
                Ok(rows) => self.collect(&chunk, rows, &mut batch),
                Err(err) if err.is_size_attributable() && chunk.len() > 1 => {
                    let right = chunk.split_off(chunk.len() / 2);
                    debug!(
                        model = %self.model,
                        left = chunk.len(),
                        right = right.len(),
                        error = %err,
                        "splitting export batch"
                    );
                    batch.splits += 1;
                    pending.push(right);
                    pending.push(chunk);
                }
                Err(err) => {
                    let reason = err.reason();
                    for id in chunk {
                        warn!(model = %self.model, id, %reason, "record could not be exported");
                        batch.failures.push(ExportFailure {
                            id,
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }
        batch
    }

    fn collect(&self, requested: &[i64], rows: Vec<Map<String, Value>>, batch: &mut ExportBatch) {
        let mut by_id: std::collections::HashMap<i64, Map<String, Value>> = rows
            .into_iter()
            .filter_map(|row| row.get("id").and_then(Value::as_i64).map(|id| (id, row)))
            .collect();
        for &id in requested {
            match by_id.remove(&id) {
                Some(row) => {
                    batch.rows.push(self.normalize_row(id, &row));
                    batch.fetched.push(id);
                }
                None => batch.missing.push(id),
            }
        }
    }

    fn normalize_row(&self, id: i64, row: &Map<String, Value>) -> Vec<Value> {
        self.columns
            .iter()
            .map(|column| match &column.source {
                ColumnSource::RecordId => Value::from(id),
                ColumnSource::Missing => Value::Null,
                ColumnSource::Field(name) => {
                    let value = row.get(name).unwrap_or(&Value::Null);
                    normalize_value(self.descriptors.get(name), value, self.raw)
                }
                ColumnSource::RelationId(name) => {
                    let value = row.get(name).unwrap_or(&Value::Null);
                    self.descriptors
                        .get(name)
                        .map_or(Value::Null, |d| relation_id(d, value))
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub model: String,
    pub session_id: String,
    pub resumed: bool,
    pub total: usize,
    pub previously_completed: usize,
    pub exported: usize,
    pub missing: usize,
    pub failures: Vec<ExportFailure>,
    pub interrupted: bool,
    /// True when the session was kept on disk for a later resume.
    pub session_retained: bool,
}

impl ExportSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.interrupted
    }
}

/// A prepared export: its session plus the ids still to fetch.
pub struct ExportRun {
    session: ExportSession,
    fetcher: BatchFetcher,
    header: Vec<String>,
    pending: Vec<i64>,
    append: bool,
    options: ExportOptions,
}

/// Prepares an export of `fields` for rows of `model` matching `filter`.
///
/// Picks up an interrupted session for the same request, so only ids not yet
/// written are fetched again.
pub async fn export_records(
    cache: Arc<MetadataCache>,
    sessions: &SessionManager,
    model: &str,
    filter: &Filter,
    fields: &[String],
    options: ExportOptions,
) -> SyncResult<ExportRun> {
    let columns = parse_columns(fields)?;
    let descriptors = cache.describe(model).await?;
    let columns = resolve_columns(model, columns, &descriptors)?;

    let mut fetch_fields: Vec<String> = Vec::new();
    for column in &columns {
        if let ColumnSource::Field(name) | ColumnSource::RelationId(name) = &column.source {
            if !fetch_fields.contains(name) {
                fetch_fields.push(name.clone());
            }
        }
    }
    let raw = options.technical
        || columns.iter().any(|c| match &c.source {
            ColumnSource::Field(name) => descriptors.get(name).is_some_and(|d| d.needs_raw_read()),
            _ => false,
        });
    if raw && !options.technical {
        debug!(model, "reading stored values for selection or binary fields");
    }

    if options.fresh {
        let id = SessionManager::session_id(model, filter, fields)?;
        if sessions.remove(&id)? {
            info!(session = %id, "discarded saved export progress");
        }
    }
    let mut session = sessions.begin(model, filter, fields)?;
    if !session.has_targets() {
        let ids = cache.remote().search(model, filter).await?;
        info!(model, count = ids.len(), "collected export targets");
        session.record_targets(ids)?;
    }
    let pending: Vec<i64> = session.remaining().into_iter().collect();
    let append = session.completed_count() > 0;

    Ok(ExportRun {
        header: columns.iter().map(|c| c.label.clone()).collect(),
        fetcher: BatchFetcher {
            store: Arc::clone(cache.remote()),
            model: Arc::from(model),
            columns: Arc::new(columns),
            descriptors,
            fetch_fields: Arc::new(fetch_fields),
            raw,
        },
        session,
        pending,
        append,
        options,
    })
}

impl ExportRun {
    pub fn session(&self) -> &ExportSession {
        &self.session
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Ids left to fetch in this run.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// True when earlier rows are already in the output, which must then be
    /// opened for appending and left without a new header.
    pub fn appends_to_existing_output(&self) -> bool {
        self.append
    }

    /// Records where rows are written so a resume can find the file again.
    /// Refuses a different file or format once rows have been written.
    pub fn bind_output(&mut self, path: &Path, format: SourceFormat) -> SyncResult<()> {
        self.session.bind_output(path, format)
    }

    /// Lazily fetched batches, at most `workers` in flight, in completion order.
    pub fn stream(&self) -> impl Stream<Item = ExportBatch> + Send + 'static {
        let fetcher = self.fetcher.clone();
        let chunks: Vec<Vec<i64>> = self
            .pending
            .chunks(self.options.batch_size.max(1))
            .map(<[i64]>::to_vec)
            .collect();
        stream::iter(chunks)
            .map(move |ids| fetcher.clone().fetch(ids))
            .buffer_unordered(self.options.workers.max(1))
    }

    /// Writes every remaining row to `sink`.
    ///
    /// Ids are marked complete only after their rows are flushed. The session
    /// is deleted when everything made it out and kept otherwise.
    pub async fn drive(mut self, sink: &mut dyn RowSink) -> SyncResult<ExportSummary> {
        let mut summary = ExportSummary {
            model: self.fetcher.model.to_string(),
            session_id: self.session.id().to_string(),
            resumed: self.session.is_resumed(),
            total: self.session.target_count(),
            previously_completed: self.session.completed_count(),
            exported: 0,
            missing: 0,
            failures: Vec::new(),
            interrupted: false,
            session_retained: false,
        };

        if let Err(err) = self.pump(sink, &mut summary).await {
            error!(session = %summary.session_id, error = %err, "export stopped");
            if let Err(retain_err) = self.session.retain(SessionStatus::Failed, Some(err.to_string())) {
                warn!(error = %retain_err, "failed to save export session state");
            }
            return Err(err);
        }

        if summary.is_complete() {
            self.session.finish()?;
        } else {
            let (status, message) = if summary.interrupted {
                (SessionStatus::Interrupted, "interrupted".to_string())
            } else {
                (
                    SessionStatus::Failed,
                    format!("{} record(s) could not be exported", summary.failures.len()),
                )
            };
            self.session.retain(status, Some(message))?;
            summary.session_retained = true;
        }
        Ok(summary)
    }

    async fn pump(&mut self, sink: &mut dyn RowSink, summary: &mut ExportSummary) -> SyncResult<()> {
        if !self.append {
            sink.write_header(&self.header)?;
            sink.flush()?;
        }
        let progress = self.options.progress.clone();
        progress.set_length(summary.total as u64);
        progress.set_position(summary.previously_completed as u64);

        let mut batches = pin!(self.stream());
        while let Some(batch) = batches.next().await {
            for row in &batch.rows {
                sink.write_row(row)?;
            }
            sink.flush()?;
            self.session.mark_complete(&batch.settled_ids())?;

            if !batch.missing.is_empty() {
                warn!(
                    model = %summary.model,
                    count = batch.missing.len(),
                    "records disappeared before they could be exported"
                );
            }
            debug!(
                model = %summary.model,
                rows = batch.rows.len(),
                failed = batch.failures.len(),
                splits = batch.splits,
                "export batch written"
            );
            progress.inc((batch.fetched.len() + batch.missing.len() + batch.failures.len()) as u64);
            summary.exported += batch.rows.len();
            summary.missing += batch.missing.len();
            summary.failures.extend(batch.failures);

            if self
                .options
                .interrupted
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                summary.interrupted = true;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;
    use crate::sink::CsvSink;
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn descriptors() -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::scalar("name", "char"),
            FieldDescriptor::scalar("is_company", "boolean"),
            FieldDescriptor::relation("parent_id", RelationKind::ManyToOne, "res.partner"),
            FieldDescriptor::relation("category_id", RelationKind::ManyToMany, "res.partner.category"),
        ]
    }

    fn store_with_partners(count: usize) -> (Arc<MemoryStore>, Vec<i64>) {
        let store = Arc::new(MemoryStore::new());
        store.define_model("res.partner", descriptors());
        let ids = (0..count)
            .map(|n| {
                let mut values = Map::new();
                values.insert("name".into(), json!(format!("Partner {n}")));
                values.insert("is_company".into(), json!(n % 2 == 0));
                store.insert("res.partner", Some(&format!("p_{n}")), values)
            })
            .collect();
        (store, ids)
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn boolean_false_survives_and_text_false_is_empty() {
        let boolean = FieldDescriptor::scalar("active", "boolean");
        let text = FieldDescriptor::scalar("email", "char");
        assert_eq!(normalize_value(Some(&boolean), &json!(false), false), json!(false));
        assert_eq!(normalize_value(Some(&text), &json!(false), false), Value::Null);
        assert_eq!(normalize_value(Some(&boolean), &json!("Yes"), false), json!(true));
        assert_eq!(normalize_value(Some(&boolean), &json!("no"), false), json!(false));
        assert_eq!(normalize_value(Some(&text), &json!("a@b.c"), false), json!("a@b.c"));
    }

    #[test]
    fn relations_export_names_or_ids() {
        let parent = FieldDescriptor::relation("parent_id", RelationKind::ManyToOne, "res.partner");
        let tags = FieldDescriptor::relation("category_id", RelationKind::ManyToMany, "res.partner.category");
        assert_eq!(normalize_value(Some(&parent), &json!([4, "Acme"]), false), json!("Acme"));
        assert_eq!(normalize_value(Some(&parent), &json!([4, "Acme"]), true), json!(4));
        assert_eq!(normalize_value(Some(&parent), &json!(4), true), json!(4));
        assert_eq!(normalize_value(Some(&parent), &json!(false), false), Value::Null);
        assert_eq!(normalize_value(Some(&tags), &json!([1, 2, 3]), false), json!("1,2,3"));
        assert_eq!(normalize_value(Some(&tags), &json!([]), false), Value::Null);
        assert_eq!(relation_id(&parent, &json!([4, "Acme"])), json!(4));
    }

    #[test]
    fn column_specifiers() {
        let columns = parse_columns(&fields(&[".id", "id", "name", "parent_id/.id"])).unwrap();
        assert_eq!(columns[0].source, ColumnSource::RecordId);
        assert_eq!(columns[1].source, ColumnSource::RecordId);
        assert_eq!(columns[2].source, ColumnSource::Field("name".into()));
        assert_eq!(columns[3].source, ColumnSource::RelationId("parent_id".into()));
        assert!(parse_columns(&fields(&["parent_id/id"])).is_err());
        assert!(parse_columns(&[]).is_err());
    }

    #[tokio::test]
    async fn bisection_reaches_single_records() {
        let (store, ids) = store_with_partners(16);
        store.make_unfetchable([ids[5]]);
        let cache = Arc::new(MetadataCache::new(store.clone()));
        let tmp = TempDir::new().unwrap();
        let sessions = SessionManager::new(tmp.path());
        let options = ExportOptions {
            batch_size: 16,
            workers: 1,
            ..ExportOptions::default()
        };
        let run = export_records(cache, &sessions, "res.partner", &json!([]), &fields(&["name"]), options)
            .await
            .unwrap();

        let mut batches = pin!(run.stream());
        let batch = batches.next().await.unwrap();
        assert!(batches.next().await.is_none());
        assert_eq!(batch.fetched.len() + batch.failures.len(), 16);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].id, ids[5]);
        assert!(batch.failures[0].reason.contains("MemoryError"));
        assert_eq!(store.stats().smallest_fetch, Some(1));
    }

    #[tokio::test]
    async fn undersized_remote_still_exports_everything() {
        let (store, _) = store_with_partners(16);
        store.limit_fetch_size(1);
        let cache = Arc::new(MetadataCache::new(store.clone()));
        let tmp = TempDir::new().unwrap();
        let sessions = SessionManager::new(tmp.path().join("sessions"));
        let run = export_records(
            cache,
            &sessions,
            "res.partner",
            &json!([]),
            &fields(&["name"]),
            ExportOptions {
                batch_size: 16,
                ..ExportOptions::default()
            },
        )
        .await
        .unwrap();
        let mut sink = CsvSink::new(Vec::new(), b',');
        let summary = run.drive(&mut sink).await.unwrap();
        assert_eq!(summary.exported, 16);
        assert!(summary.is_complete());
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out.lines().count(), 17);
    }

    #[tokio::test]
    async fn interrupted_export_resumes_without_duplicates() {
        let (store, ids) = store_with_partners(100);
        let cache = Arc::new(MetadataCache::new(store.clone()));
        let tmp = TempDir::new().unwrap();
        let sessions = SessionManager::new(tmp.path().join("sessions"));
        let output = tmp.path().join("partners.csv");
        let wanted = fields(&["id", "name", "is_company"]);

        let flag = Arc::new(AtomicBool::new(true));
        let first = export_records(
            cache.clone(),
            &sessions,
            "res.partner",
            &json!([]),
            &wanted,
            ExportOptions {
                batch_size: 60,
                workers: 1,
                interrupted: Some(flag),
                ..ExportOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(!first.appends_to_existing_output());
        let mut sink = CsvSink::open(&output, b',', false).unwrap();
        let summary = first.drive(&mut sink).await.unwrap();
        drop(sink);
        assert!(summary.interrupted);
        assert!(summary.session_retained);
        assert_eq!(summary.exported, 60);

        let second = export_records(
            cache,
            &sessions,
            "res.partner",
            &json!([]),
            &wanted,
            ExportOptions {
                batch_size: 60,
                ..ExportOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(second.session().is_resumed());
        assert_eq!(second.remaining(), 40);
        assert!(second.appends_to_existing_output());
        let mut sink = CsvSink::open(&output, b',', true).unwrap();
        let summary = second.drive(&mut sink).await.unwrap();
        drop(sink);
        assert!(summary.is_complete());
        assert!(!summary.session_retained);

        let contents = std::fs::read_to_string(&output).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("id,name,is_company"));
        let exported: Vec<i64> = lines
            .map(|line| line.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(exported.len(), 100);
        assert_eq!(exported.iter().collect::<HashSet<_>>().len(), 100);
        assert_eq!(exported, ids);
        assert!(sessions.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_result_leaves_header_and_no_session() {
        let (store, _) = store_with_partners(3);
        let cache = Arc::new(MetadataCache::new(store));
        let tmp = TempDir::new().unwrap();
        let sessions = SessionManager::new(tmp.path().join("sessions"));
        let run = export_records(
            cache,
            &sessions,
            "res.partner",
            &json!([["name", "=", "Nobody"]]),
            &fields(&["name", "is_company"]),
            ExportOptions::default(),
        )
        .await
        .unwrap();
        let mut sink = CsvSink::new(Vec::new(), b',');
        let summary = run.drive(&mut sink).await.unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.is_complete());
        assert_eq!(
            String::from_utf8(sink.into_inner().unwrap()).unwrap(),
            "name,is_company\n"
        );
        assert!(sessions.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_field_exports_empty_column() {
        let (store, _) = store_with_partners(2);
        let cache = Arc::new(MetadataCache::new(store));
        let tmp = TempDir::new().unwrap();
        let sessions = SessionManager::new(tmp.path());
        let run = export_records(
            cache,
            &sessions,
            "res.partner",
            &json!([]),
            &fields(&["name", "nickname", "parent_id/.id"]),
            ExportOptions::default(),
        )
        .await
        .unwrap();
        let mut batches = pin!(run.stream());
        let batch = batches.next().await.unwrap();
        assert_eq!(batch.rows[0], vec![json!("Partner 0"), Value::Null, Value::Null]);
    }
}
