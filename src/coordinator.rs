use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use serde_json::Value;
use tracing::{info, warn};

use crate::analyzer::{Batching, DependencyAnalyzer, PassSpec};
use crate::error::{SyncError, SyncResult};
use crate::executor::{
    PassOutcome, PoolOptions, TransferExecutor, DEFAULT_MAX_CONSECUTIVE_FAILED_BATCHES,
};
use crate::metadata::{FieldDescriptor, MetadataCache, RelationKind};
use crate::record::{FailureRecord, FailureTier, PassSummary, Record, TransferReport};
use crate::remote::RemoteStore;
use crate::scheduler::{schedule, schedule_weighted, BatchEntry};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_RELATION_LINKS: usize = 1000;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub workers: usize,
    /// Records sharing a value of this field are never written concurrently.
    pub partition_key: Option<String>,
    /// Cap on linked records per batch in the to-many pass.
    pub max_relation_links: usize,
    /// Longest a single pass may run before the import gives up on the model.
    pub pass_timeout: Option<Duration>,
    pub max_consecutive_failed_batches: Option<usize>,
    pub progress: ProgressBar,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            partition_key: None,
            max_relation_links: DEFAULT_MAX_RELATION_LINKS,
            pass_timeout: None,
            max_consecutive_failed_batches: Some(DEFAULT_MAX_CONSECUTIVE_FAILED_BATCHES),
            progress: ProgressBar::hidden(),
        }
    }
}

/// Imports `records` into `model` with a fresh metadata cache.
pub async fn import_records(
    store: Arc<dyn RemoteStore>,
    records: Vec<Record>,
    model: &str,
    options: &ImportOptions,
) -> SyncResult<TransferReport> {
    let cache = Arc::new(MetadataCache::new(Arc::clone(&store)));
    MultiPassCoordinator::new(store, cache)
        .import_records(records, model, options)
        .await
}

pub struct MultiPassCoordinator {
    store: Arc<dyn RemoteStore>,
    cache: Arc<MetadataCache>,
}

impl MultiPassCoordinator {
    pub fn new(store: Arc<dyn RemoteStore>, cache: Arc<MetadataCache>) -> Self {
        Self { store, cache }
    }

    pub async fn import_records(
        &self,
        records: Vec<Record>,
        model: &str,
        options: &ImportOptions,
    ) -> SyncResult<TransferReport> {
        let field_names = collect_field_names(&records);
        let plan = DependencyAnalyzer::new(Arc::clone(&self.cache))
            .analyze(model, &field_names)
            .await?;
        let descriptors = self.cache.describe(model).await?;

        let mut report = TransferReport {
            model: model.to_string(),
            total_records: records.len(),
            success_count: 0,
            failures: Vec::new(),
            warnings: plan.warnings.clone(),
            passes: Vec::new(),
            aborted: None,
        };
        let unkeyed = records.iter().filter(|r| !r.has_key()).count();
        if unkeyed > 0 {
            let message = format!(
                "{unkeyed} record(s) for {model} have neither an id nor a .id key; rerunning this import will create them again"
            );
            warn!("{message}");
            report.warnings.push(message);
        }
        info!(
            model,
            records = records.len(),
            passes = plan.pass_count(),
            plan = ?plan.kind,
            "starting import"
        );

        let partitions: Vec<Option<String>> = records
            .iter()
            .map(|record| options.partition_key.as_deref().map(|key| record.field_text(key)))
            .collect();
        let mut ids: Vec<Option<i64>> = records.iter().map(|r| r.internal_key).collect();
        let mut written: HashMap<String, i64> = HashMap::new();
        let mut failed: BTreeMap<usize, FailureRecord> = BTreeMap::new();

        for (position, pass) in plan.passes.iter().enumerate() {
            let mut entries = Vec::new();
            for (row, record) in records.iter().enumerate() {
                if failed.contains_key(&row) {
                    continue;
                }
                let mut projected = record.project(&pass.fields);
                if pass.index > 0 {
                    if projected.fields.is_empty() {
                        continue;
                    }
                    projected.internal_key = ids[row];
                }
                match self
                    .resolve_references(model, &descriptors, &mut projected, &written)
                    .await?
                {
                    Ok(weight) => {
                        let mut entry = BatchEntry::new(row, projected).with_weight(weight);
                        entry.partition = partitions[row].clone();
                        entries.push(entry);
                    }
                    Err(reason) => {
                        failed.insert(
                            row,
                            FailureRecord {
                                row,
                                record: record.clone(),
                                reason,
                                tier: FailureTier::Record,
                                pass: pass.index,
                            },
                        );
                    }
                }
            }

            let (summary, outcome) = self.run_pass(model, pass, entries, options).await?;
            for (row, id) in outcome.succeeded {
                ids[row] = Some(id);
                if pass.index == 0 {
                    if let Some(key) = &records[row].external_key {
                        written.insert(key.clone(), id);
                        self.cache.remember(model, key, id);
                    }
                }
            }
            for mut failure in outcome.failures {
                failure.record = records[failure.row].clone();
                failed.entry(failure.row).or_insert(failure);
            }
            report.passes.push(summary);

            if let Some(reason) = outcome.aborted {
                for later in &plan.passes[position + 1..] {
                    for (row, record) in records.iter().enumerate() {
                        if failed.contains_key(&row) || record.project(&later.fields).fields.is_empty() {
                            continue;
                        }
                        failed.insert(
                            row,
                            FailureRecord {
                                row,
                                record: record.clone(),
                                reason: reason.clone(),
                                tier: FailureTier::Batch,
                                pass: later.index,
                            },
                        );
                    }
                }
                report.aborted = Some(reason);
                break;
            }
        }

        report.success_count = records.len() - failed.len();
        report.failures = failed.into_values().collect();
        info!(
            model,
            succeeded = report.success_count,
            failed = report.failures.len(),
            "import finished"
        );
        Ok(report)
    }

    async fn run_pass(
        &self,
        model: &str,
        pass: &PassSpec,
        entries: Vec<BatchEntry>,
        options: &ImportOptions,
    ) -> SyncResult<(PassSummary, PassOutcome)> {
        let attempted = entries.len();
        let batches = match (&options.partition_key, pass.batching) {
            (Some(key), _) => schedule(entries, options.batch_size, Some(key), pass.index),
            (None, Batching::ByRelationWeight) => schedule_weighted(
                entries,
                options.batch_size,
                options.max_relation_links,
                pass.index,
            ),
            (None, Batching::BySize) => schedule(entries, options.batch_size, None, pass.index),
        };
        let batch_count = batches.len();
        info!(
            model,
            pass = pass.index + 1,
            records = attempted,
            batches = batch_count,
            mode = pass.mode.as_str(),
            "running pass"
        );

        let progress = &options.progress;
        progress.set_length(attempted as u64);
        progress.set_position(0);
        progress.set_prefix(format!("{model} pass {}", pass.index + 1));

        let executor = TransferExecutor::new(Arc::clone(&self.store), model, pass.mode, pass.index);
        let pool = PoolOptions {
            workers: options.workers,
            max_consecutive_failed_batches: options.max_consecutive_failed_batches,
        };
        let run = executor.run_batches(batches, pool, progress);
        let outcome = match options.pass_timeout {
            Some(timeout) => tokio::time::timeout(timeout, run).await.map_err(|_| {
                SyncError::BarrierTimeout {
                    model: model.to_string(),
                    pass: pass.index + 1,
                    timeout,
                }
            })??,
            None => run.await?,
        };

        let summary = PassSummary {
            index: pass.index,
            mode: pass.mode,
            fields: pass.fields.clone(),
            batches: batch_count,
            attempted,
            succeeded: outcome.succeeded.len(),
            failed: outcome.failures.len(),
            rescued: outcome.rescued,
        };
        Ok((summary, outcome))
    }

    /// Replaces relation values with internal keys in place.
    ///
    /// Returns the number of linked records on success, or the reason the
    /// record cannot be written.
    async fn resolve_references(
        &self,
        model: &str,
        descriptors: &BTreeMap<String, FieldDescriptor>,
        record: &mut Record,
        written: &HashMap<String, i64>,
    ) -> SyncResult<Result<usize, String>> {
        let mut links = 0usize;
        for (name, value) in record.fields.iter_mut() {
            let Some(descriptor) = descriptors.get(name) else {
                continue;
            };
            let target = descriptor.target.as_deref().unwrap_or(model);
            match descriptor.relation {
                RelationKind::None => {}
                RelationKind::ManyToOne => {
                    let resolved = match reference_keys(value).first() {
                        None => Value::Null,
                        Some(key) => match self.resolve_key(model, target, key, written).await? {
                            Ok(id) => Value::from(id),
                            Err(reason) => return Ok(Err(format!("{name}: {reason}"))),
                        },
                    };
                    *value = resolved;
                }
                RelationKind::ManyToMany | RelationKind::OneToMany => {
                    let mut resolved = Vec::new();
                    for key in reference_keys(value) {
                        match self.resolve_key(model, target, &key, written).await? {
                            Ok(id) => resolved.push(Value::from(id)),
                            Err(reason) => return Ok(Err(format!("{name}: {reason}"))),
                        }
                    }
                    links += resolved.len();
                    *value = Value::Array(resolved);
                }
            }
        }
        Ok(Ok(links))
    }

    async fn resolve_key(
        &self,
        model: &str,
        target: &str,
        key: &Reference,
        written: &HashMap<String, i64>,
    ) -> SyncResult<Result<i64, String>> {
        let external = match key {
            Reference::Internal(id) => return Ok(Ok(*id)),
            Reference::External(external) => external,
        };
        if target == model {
            if let Some(id) = written.get(external) {
                return Ok(Ok(*id));
            }
        }
        Ok(match self.cache.resolve_external_id(target, external).await? {
            Some(id) => Ok(id),
            None => Err(format!("no {target} record with external id '{external}'")),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Reference {
    Internal(i64),
    External(String),
}

/// Reads a relation cell: numbers are internal keys, strings are external
/// keys, and a comma separated string lists several.
fn reference_keys(value: &Value) -> Vec<Reference> {
    let mut keys = Vec::new();
    let mut push = |item: &Value| match item {
        Value::Number(n) => {
            if let Some(id) = n.as_i64() {
                keys.push(Reference::Internal(id));
            }
        }
        Value::String(s) => keys.extend(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Reference::External(part.to_string())),
        ),
        _ => {}
    };
    match value {
        Value::Array(items) => items.iter().for_each(&mut push),
        other => push(other),
    }
    keys
}

fn collect_field_names(records: &[Record]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for record in records {
        for name in record.fields.keys() {
            if !names.iter().any(|n| n == name) {
                names.push(name.clone());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::PlanKind;
    use crate::remote::{MemoryStore, WriteRule};
    use serde_json::json;

    fn partner_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.define_model(
            "res.partner.category",
            vec![FieldDescriptor::scalar("name", "char")],
        );
        store.define_model(
            "res.partner",
            vec![
                FieldDescriptor::scalar("name", "char"),
                FieldDescriptor::scalar("city", "char"),
                FieldDescriptor::relation("parent_id", RelationKind::ManyToOne, "res.partner"),
                FieldDescriptor::relation(
                    "category_id",
                    RelationKind::ManyToMany,
                    "res.partner.category",
                ),
            ],
        );
        store.add_rule("res.partner", WriteRule::Required("name".into()));
        Arc::new(store)
    }

    #[test]
    fn reference_keys_parse_cells() {
        assert_eq!(reference_keys(&json!(4)), vec![Reference::Internal(4)]);
        assert_eq!(
            reference_keys(&json!("a, b,,c")),
            vec![
                Reference::External("a".into()),
                Reference::External("b".into()),
                Reference::External("c".into())
            ]
        );
        assert_eq!(
            reference_keys(&json!([1, "x"])),
            vec![Reference::Internal(1), Reference::External("x".into())]
        );
        assert!(reference_keys(&Value::Null).is_empty());
        assert!(reference_keys(&json!(false)).is_empty());
    }

    #[tokio::test]
    async fn self_reference_resolves_children_declared_before_parents() {
        let store = partner_store();
        let records = vec![
            Record::new()
                .with_external_key("child")
                .with_field("name", "Child")
                .with_field("parent_id", "parent"),
            Record::new()
                .with_external_key("parent")
                .with_field("name", "Parent")
                .with_field("parent_id", ""),
        ];
        let report = import_records(store.clone(), records, "res.partner", &ImportOptions::default())
            .await
            .unwrap();

        assert!(report.is_complete_success(), "{:?}", report.failures);
        assert_eq!(report.passes.len(), 2);
        let parent = store.id_for("res.partner", "parent").unwrap();
        let child = store.id_for("res.partner", "child").unwrap();
        assert_eq!(store.row("res.partner", child).unwrap()["parent_id"], json!(parent));
        assert_eq!(store.row("res.partner", parent).unwrap()["parent_id"], Value::Null);
    }

    #[tokio::test]
    async fn only_keyless_records_warn_about_reruns() {
        let store = partner_store();
        let mut existing = serde_json::Map::new();
        existing.insert("name".into(), json!("Old"));
        let id = store.insert("res.partner", None, existing);

        let updates = vec![Record::new().with_internal_key(id).with_field("name", "New")];
        let report = import_records(store.clone(), updates, "res.partner", &ImportOptions::default())
            .await
            .unwrap();
        assert!(report.is_complete_success(), "{:?}", report.failures);
        assert!(
            !report.warnings.iter().any(|w| w.contains("rerunning this import")),
            "{:?}",
            report.warnings
        );

        let fresh = vec![
            Record::new().with_field("name", "Loose"),
            Record::new().with_external_key("kept").with_field("name", "Kept"),
        ];
        let report = import_records(store, fresh, "res.partner", &ImportOptions::default())
            .await
            .unwrap();
        assert!(
            report.warnings.iter().any(|w| w.starts_with("1 record(s)")),
            "{:?}",
            report.warnings
        );
    }

    #[tokio::test]
    async fn record_failed_in_first_pass_is_left_out_of_later_passes() {
        let store = partner_store();
        let records = vec![
            Record::new()
                .with_external_key("a")
                .with_field("name", "")
                .with_field("parent_id", "b"),
            Record::new()
                .with_external_key("b")
                .with_field("name", "B")
                .with_field("parent_id", ""),
        ];
        let report = import_records(store, records, "res.partner", &ImportOptions::default())
            .await
            .unwrap();

        assert_eq!(report.success_count, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].row, 0);
        assert_eq!(report.failures[0].pass, 0);
        assert_eq!(report.failures[0].record.get("parent_id"), Some(&json!("b")));
        assert_eq!(report.passes[1].attempted, 1);
    }

    #[tokio::test]
    async fn unresolvable_reference_is_a_record_failure() {
        let store = partner_store();
        let records = vec![
            Record::new()
                .with_external_key("a")
                .with_field("name", "A")
                .with_field("category_id", "vip,missing"),
        ];
        store.insert("res.partner.category", Some("vip"), serde_json::Map::new());

        let report = import_records(store, records, "res.partner", &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.success_count, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].reason.contains("missing"));
        assert_eq!(report.failures[0].pass, 2);
    }

    #[tokio::test]
    async fn layered_plan_writes_links_in_last_pass() {
        let store = partner_store();
        let vip = store.insert("res.partner.category", Some("vip"), serde_json::Map::new());
        let gold = store.insert("res.partner.category", Some("gold"), serde_json::Map::new());
        let records = vec![Record::new()
            .with_external_key("a")
            .with_field("name", "A")
            .with_field("category_id", "vip,gold")];

        let cache = Arc::new(MetadataCache::new(store.clone()));
        let plan = DependencyAnalyzer::new(Arc::clone(&cache))
            .analyze("res.partner", &["name".into(), "category_id".into()])
            .await
            .unwrap();
        assert_eq!(plan.kind, PlanKind::Layered);

        let report = MultiPassCoordinator::new(store.clone(), cache)
            .import_records(records, "res.partner", &ImportOptions::default())
            .await
            .unwrap();
        assert!(report.is_complete_success());
        assert_eq!(report.passes.len(), 3);
        let id = store.id_for("res.partner", "a").unwrap();
        assert_eq!(store.row("res.partner", id).unwrap()["category_id"], json!([vip, gold]));
    }

    #[tokio::test]
    async fn schema_outage_aborts_the_model() {
        let store = partner_store();
        store.fail_metadata(true);
        let err = import_records(
            store,
            vec![Record::new().with_external_key("a").with_field("name", "A")],
            "res.partner",
            &ImportOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.is_fatal_for_model());
    }

    #[tokio::test]
    async fn slow_pass_hits_barrier_timeout() {
        let store = partner_store();
        store.set_write_latency(Duration::from_millis(200));
        let options = ImportOptions {
            pass_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let err = import_records(
            store,
            vec![Record::new().with_external_key("a").with_field("name", "A")],
            "res.partner",
            &options,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::BarrierTimeout { pass: 1, .. }));
    }
}
