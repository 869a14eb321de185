use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{Filter, RemoteMetadata, RemoteReader, RemoteResult, RemoteWriter, WriteOutcome};
use crate::error::RemoteError;
use crate::metadata::{FieldDescriptor, RelationKind};
use crate::record::{value_text, Record, WriteMode};

/// Validation applied to every write against a model.
#[derive(Debug, Clone)]
pub enum WriteRule {
    /// Field must carry a non-empty value when a row is created, and may not be
    /// blanked by an update.
    Required(String),
    /// Writing `value` into `field` is refused with `message`.
    Forbid {
        field: String,
        value: Value,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub describe_calls: usize,
    pub fingerprint_calls: usize,
    pub resolve_calls: usize,
    pub bulk_calls: usize,
    pub single_calls: usize,
    pub search_calls: usize,
    pub fetch_calls: usize,
    pub largest_fetch: usize,
    pub smallest_fetch: Option<usize>,
    /// Times a write started while another write with the same tracked value was in flight.
    pub partition_overlaps: usize,
    pub max_in_flight: usize,
}

#[derive(Default)]
struct ModelData {
    schema: BTreeMap<String, FieldDescriptor>,
    schema_version: u64,
    rows: BTreeMap<i64, Map<String, Value>>,
    external_ids: HashMap<String, i64>,
    rules: Vec<WriteRule>,
}

struct State {
    models: HashMap<String, ModelData>,
    next_id: i64,
    stats: MemoryStats,
    atomic_bulk: bool,
    failing_bulk_writes: usize,
    metadata_down: bool,
    fetch_limit: Option<usize>,
    unfetchable: BTreeSet<i64>,
    tracked_field: Option<String>,
    in_flight: Vec<String>,
    writes_in_flight: usize,
    write_latency: Duration,
    metadata_latency: Duration,
}

/// Record store held in memory.
///
/// Mirrors the behaviour of a validating remote closely enough to exercise the
/// engine: bulk writes are all-or-nothing by default, missing values read back
/// as `false`, and relations read back as `[id, name]` pairs.
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                models: HashMap::new(),
                next_id: 1,
                stats: MemoryStats::default(),
                atomic_bulk: true,
                failing_bulk_writes: 0,
                metadata_down: false,
                fetch_limit: None,
                unfetchable: BTreeSet::new(),
                tracked_field: None,
                in_flight: Vec::new(),
                writes_in_flight: 0,
                write_latency: Duration::ZERO,
                metadata_latency: Duration::ZERO,
            }),
        }
    }

    /// Declares or replaces the schema of `model`.
    pub fn define_model(&self, model: &str, fields: Vec<FieldDescriptor>) {
        let mut state = self.lock();
        let data = state.models.entry(model.to_string()).or_default();
        data.schema = fields
            .into_iter()
            .map(|field| (field.name.clone(), field))
            .collect();
        data.schema_version += 1;
    }

    pub fn add_rule(&self, model: &str, rule: WriteRule) {
        let mut state = self.lock();
        state
            .models
            .entry(model.to_string())
            .or_default()
            .rules
            .push(rule);
    }

    /// Stores a row directly and returns its internal key.
    pub fn insert(&self, model: &str, external_id: Option<&str>, values: Map<String, Value>) -> i64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let data = state.models.entry(model.to_string()).or_default();
        data.rows.insert(id, values);
        if let Some(key) = external_id {
            data.external_ids.insert(key.to_string(), id);
        }
        id
    }

    /// With `false`, a bulk write applies valid rows and reports the rest individually.
    pub fn set_atomic_bulk(&self, atomic: bool) {
        self.lock().atomic_bulk = atomic;
    }

    /// The next `count` bulk writes fail with a transport error.
    pub fn fail_next_bulk_writes(&self, count: usize) {
        self.lock().failing_bulk_writes = count;
    }

    pub fn fail_metadata(&self, down: bool) {
        self.lock().metadata_down = down;
    }

    /// Fetches of more than `limit` ids run out of memory.
    pub fn limit_fetch_size(&self, limit: usize) {
        self.lock().fetch_limit = Some(limit);
    }

    /// Any fetch that includes one of these ids runs out of memory.
    pub fn make_unfetchable(&self, ids: impl IntoIterator<Item = i64>) {
        self.lock().unfetchable.extend(ids);
    }

    /// Counts writes that overlap on equal values of `field`.
    pub fn track_partition_field(&self, field: &str) {
        self.lock().tracked_field = Some(field.to_string());
    }

    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }

    pub fn set_metadata_latency(&self, latency: Duration) {
        self.lock().metadata_latency = latency;
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    pub fn count(&self, model: &str) -> usize {
        self.lock()
            .models
            .get(model)
            .map(|data| data.rows.len())
            .unwrap_or(0)
    }

    pub fn row(&self, model: &str, id: i64) -> Option<Map<String, Value>> {
        self.lock()
            .models
            .get(model)
            .and_then(|data| data.rows.get(&id).cloned())
    }

    pub fn id_for(&self, model: &str, external_id: &str) -> Option<i64> {
        self.lock()
            .models
            .get(model)
            .and_then(|data| data.external_ids.get(external_id).copied())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin_write(&self, records: &[Record]) -> (Vec<String>, Duration) {
        let mut state = self.lock();
        state.writes_in_flight += 1;
        state.stats.max_in_flight = state.stats.max_in_flight.max(state.writes_in_flight);
        let Some(field) = state.tracked_field.clone() else {
            return (Vec::new(), state.write_latency);
        };
        let mut values: Vec<String> = records.iter().map(|r| r.field_text(&field)).collect();
        values.sort();
        values.dedup();
        if values.iter().any(|value| state.in_flight.contains(value)) {
            state.stats.partition_overlaps += 1;
        }
        state.in_flight.extend(values.iter().cloned());
        (values, state.write_latency)
    }

    fn end_write(&self, values: &[String]) {
        let mut state = self.lock();
        state.writes_in_flight = state.writes_in_flight.saturating_sub(1);
        for value in values {
            if let Some(pos) = state.in_flight.iter().position(|v| v == value) {
                state.in_flight.swap_remove(pos);
            }
        }
    }

    async fn metadata_call(&self) -> RemoteResult<()> {
        let latency = self.lock().metadata_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.lock().metadata_down {
            return Err(RemoteError::transport("metadata service unreachable"));
        }
        Ok(())
    }
}

enum Target {
    Create,
    Update(i64),
}

fn locate(data: &ModelData, record: &Record, mode: WriteMode) -> Result<Target, String> {
    let by_internal = |id: i64| {
        if data.rows.contains_key(&id) {
            Ok(Target::Update(id))
        } else {
            Err(format!("Record does not exist or has been deleted. (id: {id})"))
        }
    };
    match mode {
        WriteMode::Upsert => match (&record.external_key, record.internal_key) {
            (Some(key), _) => Ok(data
                .external_ids
                .get(key)
                .map(|id| Target::Update(*id))
                .unwrap_or(Target::Create)),
            (None, Some(id)) => by_internal(id),
            (None, None) => Ok(Target::Create),
        },
        WriteMode::UpdateOnly => match (record.internal_key, &record.external_key) {
            (Some(id), _) => by_internal(id),
            (None, Some(key)) => data
                .external_ids
                .get(key)
                .map(|id| Target::Update(*id))
                .ok_or_else(|| format!("No record found for external id '{key}'")),
            (None, None) => Err("Update requires a record key".to_string()),
        },
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

fn validate(
    state: &State,
    model: &str,
    record: &Record,
    mode: WriteMode,
) -> Result<Target, String> {
    let empty = ModelData::default();
    let data = state.models.get(model).unwrap_or(&empty);
    let target = locate(data, record, mode)?;

    for (name, value) in &record.fields {
        if data.schema.is_empty() {
            break;
        }
        let Some(descriptor) = data.schema.get(name) else {
            return Err(format!("Invalid field '{name}' on model '{model}'"));
        };
        if !descriptor.is_writable() {
            return Err(format!("Field '{name}' on model '{model}' is read-only"));
        }
        let target_model = descriptor.target.as_deref().unwrap_or_default();
        let exists = |id: &Value| -> bool {
            id.as_i64().is_some_and(|id| {
                state
                    .models
                    .get(target_model)
                    .is_some_and(|t| t.rows.contains_key(&id))
            })
        };
        match descriptor.relation {
            RelationKind::ManyToOne => {
                if !value.is_null() && !exists(value) {
                    return Err(format!(
                        "Record does not exist or has been deleted. (Record: {target_model}({}), Field: {name})",
                        value_text(Some(value))
                    ));
                }
            }
            RelationKind::ManyToMany | RelationKind::OneToMany => {
                let Some(items) = value.as_array() else {
                    return Err(format!("Invalid value for field '{name}': expected a list"));
                };
                if let Some(missing) = items.iter().find(|item| !exists(item)) {
                    return Err(format!(
                        "Record does not exist or has been deleted. (Record: {target_model}({}), Field: {name})",
                        value_text(Some(missing))
                    ));
                }
            }
            RelationKind::None => {}
        }
    }

    for rule in &data.rules {
        match rule {
            WriteRule::Required(field) => {
                let present = record.fields.contains_key(field);
                let must_check = matches!(target, Target::Create) || present;
                if must_check && is_blank(record.fields.get(field)) {
                    return Err(format!("Missing required value for the field '{field}'"));
                }
            }
            WriteRule::Forbid {
                field,
                value,
                message,
            } => {
                if record.fields.get(field) == Some(value) {
                    return Err(message.clone());
                }
            }
        }
    }
    Ok(target)
}

fn apply(state: &mut State, model: &str, record: &Record, target: Target) -> i64 {
    let id = match target {
        Target::Update(id) => id,
        Target::Create => {
            let id = state.next_id;
            state.next_id += 1;
            id
        }
    };
    let data = state.models.entry(model.to_string()).or_default();
    let row = data.rows.entry(id).or_default();
    for (name, value) in &record.fields {
        row.insert(name.clone(), value.clone());
    }
    if let Some(key) = &record.external_key {
        data.external_ids.insert(key.clone(), id);
    }
    id
}

fn display_name(state: &State, model: &str, id: i64) -> String {
    state
        .models
        .get(model)
        .and_then(|data| data.rows.get(&id))
        .and_then(|row| row.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{model},{id}"))
}

fn compare(left: &Value, op: &str, right: &Value) -> RemoteResult<bool> {
    let as_number = |v: &Value| v.as_f64();
    Ok(match op {
        "=" => left == right || (is_blank(Some(left)) && right == &Value::Bool(false)),
        "!=" => left != right,
        "in" | "not in" => {
            let items = right
                .as_array()
                .ok_or_else(|| RemoteError::Protocol(format!("'{op}' expects a list")))?;
            let found = items.contains(left);
            if op == "in" {
                found
            } else {
                !found
            }
        }
        ">" | ">=" | "<" | "<=" => match (as_number(left), as_number(right)) {
            (Some(l), Some(r)) => match op {
                ">" => l > r,
                ">=" => l >= r,
                "<" => l < r,
                _ => l <= r,
            },
            _ => false,
        },
        "ilike" => {
            let needle = value_text(Some(right)).to_lowercase();
            value_text(Some(left)).to_lowercase().contains(&needle)
        }
        other => return Err(RemoteError::Protocol(format!("unsupported operator {other}"))),
    })
}

fn matches_filter(id: i64, row: &Map<String, Value>, filter: &Filter) -> RemoteResult<bool> {
    let Some(terms) = filter.as_array() else {
        return Err(RemoteError::Protocol("filter must be a list".into()));
    };
    for term in terms {
        let parts = term.as_array().filter(|parts| parts.len() == 3).ok_or_else(|| {
            RemoteError::Protocol(format!("filter term must be [field, op, value]: {term}"))
        })?;
        let field = parts[0].as_str().unwrap_or_default();
        let op = parts[1].as_str().unwrap_or_default();
        let left = if field == "id" {
            json!(id)
        } else {
            row.get(field).cloned().unwrap_or(Value::Null)
        };
        if !compare(&left, op, &parts[2])? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[async_trait]
impl RemoteWriter for MemoryStore {
    async fn bulk_write(
        &self,
        model: &str,
        records: &[Record],
        mode: WriteMode,
    ) -> RemoteResult<Vec<WriteOutcome>> {
        let (tracked, latency) = self.begin_write(records);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let mut state = self.lock();
            state.stats.bulk_calls += 1;
            if state.failing_bulk_writes > 0 {
                state.failing_bulk_writes -= 1;
                Err(RemoteError::transport("connection reset by peer"))
            } else {
                let mut checked = Vec::with_capacity(records.len());
                for record in records {
                    checked.push(validate(&state, model, record, mode));
                }
                let rejected: Vec<String> = checked
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, check)| {
                        check.as_ref().err().map(|msg| format!("row {}: {msg}", idx + 1))
                    })
                    .collect();
                if state.atomic_bulk && !rejected.is_empty() {
                    Err(RemoteError::Rejected(rejected.join("; ")))
                } else {
                    let mut outcomes = Vec::with_capacity(records.len());
                    for (record, check) in records.iter().zip(checked) {
                        outcomes.push(match check {
                            Ok(target) => WriteOutcome::Written(apply(&mut state, model, record, target)),
                            Err(message) => WriteOutcome::Rejected(message),
                        });
                    }
                    Ok(outcomes)
                }
            }
        };

        self.end_write(&tracked);
        result
    }

    async fn single_write(
        &self,
        model: &str,
        record: &Record,
        mode: WriteMode,
    ) -> RemoteResult<i64> {
        let (tracked, latency) = self.begin_write(std::slice::from_ref(record));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let mut state = self.lock();
            state.stats.single_calls += 1;
            match validate(&state, model, record, mode) {
                Ok(target) => Ok(apply(&mut state, model, record, target)),
                Err(message) => Err(RemoteError::Rejected(message)),
            }
        };

        self.end_write(&tracked);
        result
    }
}

#[async_trait]
impl RemoteReader for MemoryStore {
    async fn search(&self, model: &str, filter: &Filter) -> RemoteResult<Vec<i64>> {
        let mut state = self.lock();
        state.stats.search_calls += 1;
        let Some(data) = state.models.get(model) else {
            return Ok(Vec::new());
        };
        let mut ids = Vec::new();
        for (id, row) in &data.rows {
            if matches_filter(*id, row, filter)? {
                ids.push(*id);
            }
        }
        Ok(ids)
    }

    async fn fetch(
        &self,
        model: &str,
        ids: &[i64],
        fields: &[String],
        raw: bool,
    ) -> RemoteResult<Vec<Map<String, Value>>> {
        let mut state = self.lock();
        state.stats.fetch_calls += 1;
        state.stats.largest_fetch = state.stats.largest_fetch.max(ids.len());
        state.stats.smallest_fetch = Some(
            state
                .stats
                .smallest_fetch
                .map_or(ids.len(), |s| s.min(ids.len())),
        );

        if state.fetch_limit.is_some_and(|limit| ids.len() > limit)
            || ids.iter().any(|id| state.unfetchable.contains(id))
        {
            return Err(RemoteError::ResourceExhausted(format!(
                "MemoryError while reading {} record(s)",
                ids.len()
            )));
        }

        let Some(data) = state.models.get(model) else {
            return Ok(Vec::new());
        };
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(stored) = data.rows.get(id) else {
                continue;
            };
            let mut row = Map::new();
            row.insert("id".to_string(), json!(id));
            for name in fields {
                if name == "id" {
                    continue;
                }
                let value = stored.get(name).cloned().unwrap_or(Value::Null);
                let descriptor = data.schema.get(name);
                let rendered = match descriptor.map(|d| (d.relation, d.target.clone())) {
                    Some((RelationKind::ManyToOne, target)) => match value.as_i64() {
                        Some(target_id) if raw => json!(target_id),
                        Some(target_id) => {
                            let target = target.unwrap_or_default();
                            json!([target_id, display_name(&state, &target, target_id)])
                        }
                        None => Value::Bool(false),
                    },
                    Some((RelationKind::ManyToMany | RelationKind::OneToMany, _)) => {
                        if value.is_array() {
                            value
                        } else {
                            json!([])
                        }
                    }
                    _ if value.is_null() => Value::Bool(false),
                    _ => value,
                };
                row.insert(name.clone(), rendered);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

#[async_trait]
impl RemoteMetadata for MemoryStore {
    async fn describe_fields(
        &self,
        model: &str,
    ) -> RemoteResult<BTreeMap<String, FieldDescriptor>> {
        self.metadata_call().await?;
        let mut state = self.lock();
        state.stats.describe_calls += 1;
        state
            .models
            .get(model)
            .map(|data| data.schema.clone())
            .ok_or_else(|| RemoteError::Rejected(format!("Unknown model '{model}'")))
    }

    async fn schema_fingerprint(&self, model: &str) -> RemoteResult<String> {
        self.metadata_call().await?;
        let mut state = self.lock();
        state.stats.fingerprint_calls += 1;
        Ok(state
            .models
            .get(model)
            .map(|data| data.schema_version.to_string())
            .unwrap_or_default())
    }

    async fn resolve_external_id(&self, model: &str, key: &str) -> RemoteResult<Option<i64>> {
        self.metadata_call().await?;
        let mut state = self.lock();
        state.stats.resolve_calls += 1;
        Ok(state
            .models
            .get(model)
            .and_then(|data| data.external_ids.get(key).copied()))
    }
}
