use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{Filter, RemoteMetadata, RemoteReader, RemoteResult, RemoteWriter, WriteOutcome};
use crate::error::RemoteError;
use crate::metadata::{FieldDescriptor, Mutability, RelationKind};
use crate::record::{Record, WriteMode};

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_ATTEMPTS: usize = 5;
const RETRY_BASE_DELAY_MS: u64 = 300;
const MAX_BACKOFF_SECS: u64 = 8;
const DEFAULT_XID_MODULE: &str = "__import__";

#[derive(Debug, Clone)]
pub struct JsonRpcConfig {
    pub url: String,
    pub database: String,
    pub login: String,
    pub password: String,
    pub timeout: Duration,
    /// Attempts per idempotent call. Writes are never retried here.
    pub max_attempts: usize,
}

impl JsonRpcConfig {
    pub fn new(url: &str, database: &str, login: &str, password: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            login: login.to_string(),
            password: password.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Record store reached over the `/jsonrpc` endpoint.
pub struct JsonRpcStore {
    http: Client,
    endpoint: String,
    config: JsonRpcConfig,
    uid: OnceCell<i64>,
    /// Field layouts seen through `describe_fields`, used to name load columns.
    schemas: Mutex<HashMap<String, BTreeMap<String, FieldDescriptor>>>,
}

impl JsonRpcStore {
    pub fn new(config: JsonRpcConfig) -> RemoteResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RemoteError::Transport {
                message: format!("failed to build http client: {err}"),
                retryable: false,
            })?;
        Ok(Self {
            http,
            endpoint: format!("{}/jsonrpc", config.url),
            config,
            uid: OnceCell::new(),
            schemas: Mutex::new(HashMap::new()),
        })
    }

    async fn uid(&self) -> RemoteResult<i64> {
        let uid = self
            .uid
            .get_or_try_init(|| async {
                let args = json!([self.config.database, self.config.login, self.config.password]);
                let result = self.call("common", "login", args, true).await?;
                match result.as_i64() {
                    Some(uid) if uid > 0 => {
                        debug!(login = %self.config.login, uid, "authenticated");
                        Ok(uid)
                    }
                    _ => Err(RemoteError::Transport {
                        message: format!(
                            "authentication failed for {} on {}",
                            self.config.login, self.config.database
                        ),
                        retryable: false,
                    }),
                }
            })
            .await?;
        Ok(*uid)
    }

    async fn execute(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
        retry: bool,
    ) -> RemoteResult<Value> {
        let uid = self.uid().await?;
        let params = json!([
            self.config.database,
            uid,
            self.config.password,
            model,
            method,
            args,
            kwargs
        ]);
        debug!(model, method, "rpc call");
        self.call("object", "execute_kw", params, retry).await
    }

    async fn call(&self, service: &str, method: &str, args: Value, retry: bool) -> RemoteResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {"service": service, "method": method, "args": args},
        });
        if !retry {
            return post_once(&self.http, &self.endpoint, &body).await;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let attempt_counter = Arc::new(AtomicUsize::new(0));
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(RETRY_BASE_DELAY_MS))
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(Duration::from_secs(MAX_BACKOFF_SECS))
            .with_max_elapsed_time(None)
            .build();

        retry_notify(
            backoff,
            || {
                let http = self.http.clone();
                let endpoint = self.endpoint.clone();
                let body = body.clone();
                let attempt_counter = Arc::clone(&attempt_counter);
                async move {
                    let attempt = attempt_counter.fetch_add(1, Ordering::Relaxed) + 1;
                    match post_once(&http, &endpoint, &body).await {
                        Ok(value) => Ok(value),
                        Err(err) if err.is_retryable() && attempt < max_attempts => {
                            Err(BackoffError::transient(err))
                        }
                        Err(err) => Err(BackoffError::permanent(err)),
                    }
                }
            },
            |err: RemoteError, wait: Duration| {
                warn!(service, method, error = %err, ?wait, "retrying rpc call");
            },
        )
        .await
    }

    fn cached_schema(&self, model: &str) -> Option<BTreeMap<String, FieldDescriptor>> {
        self.schemas
            .lock()
            .ok()
            .and_then(|schemas| schemas.get(model).cloned())
    }
}

async fn post_once(http: &Client, endpoint: &str, body: &Value) -> RemoteResult<Value> {
    let response = http.post(endpoint).json(body).send().await.map_err(|err| {
        if err.is_timeout() {
            RemoteError::ResourceExhausted(format!("request timed out: {err}"))
        } else {
            RemoteError::transport(format!("network error: {err}"))
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(status, text));
    }
    let payload: Value = response
        .json()
        .await
        .map_err(|err| RemoteError::Protocol(format!("invalid rpc response: {err}")))?;
    if let Some(error) = payload.get("error") {
        return Err(classify_rpc_error(error));
    }
    payload
        .get("result")
        .cloned()
        .ok_or_else(|| RemoteError::Protocol("rpc response has neither result nor error".to_string()))
}

fn classify_status(status: StatusCode, body: String) -> RemoteError {
    let message = format!("HTTP {status}: {}", body.trim());
    match status.as_u16() {
        413 | 502 | 503 | 504 => RemoteError::ResourceExhausted(message),
        _ => RemoteError::Transport {
            message,
            retryable: status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
        },
    }
}

/// Maps a JSON-RPC `error` object. Server-side memory exhaustion is the only
/// error a smaller request can cure; everything else is the server refusing.
fn classify_rpc_error(error: &Value) -> RemoteError {
    let data = error.get("data");
    let name = data
        .and_then(|d| d.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = data
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str)
        .or_else(|| error.get("message").and_then(Value::as_str))
        .unwrap_or("unknown server error")
        .to_string();
    if name == "builtins.MemoryError" || message.contains("MemoryError") {
        RemoteError::ResourceExhausted(message)
    } else {
        RemoteError::Rejected(message)
    }
}

fn descriptor_from_attrs(name: &str, attrs: &Value) -> FieldDescriptor {
    let field_type = attrs.get("type").and_then(Value::as_str).unwrap_or("char");
    let relation = match field_type {
        "many2one" => RelationKind::ManyToOne,
        "many2many" => RelationKind::ManyToMany,
        "one2many" => RelationKind::OneToMany,
        _ => RelationKind::None,
    };
    let readonly = attrs.get("readonly").and_then(Value::as_bool).unwrap_or(false);
    let stored = attrs.get("store").and_then(Value::as_bool).unwrap_or(true);
    let mutability = match (readonly, stored) {
        (true, false) => Mutability::Computed,
        (true, true) => Mutability::ReadOnly,
        _ => Mutability::Writable,
    };
    let mut descriptor = match (relation, attrs.get("relation").and_then(Value::as_str)) {
        (RelationKind::None, _) | (_, None) => FieldDescriptor::scalar(name, field_type),
        (kind, Some(target)) => FieldDescriptor::relation(name, kind, target),
    };
    descriptor.mutability = mutability;
    descriptor
}

/// Splits `key` into the `(module, name)` pair external ids are stored under.
fn split_external_id(key: &str) -> (&str, &str) {
    match key.split_once('.') {
        Some((module, name)) if !module.is_empty() && !name.is_empty() => (module, name),
        _ => (DEFAULT_XID_MODULE, key),
    }
}

fn load_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// How a relation field is keyed across a whole `load` batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyColumn {
    /// `field/.id`: internal keys.
    Internal,
    /// `field/id`: external keys.
    External,
    /// Both kinds present; each cell goes to the column of its own kind.
    Mixed,
}

fn key_kinds(value: &Value) -> (bool, bool) {
    match value {
        Value::Number(_) => (true, false),
        Value::String(s) if s.trim().is_empty() => (false, false),
        Value::String(_) => (false, true),
        Value::Array(items) => items.iter().map(key_kinds).fold((false, false), |acc, kinds| {
            (acc.0 || kinds.0, acc.1 || kinds.1)
        }),
        _ => (false, false),
    }
}

/// One column form per relation field, so empty cells never open a second
/// column for the same field.
fn key_columns(
    schema: Option<&BTreeMap<String, FieldDescriptor>>,
    records: &[Record],
) -> HashMap<String, KeyColumn> {
    let mut seen: HashMap<String, (bool, bool)> = HashMap::new();
    for record in records {
        for (field, value) in &record.fields {
            let is_relation = schema
                .and_then(|s| s.get(field))
                .is_some_and(|d| d.relation.is_relation());
            if !is_relation {
                continue;
            }
            let (internal, external) = key_kinds(value);
            let entry = seen.entry(field.clone()).or_default();
            entry.0 |= internal;
            entry.1 |= external;
        }
    }
    seen.into_iter()
        .map(|(field, kinds)| {
            let column = match kinds {
                (true, true) => KeyColumn::Mixed,
                (false, true) => KeyColumn::External,
                _ => KeyColumn::Internal,
            };
            (field, column)
        })
        .collect()
}

fn join_cells(items: &[Value]) -> String {
    items.iter().map(load_cell).collect::<Vec<_>>().join(",")
}

/// Column name and cell for one field.
fn load_column(form: Option<KeyColumn>, field: &str, value: &Value) -> (String, String) {
    let internal = format!("{field}/.id");
    let external = format!("{field}/id");
    match (form, value) {
        (None, _) => (field.to_string(), load_cell(value)),
        (Some(KeyColumn::Internal), Value::Array(items)) => (internal, join_cells(items)),
        (Some(KeyColumn::Internal), other) => (internal, load_cell(other)),
        (Some(KeyColumn::External), Value::Array(items)) => (external, join_cells(items)),
        (Some(KeyColumn::External), other) => (external, load_cell(other)),
        (Some(KeyColumn::Mixed), other) => match key_kinds(other) {
            (false, true) => match other {
                Value::Array(items) => (external, join_cells(items)),
                _ => (external, load_cell(other)),
            },
            _ => match other {
                Value::Array(items) => (internal, join_cells(items)),
                _ => (internal, load_cell(other)),
            },
        },
    }
}

fn push_column(header: &mut Vec<String>, name: &str) {
    if !header.iter().any(|h| h == name) {
        header.push(name.to_string());
    }
}

/// Header and rows for a `load` call.
fn load_payload(
    schema: Option<&BTreeMap<String, FieldDescriptor>>,
    records: &[Record],
    mode: WriteMode,
) -> (Vec<String>, Vec<Vec<String>>) {
    let forms = key_columns(schema, records);
    let mut header: Vec<String> = Vec::new();
    let mut cells: Vec<Map<String, Value>> = Vec::with_capacity(records.len());
    for record in records {
        let mut row = Map::new();
        match (&record.external_key, record.internal_key) {
            (_, Some(id)) if mode == WriteMode::UpdateOnly => {
                push_column(&mut header, ".id");
                row.insert(".id".to_string(), Value::String(id.to_string()));
            }
            (Some(key), _) => {
                push_column(&mut header, "id");
                row.insert("id".to_string(), Value::String(key.clone()));
            }
            (None, Some(id)) => {
                push_column(&mut header, ".id");
                row.insert(".id".to_string(), Value::String(id.to_string()));
            }
            (None, None) => {}
        }
        for (field, value) in &record.fields {
            let (column, cell) = load_column(forms.get(field).copied(), field, value);
            push_column(&mut header, &column);
            row.insert(column, Value::String(cell));
        }
        cells.push(row);
    }

    let rows = cells
        .iter()
        .map(|row| {
            header
                .iter()
                .map(|column| row.get(column).and_then(Value::as_str).unwrap_or_default().to_string())
                .collect()
        })
        .collect();
    (header, rows)
}

fn load_messages(result: &Value) -> String {
    let messages: Vec<String> = result
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m.get("message").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if messages.is_empty() {
        "load failed without a message".to_string()
    } else {
        messages.join("; ")
    }
}

#[async_trait]
impl RemoteWriter for JsonRpcStore {
    async fn bulk_write(
        &self,
        model: &str,
        records: &[Record],
        mode: WriteMode,
    ) -> RemoteResult<Vec<WriteOutcome>> {
        let schema = self.cached_schema(model);
        let (header, rows) = load_payload(schema.as_ref(), records, mode);
        let result = self
            .execute(model, "load", json!([header, rows]), json!({}), false)
            .await?;
        let ids = match result.get("ids") {
            Some(Value::Array(ids)) => ids,
            _ => return Err(RemoteError::Rejected(load_messages(&result))),
        };
        if ids.len() != records.len() {
            return Err(RemoteError::Protocol(format!(
                "load returned {} ids for {} records",
                ids.len(),
                records.len()
            )));
        }
        Ok(ids
            .iter()
            .map(|id| match id.as_i64() {
                Some(id) => WriteOutcome::Written(id),
                None => WriteOutcome::Rejected(format!("no id returned: {id}")),
            })
            .collect())
    }

    async fn single_write(&self, model: &str, record: &Record, mode: WriteMode) -> RemoteResult<i64> {
        let outcomes = self.bulk_write(model, std::slice::from_ref(record), mode).await?;
        match outcomes.into_iter().next() {
            Some(WriteOutcome::Written(id)) => Ok(id),
            Some(WriteOutcome::Rejected(message)) => Err(RemoteError::Rejected(message)),
            None => Err(RemoteError::Protocol("load returned no outcome".to_string())),
        }
    }
}

#[async_trait]
impl RemoteReader for JsonRpcStore {
    async fn search(&self, model: &str, filter: &Filter) -> RemoteResult<Vec<i64>> {
        if !filter.is_array() {
            return Err(RemoteError::Protocol(format!("filter must be a list, got {filter}")));
        }
        let result = self
            .execute(model, "search", json!([filter]), json!({"order": "id asc"}), true)
            .await?;
        result
            .as_array()
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .ok_or_else(|| RemoteError::Protocol("search did not return a list".to_string()))
    }

    async fn fetch(
        &self,
        model: &str,
        ids: &[i64],
        fields: &[String],
        raw: bool,
    ) -> RemoteResult<Vec<Map<String, Value>>> {
        let kwargs = if raw {
            json!({"load": "_classic_write"})
        } else {
            json!({})
        };
        let result = self
            .execute(model, "read", json!([ids, fields]), kwargs, true)
            .await?;
        let rows = result
            .as_array()
            .ok_or_else(|| RemoteError::Protocol("read did not return a list".to_string()))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.as_object().cloned())
            .collect())
    }
}

#[async_trait]
impl RemoteMetadata for JsonRpcStore {
    async fn describe_fields(&self, model: &str) -> RemoteResult<BTreeMap<String, FieldDescriptor>> {
        let result = self
            .execute(
                model,
                "fields_get",
                json!([]),
                json!({"attributes": ["type", "relation", "readonly", "store"]}),
                true,
            )
            .await?;
        let attrs = result
            .as_object()
            .ok_or_else(|| RemoteError::Protocol("fields_get did not return an object".to_string()))?;
        let fields: BTreeMap<String, FieldDescriptor> = attrs
            .iter()
            .map(|(name, attrs)| (name.clone(), descriptor_from_attrs(name, attrs)))
            .collect();
        if let Ok(mut schemas) = self.schemas.lock() {
            schemas.insert(model.to_string(), fields.clone());
        }
        Ok(fields)
    }

    async fn schema_fingerprint(&self, model: &str) -> RemoteResult<String> {
        let domain = json!([[["model", "=", model]]]);
        let count = self
            .execute("ir.model.fields", "search_count", domain.clone(), json!({}), true)
            .await?;
        let latest = self
            .execute(
                "ir.model.fields",
                "search_read",
                domain,
                json!({"fields": ["write_date"], "order": "write_date desc", "limit": 1}),
                true,
            )
            .await?;
        let write_date = latest
            .get(0)
            .and_then(|row| row.get("write_date"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(format!("{}:{write_date}", count.as_i64().unwrap_or_default()))
    }

    async fn resolve_external_id(&self, model: &str, key: &str) -> RemoteResult<Option<i64>> {
        let (module, name) = split_external_id(key);
        let result = self
            .execute(
                "ir.model.data",
                "search_read",
                json!([[["module", "=", module], ["name", "=", name], ["model", "=", model]]]),
                json!({"fields": ["res_id"], "limit": 1}),
                true,
            )
            .await?;
        Ok(result
            .get(0)
            .and_then(|row| row.get("res_id"))
            .and_then(Value::as_i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> BTreeMap<String, FieldDescriptor> {
        [
            FieldDescriptor::scalar("name", "char"),
            FieldDescriptor::scalar("is_company", "boolean"),
            FieldDescriptor::relation("parent_id", RelationKind::ManyToOne, "res.partner"),
            FieldDescriptor::relation("category_id", RelationKind::ManyToMany, "res.partner.category"),
        ]
        .into_iter()
        .map(|d| (d.name.clone(), d))
        .collect()
    }

    #[test]
    fn memory_errors_are_size_attributable() {
        let error = json!({
            "code": 200,
            "message": "Odoo Server Error",
            "data": {"name": "builtins.MemoryError", "message": ""}
        });
        assert!(classify_rpc_error(&error).is_size_attributable());

        let validation = json!({
            "message": "Odoo Server Error",
            "data": {"name": "odoo.exceptions.ValidationError", "message": "Email is invalid"}
        });
        assert_eq!(
            classify_rpc_error(&validation),
            RemoteError::Rejected("Email is invalid".into())
        );
    }

    #[test]
    fn gateway_statuses_shrink_requests() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_size_attributable());
        assert!(classify_status(StatusCode::PAYLOAD_TOO_LARGE, String::new()).is_size_attributable());
        let internal = classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom".into());
        assert!(internal.is_retryable());
        assert!(!classify_status(StatusCode::FORBIDDEN, String::new()).is_retryable());
    }

    #[test]
    fn fields_get_attributes_map_to_descriptors() {
        let computed = descriptor_from_attrs("total_due", &json!({"type": "monetary", "readonly": true, "store": false}));
        assert_eq!(computed.mutability, Mutability::Computed);
        let stored_readonly = descriptor_from_attrs("create_date", &json!({"type": "datetime", "readonly": true, "store": true}));
        assert_eq!(stored_readonly.mutability, Mutability::ReadOnly);
        let parent = descriptor_from_attrs("parent_id", &json!({"type": "many2one", "relation": "res.partner"}));
        assert_eq!(parent.relation, RelationKind::ManyToOne);
        assert_eq!(parent.target.as_deref(), Some("res.partner"));
        assert!(parent.is_writable());
    }

    #[test]
    fn external_ids_default_to_import_module() {
        assert_eq!(split_external_id("base.main_company"), ("base", "main_company"));
        assert_eq!(split_external_id("partner_1"), ("__import__", "partner_1"));
    }

    #[test]
    fn load_payload_names_relation_columns_by_key_kind() {
        let schema = schema();
        let records = vec![
            Record::new()
                .with_external_key("p1")
                .with_field("name", "Acme")
                .with_field("is_company", true)
                .with_field("parent_id", 7)
                .with_field("category_id", json!([1, 2])),
            Record::new().with_external_key("p2").with_field("name", "Beta"),
        ];
        let (header, rows) = load_payload(Some(&schema), &records, WriteMode::Upsert);
        assert_eq!(
            header,
            vec!["id", "name", "is_company", "parent_id/.id", "category_id/.id"]
        );
        assert_eq!(rows[0], vec!["p1", "Acme", "1", "7", "1,2"]);
        assert_eq!(rows[1], vec!["p2", "Beta", "", "", ""]);
    }

    #[test]
    fn update_only_targets_internal_keys() {
        let records = vec![Record::new()
            .with_external_key("p1")
            .with_internal_key(42)
            .with_field("parent_id", 7)];
        let (header, rows) = load_payload(Some(&schema()), &records, WriteMode::UpdateOnly);
        assert_eq!(header, vec![".id", "parent_id/.id"]);
        assert_eq!(rows[0], vec!["42", "7"]);
    }

    #[test]
    fn empty_relation_shares_the_column_of_resolved_ones() {
        let records = vec![
            Record::new().with_internal_key(2).with_field("parent_id", 1),
            Record::new()
                .with_internal_key(1)
                .with_field("parent_id", Value::Null),
        ];
        let (header, rows) = load_payload(Some(&schema()), &records, WriteMode::UpdateOnly);
        assert_eq!(header, vec![".id", "parent_id/.id"]);
        assert_eq!(rows, vec![vec!["2", "1"], vec!["1", ""]]);

        let by_xid = vec![
            Record::new().with_external_key("a").with_field("parent_id", Value::Null),
            Record::new().with_external_key("b").with_field("parent_id", "a"),
        ];
        let (header, rows) = load_payload(Some(&schema()), &by_xid, WriteMode::Upsert);
        assert_eq!(header, vec!["id", "parent_id/id"]);
        assert_eq!(rows, vec![vec!["a", ""], vec!["b", "a"]]);
    }
}
