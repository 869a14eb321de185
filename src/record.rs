use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row headed for, or coming from, the remote store.
///
/// `fields` keeps insertion order so output columns follow the input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_key: Option<i64>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_external_key(mut self, key: impl Into<String>) -> Self {
        self.external_key = Some(key.into());
        self
    }

    pub fn with_internal_key(mut self, key: i64) -> Self {
        self.internal_key = Some(key);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// A record that can only target an existing remote row.
    pub fn is_update_only(&self) -> bool {
        self.external_key.is_none() && self.internal_key.is_some()
    }

    pub fn has_key(&self) -> bool {
        self.external_key.is_some() || self.internal_key.is_some()
    }

    /// Copy of this record carrying the keys plus the listed fields that are present.
    pub fn project(&self, fields: &[String]) -> Record {
        let mut projected = Map::new();
        for name in fields {
            if let Some(value) = self.fields.get(name) {
                projected.insert(name.clone(), value.clone());
            }
        }
        Record {
            external_key: self.external_key.clone(),
            internal_key: self.internal_key,
            fields: projected,
        }
    }

    /// String form of a field, used for grouping and reporting.
    pub fn field_text(&self, field: &str) -> String {
        value_text(self.fields.get(field))
    }
}

pub fn value_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(false)) => String::new(),
        Some(other) => other.to_string(),
    }
}

/// How a pass writes its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Create or update by external key, update by internal key when only that is known.
    Upsert,
    /// Touch existing rows only.
    UpdateOnly,
}

impl WriteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::UpdateOnly => "update_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTier {
    /// Never individually attempted, e.g. after an abort.
    Batch,
    /// Rejected when written on its own.
    Record,
}

impl FailureTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Record => "record",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Zero-based position in the input.
    pub row: usize,
    pub record: Record,
    pub reason: String,
    pub tier: FailureTier,
    /// Zero-based pass in which the record failed.
    pub pass: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassSummary {
    pub index: usize,
    pub mode: WriteMode,
    pub fields: Vec<String>,
    pub batches: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records only Tier 2 got through.
    pub rescued: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReport {
    pub model: String,
    pub total_records: usize,
    /// Records that made it through every pass they took part in.
    pub success_count: usize,
    pub failures: Vec<FailureRecord>,
    pub warnings: Vec<String>,
    pub passes: Vec<PassSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl TransferReport {
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn internal_key_only_is_update_only() {
        let record = Record::new().with_internal_key(7);
        assert!(record.is_update_only());

        let both = Record::new().with_internal_key(7).with_external_key("p_7");
        assert!(!both.is_update_only());
        assert!(!Record::new().is_update_only());
    }

    #[test]
    fn project_keeps_keys_and_requested_fields() {
        let record = Record::new()
            .with_external_key("p1")
            .with_field("name", "Acme")
            .with_field("parent_id", "p0")
            .with_field("email", "a@example.com");

        let projected = record.project(&["parent_id".to_string(), "missing".to_string()]);
        assert_eq!(projected.external_key.as_deref(), Some("p1"));
        assert_eq!(projected.fields.len(), 1);
        assert_eq!(projected.get("parent_id"), Some(&json!("p0")));
    }

    #[test]
    fn field_text_renders_scalars() {
        let record = Record::new()
            .with_field("n", 3)
            .with_field("flag", false)
            .with_field("s", "x")
            .with_field("none", Value::Null);
        assert_eq!(record.field_text("n"), "3");
        assert_eq!(record.field_text("flag"), "");
        assert_eq!(record.field_text("s"), "x");
        assert_eq!(record.field_text("none"), "");
        assert_eq!(record.field_text("absent"), "");
    }

    #[test]
    fn report_success_requires_no_failures_and_no_abort() {
        let mut report = TransferReport {
            model: "res.partner".into(),
            total_records: 1,
            success_count: 1,
            failures: Vec::new(),
            warnings: Vec::new(),
            passes: Vec::new(),
            aborted: None,
        };
        assert!(report.is_complete_success());
        report.aborted = Some("stopped".into());
        assert!(!report.is_complete_success());
    }
}
