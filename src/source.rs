//! Reading import files and turning their rows into records.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};
use crate::record::Record;

/// One input row, keyed by column name in file order.
pub type SourceRow = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Csv,
    Jsonl,
}

impl SourceFormat {
    /// Guesses the format from a file extension, defaulting to CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("jsonl") || ext.eq_ignore_ascii_case("ndjson") => {
                Self::Jsonl
            }
            _ => Self::Csv,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Jsonl => "jsonl",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    pub header: Vec<String>,
    pub rows: Vec<SourceRow>,
}

impl SourceTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn read_source(path: &Path, format: SourceFormat, separator: u8) -> SyncResult<SourceTable> {
    match format {
        SourceFormat::Csv => read_csv(path, separator),
        SourceFormat::Jsonl => read_jsonl(path),
    }
}

pub fn read_csv(path: &Path, separator: u8) -> SyncResult<SourceTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator)
        .flexible(false)
        .from_path(path)?;
    let header: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let mut row = Map::new();
        for (name, cell) in header.iter().zip(record.iter()) {
            row.insert(name.clone(), Value::String(cell.to_string()));
        }
        rows.push(row);
    }
    Ok(SourceTable { header, rows })
}

pub fn read_jsonl(path: &Path) -> SyncResult<SourceTable> {
    let file = File::open(path).map_err(|err| SyncError::io("failed to open", path, err))?;
    let mut table = SourceTable::default();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| SyncError::io("failed to read", path, err))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: SourceRow = match serde_json::from_str::<Value>(&line)? {
            Value::Object(row) => row,
            _ => {
                return Err(SyncError::InvalidArgument(format!(
                    "{} line {} is not a JSON object",
                    path.display(),
                    idx + 1
                )));
            }
        };
        for key in row.keys() {
            if !table.header.contains(key) {
                table.header.push(key.clone());
            }
        }
        table.rows.push(row);
    }
    Ok(table)
}

/// Turns one source row into a record.
pub trait RowTransform: Send + Sync {
    fn transform(&self, row: &SourceRow) -> SyncResult<Record>;
}

/// The column conventions of import files.
///
/// `id` is the external key and `.id` the internal key. A relation column may
/// be written `field/id` (external keys of the targets) or `field/.id`
/// (internal keys), comma separated for to-many fields. Empty cells become
/// null values.
#[derive(Debug, Clone, Default)]
pub struct ColumnTransform {
    ignored: Vec<String>,
}

impl ColumnTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops columns whose base name (before any `/`) is listed.
    pub fn with_ignored(mut self, columns: impl IntoIterator<Item = String>) -> Self {
        self.ignored.extend(columns);
        self
    }

    fn is_ignored(&self, column: &str) -> bool {
        let base = column.split('/').next().unwrap_or(column);
        self.ignored.iter().any(|ignored| ignored == base)
    }
}

impl RowTransform for ColumnTransform {
    fn transform(&self, row: &SourceRow) -> SyncResult<Record> {
        let mut record = Record::new();
        for (column, value) in row {
            if self.is_ignored(column) {
                continue;
            }
            let text = cell_text(value);
            match column.split_once('/') {
                None if column == "id" => {
                    if !text.is_empty() {
                        record.external_key = Some(text);
                    }
                }
                None if column == ".id" => {
                    if !text.is_empty() {
                        let id = text.parse::<i64>().map_err(|_| {
                            SyncError::InvalidArgument(format!("invalid .id value {text:?}"))
                        })?;
                        record.internal_key = Some(id);
                    }
                }
                None => {
                    let value = match value {
                        Value::String(s) if s.is_empty() => Value::Null,
                        other => other.clone(),
                    };
                    record.fields.insert(column.clone(), value);
                }
                Some((field, "id")) => {
                    let value = if text.is_empty() {
                        Value::Null
                    } else {
                        Value::String(text)
                    };
                    record.fields.insert(field.to_string(), value);
                }
                Some((field, ".id")) => {
                    record.fields.insert(field.to_string(), internal_ids(field, value)?);
                }
                Some(_) => {
                    return Err(SyncError::InvalidArgument(format!(
                        "unsupported column {column}; expected <field>, <field>/id or <field>/.id"
                    )));
                }
            }
        }
        Ok(record)
    }
}

/// Field names a transformed table will write, in column order.
pub fn field_names(header: &[String], transform: &ColumnTransform) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for column in header {
        if column == "id" || column == ".id" || transform.is_ignored(column) {
            continue;
        }
        let field = column.split('/').next().unwrap_or(column).to_string();
        if !names.contains(&field) {
            names.push(field);
        }
    }
    names
}

pub fn transform_rows(rows: &[SourceRow], transform: &dyn RowTransform) -> SyncResult<Vec<Record>> {
    rows.iter()
        .enumerate()
        .map(|(idx, row)| {
            transform.transform(row).map_err(|err| match err {
                SyncError::InvalidArgument(message) => {
                    SyncError::InvalidArgument(format!("row {}: {message}", idx + 1))
                }
                other => other,
            })
        })
        .collect()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn internal_ids(field: &str, value: &Value) -> SyncResult<Value> {
    let parse = |part: &str| {
        part.trim().parse::<i64>().map_err(|_| {
            SyncError::InvalidArgument(format!("invalid {field}/.id value {part:?}"))
        })
    };
    match value {
        Value::Number(_) | Value::Null => Ok(value.clone()),
        Value::Array(_) => Ok(value.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) if s.contains(',') => {
            let ids = s
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| parse(part).map(Value::from))
                .collect::<SyncResult<Vec<Value>>>()?;
            Ok(Value::Array(ids))
        }
        Value::String(s) => Ok(Value::from(parse(s)?)),
        other => Err(SyncError::InvalidArgument(format!(
            "invalid {field}/.id value {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(pairs: &[(&str, Value)]) -> SourceRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn key_columns_become_record_keys() {
        let record = ColumnTransform::new()
            .transform(&row(&[
                ("id", json!("partner_1")),
                (".id", json!("42")),
                ("name", json!("Acme")),
                ("email", json!("")),
            ]))
            .unwrap();
        assert_eq!(record.external_key.as_deref(), Some("partner_1"));
        assert_eq!(record.internal_key, Some(42));
        assert_eq!(record.get("name"), Some(&json!("Acme")));
        assert_eq!(record.get("email"), Some(&Value::Null));
    }

    #[test]
    fn relation_columns_keep_key_kind() {
        let record = ColumnTransform::new()
            .transform(&row(&[
                ("parent_id/id", json!("partner_0")),
                ("category_id/.id", json!("3, 4")),
                ("user_id/.id", json!("9")),
            ]))
            .unwrap();
        assert_eq!(record.get("parent_id"), Some(&json!("partner_0")));
        assert_eq!(record.get("category_id"), Some(&json!([3, 4])));
        assert_eq!(record.get("user_id"), Some(&json!(9)));
    }

    #[test]
    fn ignored_columns_are_dropped_by_base_name() {
        let transform = ColumnTransform::new().with_ignored(["parent_id".to_string()]);
        let input = row(&[("name", json!("Acme")), ("parent_id/id", json!("partner_0"))]);
        let record = transform.transform(&input).unwrap();
        assert!(record.get("parent_id").is_none());
        assert_eq!(
            field_names(&["id".into(), "name".into(), "parent_id/id".into()], &transform),
            vec!["name"]
        );
    }

    #[test]
    fn bad_internal_key_names_the_row() {
        let rows = vec![row(&[(".id", json!("1"))]), row(&[(".id", json!("x"))])];
        let err = transform_rows(&rows, &ColumnTransform::new()).unwrap_err();
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn reads_csv_with_custom_separator() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("partners.csv");
        std::fs::write(&path, "id;name;parent_id/id\np1;Acme;\np2;Beta;p1\n").unwrap();
        let table = read_source(&path, SourceFormat::from_path(&path), b';').unwrap();
        assert_eq!(table.header, vec!["id", "name", "parent_id/id"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[1]["parent_id/id"], json!("p1"));
    }

    #[test]
    fn reads_jsonl_and_collects_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("partners.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"p1\",\"name\":\"Acme\"}\n\n{\"id\":\"p2\",\"is_company\":true}\n",
        )
        .unwrap();
        assert_eq!(SourceFormat::from_path(&path), SourceFormat::Jsonl);
        let table = read_jsonl(&path).unwrap();
        assert_eq!(table.header, vec!["id", "name", "is_company"]);
        assert_eq!(table.rows[1]["is_company"], json!(true));
    }
}
