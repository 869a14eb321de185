//! The fail file: rows that did not make it, ready to be fixed and re-imported.

use std::path::Path;

use crate::error::{SyncError, SyncResult};
use crate::record::FailureRecord;
use crate::source::SourceRow;

pub const ERROR_REASON_COLUMN: &str = "_ERROR_REASON";

/// Writes the original columns of every failed row plus the failure reason.
///
/// Rows appear once, in input order. Returns the number of rows written.
pub fn write_fail_file(
    path: &Path,
    header: &[String],
    rows: &[SourceRow],
    failures: &[FailureRecord],
    separator: u8,
) -> SyncResult<usize> {
    let mut failed: Vec<&FailureRecord> = failures.iter().collect();
    failed.sort_by_key(|failure| failure.row);
    failed.dedup_by_key(|failure| failure.row);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| SyncError::io("failed to create", parent, err))?;
    }
    let mut writer = csv::WriterBuilder::new().delimiter(separator).from_path(path)?;
    let mut columns: Vec<&str> = header.iter().map(String::as_str).collect();
    columns.push(ERROR_REASON_COLUMN);
    writer.write_record(&columns)?;

    for failure in &failed {
        let source = rows.get(failure.row);
        let mut line: Vec<String> = header
            .iter()
            .map(|column| {
                source
                    .and_then(|row| row.get(column))
                    .map(crate::sink::cell_text)
                    .unwrap_or_default()
            })
            .collect();
        line.push(failure.reason.replace(['\n', '\r'], " "));
        writer.write_record(&line)?;
    }
    writer
        .flush()
        .map_err(|err| SyncError::io("failed to flush", path, err))?;
    Ok(failed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FailureTier, Record};
    use serde_json::json;
    use tempfile::TempDir;

    fn source_row(id: &str, name: &str) -> SourceRow {
        let mut row = SourceRow::new();
        row.insert("id".into(), json!(id));
        row.insert("name".into(), json!(name));
        row
    }

    fn failure(row: usize, reason: &str) -> FailureRecord {
        FailureRecord {
            row,
            record: Record::new(),
            reason: reason.to_string(),
            tier: FailureTier::Record,
            pass: 0,
        }
    }

    #[test]
    fn failed_rows_keep_their_columns_and_reason() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out/partners_fail.csv");
        let header = vec!["id".to_string(), "name".to_string()];
        let rows = vec![source_row("p1", "Acme"), source_row("p2", ""), source_row("p3", "Gamma")];
        let failures = vec![
            failure(1, "Missing required value for the field 'name'\nline two"),
            failure(1, "duplicate"),
        ];

        let written = write_fail_file(&path, &header, &rows, &failures, b',').unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "id,name,_ERROR_REASON\np2,,Missing required value for the field 'name' line two\n"
        );
    }
}
