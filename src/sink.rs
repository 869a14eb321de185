//! Destinations for exported rows.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// Receives exported rows in the order the export produces them.
///
/// The exporter calls `flush` after every batch and only then marks the
/// batch complete, so anything flushed survives a crash.
pub trait RowSink: Send {
    fn write_header(&mut self, header: &[String]) -> SyncResult<()>;
    fn write_row(&mut self, row: &[Value]) -> SyncResult<()>;
    fn flush(&mut self) -> SyncResult<()>;
}

/// Text form of an exported cell.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(inner: W, separator: u8) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(separator)
            .has_headers(false)
            .from_writer(inner);
        Self { writer }
    }

    pub fn into_inner(self) -> SyncResult<W> {
        self.writer
            .into_inner()
            .map_err(|err| SyncError::InvalidArgument(format!("failed to finish csv output: {err}")))
    }
}

impl CsvSink<File> {
    /// Opens `path` for writing. With `append` set the existing rows stay
    /// and the caller is expected to skip the header.
    pub fn open(path: &Path, separator: u8, append: bool) -> SyncResult<Self> {
        let file = open_output(path, append)?;
        Ok(Self::new(file, separator))
    }
}

impl<W: Write + Send> RowSink for CsvSink<W> {
    fn write_header(&mut self, header: &[String]) -> SyncResult<()> {
        self.writer.write_record(header)?;
        Ok(())
    }

    fn write_row(&mut self, row: &[Value]) -> SyncResult<()> {
        self.writer.write_record(row.iter().map(cell_text))?;
        Ok(())
    }

    fn flush(&mut self) -> SyncResult<()> {
        self.writer
            .flush()
            .map_err(|err| SyncError::io("failed to flush", "csv output", err))
    }
}

/// One JSON object per line, keyed by the export header.
pub struct JsonlSink {
    path: PathBuf,
    header: Vec<String>,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn open(path: &Path, append: bool) -> SyncResult<Self> {
        let file = open_output(path, append)?;
        Ok(Self {
            path: path.to_path_buf(),
            header: Vec::new(),
            writer: BufWriter::new(file),
        })
    }
}

impl RowSink for JsonlSink {
    // JSONL has no header line; the names only key each object.
    fn write_header(&mut self, header: &[String]) -> SyncResult<()> {
        self.header = header.to_vec();
        Ok(())
    }

    fn write_row(&mut self, row: &[Value]) -> SyncResult<()> {
        let mut object = Map::new();
        for (idx, value) in row.iter().enumerate() {
            let key = self
                .header
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("column_{}", idx + 1));
            object.insert(key, value.clone());
        }
        let line = serde_json::to_string(&Value::Object(object))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|err| SyncError::io("failed to write", &self.path, err))
    }

    fn flush(&mut self) -> SyncResult<()> {
        self.writer
            .flush()
            .map_err(|err| SyncError::io("failed to flush", &self.path, err))
    }
}

fn open_output(path: &Path, append: bool) -> SyncResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| SyncError::io("failed to create", parent, err))?;
    }
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(path)
        .map_err(|err| SyncError::io("failed to open", path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn csv_renders_cells() {
        let mut sink = CsvSink::new(Vec::new(), b';');
        sink.write_header(&["name".into(), "active".into(), "parent".into()])
            .unwrap();
        sink.write_row(&[json!("Acme; Inc"), json!(false), Value::Null])
            .unwrap();
        sink.write_row(&[json!("Beta"), json!(true), json!(7)]).unwrap();
        sink.flush().unwrap();
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out, "name;active;parent\n\"Acme; Inc\";false;\nBeta;true;7\n");
    }

    #[test]
    fn csv_append_keeps_prior_rows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.csv");
        {
            let mut sink = CsvSink::open(&path, b',', false).unwrap();
            sink.write_header(&["id".into()]).unwrap();
            sink.write_row(&[json!(1)]).unwrap();
            sink.flush().unwrap();
        }
        {
            let mut sink = CsvSink::open(&path, b',', true).unwrap();
            sink.write_row(&[json!(2)]).unwrap();
            sink.flush().unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "id\n1\n2\n");
    }

    #[test]
    fn jsonl_keys_rows_by_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/out.jsonl");
        let mut sink = JsonlSink::open(&path, false).unwrap();
        sink.write_header(&["name".into(), "active".into()]).unwrap();
        sink.write_row(&[json!("Acme"), json!(false)]).unwrap();
        sink.flush().unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"name\":\"Acme\",\"active\":false}\n"
        );
    }
}
