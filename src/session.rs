use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::source::SourceFormat;

const SESSION_SCHEMA_VERSION: u32 = 1;
const SESSION_ID_LEN: usize = 16;

const SPEC_FILE: &str = "spec.json";
const STATE_FILE: &str = "state.json";
const TARGETS_FILE: &str = "all_ids.json";
const COMPLETED_FILE: &str = "completed_ids.txt";

/// What an export asked for. Its hash is the session identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub schema_version: u32,
    pub model: String,
    pub filter: Value,
    pub fields: Vec<String>,
}

impl SessionSpec {
    pub fn new(model: &str, filter: &Value, fields: &[String]) -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            model: model.to_string(),
            filter: filter.clone(),
            fields: fields.to_vec(),
        }
    }

    pub fn id(&self) -> SyncResult<String> {
        let canonical = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&canonical);
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        out.truncate(SESSION_ID_LEN);
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Interrupted,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub schema_version: u32,
    pub session_id: String,
    pub status: SessionStatus,
    pub target_count: Option<usize>,
    pub completed_count: usize,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub output_format: Option<SourceFormat>,
    pub started_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub model: String,
    pub fields: Vec<String>,
    pub filter: Value,
    pub status: SessionStatus,
    pub target_count: Option<usize>,
    pub completed_count: usize,
    pub output_path: Option<String>,
    pub updated_at: String,
}

/// Persisted progress of exports, one directory per session under `root`.
#[derive(Debug, Clone)]
pub struct SessionManager {
    root: PathBuf,
}

impl SessionManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_id(model: &str, filter: &Value, fields: &[String]) -> SyncResult<String> {
        SessionSpec::new(model, filter, fields).id()
    }

    /// Picks up the session for this request shape, or starts one.
    ///
    /// State that cannot be read back, or that belongs to a different request,
    /// is thrown away and a fresh session takes its place.
    pub fn begin(&self, model: &str, filter: &Value, fields: &[String]) -> SyncResult<ExportSession> {
        let spec = SessionSpec::new(model, filter, fields);
        let id = spec.id()?;
        let dir = self.root.join(&id);

        if dir.exists() {
            match ExportSession::load(&id, &dir, Some(&spec)) {
                Ok(session) => {
                    info!(
                        session = %id,
                        completed = session.completed.len(),
                        targets = session.targets.as_ref().map(BTreeSet::len),
                        "resuming export session"
                    );
                    return Ok(session);
                }
                Err(reason) => {
                    warn!(session = %id, %reason, "discarding unusable export session");
                    fs::remove_dir_all(&dir)
                        .map_err(|err| SyncError::io("failed to remove", &dir, err))?;
                }
            }
        }
        ExportSession::create(id, dir, spec)
    }

    /// Opens an existing session by id.
    pub fn open(&self, id: &str) -> SyncResult<ExportSession> {
        check_id(id)?;
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(SyncError::Session {
                id: id.to_string(),
                message: "no such session".to_string(),
            });
        }
        ExportSession::load(id, &dir, None).map_err(|message| SyncError::Session {
            id: id.to_string(),
            message,
        })
    }

    pub fn list(&self) -> SyncResult<Vec<SessionSummary>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        let entries =
            fs::read_dir(&self.root).map_err(|err| SyncError::io("failed to read", &self.root, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::io("failed to read", &self.root, err))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match ExportSession::load(&id, &path, None) {
                Ok(session) => sessions.push(session.summary()),
                Err(reason) => debug!(session = %id, %reason, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Deletes a session. Returns false when it did not exist.
    pub fn remove(&self, id: &str) -> SyncResult<bool> {
        check_id(id)?;
        let dir = self.root.join(id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|err| SyncError::io("failed to remove", &dir, err))?;
        Ok(true)
    }
}

#[derive(Debug)]
pub struct ExportSession {
    id: String,
    dir: PathBuf,
    spec: SessionSpec,
    targets: Option<BTreeSet<i64>>,
    completed: BTreeSet<i64>,
    state: SessionState,
    resumed: bool,
    /// Set once the completion log is known to end on a line boundary.
    log_aligned: bool,
}

impl ExportSession {
    fn create(id: String, dir: PathBuf, spec: SessionSpec) -> SyncResult<Self> {
        fs::create_dir_all(&dir).map_err(|err| SyncError::io("failed to create", &dir, err))?;
        let now = now();
        let state = SessionState {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: id.clone(),
            status: SessionStatus::Running,
            target_count: None,
            completed_count: 0,
            output_path: None,
            output_format: None,
            started_at: now.clone(),
            updated_at: now,
            message: None,
        };
        write_json_atomic(&dir.join(SPEC_FILE), &spec)?;
        write_json_atomic(&dir.join(STATE_FILE), &state)?;
        debug!(session = %id, dir = %dir.display(), "created export session");
        Ok(Self {
            id,
            dir,
            spec,
            targets: None,
            completed: BTreeSet::new(),
            state,
            resumed: false,
            log_aligned: true,
        })
    }

    fn load(id: &str, dir: &Path, expected: Option<&SessionSpec>) -> Result<Self, String> {
        let spec: SessionSpec = read_json_file(&dir.join(SPEC_FILE))?;
        if expected.is_some_and(|expected| expected != &spec) {
            return Err("stored request does not match".to_string());
        }
        if spec.schema_version != SESSION_SCHEMA_VERSION {
            return Err(format!("unsupported schema version {}", spec.schema_version));
        }
        let state: SessionState = read_json_file(&dir.join(STATE_FILE))?;
        if state.session_id != id {
            return Err(format!("state belongs to session {}", state.session_id));
        }

        let targets_path = dir.join(TARGETS_FILE);
        let targets = if targets_path.exists() {
            let ids: Vec<i64> = read_json_file(&targets_path)?;
            Some(ids.into_iter().collect::<BTreeSet<i64>>())
        } else {
            None
        };
        let completed = read_completed(&dir.join(COMPLETED_FILE))?;
        match &targets {
            Some(targets) => {
                if let Some(stray) = completed.iter().find(|id| !targets.contains(id)) {
                    return Err(format!("completed id {stray} is not a target"));
                }
            }
            None if !completed.is_empty() => {
                return Err("completed ids recorded without targets".to_string());
            }
            None => {}
        }

        Ok(Self {
            id: id.to_string(),
            dir: dir.to_path_buf(),
            spec,
            targets,
            completed,
            state,
            resumed: true,
            log_aligned: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// True when this session was picked up from an earlier run.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn has_targets(&self) -> bool {
        self.targets.is_some()
    }

    pub fn target_count(&self) -> usize {
        self.targets.as_ref().map_or(0, BTreeSet::len)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Stores the full id set of the export. Done once per session.
    pub fn record_targets(&mut self, ids: impl IntoIterator<Item = i64>) -> SyncResult<()> {
        let targets: BTreeSet<i64> = ids.into_iter().collect();
        let ordered: Vec<i64> = targets.iter().copied().collect();
        write_json_atomic(&self.dir.join(TARGETS_FILE), &ordered)?;
        self.state.target_count = Some(targets.len());
        self.targets = Some(targets);
        self.save_state()
    }

    pub fn mark_complete(&mut self, ids: &[i64]) -> SyncResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(COMPLETED_FILE);
        if !self.log_aligned {
            drop_torn_tail(&path).map_err(|err| SyncError::io("failed to repair", &path, err))?;
            self.log_aligned = true;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| SyncError::io("failed to open", &path, err))?;
        let mut writer = BufWriter::new(file);
        for id in ids {
            writeln!(writer, "{id}").map_err(|err| SyncError::io("failed to write", &path, err))?;
        }
        writer
            .flush()
            .map_err(|err| SyncError::io("failed to flush", &path, err))?;
        self.completed.extend(ids.iter().copied());
        self.state.completed_count = self.completed.len();
        self.save_state()
    }

    /// Target ids not yet written, ascending.
    pub fn remaining(&self) -> BTreeSet<i64> {
        match &self.targets {
            Some(targets) => targets.difference(&self.completed).copied().collect(),
            None => BTreeSet::new(),
        }
    }

    /// Ties the session to the file its rows go to.
    ///
    /// Once rows have been written, a later run must append to the same file
    /// in the same format; anything else is refused and nothing is saved.
    pub fn bind_output(&mut self, path: &Path, format: SourceFormat) -> SyncResult<()> {
        let recorded = self.state.output_path.as_deref().map(Path::new);
        if !self.completed.is_empty() {
            if let Some(recorded) = recorded.filter(|recorded| *recorded != path) {
                return Err(SyncError::Session {
                    id: self.id.clone(),
                    message: format!(
                        "rows were already written to {}; rerun with that output or start over with --fresh",
                        recorded.display()
                    ),
                });
            }
            if let Some(recorded) = self.state.output_format.filter(|recorded| *recorded != format) {
                return Err(SyncError::Session {
                    id: self.id.clone(),
                    message: format!(
                        "rows were already written as {}; rerun in that format or start over with --fresh",
                        recorded.as_str()
                    ),
                });
            }
        }
        self.state.output_path = Some(path.display().to_string());
        self.state.output_format = Some(format);
        self.save_state()
    }

    /// Keeps the session on disk for a later resume.
    pub fn retain(&mut self, status: SessionStatus, message: Option<String>) -> SyncResult<()> {
        self.state.status = status;
        self.state.message = message;
        self.save_state()
    }

    /// Deletes the persisted state after a complete export.
    pub fn finish(self) -> SyncResult<()> {
        fs::remove_dir_all(&self.dir).map_err(|err| SyncError::io("failed to remove", &self.dir, err))?;
        info!(session = %self.id, "export session finished");
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            model: self.spec.model.clone(),
            fields: self.spec.fields.clone(),
            filter: self.spec.filter.clone(),
            status: self.state.status,
            target_count: self.state.target_count,
            completed_count: self.completed.len(),
            output_path: self.state.output_path.clone(),
            updated_at: self.state.updated_at.clone(),
        }
    }

    fn save_state(&mut self) -> SyncResult<()> {
        self.state.updated_at = now();
        write_json_atomic(&self.dir.join(STATE_FILE), &self.state)
    }
}

/// Ids from the append-only completion log. A final line without a newline
/// is a torn write and is ignored.
fn read_completed(path: &Path) -> Result<BTreeSet<i64>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };
    let complete = match contents.rfind('\n') {
        Some(end) => &contents[..end],
        None => "",
    };
    let mut ids = BTreeSet::new();
    for (idx, line) in complete.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let id = line
            .parse::<i64>()
            .map_err(|_| format!("{} line {} is not an id", path.display(), idx + 1))?;
        ids.insert(id);
    }
    Ok(ids)
}

/// Cuts a partial final line off the completion log so the next append
/// starts on its own line.
fn drop_torn_tail(path: &Path) -> std::io::Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    if matches!(contents.last(), None | Some(b'\n')) {
        return Ok(());
    }
    let keep = contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |pos| pos + 1);
    warn!(
        path = %path.display(),
        dropped = contents.len() - keep,
        "dropping partial line from completion log"
    );
    file.set_len(keep as u64)?;
    file.sync_all()
}

fn check_id(id: &str) -> SyncResult<()> {
    let well_formed = id.len() == SESSION_ID_LEN
        && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(SyncError::Session {
            id: id.to_string(),
            message: format!("not a session id; expected {SESSION_ID_LEN} lowercase hex characters"),
        })
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> SyncResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| SyncError::io("failed to write", &tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| SyncError::io("failed to replace", path, err))?;
    Ok(())
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes = fs::read(path).map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|err| format!("failed to parse {}: {err}", path.display()))
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
