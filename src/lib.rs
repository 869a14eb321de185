//! Bulk record transfer between local files and a remote record store.
//!
//! Imports run as one to three barrier-separated passes chosen from the
//! relations being written; each pass is batched, written by a worker pool and
//! retried record by record when a batch fails. Exports stream batches of
//! normalized rows into a sink and persist their progress so an interrupted
//! run picks up where it stopped.

pub mod analyzer;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod export;
pub mod failures;
pub mod metadata;
pub mod record;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod source;

pub use analyzer::{DependencyAnalyzer, PlanKind, TransferPlan};
pub use coordinator::{import_records, ImportOptions, MultiPassCoordinator};
pub use error::{RemoteError, SyncError, SyncResult};
pub use export::{export_records, ExportOptions, ExportRun, ExportSummary};
pub use metadata::{FieldDescriptor, MetadataCache, RelationKind};
pub use record::{FailureRecord, Record, TransferReport, WriteMode};
pub use remote::{JsonRpcConfig, JsonRpcStore, MemoryStore, RemoteStore};
pub use session::{ExportSession, SessionManager};
pub use sink::{CsvSink, JsonlSink, RowSink};
pub use source::{ColumnTransform, RowTransform};
