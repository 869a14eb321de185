//! The narrow API the engine needs from a remote record store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::RemoteError;
use crate::metadata::FieldDescriptor;
use crate::record::{Record, WriteMode};

mod jsonrpc;
mod memory;

pub use jsonrpc::{JsonRpcConfig, JsonRpcStore};
pub use memory::{MemoryStore, WriteRule};

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Result of one record inside a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(i64),
    Rejected(String),
}

/// Rows matching a filter. Filters are domain-style JSON lists such as
/// `[["active", "=", true]]`; an empty list matches everything.
pub type Filter = Value;

#[async_trait]
pub trait RemoteWriter: Send + Sync {
    /// Writes a whole batch.
    ///
    /// `Err` means the batch as a whole was not applied. `Ok` carries one
    /// outcome per input record, in input order.
    async fn bulk_write(
        &self,
        model: &str,
        records: &[Record],
        mode: WriteMode,
    ) -> RemoteResult<Vec<WriteOutcome>>;

    /// Writes one record and returns its internal key.
    async fn single_write(&self, model: &str, record: &Record, mode: WriteMode)
        -> RemoteResult<i64>;
}

#[async_trait]
pub trait RemoteReader: Send + Sync {
    /// Internal keys matching `filter`, ascending.
    async fn search(&self, model: &str, filter: &Filter) -> RemoteResult<Vec<i64>>;

    /// Field values for `ids`. With `raw` set, relations come back as bare
    /// internal keys instead of `[id, display_name]` pairs.
    async fn fetch(
        &self,
        model: &str,
        ids: &[i64],
        fields: &[String],
        raw: bool,
    ) -> RemoteResult<Vec<Map<String, Value>>>;
}

#[async_trait]
pub trait RemoteMetadata: Send + Sync {
    async fn describe_fields(&self, model: &str)
        -> RemoteResult<BTreeMap<String, FieldDescriptor>>;

    /// Opaque marker that changes whenever the model's schema changes.
    async fn schema_fingerprint(&self, model: &str) -> RemoteResult<String>;

    async fn resolve_external_id(&self, model: &str, key: &str) -> RemoteResult<Option<i64>>;
}

pub trait RemoteStore: RemoteWriter + RemoteReader + RemoteMetadata {}

impl<T: RemoteWriter + RemoteReader + RemoteMetadata> RemoteStore for T {}
