use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;

pub const DEFAULT_FINGERPRINT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    None,
    ManyToOne,
    ManyToMany,
    OneToMany,
}

impl RelationKind {
    pub fn is_to_many(self) -> bool {
        matches!(self, Self::ManyToMany | Self::OneToMany)
    }

    pub fn is_relation(self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    Writable,
    ReadOnly,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// Remote type name, e.g. `char`, `boolean`, `many2one`.
    pub field_type: String,
    pub relation: RelationKind,
    pub mutability: Mutability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Set by [`MetadataCache`] when `target` is the described model.
    #[serde(default)]
    pub self_referential: bool,
}

impl FieldDescriptor {
    pub fn scalar(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            relation: RelationKind::None,
            mutability: Mutability::Writable,
            target: None,
            self_referential: false,
        }
    }

    pub fn relation(name: &str, relation: RelationKind, target: &str) -> Self {
        let field_type = match relation {
            RelationKind::ManyToOne => "many2one",
            RelationKind::ManyToMany => "many2many",
            RelationKind::OneToMany => "one2many",
            RelationKind::None => "char",
        };
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            relation,
            mutability: Mutability::Writable,
            target: Some(target.to_string()),
            self_referential: false,
        }
    }

    pub fn with_mutability(mut self, mutability: Mutability) -> Self {
        self.mutability = mutability;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.mutability == Mutability::Writable
    }

    pub fn is_boolean(&self) -> bool {
        self.field_type == "boolean"
    }

    /// Types whose plain read value is a display label rather than the stored value.
    pub fn needs_raw_read(&self) -> bool {
        matches!(self.field_type.as_str(), "selection" | "binary")
    }
}

pub type FieldMap = Arc<BTreeMap<String, FieldDescriptor>>;

struct ModelEntry {
    fields: FieldMap,
    fingerprint: String,
    checked_at: Instant,
}

type ModelSlot = Arc<tokio::sync::Mutex<Option<ModelEntry>>>;

/// Schema and external-id cache shared by every worker of a run.
///
/// Each model gets its own async slot; the map lock is only held long enough
/// to find or create that slot, never across a remote call.
pub struct MetadataCache {
    remote: Arc<dyn RemoteStore>,
    fingerprint_ttl: Duration,
    models: Mutex<HashMap<String, ModelSlot>>,
    external_ids: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl MetadataCache {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self::with_fingerprint_ttl(remote, DEFAULT_FINGERPRINT_TTL)
    }

    pub fn with_fingerprint_ttl(remote: Arc<dyn RemoteStore>, fingerprint_ttl: Duration) -> Self {
        Self {
            remote,
            fingerprint_ttl,
            models: Mutex::new(HashMap::new()),
            external_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Field descriptors of `model`.
    pub async fn describe(&self, model: &str) -> SyncResult<FieldMap> {
        let slot = self.slot(model);
        let mut entry = slot.lock().await;

        if let Some(current) = entry.as_mut() {
            if current.checked_at.elapsed() < self.fingerprint_ttl {
                return Ok(Arc::clone(&current.fields));
            }
            let fingerprint = self.fetch_fingerprint(model).await?;
            if fingerprint == current.fingerprint {
                current.checked_at = Instant::now();
                return Ok(Arc::clone(&current.fields));
            }
            info!(model, "remote schema changed, refreshing metadata");
            self.forget_external_ids(model);
        }

        let fingerprint = self.fetch_fingerprint(model).await?;
        let mut fields = self
            .remote
            .describe_fields(model)
            .await
            .map_err(|err| SyncError::schema(model, err.to_string()))?;
        if fields.is_empty() {
            return Err(SyncError::schema(model, "remote reported no fields"));
        }
        for (name, descriptor) in fields.iter_mut() {
            descriptor.name = name.clone();
            descriptor.self_referential =
                descriptor.relation.is_relation() && descriptor.target.as_deref() == Some(model);
        }
        debug!(model, fields = fields.len(), "fetched field metadata");

        let fields = Arc::new(fields);
        *entry = Some(ModelEntry {
            fields: Arc::clone(&fields),
            fingerprint,
            checked_at: Instant::now(),
        });
        Ok(fields)
    }

    /// Internal key for an external key, `None` when the remote has no such row.
    pub async fn resolve_external_id(&self, model: &str, key: &str) -> SyncResult<Option<i64>> {
        if let Some(id) = self.cached_external_id(model, key) {
            return Ok(Some(id));
        }
        let resolved = self
            .remote
            .resolve_external_id(model, key)
            .await
            .map_err(|err| SyncError::schema(model, format!("external id lookup failed: {err}")))?;
        if let Some(id) = resolved {
            self.remember(model, key, id);
        }
        Ok(resolved)
    }

    /// Seeds the external-id cache, typically from rows this run just wrote.
    pub fn remember(&self, model: &str, key: &str, id: i64) {
        let mut ids = lock(&self.external_ids);
        ids.entry(model.to_string())
            .or_default()
            .insert(key.to_string(), id);
    }

    fn cached_external_id(&self, model: &str, key: &str) -> Option<i64> {
        let ids = lock(&self.external_ids);
        ids.get(model).and_then(|keys| keys.get(key).copied())
    }

    fn forget_external_ids(&self, model: &str) {
        lock(&self.external_ids).remove(model);
    }

    fn slot(&self, model: &str) -> ModelSlot {
        let mut models = lock(&self.models);
        Arc::clone(models.entry(model.to_string()).or_default())
    }

    async fn fetch_fingerprint(&self, model: &str) -> SyncResult<String> {
        self.remote
            .schema_fingerprint(model)
            .await
            .map_err(|err| SyncError::schema(model, err.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
