use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::metadata::{FieldDescriptor, MetadataCache, Mutability, RelationKind};
use crate::record::WriteMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Everything in one pass.
    SinglePass,
    /// Self references are written after every row exists.
    SelfReference,
    /// Scalars, then many-to-one links, then to-many links.
    Layered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Batching {
    BySize,
    /// Batches are also capped by the number of linked records they carry.
    ByRelationWeight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSpec {
    pub index: usize,
    pub fields: Vec<String>,
    pub mode: WriteMode,
    pub batching: Batching,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub kind: PlanKind,
    pub passes: Vec<PassSpec>,
    /// Fields dropped from every pass because the remote computes them.
    pub excluded: Vec<String>,
    pub warnings: Vec<String>,
}

impl TransferPlan {
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }
}

pub struct DependencyAnalyzer {
    cache: Arc<MetadataCache>,
}

impl DependencyAnalyzer {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }

    pub async fn analyze(&self, model: &str, fields: &[String]) -> SyncResult<TransferPlan> {
        let descriptors = self.cache.describe(model).await?;
        let mut classified: Vec<&FieldDescriptor> = Vec::with_capacity(fields.len());
        for name in fields {
            let descriptor = descriptors
                .get(name)
                .ok_or_else(|| SyncError::UnknownField {
                    model: model.to_string(),
                    field: name.clone(),
                })?;
            classified.push(descriptor);
        }
        Ok(plan_for(model, &classified))
    }
}

/// Builds the pass layout for already-classified fields.
pub fn plan_for(model: &str, fields: &[&FieldDescriptor]) -> TransferPlan {
    let mut excluded = Vec::new();
    let mut warnings = Vec::new();
    let mut writable: Vec<&FieldDescriptor> = Vec::new();

    for &field in fields {
        if field.is_writable() {
            writable.push(field);
            continue;
        }
        let why = match field.mutability {
            Mutability::Computed => "computed",
            _ => "read-only",
        };
        let message = format!("field {} on {model} is {why} and will not be written", field.name);
        warn!("{message}");
        warnings.push(message);
        excluded.push(field.name.clone());
    }

    let has_to_many = writable.iter().any(|f| f.relation.is_to_many());
    let has_self_reference = writable
        .iter()
        .any(|f| f.relation == RelationKind::ManyToOne && f.self_referential);
    let names = |pred: &dyn Fn(&FieldDescriptor) -> bool| -> Vec<String> {
        writable
            .iter()
            .copied()
            .filter(|f| pred(*f))
            .map(|f| f.name.clone())
            .collect()
    };

    let (kind, layout) = if has_to_many {
        (
            PlanKind::Layered,
            vec![
                (names(&|f| !f.relation.is_relation()), WriteMode::Upsert, Batching::BySize),
                (
                    names(&|f| f.relation == RelationKind::ManyToOne),
                    WriteMode::UpdateOnly,
                    Batching::BySize,
                ),
                (
                    names(&|f| f.relation.is_to_many()),
                    WriteMode::UpdateOnly,
                    Batching::ByRelationWeight,
                ),
            ],
        )
    } else if has_self_reference {
        let deferred = |f: &FieldDescriptor| f.relation == RelationKind::ManyToOne && f.self_referential;
        (
            PlanKind::SelfReference,
            vec![
                (names(&|f| !deferred(f)), WriteMode::Upsert, Batching::BySize),
                (names(&deferred), WriteMode::UpdateOnly, Batching::BySize),
            ],
        )
    } else {
        (
            PlanKind::SinglePass,
            vec![(names(&|_| true), WriteMode::Upsert, Batching::BySize)],
        )
    };

    // Later passes stay in the plan even when empty; they cost nothing to run.
    let passes: Vec<PassSpec> = layout
        .into_iter()
        .enumerate()
        .map(|(index, (fields, mode, batching))| PassSpec {
            index,
            fields,
            mode,
            batching,
        })
        .collect();
    debug!(model, ?kind, passes = passes.len(), "selected transfer plan");

    TransferPlan {
        kind,
        passes,
        excluded,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;

    fn self_ref(name: &str) -> FieldDescriptor {
        let mut d = FieldDescriptor::relation(name, RelationKind::ManyToOne, "res.partner");
        d.self_referential = true;
        d
    }

    #[test]
    fn scalars_only_is_single_pass() {
        let name = FieldDescriptor::scalar("name", "char");
        let country = FieldDescriptor::relation("country_id", RelationKind::ManyToOne, "res.country");
        let plan = plan_for("res.partner", &[&name, &country]);
        assert_eq!(plan.kind, PlanKind::SinglePass);
        assert_eq!(plan.pass_count(), 1);
        assert_eq!(plan.passes[0].fields, vec!["name", "country_id"]);
        assert_eq!(plan.passes[0].mode, WriteMode::Upsert);
    }

    #[test]
    fn self_reference_defers_to_second_pass() {
        let name = FieldDescriptor::scalar("name", "char");
        let parent = self_ref("parent_id");
        let plan = plan_for("res.partner", &[&name, &parent]);
        assert_eq!(plan.kind, PlanKind::SelfReference);
        assert!(plan.pass_count() >= 2);
        assert_eq!(plan.passes[0].fields, vec!["name"]);
        assert_eq!(plan.passes[1].fields, vec!["parent_id"]);
        assert_eq!(plan.passes[1].mode, WriteMode::UpdateOnly);
    }

    #[test]
    fn to_many_takes_three_passes_and_subsumes_self_reference() {
        let name = FieldDescriptor::scalar("name", "char");
        let parent = self_ref("parent_id");
        let tags = FieldDescriptor::relation("category_id", RelationKind::ManyToMany, "res.partner.category");
        let plan = plan_for("res.partner", &[&name, &parent, &tags]);
        assert_eq!(plan.kind, PlanKind::Layered);
        assert!(plan.pass_count() >= 3);
        assert_eq!(plan.passes[0].fields, vec!["name"]);
        assert_eq!(plan.passes[1].fields, vec!["parent_id"]);
        assert_eq!(plan.passes[2].fields, vec!["category_id"]);
        assert_eq!(plan.passes[2].batching, Batching::ByRelationWeight);
    }

    #[test]
    fn layered_without_many_to_one_keeps_three_passes() {
        let name = FieldDescriptor::scalar("name", "char");
        let tags = FieldDescriptor::relation("category_id", RelationKind::ManyToMany, "res.partner.category");
        let plan = plan_for("res.partner", &[&name, &tags]);
        assert_eq!(plan.pass_count(), 3);
        assert!(plan.passes[1].fields.is_empty());
        assert_eq!(plan.passes[2].index, 2);
        assert_eq!(plan.passes[2].fields, vec!["category_id"]);
    }

    #[test]
    fn read_only_fields_are_excluded_with_warning() {
        let name = FieldDescriptor::scalar("name", "char");
        let total = FieldDescriptor::scalar("total_due", "monetary").with_mutability(Mutability::Computed);
        let plan = plan_for("res.partner", &[&name, &total]);
        assert_eq!(plan.excluded, vec!["total_due"]);
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.passes.iter().all(|p| !p.fields.contains(&"total_due".to_string())));
    }

    #[tokio::test]
    async fn unknown_field_is_schema_fatal() {
        let store = MemoryStore::new();
        store.define_model("res.partner", vec![FieldDescriptor::scalar("name", "char")]);
        let analyzer = DependencyAnalyzer::new(Arc::new(MetadataCache::new(Arc::new(store))));

        let err = analyzer
            .analyze("res.partner", &["name".into(), "nickname".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownField { ref field, .. } if field == "nickname"));
    }

    #[tokio::test]
    async fn analyze_detects_self_reference_from_metadata() {
        let store = MemoryStore::new();
        store.define_model(
            "res.partner",
            vec![
                FieldDescriptor::scalar("name", "char"),
                FieldDescriptor::relation("parent_id", RelationKind::ManyToOne, "res.partner"),
            ],
        );
        let analyzer = DependencyAnalyzer::new(Arc::new(MetadataCache::new(Arc::new(store))));
        let plan = analyzer
            .analyze("res.partner", &["name".into(), "parent_id".into()])
            .await
            .unwrap();
        assert_eq!(plan.kind, PlanKind::SelfReference);
    }
}
