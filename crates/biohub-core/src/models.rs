//! Core data models that flow through the build/diff/release pipeline.
//!
//! | Type | Produced by | Consumed by |
//! |------|-------------|-------------|
//! | [`Document`] | source collections | builder, differ, syncer |
//! | [`BuildConfiguration`] | configuration provider | builder, order resolver |
//! | [`BuildRecord`] | builder | differ, publisher, release notes |
//! | [`DiffReport`] | differ | syncer, publisher, release notes |
//! | [`PatchOperation`] | differ | syncer |
//! | [`Release`] | publisher | CLI |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ErrorReport, HubError, Result};
use crate::mapping::{Mapping, MappingDelta};

/// Name of the identifier field in serialized documents.
pub const ID_FIELD: &str = "_id";

/// A document keyed by its `_id`. The identifier is the merge key across
/// every source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Build a document from a JSON object carrying a string `_id`.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(HubError::invalid_state(format!(
                    "document must be a JSON object, got {}",
                    other
                )))
            }
        };
        let id = match fields.remove(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(other) => {
                return Err(HubError::invalid_state(format!(
                    "document _id must be a non-empty string, got {}",
                    other
                )))
            }
            None => return Err(HubError::invalid_state("document is missing _id")),
        };
        Ok(Self { id, fields })
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 1);
        map.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// How conflicting values from two sources are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Fail the build on any differing value.
    Error,
    /// Keep the value that was merged first.
    Ignore,
    /// Collect differing scalars into a list, in merge order.
    #[default]
    MergeAsList,
}

/// Named description of which sources merge into a build and how.
///
/// Immutable for the duration of a build: the builder works on a clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfiguration {
    pub name: String,
    pub doc_type: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub root_sources: Vec<String>,
    /// Name of a registered merge-order hook.
    #[serde(default)]
    pub merge_order_hook: Option<String>,
    /// Name of a registered builder extension.
    #[serde(default)]
    pub builder: Option<String>,
    /// Name of a registered post-merge hook.
    #[serde(default)]
    pub post_merge_hook: Option<String>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Explicit mapping; inferred from the merged documents when absent.
    #[serde(default)]
    pub mapping: Option<Mapping>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl BuildConfiguration {
    pub fn new(name: impl Into<String>, doc_type: impl Into<String>, sources: &[&str]) -> Self {
        Self {
            name: name.into(),
            doc_type: doc_type.into(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            root_sources: Vec::new(),
            merge_order_hook: None,
            builder: None,
            post_merge_hook: None,
            conflict_policy: ConflictPolicy::default(),
            mapping: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_root_sources(mut self, roots: &[&str]) -> Self {
        self.root_sources = roots.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// A source may create new documents if it is a root source, or if no
    /// root sources are declared at all.
    pub fn can_originate(&self, source: &str) -> bool {
        self.root_sources.is_empty() || self.root_sources.iter().any(|r| r == source)
    }
}

/// Version provenance for one source collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: String,
    pub version: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub documents: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Success,
    Failed,
}

/// Builder state machine. Stages only move forward; `Failed` is reachable
/// from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    Pending,
    MergingRoot,
    MergingOthers,
    PostProcessing,
    Success,
    Failed,
}

impl BuildStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn can_advance_to(self, next: BuildStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next >= self
    }
}

/// Per-source statistics recorded on a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub version: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Documents read from the source collection.
    pub documents: u64,
    /// Documents that were created or enriched in the target.
    pub merged: u64,
    /// Documents dropped because the source cannot originate them.
    pub skipped: u64,
}

/// Metadata of one target-collection generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Generation identifier, also the target collection name.
    pub name: String,
    pub config_name: String,
    pub doc_type: String,
    pub version: String,
    pub status: BuildStatus,
    pub stage: BuildStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub merge_order: Vec<String>,
    pub sources: BTreeMap<String, SourceStats>,
    pub total_documents: u64,
    pub mapping: Option<Mapping>,
    pub error: Option<ErrorReport>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub archived: bool,
}

impl BuildRecord {
    pub fn pending(name: String, config: &BuildConfiguration, version: String) -> Self {
        Self {
            name,
            config_name: config.name.clone(),
            doc_type: config.doc_type.clone(),
            version,
            status: BuildStatus::Pending,
            stage: BuildStage::Pending,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            merge_order: Vec::new(),
            sources: BTreeMap::new(),
            total_documents: 0,
            mapping: None,
            error: None,
            cancelled: false,
            archived: false,
        }
    }

    /// Move to `next`, refusing backwards or post-terminal transitions.
    pub fn advance(&mut self, next: BuildStage) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(HubError::invalid_state(format!(
                "build {} cannot move from {:?} to {:?}",
                self.name, self.stage, next
            )));
        }
        self.stage = next;
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.advance(BuildStage::Success)?;
        self.status = BuildStatus::Success;
        self.finish();
        Ok(())
    }

    pub fn fail(&mut self, err: &HubError) {
        self.stage = BuildStage::Failed;
        self.status = BuildStatus::Failed;
        self.cancelled = err.is_cancelled();
        self.error = Some(err.report());
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }

    /// Usable as input to diff and publish.
    pub fn is_usable(&self) -> bool {
        self.status == BuildStatus::Success && !self.archived
    }
}

/// Kind of a single patch instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
    AddDocument,
    DeleteDocument,
}

impl OpKind {
    pub fn is_document_level(self) -> bool {
        matches!(self, Self::AddDocument | Self::DeleteDocument)
    }
}

/// One entry of a patch file.
///
/// `path` is a dot-notation field path (empty for document-level
/// operations). A missing `value` deserializes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: OpKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl PatchOperation {
    pub fn add(id: &str, path: String, value: Value) -> Self {
        Self {
            op: OpKind::Add,
            id: id.to_string(),
            path,
            value,
        }
    }

    pub fn remove(id: &str, path: String) -> Self {
        Self {
            op: OpKind::Remove,
            id: id.to_string(),
            path,
            value: Value::Null,
        }
    }

    pub fn replace(id: &str, path: String, value: Value) -> Self {
        Self {
            op: OpKind::Replace,
            id: id.to_string(),
            path,
            value,
        }
    }

    pub fn add_document(doc: &Document) -> Self {
        Self {
            op: OpKind::AddDocument,
            id: doc.id.clone(),
            path: String::new(),
            value: doc.to_value(),
        }
    }

    pub fn delete_document(id: &str) -> Self {
        Self {
            op: OpKind::DeleteDocument,
            id: id.to_string(),
            path: String::new(),
            value: Value::Null,
        }
    }
}

/// Reference to one immutable patch file of a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchFileRef {
    pub seq: u32,
    pub location: String,
    pub operations: u64,
    pub documents: u64,
    pub bytes: u64,
    pub checksum: String,
    /// Sync targets this file has been fully applied to.
    #[serde(default)]
    pub synced: BTreeSet<String>,
}

impl PatchFileRef {
    pub fn is_synced(&self, target: &str) -> bool {
        self.synced.contains(target)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: u64,
    pub deleted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub operations: u64,
    pub patch_files: u64,
    pub total_bytes: u64,
}

/// Ordered patch files between two builds plus aggregate counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    pub id: String,
    pub old_build: String,
    pub new_build: String,
    pub doc_type: String,
    pub created_at: DateTime<Utc>,
    pub stats: DiffStats,
    pub mapping_delta: MappingDelta,
    pub files: Vec<PatchFileRef>,
}

impl DiffReport {
    pub fn id_for(old_build: &str, new_build: &str) -> String {
        format!("{}__{}", old_build, new_build)
    }

    pub fn is_fully_synced(&self, target: &str) -> bool {
        self.files.iter().all(|f| f.is_synced(target))
    }
}

/// Metadata document stored alongside a search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub build: String,
    pub build_version: String,
    pub config_name: String,
    pub doc_type: String,
    pub total_documents: u64,
    pub sources: BTreeMap<String, SourceStats>,
    pub mapping: Option<Mapping>,
    pub release_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseKind {
    Full,
    Diff,
}

/// Publisher state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStage {
    Pending,
    PreSteps,
    CoreStep,
    MetadataUpdate,
    PostSteps,
    Success,
    Failed,
}

/// Record of one publish action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub kind: ReleaseKind,
    pub build: String,
    pub previous_build: Option<String>,
    pub index: String,
    pub stage: ReleaseStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub diff_id: Option<String>,
    pub documents_loaded: u64,
    pub note: Option<crate::release_note::ReleaseNote>,
    #[serde(default)]
    pub sync: Option<SyncResult>,
    pub error: Option<ErrorReport>,
}

impl Release {
    pub fn new(kind: ReleaseKind, build: &str, previous: Option<&str>, index: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            build: build.to_string(),
            previous_build: previous.map(str::to_string),
            index: index.to_string(),
            stage: ReleaseStage::Pending,
            started_at: Utc::now(),
            finished_at: None,
            diff_id: None,
            documents_loaded: 0,
            note: None,
            sync: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.stage == ReleaseStage::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileSyncStatus {
    Applied,
    Skipped,
    Failed,
    DryRun,
}

/// A single patch operation that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub id: String,
    pub op: OpKind,
    pub path: String,
    pub error: ErrorReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSyncResult {
    pub seq: u32,
    pub status: FileSyncStatus,
    pub operations: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<OperationError>,
    /// Failure that prevented reading the file at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// Outcome of applying a diff to one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub diff_id: String,
    pub target: String,
    pub dry_run: bool,
    pub files: Vec<FileSyncResult>,
    pub files_total: u64,
    pub files_applied: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub operations_applied: u64,
    pub documents_patched: u64,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.files_failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_roundtrip_keeps_id_out_of_fields() {
        let doc = Document::from_value(json!({"_id": "G1", "gene": "ABL1"})).unwrap();
        assert_eq!(doc.id, "G1");
        assert!(doc.fields.get("_id").is_none());
        assert_eq!(doc.to_value(), json!({"_id": "G1", "gene": "ABL1"}));

        let parsed: Document = serde_json::from_value(json!({"_id": "G2", "x": 1})).unwrap();
        assert_eq!(parsed.id, "G2");
        assert_eq!(parsed.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_document_requires_string_id() {
        assert!(Document::from_value(json!({"gene": "ABL1"})).is_err());
        assert!(Document::from_value(json!({"_id": 7})).is_err());
        assert!(Document::from_value(json!({"_id": ""})).is_err());
        assert!(Document::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_conflict_policy_names() {
        let p: ConflictPolicy = serde_json::from_value(json!("merge-as-list")).unwrap();
        assert_eq!(p, ConflictPolicy::MergeAsList);
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::MergeAsList);
        assert_eq!(serde_json::to_value(ConflictPolicy::Ignore).unwrap(), json!("ignore"));
    }

    #[test]
    fn test_can_originate() {
        let cfg = BuildConfiguration::new("genes", "gene", &["annotations", "druglabels"]);
        assert!(cfg.can_originate("druglabels"));
        let cfg = cfg.with_root_sources(&["annotations"]);
        assert!(cfg.can_originate("annotations"));
        assert!(!cfg.can_originate("druglabels"));
    }

    #[test]
    fn test_stage_transitions() {
        let cfg = BuildConfiguration::new("genes", "gene", &["a"]);
        let mut rec = BuildRecord::pending("genes_1".into(), &cfg, "1".into());
        rec.advance(BuildStage::MergingOthers).unwrap();
        assert!(rec.advance(BuildStage::MergingRoot).is_err());
        rec.advance(BuildStage::PostProcessing).unwrap();
        rec.succeed().unwrap();
        assert_eq!(rec.status, BuildStatus::Success);
        assert!(rec.advance(BuildStage::Failed).is_err());
    }

    #[test]
    fn test_fail_marks_cancelled_distinctly() {
        let cfg = BuildConfiguration::new("genes", "gene", &["a"]);
        let mut rec = BuildRecord::pending("genes_1".into(), &cfg, "1".into());
        rec.fail(&HubError::Cancelled);
        assert_eq!(rec.status, BuildStatus::Failed);
        assert!(rec.cancelled);
        assert_eq!(rec.error.as_ref().unwrap().kind, "cancelled");
        assert!(!rec.is_usable());
    }

    #[test]
    fn test_patch_operation_null_value_roundtrip() {
        let op = PatchOperation::replace("X", "v".into(), Value::Null);
        let line = serde_json::to_string(&op).unwrap();
        assert_eq!(line, r#"{"op":"replace","id":"X","path":"v"}"#);
        let back: PatchOperation = serde_json::from_str(&line).unwrap();
        assert_eq!(back, op);
    }
}
