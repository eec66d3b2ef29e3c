//! End-to-end pipeline tests over the in-memory stores.

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use biohub::hooks::{BuilderExtension, HookRegistry, PostMergeHook};
use biohub::hub::{Hub, PipelineSettings, Stores};
use biohub::scheduler::TaskScheduler;
use biohub::syncer::SyncTarget;
use biohub_core::cancel::CancelToken;
use biohub_core::mapping::{Mapping, MappingDelta};
use biohub_core::models::{
    BuildConfiguration, BuildStatus, ConflictPolicy, Document, FileSyncStatus, IndexMetadata,
    OpKind, ReleaseKind, ReleaseStage,
};
use biohub_core::store::memory::InMemoryStore;
use biohub_core::store::{DocumentStore, PatchStore, SearchIndex};

fn doc(value: Value) -> Document {
    Document::from_value(value).unwrap()
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        build_batch: 2,
        diff_batch: 2,
        timeout: Duration::from_secs(5),
        max_retries: 2,
        retry_backoff: Duration::from_millis(1),
    }
}

fn hub() -> (Hub, Arc<InMemoryStore>) {
    Hub::in_memory(settings())
}

async fn fetch(store: &InMemoryStore, collection: &str, id: &str) -> Option<Document> {
    store
        .get_documents(collection, &[id.to_string()])
        .await
        .unwrap()
        .into_iter()
        .next()
}

/// Two builds of the `items` configuration over source `s`: v1 then v2.
async fn two_builds(
    hub: &Hub,
    store: &InMemoryStore,
    v1: Vec<Value>,
    v2: Vec<Value>,
) -> (String, String) {
    let cfg = BuildConfiguration::new("items", "item", &["s"]);
    store
        .load_source("s", Some("1"), v1.into_iter().map(doc).collect())
        .unwrap();
    let b1 = hub.builder().build(&cfg).await.unwrap();
    store
        .load_source("s", Some("2"), v2.into_iter().map(doc).collect())
        .unwrap();
    let b2 = hub.builder().build(&cfg).await.unwrap();
    (b1.name, b2.name)
}

#[tokio::test]
async fn test_root_source_enriches_existing_document() {
    let (hub, store) = hub();
    store
        .load_source("annotations", Some("2024-06"), vec![doc(json!({"_id": "G1", "gene": "ABL1"}))])
        .unwrap();
    store
        .load_source("druglabels", Some("7"), vec![doc(json!({"_id": "G1", "label": "X"}))])
        .unwrap();
    let cfg = BuildConfiguration::new("genes", "gene", &["druglabels", "annotations"])
        .with_root_sources(&["annotations"]);

    let build = hub.builder().build(&cfg).await.unwrap();
    assert_eq!(build.status, BuildStatus::Success);
    assert_eq!(build.merge_order, vec!["annotations", "druglabels"]);
    assert_eq!(build.total_documents, 1);
    let g1 = fetch(&store, &build.name, "G1").await.unwrap();
    assert_eq!(g1.to_value(), json!({"_id": "G1", "gene": "ABL1", "label": "X"}));
    assert_eq!(build.sources["annotations"].version.as_deref(), Some("2024-06"));
}

#[tokio::test]
async fn test_non_root_source_cannot_originate_documents() {
    let (hub, store) = hub();
    store
        .load_source("annotations", None, vec![doc(json!({"_id": "G1", "gene": "ABL1"}))])
        .unwrap();
    store
        .load_source("druglabels", None, vec![doc(json!({"_id": "G2", "label": "Y"}))])
        .unwrap();
    let cfg = BuildConfiguration::new("genes", "gene", &["annotations", "druglabels"])
        .with_root_sources(&["annotations"]);

    let build = hub.builder().build(&cfg).await.unwrap();
    assert_eq!(build.total_documents, 1);
    assert!(fetch(&store, &build.name, "G2").await.is_none());
    assert_eq!(build.sources["druglabels"].skipped, 1);
    assert_eq!(build.sources["druglabels"].merged, 0);
}

#[tokio::test]
async fn test_without_root_sources_build_is_union() {
    let (hub, store) = hub();
    store
        .load_source("a", None, vec![doc(json!({"_id": "1", "x": 1})), doc(json!({"_id": "2", "x": 2}))])
        .unwrap();
    store
        .load_source("b", None, vec![doc(json!({"_id": "2", "y": 2})), doc(json!({"_id": "3", "y": 3}))])
        .unwrap();
    let cfg = BuildConfiguration::new("u", "thing", &["a", "b"]);
    let build = hub.builder().build(&cfg).await.unwrap();
    assert_eq!(build.total_documents, 3);
    let two = fetch(&store, &build.name, "2").await.unwrap();
    assert_eq!(two.to_value(), json!({"_id": "2", "x": 2, "y": 2}));
    let mapping = build.mapping.unwrap();
    assert!(mapping.contains_key("x") && mapping.contains_key("y"));
}

#[tokio::test]
async fn test_conflicting_scalars_follow_policy() {
    let (hub, store) = hub();
    store.load_source("a", None, vec![doc(json!({"_id": "X", "v": 1}))]).unwrap();
    store.load_source("b", None, vec![doc(json!({"_id": "X", "v": 2}))]).unwrap();

    let cfg = BuildConfiguration::new("lists", "thing", &["a", "b"]);
    let build = hub.builder().build(&cfg).await.unwrap();
    let x = fetch(&store, &build.name, "X").await.unwrap();
    assert_eq!(x.get("v"), Some(&json!([1, 2])));

    let cfg = BuildConfiguration::new("strict", "thing", &["a", "b"]).with_policy(ConflictPolicy::Error);
    let err = hub.builder().build(&cfg).await.unwrap_err();
    assert_eq!(err.kind(), "merge_conflict");
    let report = err.report();
    assert_eq!(report.context["source"], json!("b"));
    assert_eq!(report.context["path"], json!("v"));

    let records = hub.builder().list_builds(Some("strict")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BuildStatus::Failed);
    assert!(!records[0].is_usable());
    assert_eq!(records[0].error.as_ref().unwrap().kind, "merge_conflict");
    assert!(hub.builder().latest_successful("strict").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_source_fails_before_any_record() {
    let (hub, store) = hub();
    store.load_source("a", None, vec![doc(json!({"_id": "X"}))]).unwrap();
    let cfg = BuildConfiguration::new("genes", "gene", &["a", "ghost"]);
    let err = hub.builder().build(&cfg).await.unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(hub.builder().list_builds(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_build_of_same_config_is_busy() {
    let (hub, store) = hub();
    store.load_source("a", None, vec![doc(json!({"_id": "X"}))]).unwrap();
    let cfg = BuildConfiguration::new("genes", "gene", &["a"]);

    let held = hub.scheduler().try_lock_config("genes").unwrap();
    let err = hub.builder().build(&cfg).await.unwrap_err();
    assert_eq!(err.kind(), "busy");
    drop(held);
    assert!(hub.builder().build(&cfg).await.is_ok());
}

#[tokio::test]
async fn test_repeated_root_source_is_configuration_error() {
    let (hub, store) = hub();
    store.load_source("a", None, vec![doc(json!({"_id": "X"}))]).unwrap();
    store.load_source("b", None, vec![doc(json!({"_id": "X"}))]).unwrap();
    let cfg = BuildConfiguration::new("genes", "gene", &["a", "b"]).with_root_sources(&["a", "a"]);
    let err = hub.builder().build(&cfg).await.unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(hub.builder().list_builds(None).await.unwrap().is_empty());
}

/// Target store whose bulk writes take longer than the storage timeout.
struct SlowWrites {
    inner: Arc<InMemoryStore>,
    delay: Duration,
}

#[async_trait]
impl DocumentStore for SlowWrites {
    async fn create_collection(&self, collection: &str) -> AnyResult<()> {
        self.inner.create_collection(collection).await
    }
    async fn drop_collection(&self, collection: &str) -> AnyResult<()> {
        self.inner.drop_collection(collection).await
    }
    async fn collection_exists(&self, collection: &str) -> AnyResult<bool> {
        self.inner.collection_exists(collection).await
    }
    async fn get_documents(&self, collection: &str, ids: &[String]) -> AnyResult<Vec<Document>> {
        self.inner.get_documents(collection, ids).await
    }
    async fn upsert_documents(&self, collection: &str, docs: &[Document]) -> AnyResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert_documents(collection, docs).await
    }
    async fn delete_documents(&self, collection: &str, ids: &[String]) -> AnyResult<()> {
        self.inner.delete_documents(collection, ids).await
    }
    async fn list_ids(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> AnyResult<Vec<String>> {
        self.inner.list_ids(collection, after, limit).await
    }
    async fn list_documents(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> AnyResult<Vec<Document>> {
        self.inner.list_documents(collection, after, limit).await
    }
    async fn count_documents(&self, collection: &str) -> AnyResult<u64> {
        self.inner.count_documents(collection).await
    }
}

fn short_timeout() -> PipelineSettings {
    PipelineSettings {
        timeout: Duration::from_millis(50),
        ..settings()
    }
}

#[tokio::test]
async fn test_storage_timeout_fails_build() {
    let store = Arc::new(InMemoryStore::new());
    let mut stores = Stores::memory(store.clone());
    stores.targets = Arc::new(SlowWrites {
        inner: store.clone(),
        delay: Duration::from_millis(500),
    });
    let hub = Hub::new(stores, HookRegistry::with_builtins(), TaskScheduler::new(2), short_timeout());
    store.load_source("a", None, vec![doc(json!({"_id": "X", "v": 1}))]).unwrap();
    let cfg = BuildConfiguration::new("genes", "gene", &["a"]);

    let err = hub.builder().build(&cfg).await.unwrap_err();
    assert_eq!(err.kind(), "timeout");
    let records = hub.builder().list_builds(Some("genes")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BuildStatus::Failed);
    assert!(!records[0].cancelled);
    assert_eq!(records[0].error.as_ref().unwrap().kind, "timeout");
    assert!(hub.builder().latest_successful("genes").await.unwrap().is_none());
}

/// Post-merge hook that never finishes within the storage timeout.
struct Stall;

#[async_trait]
impl PostMergeHook for Stall {
    async fn run(
        &self,
        _store: &dyn DocumentStore,
        _collection: &str,
        _batch_size: usize,
        _cancel: &CancelToken,
    ) -> AnyResult<u64> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(0)
    }
}

#[tokio::test]
async fn test_post_merge_hook_is_bounded_by_timeout() {
    let (hub, store) = Hub::in_memory(short_timeout());
    store.load_source("a", None, vec![doc(json!({"_id": "X"}))]).unwrap();
    let mut hooks = HookRegistry::with_builtins();
    hooks.register_post_merge("stall", Arc::new(Stall));
    let hub = hub.with_hooks(hooks);

    let mut cfg = BuildConfiguration::new("genes", "gene", &["a"]);
    cfg.post_merge_hook = Some("stall".into());
    let err = hub.builder().build(&cfg).await.unwrap_err();
    assert_eq!(err.kind(), "timeout");
    assert_eq!(err.report().context["operation"], json!("post-merge hook"));
}

/// Cancels the build's token from the builder's finalize step.
struct CancelInFinalize(CancelToken);

#[async_trait]
impl BuilderExtension for CancelInFinalize {
    async fn finalize(
        &self,
        _store: &dyn DocumentStore,
        _collection: &str,
        _cancel: &CancelToken,
    ) -> AnyResult<()> {
        self.0.cancel();
        Ok(())
    }
}

#[tokio::test]
async fn test_cancellation_reaches_post_processing() {
    let (hub, store) = hub();
    store.load_source("a", None, vec![doc(json!({"_id": "X", "e": ""}))]).unwrap();
    let token = CancelToken::new();
    let mut hooks = HookRegistry::with_builtins();
    hooks.register_builder("cancel-in-finalize", Arc::new(CancelInFinalize(token.clone())));
    let hub = hub.with_hooks(hooks);

    let mut cfg = BuildConfiguration::new("genes", "gene", &["a"]);
    cfg.builder = Some("cancel-in-finalize".into());
    cfg.post_merge_hook = Some("drop-empty-fields".into());
    let err = hub.builder().build_with_cancel(&cfg, token).await.unwrap_err();
    assert!(err.is_cancelled());

    let records = hub.builder().list_builds(Some("genes")).await.unwrap();
    assert_eq!(records[0].status, BuildStatus::Failed);
    assert!(records[0].cancelled);
    // The post-merge hook never ran.
    let x = fetch(&store, &records[0].name, "X").await.unwrap();
    assert_eq!(x.get("e"), Some(&json!("")));
}

/// Cancels the build's token while transforming the first page.
struct CancelOnFirstPage(CancelToken);

impl BuilderExtension for CancelOnFirstPage {
    fn transform(&self, _source: &str, doc: Document) -> Option<Document> {
        self.0.cancel();
        Some(doc)
    }
}

#[tokio::test]
async fn test_cancelled_build_is_failed_not_success() {
    let (hub, store) = hub();
    let docs = (0..5).map(|i| doc(json!({"_id": format!("d{i}"), "n": i}))).collect();
    store.load_source("a", None, docs).unwrap();

    let token = CancelToken::new();
    let mut hooks = HookRegistry::with_builtins();
    hooks.register_builder("cancel-on-first-page", Arc::new(CancelOnFirstPage(token.clone())));
    let hub = hub.with_hooks(hooks);

    let mut cfg = BuildConfiguration::new("genes", "gene", &["a"]);
    cfg.builder = Some("cancel-on-first-page".into());
    let err = hub.builder().build_with_cancel(&cfg, token).await.unwrap_err();
    assert!(err.is_cancelled());

    let records = hub.builder().list_builds(Some("genes")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BuildStatus::Failed);
    assert!(records[0].cancelled);
    // The first page was fully written before cancellation was observed.
    assert_eq!(store.count_documents(&records[0].name).await.unwrap(), 2);
}

#[tokio::test]
async fn test_post_merge_hook_and_order_hook() {
    let (hub, store) = hub();
    store.load_source("b", None, vec![doc(json!({"_id": "X", "v": "b"}))]).unwrap();
    store
        .load_source("a", None, vec![doc(json!({"_id": "X", "v": "a", "empty": ""}))])
        .unwrap();
    let mut cfg = BuildConfiguration::new("ordered", "thing", &["b", "a"]);
    cfg.merge_order_hook = Some("alphabetical".into());
    cfg.post_merge_hook = Some("drop-empty-fields".into());

    let build = hub.builder().build(&cfg).await.unwrap();
    assert_eq!(build.merge_order, vec!["a", "b"]);
    let x = fetch(&store, &build.name, "X").await.unwrap();
    assert_eq!(x.to_value(), json!({"_id": "X", "v": ["a", "b"]}));
}

#[tokio::test]
async fn test_whatsnew_and_archive() {
    let (hub, store) = hub();
    store.load_source("a", Some("1"), vec![doc(json!({"_id": "X"}))]).unwrap();
    let cfg = BuildConfiguration::new("genes", "gene", &["a"]);

    let news = hub.builder().whatsnew(&cfg).await.unwrap();
    assert!(news.needs_rebuild);
    assert!(news.latest_build.is_none());

    let build = hub.builder().build(&cfg).await.unwrap();
    let news = hub.builder().whatsnew(&cfg).await.unwrap();
    assert!(!news.needs_rebuild);
    assert_eq!(news.latest_build.as_deref(), Some(build.name.as_str()));

    store.load_source("a", Some("2"), vec![doc(json!({"_id": "X"}))]).unwrap();
    let news = hub.builder().whatsnew(&cfg).await.unwrap();
    assert!(news.needs_rebuild);
    assert_eq!(news.sources[0].built_version.as_deref(), Some("1"));
    assert_eq!(news.sources[0].current_version.as_deref(), Some("2"));

    let archived = hub.builder().archive_build(&build.name).await.unwrap();
    assert!(archived.archived);
    assert!(!store.collection_exists(&build.name).await.unwrap());
    assert!(hub.builder().latest_successful("genes").await.unwrap().is_none());
    let err = hub.builder().get_build("nope").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_single_replace_diff_and_sync_to_index() {
    let (hub, store) = hub();
    let (b1, b2) = two_builds(&hub, &store, vec![json!({"_id": "X", "v": 1})], vec![json!({"_id": "X", "v": 2})]).await;

    let report = hub.differ().diff(&b1, &b2).await.unwrap();
    assert_eq!(report.id, format!("{}__{}", b1, b2));
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.stats.updated, 1);
    let ops = store.read_patch(&report.files[0]).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op, OpKind::Replace);
    assert_eq!(ops[0].path, "v");
    assert_eq!(ops[0].value, json!(2));

    hub.publisher().publish_full(&b1, "live").await.unwrap();
    let target = SyncTarget::Index("live".into());
    let result = hub.syncer().sync(&report.id, &target, false).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.files_applied, 1);
    assert_eq!(result.documents_patched, 1);
    let x = store.get_indexed("live", "X").await.unwrap().unwrap();
    assert_eq!(x.to_value(), json!({"_id": "X", "v": 2}));

    // Synced files are skipped on a second run.
    let again = hub.syncer().sync(&report.id, &target, false).await.unwrap();
    assert_eq!(again.files_skipped, 1);
    assert_eq!(again.files_applied, 0);
    assert_eq!(again.files[0].status, FileSyncStatus::Skipped);
    let x = store.get_indexed("live", "X").await.unwrap().unwrap();
    assert_eq!(x.get("v"), Some(&json!(2)));

    // Flags are only reset explicitly.
    let cleared = hub.differ().reset_synced(&report.id, &target.to_string()).await.unwrap();
    assert_eq!(cleared, 1);
    let third = hub.syncer().sync(&report.id, &target, false).await.unwrap();
    assert_eq!(third.files_applied, 1);
}

#[tokio::test]
async fn test_diff_classifies_and_roundtrips_through_collection_sync() {
    let (hub, store) = hub();
    let (b1, b2) = two_builds(
        &hub,
        &store,
        vec![
            json!({"_id": "X", "v": 1, "tags": ["a"]}),
            json!({"_id": "Y", "v": 5}),
            json!({"_id": "W", "v": 9}),
        ],
        vec![
            json!({"_id": "X", "v": 2, "tags": ["a", "b"]}),
            json!({"_id": "Z", "v": 3}),
            json!({"_id": "W", "v": 9}),
        ],
    )
    .await;

    let report = hub.differ().diff(&b1, &b2).await.unwrap();
    assert_eq!(report.stats.added, 1);
    assert_eq!(report.stats.deleted, 1);
    assert_eq!(report.stats.updated, 1);
    assert_eq!(report.stats.unchanged, 1);
    assert_eq!(report.stats.patch_files, report.files.len() as u64);
    assert!(report.files.windows(2).all(|w| w[0].seq < w[1].seq));

    // Every identifier's operations live in exactly one file.
    let mut owners = std::collections::BTreeMap::new();
    for file in &report.files {
        for op in store.read_patch(file).await.unwrap() {
            let owner = owners.entry(op.id.clone()).or_insert(file.seq);
            assert_eq!(*owner, file.seq, "{} spans files", op.id);
        }
    }

    // Reusing the report does not recompute it.
    let again = hub.differ().diff(&b1, &b2).await.unwrap();
    assert_eq!(again.created_at, report.created_at);

    // Apply to a copy of v1 and compare with v2.
    store.create_collection("copy").await.unwrap();
    let v1_docs = store.list_documents(&b1, None, 100).await.unwrap();
    store.upsert_documents("copy", &v1_docs).await.unwrap();

    let target = SyncTarget::Collection("copy".into());
    let dry = hub.syncer().sync(&report.id, &target, true).await.unwrap();
    assert!(dry.files.iter().all(|f| f.status == FileSyncStatus::DryRun));
    assert_eq!(dry.operations_applied, report.stats.operations);
    assert_eq!(store.list_documents("copy", None, 100).await.unwrap(), v1_docs);

    let result = hub.syncer().sync(&report.id, &target, false).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.documents_patched, 3);
    let copy = store.list_documents("copy", None, 100).await.unwrap();
    let expected = store.list_documents(&b2, None, 100).await.unwrap();
    assert_eq!(copy, expected);

    let synced = hub.differ().get_diff(&report.id).await.unwrap();
    assert!(synced.is_fully_synced("collection:copy"));
}

#[tokio::test]
async fn test_empty_field_name_roundtrips_through_sync() {
    let (hub, store) = hub();
    let (b1, b2) = two_builds(&hub, &store, vec![json!({"_id": "X", "": 1})], vec![json!({"_id": "X", "": 2})]).await;
    let report = hub.differ().diff(&b1, &b2).await.unwrap();
    assert_eq!(report.stats.updated, 1);

    store.create_collection("copy").await.unwrap();
    let v1_docs = store.list_documents(&b1, None, 100).await.unwrap();
    store.upsert_documents("copy", &v1_docs).await.unwrap();
    let result = hub
        .syncer()
        .sync(&report.id, &SyncTarget::Collection("copy".into()), false)
        .await
        .unwrap();
    assert!(result.is_success());
    let x = fetch(&store, "copy", "X").await.unwrap();
    assert_eq!(x.to_value(), json!({"_id": "X", "": 2}));
}

#[tokio::test]
async fn test_diff_of_different_doc_types_is_configuration_error() {
    let (hub, store) = hub();
    store.load_source("s", None, vec![doc(json!({"_id": "X", "v": 1}))]).unwrap();
    let genes = hub
        .builder()
        .build(&BuildConfiguration::new("genes", "gene", &["s"]))
        .await
        .unwrap();
    let variants = hub
        .builder()
        .build(&BuildConfiguration::new("variants", "variant", &["s"]))
        .await
        .unwrap();

    let err = hub.differ().diff(&genes.name, &variants.name).await.unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(hub.differ().list_diffs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_removed_field_fails_diff_without_patch_files() {
    let (hub, store) = hub();
    let (b1, b2) = two_builds(
        &hub,
        &store,
        vec![json!({"_id": "X", "v": 1, "notes": "old"})],
        vec![json!({"_id": "X", "v": 1})],
    )
    .await;

    let err = hub.differ().diff(&b1, &b2).await.unwrap_err();
    assert_eq!(err.kind(), "schema_incompatibility");
    assert_eq!(err.report().context["removed"], json!(["notes"]));
    assert!(hub.differ().list_diffs().await.unwrap().is_empty());
    let x = fetch(&store, &b1, "X").await.unwrap();
    assert_eq!(x.get("notes"), Some(&json!("old")));
    assert_eq!(fetch(&store, &b2, "X").await.unwrap().to_value(), json!({"_id": "X", "v": 1}));
}

#[tokio::test]
async fn test_field_patch_on_missing_document_fails_file_only() {
    let (hub, store) = hub();
    let (b1, b2) = two_builds(&hub, &store, vec![json!({"_id": "X", "v": 1})], vec![json!({"_id": "X", "v": 2})]).await;
    let report = hub.differ().diff(&b1, &b2).await.unwrap();

    store.create_collection("empty").await.unwrap();
    let target = SyncTarget::Collection("empty".into());
    let result = hub.syncer().sync(&report.id, &target, false).await.unwrap();
    assert!(!result.is_success());
    assert_eq!(result.files_failed, 1);
    let file = &result.files[0];
    assert_eq!(file.status, FileSyncStatus::Failed);
    assert_eq!(file.attempts, 1);
    assert_eq!(file.errors[0].id, "X");
    assert_eq!(file.errors[0].error.kind, "invalid_state");

    let diff = hub.differ().get_diff(&report.id).await.unwrap();
    assert!(!diff.is_fully_synced("collection:empty"));
}

/// Index wrapper whose first `failures` single-document writes fail.
struct FlakyIndex {
    inner: Arc<InMemoryStore>,
    failures: AtomicU32,
}

#[async_trait]
impl SearchIndex for FlakyIndex {
    async fn create_index(&self, index: &str, mapping: &Mapping) -> AnyResult<()> {
        self.inner.create_index(index, mapping).await
    }
    async fn index_exists(&self, index: &str) -> AnyResult<bool> {
        self.inner.index_exists(index).await
    }
    async fn validate_mapping(&self, index: &str, mapping: &Mapping) -> AnyResult<MappingDelta> {
        SearchIndex::validate_mapping(self.inner.as_ref(), index, mapping).await
    }
    async fn index_mapping(&self, index: &str) -> AnyResult<Option<Mapping>> {
        self.inner.index_mapping(index).await
    }
    async fn update_mapping(&self, index: &str, mapping: &Mapping) -> AnyResult<()> {
        self.inner.update_mapping(index, mapping).await
    }
    async fn bulk_index(&self, index: &str, docs: &[Document]) -> AnyResult<()> {
        self.inner.bulk_index(index, docs).await
    }
    async fn get_indexed(&self, index: &str, id: &str) -> AnyResult<Option<Document>> {
        self.inner.get_indexed(index, id).await
    }
    async fn put_indexed(&self, index: &str, doc: &Document) -> AnyResult<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("connection reset"));
        }
        self.inner.put_indexed(index, doc).await
    }
    async fn delete_indexed(&self, index: &str, id: &str) -> AnyResult<()> {
        self.inner.delete_indexed(index, id).await
    }
    async fn index_count(&self, index: &str) -> AnyResult<u64> {
        self.inner.index_count(index).await
    }
    async fn get_metadata(&self, index: &str) -> AnyResult<Option<IndexMetadata>> {
        self.inner.get_metadata(index).await
    }
    async fn put_metadata(&self, index: &str, metadata: &IndexMetadata) -> AnyResult<()> {
        self.inner.put_metadata(index, metadata).await
    }
}

#[tokio::test]
async fn test_transient_index_failure_is_retried() {
    let store = Arc::new(InMemoryStore::new());
    let mut stores = Stores::memory(store.clone());
    stores.index = Arc::new(FlakyIndex {
        inner: store.clone(),
        failures: AtomicU32::new(1),
    });
    let hub = Hub::new(stores, HookRegistry::with_builtins(), TaskScheduler::new(2), settings());

    let (b1, b2) = two_builds(&hub, &store, vec![json!({"_id": "X", "v": 1})], vec![json!({"_id": "X", "v": 2})]).await;
    hub.publisher().publish_full(&b1, "live").await.unwrap();
    let report = hub.differ().diff(&b1, &b2).await.unwrap();

    let result = hub
        .syncer()
        .sync(&report.id, &SyncTarget::Index("live".into()), false)
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.files[0].status, FileSyncStatus::Applied);
    assert_eq!(result.files[0].attempts, 2);
    let x = store.get_indexed("live", "X").await.unwrap().unwrap();
    assert_eq!(x.get("v"), Some(&json!(2)));
}

#[tokio::test]
async fn test_full_then_diff_release() {
    let (hub, store) = hub();
    let (b1, b2) = two_builds(
        &hub,
        &store,
        vec![json!({"_id": "X", "v": 1}), json!({"_id": "Y", "v": 2})],
        vec![json!({"_id": "X", "v": 3}), json!({"_id": "Y", "v": 2}), json!({"_id": "Z", "v": 4})],
    )
    .await;

    let full = hub.publisher().publish_full(&b1, "live").await.unwrap();
    assert_eq!(full.kind, ReleaseKind::Full);
    assert!(full.is_success());
    assert_eq!(full.documents_loaded, 2);
    let meta = store.get_metadata("live").await.unwrap().unwrap();
    assert_eq!(meta.build, b1);
    assert_eq!(meta.total_documents, 2);
    assert_eq!(meta.release_id, full.id);

    let release = hub.publisher().publish_diff(&b1, &b2, "live").await.unwrap();
    assert_eq!(release.stage, ReleaseStage::Success);
    assert_eq!(release.diff_id.as_deref(), Some(format!("{}__{}", b1, b2).as_str()));
    assert!(release.sync.as_ref().unwrap().is_success());
    let meta = store.get_metadata("live").await.unwrap().unwrap();
    assert_eq!(meta.build, b2);
    assert_eq!(meta.total_documents, 3);
    assert_eq!(store.index_count("live").await.unwrap(), 3);

    let note = release.note.as_ref().unwrap();
    assert_eq!(note.old_build, b1);
    assert_eq!(note.new_build, b2);
    assert_eq!(note.total.delta, 1);
    assert_eq!(note.diff.as_ref().unwrap().added, 1);
    assert!(note.render_text().contains(&b2));

    // The index now holds b2, so b1 -> b2 cannot be applied again.
    let err = hub.publisher().publish_diff(&b1, &b2, "live").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    let releases = hub.publisher().list_releases().await.unwrap();
    assert_eq!(releases.len(), 3);
    let failed = releases.iter().find(|r| r.stage == ReleaseStage::Failed).unwrap();
    assert_eq!(failed.error.as_ref().unwrap().kind, "invalid_state");
}

#[tokio::test]
async fn test_count_mismatch_leaves_index_mapping_and_metadata() {
    let (hub, store) = hub();
    let (b1, b2) = two_builds(
        &hub,
        &store,
        vec![json!({"_id": "X", "v": 1})],
        vec![json!({"_id": "X", "v": 2, "w": true})],
    )
    .await;
    hub.publisher().publish_full(&b1, "live").await.unwrap();
    let before = store.index_mapping("live").await.unwrap();
    store
        .put_indexed("live", &doc(json!({"_id": "stray", "v": 0})))
        .await
        .unwrap();

    let err = hub.publisher().publish_diff(&b1, &b2, "live").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    assert_eq!(store.index_mapping("live").await.unwrap(), before);
    let meta = store.get_metadata("live").await.unwrap().unwrap();
    assert_eq!(meta.build, b1);
}

#[tokio::test]
async fn test_release_note_without_release() {
    let (hub, store) = hub();
    let (b1, b2) = two_builds(&hub, &store, vec![json!({"_id": "X", "v": 1})], vec![json!({"_id": "X", "v": 1, "w": true})]).await;
    let note = hub.publisher().release_note(&b1, &b2).await.unwrap();
    assert!(note.diff.is_none());
    assert_eq!(note.fields_added, vec!["w"]);
    assert_eq!(note.version_changes.len(), 1);

    hub.differ().diff(&b1, &b2).await.unwrap();
    let note = hub.publisher().release_note(&b1, &b2).await.unwrap();
    assert_eq!(note.diff.as_ref().unwrap().updated, 1);
}
