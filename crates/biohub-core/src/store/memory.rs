//! In-memory implementation of every store trait, for tests and embedders.
//!
//! Uses `BTreeMap` behind `std::sync::RwLock`, so identifier paging and
//! listing order match the SQLite backend. Locks are never held across an
//! await point.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::diff::checksum;
use crate::mapping::{diff_mappings, Mapping, MappingDelta};
use crate::models::{
    BuildRecord, DiffReport, Document, IndexMetadata, PatchFileRef, PatchOperation, Release,
    SourceInfo,
};

use super::{DocumentStore, MetadataStore, PatchStore, SearchIndex, SourceCollection};

type Docs = BTreeMap<String, Document>;

struct StoredSource {
    info: SourceInfo,
    docs: Docs,
}

#[derive(Default)]
struct StoredIndex {
    mapping: Mapping,
    docs: Docs,
    metadata: Option<IndexMetadata>,
}

/// In-memory hub storage: sources, target collections, indices, metadata
/// and patch files.
#[derive(Default)]
pub struct InMemoryStore {
    sources: RwLock<BTreeMap<String, StoredSource>>,
    collections: RwLock<BTreeMap<String, Docs>>,
    indices: RwLock<BTreeMap<String, StoredIndex>>,
    builds: RwLock<BTreeMap<String, BuildRecord>>,
    diffs: RwLock<BTreeMap<String, DiffReport>>,
    releases: RwLock<Vec<Release>>,
    patches: RwLock<BTreeMap<(String, u32), Vec<PatchOperation>>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn page<'a, T: 'a>(
    docs: impl Iterator<Item = (&'a String, T)>,
    after: Option<&str>,
    limit: usize,
) -> Vec<T> {
    docs.filter(|(id, _)| after.map_or(true, |a| id.as_str() > a))
        .take(limit)
        .map(|(_, v)| v)
        .collect()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a source collection with `docs`. Stands in for an uploader.
    pub fn load_source(&self, name: &str, version: Option<&str>, docs: Vec<Document>) -> Result<()> {
        let docs: Docs = docs.into_iter().map(|d| (d.id.clone(), d)).collect();
        let info = SourceInfo {
            name: name.to_string(),
            version: version.map(str::to_string),
            updated_at: Some(Utc::now()),
            documents: docs.len() as u64,
        };
        write(&self.sources)?.insert(name.to_string(), StoredSource { info, docs });
        Ok(())
    }
}

#[async_trait]
impl SourceCollection for InMemoryStore {
    async fn list_sources(&self) -> Result<Vec<SourceInfo>> {
        Ok(read(&self.sources)?.values().map(|s| s.info.clone()).collect())
    }

    async fn source_info(&self, source: &str) -> Result<Option<SourceInfo>> {
        Ok(read(&self.sources)?.get(source).map(|s| s.info.clone()))
    }

    async fn source_documents(
        &self,
        source: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let sources = read(&self.sources)?;
        let Some(stored) = sources.get(source) else {
            bail!("source collection '{}' does not exist", source);
        };
        Ok(page(stored.docs.iter().map(|(k, d)| (k, d.clone())), after, limit))
    }

    async fn source_documents_by_id(&self, source: &str, ids: &[String]) -> Result<Vec<Document>> {
        let sources = read(&self.sources)?;
        let Some(stored) = sources.get(source) else {
            bail!("source collection '{}' does not exist", source);
        };
        Ok(ids.iter().filter_map(|id| stored.docs.get(id).cloned()).collect())
    }

    async fn source_count(&self, source: &str) -> Result<u64> {
        Ok(read(&self.sources)?
            .get(source)
            .map(|s| s.docs.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_collection(&self, collection: &str) -> Result<()> {
        write(&self.collections)?.insert(collection.to_string(), Docs::new());
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        write(&self.collections)?.remove(collection);
        Ok(())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        Ok(read(&self.collections)?.contains_key(collection))
    }

    async fn get_documents(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>> {
        let collections = read(&self.collections)?;
        let Some(docs) = collections.get(collection) else {
            bail!("collection '{}' does not exist", collection);
        };
        Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
    }

    async fn upsert_documents(&self, collection: &str, docs: &[Document]) -> Result<()> {
        let mut collections = write(&self.collections)?;
        let Some(stored) = collections.get_mut(collection) else {
            bail!("collection '{}' does not exist", collection);
        };
        for doc in docs {
            stored.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<()> {
        let mut collections = write(&self.collections)?;
        let Some(stored) = collections.get_mut(collection) else {
            bail!("collection '{}' does not exist", collection);
        };
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn list_ids(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let collections = read(&self.collections)?;
        let Some(docs) = collections.get(collection) else {
            bail!("collection '{}' does not exist", collection);
        };
        Ok(page(docs.keys().map(|k| (k, k.clone())), after, limit))
    }

    async fn list_documents(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let collections = read(&self.collections)?;
        let Some(docs) = collections.get(collection) else {
            bail!("collection '{}' does not exist", collection);
        };
        Ok(page(docs.iter().map(|(k, d)| (k, d.clone())), after, limit))
    }

    async fn count_documents(&self, collection: &str) -> Result<u64> {
        Ok(read(&self.collections)?
            .get(collection)
            .map(|d| d.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl SearchIndex for InMemoryStore {
    async fn create_index(&self, index: &str, mapping: &Mapping) -> Result<()> {
        write(&self.indices)?.insert(
            index.to_string(),
            StoredIndex {
                mapping: mapping.clone(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(read(&self.indices)?.contains_key(index))
    }

    async fn validate_mapping(&self, index: &str, mapping: &Mapping) -> Result<MappingDelta> {
        let indices = read(&self.indices)?;
        let current = indices.get(index).map(|i| i.mapping.clone()).unwrap_or_default();
        Ok(diff_mappings(&current, mapping))
    }

    async fn index_mapping(&self, index: &str) -> Result<Option<Mapping>> {
        Ok(read(&self.indices)?.get(index).map(|i| i.mapping.clone()))
    }

    async fn update_mapping(&self, index: &str, mapping: &Mapping) -> Result<()> {
        let mut indices = write(&self.indices)?;
        let Some(stored) = indices.get_mut(index) else {
            bail!("index '{}' does not exist", index);
        };
        stored.mapping = mapping.clone();
        Ok(())
    }

    async fn bulk_index(&self, index: &str, docs: &[Document]) -> Result<()> {
        let mut indices = write(&self.indices)?;
        let Some(stored) = indices.get_mut(index) else {
            bail!("index '{}' does not exist", index);
        };
        for doc in docs {
            stored.docs.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn get_indexed(&self, index: &str, id: &str) -> Result<Option<Document>> {
        let indices = read(&self.indices)?;
        let Some(stored) = indices.get(index) else {
            bail!("index '{}' does not exist", index);
        };
        Ok(stored.docs.get(id).cloned())
    }

    async fn put_indexed(&self, index: &str, doc: &Document) -> Result<()> {
        self.bulk_index(index, std::slice::from_ref(doc)).await
    }

    async fn delete_indexed(&self, index: &str, id: &str) -> Result<()> {
        let mut indices = write(&self.indices)?;
        let Some(stored) = indices.get_mut(index) else {
            bail!("index '{}' does not exist", index);
        };
        stored.docs.remove(id);
        Ok(())
    }

    async fn index_count(&self, index: &str) -> Result<u64> {
        Ok(read(&self.indices)?
            .get(index)
            .map(|i| i.docs.len() as u64)
            .unwrap_or(0))
    }

    async fn get_metadata(&self, index: &str) -> Result<Option<IndexMetadata>> {
        Ok(read(&self.indices)?
            .get(index)
            .and_then(|i| i.metadata.clone()))
    }

    async fn put_metadata(&self, index: &str, metadata: &IndexMetadata) -> Result<()> {
        let mut indices = write(&self.indices)?;
        let Some(stored) = indices.get_mut(index) else {
            bail!("index '{}' does not exist", index);
        };
        stored.metadata = Some(metadata.clone());
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn save_build(&self, record: &BuildRecord) -> Result<()> {
        write(&self.builds)?.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn get_build(&self, name: &str) -> Result<Option<BuildRecord>> {
        Ok(read(&self.builds)?.get(name).cloned())
    }

    async fn list_builds(&self, config: Option<&str>) -> Result<Vec<BuildRecord>> {
        let mut builds: Vec<BuildRecord> = read(&self.builds)?
            .values()
            .filter(|b| config.map_or(true, |c| b.config_name == c))
            .cloned()
            .collect();
        builds.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.name.cmp(&b.name)));
        Ok(builds)
    }

    async fn save_diff(&self, report: &DiffReport) -> Result<()> {
        write(&self.diffs)?.insert(report.id.clone(), report.clone());
        Ok(())
    }

    async fn get_diff(&self, id: &str) -> Result<Option<DiffReport>> {
        Ok(read(&self.diffs)?.get(id).cloned())
    }

    async fn list_diffs(&self) -> Result<Vec<DiffReport>> {
        let mut diffs: Vec<DiffReport> = read(&self.diffs)?.values().cloned().collect();
        diffs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(diffs)
    }

    async fn mark_patch_synced(&self, diff_id: &str, seq: u32, target: &str) -> Result<()> {
        let mut diffs = write(&self.diffs)?;
        let Some(report) = diffs.get_mut(diff_id) else {
            bail!("diff '{}' does not exist", diff_id);
        };
        let Some(file) = report.files.iter_mut().find(|f| f.seq == seq) else {
            bail!("diff '{}' has no patch file {}", diff_id, seq);
        };
        file.synced.insert(target.to_string());
        Ok(())
    }

    async fn reset_synced(&self, diff_id: &str, target: &str) -> Result<u64> {
        let mut diffs = write(&self.diffs)?;
        let Some(report) = diffs.get_mut(diff_id) else {
            bail!("diff '{}' does not exist", diff_id);
        };
        let mut cleared = 0;
        for file in report.files.iter_mut() {
            if file.synced.remove(target) {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn save_release(&self, release: &Release) -> Result<()> {
        let mut releases = write(&self.releases)?;
        match releases.iter_mut().find(|r| r.id == release.id) {
            Some(existing) => *existing = release.clone(),
            None => releases.push(release.clone()),
        }
        Ok(())
    }

    async fn list_releases(&self) -> Result<Vec<Release>> {
        let mut releases = read(&self.releases)?.clone();
        releases.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(releases)
    }
}

#[async_trait]
impl PatchStore for InMemoryStore {
    async fn write_patch(
        &self,
        diff_id: &str,
        seq: u32,
        ops: &[PatchOperation],
    ) -> Result<PatchFileRef> {
        let mut body = String::new();
        for op in ops {
            body.push_str(&serde_json::to_string(op)?);
            body.push('\n');
        }
        let mut ids: Vec<&str> = ops.iter().map(|o| o.id.as_str()).collect();
        ids.dedup();
        write(&self.patches)?.insert((diff_id.to_string(), seq), ops.to_vec());
        Ok(PatchFileRef {
            seq,
            location: format!("memory://{}/{:05}", diff_id, seq),
            operations: ops.len() as u64,
            documents: ids.len() as u64,
            bytes: body.len() as u64,
            checksum: checksum(body.as_bytes()),
            synced: Default::default(),
        })
    }

    async fn read_patch(&self, file: &PatchFileRef) -> Result<Vec<PatchOperation>> {
        let Some(rest) = file.location.strip_prefix("memory://") else {
            bail!("not an in-memory patch location: {}", file.location);
        };
        let diff_id = rest
            .rsplit_once('/')
            .map(|(d, _)| d)
            .ok_or_else(|| anyhow!("malformed patch location: {}", file.location))?;
        read(&self.patches)?
            .get(&(diff_id.to_string(), file.seq))
            .cloned()
            .ok_or_else(|| anyhow!("patch file {} is missing", file.location))
    }

    async fn remove_patches(&self, diff_id: &str) -> Result<()> {
        write(&self.patches)?.retain(|(d, _), _| d != diff_id);
        Ok(())
    }
}
