//! Collaborator contracts consumed by the pipeline.
//!
//! The pipeline never talks to a storage engine directly. It issues the
//! narrow operations below and leaves query languages, sharding and
//! persistence formats to the implementations.
//!
//! | Trait | Role | Implementations |
//! |-------|------|-----------------|
//! | [`SourceCollection`] | per-source documents, restartable paging | memory, sqlite |
//! | [`DocumentStore`] | target collections written by the builder | memory, sqlite |
//! | [`SearchIndex`] | live index: bulk load, per-document patch, metadata | memory, sqlite |
//! | [`MetadataStore`] | build, diff and release records | memory, sqlite |
//! | [`PatchStore`] | immutable patch files | memory, filesystem |
//!
//! All methods return `anyhow::Result`; the pipeline turns those failures
//! into `HubError::Backend`, which is retryable during sync.
//!
//! Paging is keyset-based: `after` is the last identifier of the previous
//! page and pages are ordered by identifier, so iteration can be restarted
//! from any point.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::mapping::{Mapping, MappingDelta};
use crate::models::{
    BuildRecord, DiffReport, Document, IndexMetadata, PatchFileRef, PatchOperation, Release,
    SourceInfo,
};

#[async_trait]
pub trait SourceCollection: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<SourceInfo>>;

    async fn source_info(&self, source: &str) -> Result<Option<SourceInfo>>;

    /// One page of documents with identifiers greater than `after`.
    async fn source_documents(
        &self,
        source: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    /// Documents whose identifiers are in `ids`; unknown ids are skipped.
    async fn source_documents_by_id(&self, source: &str, ids: &[String]) -> Result<Vec<Document>>;

    async fn source_count(&self, source: &str) -> Result<u64>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create an empty collection, dropping any existing one of that name.
    async fn create_collection(&self, collection: &str) -> Result<()>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;

    async fn collection_exists(&self, collection: &str) -> Result<bool>;

    async fn get_documents(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>>;

    /// Insert or fully replace documents by identifier.
    async fn upsert_documents(&self, collection: &str, docs: &[Document]) -> Result<()>;

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<()>;

    async fn list_ids(&self, collection: &str, after: Option<&str>, limit: usize)
        -> Result<Vec<String>>;

    async fn list_documents(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    async fn count_documents(&self, collection: &str) -> Result<u64>;
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create a fresh index with `mapping`, replacing any existing one.
    async fn create_index(&self, index: &str, mapping: &Mapping) -> Result<()>;

    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Dry-run mapping check: how `mapping` differs from the committed one
    /// (empty when the index does not exist). Nothing is written.
    async fn validate_mapping(&self, index: &str, mapping: &Mapping) -> Result<MappingDelta>;

    async fn index_mapping(&self, index: &str) -> Result<Option<Mapping>>;

    async fn update_mapping(&self, index: &str, mapping: &Mapping) -> Result<()>;

    async fn bulk_index(&self, index: &str, docs: &[Document]) -> Result<()>;

    async fn get_indexed(&self, index: &str, id: &str) -> Result<Option<Document>>;

    async fn put_indexed(&self, index: &str, doc: &Document) -> Result<()>;

    async fn delete_indexed(&self, index: &str, id: &str) -> Result<()>;

    async fn index_count(&self, index: &str) -> Result<u64>;

    async fn get_metadata(&self, index: &str) -> Result<Option<IndexMetadata>>;

    /// Replace the metadata document in a single write.
    async fn put_metadata(&self, index: &str, metadata: &IndexMetadata) -> Result<()>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn save_build(&self, record: &BuildRecord) -> Result<()>;

    async fn get_build(&self, name: &str) -> Result<Option<BuildRecord>>;

    /// Builds ordered by start time, oldest first.
    async fn list_builds(&self, config: Option<&str>) -> Result<Vec<BuildRecord>>;

    async fn save_diff(&self, report: &DiffReport) -> Result<()>;

    async fn get_diff(&self, id: &str) -> Result<Option<DiffReport>>;

    async fn list_diffs(&self) -> Result<Vec<DiffReport>>;

    /// Flag one patch file as fully applied to `target`.
    async fn mark_patch_synced(&self, diff_id: &str, seq: u32, target: &str) -> Result<()>;

    /// Clear every synced flag of `target` on a diff. Returns the number of
    /// files that were flagged.
    async fn reset_synced(&self, diff_id: &str, target: &str) -> Result<u64>;

    async fn save_release(&self, release: &Release) -> Result<()>;

    async fn list_releases(&self) -> Result<Vec<Release>>;
}

#[async_trait]
pub trait PatchStore: Send + Sync {
    /// Persist one patch file. Files are never rewritten once referenced by a
    /// saved diff report.
    async fn write_patch(
        &self,
        diff_id: &str,
        seq: u32,
        ops: &[PatchOperation],
    ) -> Result<PatchFileRef>;

    async fn read_patch(&self, file: &PatchFileRef) -> Result<Vec<PatchOperation>>;

    async fn remove_patches(&self, diff_id: &str) -> Result<()>;
}
