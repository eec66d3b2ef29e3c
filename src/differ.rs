//! Differ: computes patch files between two successful builds.
//!
//! A diff is a keyed set difference over document identifiers composed with
//! a per-document structural diff:
//!
//! 1. Both builds must be usable and of the same document type.
//! 2. Their mappings are compared first. Removed or retyped fields fail the
//!    diff with `SchemaIncompatibility` before anything is written.
//! 3. The new build is paged by identifier; each page is looked up in the
//!    old build to classify documents as added, updated or unchanged.
//! 4. The old build's identifiers are paged to find deleted documents.
//!
//! Operations are buffered and flushed to a new patch file whenever
//! `diff_batch` documents have accumulated. Flushing only happens between
//! documents, so the operations of one identifier always live in exactly one
//! patch file. If the diff fails midway, the files written so far are removed
//! and no report is saved.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info};

use biohub_core::cancel::CancelToken;
use biohub_core::diff::diff_documents;
use biohub_core::mapping::{diff_mappings, MappingDelta};
use biohub_core::models::{BuildRecord, DiffReport, DiffStats, PatchFileRef, PatchOperation};
use biohub_core::{HubError, Result};

use crate::hub::{PipelineSettings, Stores};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::scheduler::{timed, TaskKind, TaskScheduler};

/// Accumulates per-document operations into bounded patch files.
struct PatchWriter<'a> {
    stores: &'a Stores,
    diff_id: &'a str,
    batch: usize,
    pending: Vec<PatchOperation>,
    pending_docs: usize,
    files: Vec<PatchFileRef>,
}

impl<'a> PatchWriter<'a> {
    fn new(stores: &'a Stores, diff_id: &'a str, batch: usize) -> Self {
        Self {
            stores,
            diff_id,
            batch: batch.max(1),
            pending: Vec::new(),
            pending_docs: 0,
            files: Vec::new(),
        }
    }

    async fn push_document(&mut self, ops: Vec<PatchOperation>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.pending.extend(ops);
        self.pending_docs += 1;
        if self.pending_docs >= self.batch {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let seq = self.files.len() as u32;
        let file = self
            .stores
            .patches
            .write_patch(self.diff_id, seq, &self.pending)
            .await?;
        self.pending.clear();
        self.pending_docs = 0;
        self.files.push(file);
        Ok(())
    }

    async fn finish(mut self) -> Result<Vec<PatchFileRef>> {
        self.flush().await?;
        Ok(self.files)
    }
}

pub struct Differ {
    stores: Stores,
    scheduler: TaskScheduler,
    settings: PipelineSettings,
    progress: Arc<dyn ProgressReporter>,
}

impl Differ {
    pub fn new(stores: Stores, scheduler: TaskScheduler, settings: PipelineSettings) -> Self {
        Self {
            stores,
            scheduler,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Diff `old` against `new`, reusing an existing report for the pair.
    pub async fn diff(&self, old: &str, new: &str) -> Result<DiffReport> {
        self.diff_with_cancel(old, new, CancelToken::new()).await
    }

    pub async fn diff_with_cancel(
        &self,
        old: &str,
        new: &str,
        cancel: CancelToken,
    ) -> Result<DiffReport> {
        if let Some(existing) = self.find_diff(old, new).await? {
            info!(diff = %existing.id, "reusing existing diff");
            return Ok(existing);
        }
        let (old_build, new_build, delta) = self.check_builds(old, new).await?;
        let label = DiffReport::id_for(old, new);
        self.scheduler
            .run_with_token(TaskKind::Diff, &label, cancel, |token| {
                self.execute(old_build, new_build, delta, token)
            })
            .await
    }

    /// Validate both builds and their mappings. Nothing is written.
    async fn check_builds(
        &self,
        old: &str,
        new: &str,
    ) -> Result<(BuildRecord, BuildRecord, MappingDelta)> {
        if old == new {
            return Err(HubError::invalid_state(format!(
                "cannot diff build '{}' against itself",
                old
            )));
        }
        let old_build = self.usable_build(old).await?;
        let new_build = self.usable_build(new).await?;
        if old_build.doc_type != new_build.doc_type {
            return Err(HubError::config(format!(
                "builds '{}' ({}) and '{}' ({}) have different document types",
                old, old_build.doc_type, new, new_build.doc_type
            )));
        }
        let delta = match (&old_build.mapping, &new_build.mapping) {
            (Some(a), Some(b)) => diff_mappings(a, b),
            _ => MappingDelta::default(),
        };
        delta.ensure_compatible()?;
        Ok((old_build, new_build, delta))
    }

    async fn usable_build(&self, name: &str) -> Result<BuildRecord> {
        let build = self
            .stores
            .meta
            .get_build(name)
            .await?
            .ok_or_else(|| HubError::not_found("build", name))?;
        if !build.is_usable() {
            return Err(HubError::invalid_state(format!(
                "build '{}' is not usable (status {:?}, archived {})",
                name, build.status, build.archived
            )));
        }
        Ok(build)
    }

    async fn execute(
        &self,
        old: BuildRecord,
        new: BuildRecord,
        delta: MappingDelta,
        cancel: CancelToken,
    ) -> Result<DiffReport> {
        let diff_id = DiffReport::id_for(&old.name, &new.name);
        info!(diff = %diff_id, "diff started");
        // Leftovers of an interrupted run are never referenced by a report.
        self.stores.patches.remove_patches(&diff_id).await?;

        match self.compute(&old, &new, &diff_id, &cancel).await {
            Ok((stats, files)) => {
                let report = DiffReport {
                    id: diff_id.clone(),
                    old_build: old.name.clone(),
                    new_build: new.name.clone(),
                    doc_type: new.doc_type.clone(),
                    created_at: Utc::now(),
                    stats,
                    mapping_delta: delta,
                    files,
                };
                self.stores.meta.save_diff(&report).await?;
                info!(
                    diff = %diff_id,
                    added = report.stats.added,
                    deleted = report.stats.deleted,
                    updated = report.stats.updated,
                    files = report.stats.patch_files,
                    "diff finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(diff = %diff_id, error = %e, "diff failed");
                if let Err(cleanup) = self.stores.patches.remove_patches(&diff_id).await {
                    error!(diff = %diff_id, error = %cleanup, "failed to remove partial patch files");
                }
                Err(e)
            }
        }
    }

    async fn compute(
        &self,
        old: &BuildRecord,
        new: &BuildRecord,
        diff_id: &str,
        cancel: &CancelToken,
    ) -> Result<(DiffStats, Vec<PatchFileRef>)> {
        let batch = self.settings.build_batch;
        let mut stats = DiffStats::default();
        let mut writer = PatchWriter::new(&self.stores, diff_id, self.settings.diff_batch);
        let mut seen = 0u64;

        let mut after: Option<String> = None;
        loop {
            cancel.check()?;
            let page = timed(
                "scan new build",
                self.settings.timeout,
                self.stores
                    .targets
                    .list_documents(&new.name, after.as_deref(), batch),
            )
            .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());

            let ids: Vec<String> = page.iter().map(|d| d.id.clone()).collect();
            let previous = timed(
                "read old build",
                self.settings.timeout,
                self.stores.targets.get_documents(&old.name, &ids),
            )
            .await?;
            let mut previous: BTreeMap<String, _> =
                previous.into_iter().map(|d| (d.id.clone(), d)).collect();

            for doc in page {
                match previous.remove(&doc.id) {
                    None => {
                        stats.added += 1;
                        writer
                            .push_document(vec![PatchOperation::add_document(&doc)])
                            .await?;
                    }
                    Some(before) => {
                        let ops = diff_documents(&before, &doc);
                        if ops.is_empty() {
                            stats.unchanged += 1;
                        } else {
                            stats.updated += 1;
                            stats.operations += ops.len() as u64;
                            writer.push_document(ops).await?;
                        }
                    }
                }
                seen += 1;
            }
            self.progress.report(ProgressEvent::Diffing {
                diff: diff_id.to_string(),
                n: seen,
            });
        }

        let mut after: Option<String> = None;
        loop {
            cancel.check()?;
            let ids = timed(
                "scan old build",
                self.settings.timeout,
                self.stores
                    .targets
                    .list_ids(&old.name, after.as_deref(), batch),
            )
            .await?;
            let Some(last) = ids.last() else {
                break;
            };
            after = Some(last.clone());

            let present: BTreeSet<String> = timed(
                "read new build",
                self.settings.timeout,
                self.stores.targets.get_documents(&new.name, &ids),
            )
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
            for id in ids.iter().filter(|id| !present.contains(*id)) {
                stats.deleted += 1;
                writer
                    .push_document(vec![PatchOperation::delete_document(id)])
                    .await?;
            }
        }

        stats.operations += stats.added + stats.deleted;
        let files = writer.finish().await?;
        stats.patch_files = files.len() as u64;
        stats.total_bytes = files.iter().map(|f| f.bytes).sum();
        Ok((stats, files))
    }

    pub async fn find_diff(&self, old: &str, new: &str) -> Result<Option<DiffReport>> {
        Ok(self
            .stores
            .meta
            .get_diff(&DiffReport::id_for(old, new))
            .await?)
    }

    pub async fn get_diff(&self, id: &str) -> Result<DiffReport> {
        self.stores
            .meta
            .get_diff(id)
            .await?
            .ok_or_else(|| HubError::not_found("diff", id))
    }

    pub async fn list_diffs(&self) -> Result<Vec<DiffReport>> {
        Ok(self.stores.meta.list_diffs().await?)
    }

    /// Clear the synced flags `target` holds on a diff's patch files.
    pub async fn reset_synced(&self, diff_id: &str, target: &str) -> Result<u64> {
        self.get_diff(diff_id).await?;
        let cleared = self.stores.meta.reset_synced(diff_id, target).await?;
        info!(diff = %diff_id, target = %target, cleared, "synced flags reset");
        Ok(cleared)
    }
}
