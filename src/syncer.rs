//! Syncer: applies a diff's patch files to a collection or an index.
//!
//! Files are applied strictly in generation order. A file already flagged
//! synced for the target is skipped, which is what makes repeated syncs
//! after a partial failure or restart safe. Within a file, operations are
//! grouped by document: the current document is read, the group applied in
//! memory and the result written (or deleted) in one call.
//!
//! Application is best effort. A failing document does not roll back the
//! others of the file; its operations are reported and the file stays
//! unflagged. When every failure is retryable (backend error, timeout) the
//! whole file is re-applied after a linear backoff, up to `max_retries`
//! extra attempts. Re-applying is safe: field replace/remove and document
//! upsert/delete are idempotent.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use biohub_core::cancel::CancelToken;
use biohub_core::diff::apply_document_ops;
use biohub_core::models::{
    Document, FileSyncResult, FileSyncStatus, OperationError, PatchFileRef, PatchOperation,
    SyncResult,
};
use biohub_core::{ErrorReport, HubError, Result};

use crate::hub::{PipelineSettings, Stores};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::scheduler::{timed, TaskKind, TaskScheduler};

/// Where a diff is applied: `collection:<name>` or `index:<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    Collection(String),
    Index(String),
}

impl SyncTarget {
    pub fn name(&self) -> &str {
        match self {
            Self::Collection(name) | Self::Index(name) => name,
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection(name) => write!(f, "collection:{}", name),
            Self::Index(name) => write!(f, "index:{}", name),
        }
    }
}

impl FromStr for SyncTarget {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("collection", name)) if !name.is_empty() => Ok(Self::Collection(name.into())),
            Some(("index", name)) if !name.is_empty() => Ok(Self::Index(name.into())),
            _ => Err(HubError::config(format!(
                "invalid sync target '{}' (expected collection:<name> or index:<name>)",
                s
            ))),
        }
    }
}

/// Outcome of one pass over a patch file.
#[derive(Default)]
struct FilePass {
    operations: u64,
    documents: u64,
    errors: Vec<(OperationError, bool)>,
    read_error: Option<(ErrorReport, bool)>,
}

impl FilePass {
    fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.read_error.is_none()
    }

    fn all_retryable(&self) -> bool {
        self.errors.iter().all(|(_, retryable)| *retryable)
            && self.read_error.as_ref().map_or(true, |(_, retryable)| *retryable)
    }
}

pub struct Syncer {
    stores: Stores,
    scheduler: TaskScheduler,
    settings: PipelineSettings,
    progress: Arc<dyn ProgressReporter>,
}

impl Syncer {
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

    pub async fn sync(&self, diff_id: &str, target: &SyncTarget, dry_run: bool) -> Result<SyncResult> {
        self.sync_with_cancel(diff_id, target, dry_run, CancelToken::new())
            .await
    }

    pub async fn sync_with_cancel(
        &self,
        diff_id: &str,
        target: &SyncTarget,
        dry_run: bool,
        cancel: CancelToken,
    ) -> Result<SyncResult> {
        let label = format!("{} -> {}", diff_id, target);
        self.scheduler
            .run_with_token(TaskKind::Sync, &label, cancel, |token| {
                self.execute(diff_id, target, dry_run, token)
            })
            .await
    }

    async fn execute(
        &self,
        diff_id: &str,
        target: &SyncTarget,
        dry_run: bool,
        cancel: CancelToken,
    ) -> Result<SyncResult> {
        let report = self
            .stores
            .meta
            .get_diff(diff_id)
            .await?
            .ok_or_else(|| HubError::not_found("diff", diff_id))?;
        self.ensure_target(target).await?;

        let target_key = target.to_string();
        let mut files = report.files.clone();
        files.sort_by_key(|f| f.seq);

        let mut result = SyncResult {
            diff_id: diff_id.to_string(),
            target: target_key.clone(),
            dry_run,
            files_total: files.len() as u64,
            ..Default::default()
        };
        info!(diff = %diff_id, target = %target, files = files.len(), dry_run, "sync started");

        for (done, file) in files.iter().enumerate() {
            cancel.check()?;
            let outcome = if file.is_synced(&target_key) {
                debug!(diff = %diff_id, seq = file.seq, "patch file already synced");
                result.files_skipped += 1;
                FileSyncResult {
                    seq: file.seq,
                    status: FileSyncStatus::Skipped,
                    operations: file.operations,
                    attempts: 0,
                    errors: Vec::new(),
                    error: None,
                }
            } else if dry_run {
                match self.read_file(file).await {
                    Ok(ops) => {
                        result.operations_applied += ops.len() as u64;
                        FileSyncResult {
                            seq: file.seq,
                            status: FileSyncStatus::DryRun,
                            operations: ops.len() as u64,
                            attempts: 0,
                            errors: Vec::new(),
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(diff = %diff_id, seq = file.seq, error = %e, "patch file unreadable");
                        result.files_failed += 1;
                        FileSyncResult {
                            seq: file.seq,
                            status: FileSyncStatus::Failed,
                            operations: 0,
                            attempts: 0,
                            errors: Vec::new(),
                            error: Some(e.report()),
                        }
                    }
                }
            } else {
                self.apply_file(diff_id, target, file, &mut result).await?
            };
            result.files.push(outcome);

            self.progress.report(ProgressEvent::Syncing {
                diff: diff_id.to_string(),
                target: target_key.clone(),
                files_done: done as u64 + 1,
                files_total: result.files_total,
                documents: result.documents_patched,
            });
        }

        if result.is_success() {
            info!(
                diff = %diff_id,
                target = %target,
                applied = result.files_applied,
                skipped = result.files_skipped,
                documents = result.documents_patched,
                "sync finished"
            );
        } else {
            warn!(
                diff = %diff_id,
                target = %target,
                failed = result.files_failed,
                "sync finished with failed patch files"
            );
        }
        Ok(result)
    }

    async fn ensure_target(&self, target: &SyncTarget) -> Result<()> {
        let exists = match target {
            SyncTarget::Collection(name) => self.stores.targets.collection_exists(name).await?,
            SyncTarget::Index(name) => self.stores.index.index_exists(name).await?,
        };
        if exists {
            Ok(())
        } else {
            Err(HubError::not_found("sync target", target.to_string()))
        }
    }

    async fn read_file(&self, file: &PatchFileRef) -> Result<Vec<PatchOperation>> {
        timed(
            "read patch file",
            self.settings.timeout,
            self.stores.patches.read_patch(file),
        )
        .await
    }

    async fn apply_file(
        &self,
        diff_id: &str,
        target: &SyncTarget,
        file: &PatchFileRef,
        result: &mut SyncResult,
    ) -> Result<FileSyncResult> {
        let max_attempts = self.settings.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let pass = match self.read_file(file).await {
                Ok(ops) => self.apply_ops(target, &ops).await,
                Err(e) => FilePass {
                    read_error: Some((e.report(), e.is_retryable())),
                    ..Default::default()
                },
            };

            if pass.is_clean() {
                self.stores
                    .meta
                    .mark_patch_synced(diff_id, file.seq, &target.to_string())
                    .await?;
                result.files_applied += 1;
                result.operations_applied += pass.operations;
                result.documents_patched += pass.documents;
                return Ok(FileSyncResult {
                    seq: file.seq,
                    status: FileSyncStatus::Applied,
                    operations: pass.operations,
                    attempts: attempt,
                    errors: Vec::new(),
                    error: None,
                });
            }

            if pass.all_retryable() && attempt < max_attempts {
                let backoff = self.settings.retry_backoff * attempt;
                warn!(
                    diff = %diff_id,
                    seq = file.seq,
                    attempt,
                    errors = pass.errors.len() + pass.read_error.is_some() as usize,
                    backoff_ms = backoff.as_millis() as u64,
                    "patch file failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            warn!(
                diff = %diff_id,
                seq = file.seq,
                attempt,
                errors = pass.errors.len() + pass.read_error.is_some() as usize,
                "patch file failed"
            );
            result.files_failed += 1;
            result.operations_applied += pass.operations;
            result.documents_patched += pass.documents;
            return Ok(FileSyncResult {
                seq: file.seq,
                status: FileSyncStatus::Failed,
                operations: pass.operations,
                attempts: attempt,
                errors: pass.errors.into_iter().map(|(e, _)| e).collect(),
                error: pass.read_error.map(|(e, _)| e),
            });
        }
    }

    /// Apply every document group of a file, collecting failures.
    async fn apply_ops(&self, target: &SyncTarget, ops: &[PatchOperation]) -> FilePass {
        let mut pass = FilePass::default();
        for group in ops.chunk_by(|a, b| a.id == b.id) {
            match self.apply_group(target, group).await {
                Ok(()) => {
                    pass.operations += group.len() as u64;
                    pass.documents += 1;
                }
                Err((op, e)) => {
                    let retryable = e.is_retryable();
                    pass.errors.push((
                        OperationError {
                            id: op.id.clone(),
                            op: op.op,
                            path: op.path.clone(),
                            error: e.report(),
                        },
                        retryable,
                    ));
                }
            }
        }
        pass
    }

    /// Read, patch and write one document. On failure, returns the operation
    /// blamed for it: the offending one for a patch error, the first of the
    /// group for a storage error.
    async fn apply_group<'a>(
        &self,
        target: &SyncTarget,
        group: &'a [PatchOperation],
    ) -> std::result::Result<(), (&'a PatchOperation, HubError)> {
        let Some(first) = group.first() else {
            return Ok(());
        };
        let id = first.id.as_str();
        let mut state = self.fetch(target, id).await.map_err(|e| (first, e))?;
        for op in group {
            state = apply_document_ops(state, std::slice::from_ref(op)).map_err(|e| (op, e))?;
        }
        self.store(target, id, state).await.map_err(|e| (first, e))
    }

    async fn fetch(&self, target: &SyncTarget, id: &str) -> Result<Option<Document>> {
        let limit = self.settings.timeout;
        match target {
            SyncTarget::Collection(name) => {
                let ids = [id.to_string()];
                let docs = timed(
                    "read document",
                    limit,
                    self.stores.targets.get_documents(name, &ids),
                )
                .await?;
                Ok(docs.into_iter().next())
            }
            SyncTarget::Index(name) => {
                timed("read indexed document", limit, self.stores.index.get_indexed(name, id)).await
            }
        }
    }

    async fn store(&self, target: &SyncTarget, id: &str, doc: Option<Document>) -> Result<()> {
        let limit = self.settings.timeout;
        match (target, doc) {
            (SyncTarget::Collection(name), Some(doc)) => {
                timed(
                    "write document",
                    limit,
                    self.stores
                        .targets
                        .upsert_documents(name, std::slice::from_ref(&doc)),
                )
                .await
            }
            (SyncTarget::Collection(name), None) => {
                let ids = [id.to_string()];
                timed(
                    "delete document",
                    limit,
                    self.stores.targets.delete_documents(name, &ids),
                )
                .await
            }
            (SyncTarget::Index(name), Some(doc)) => {
                timed("index document", limit, self.stores.index.put_indexed(name, &doc)).await
            }
            (SyncTarget::Index(name), None) => {
                timed(
                    "delete indexed document",
                    limit,
                    self.stores.index.delete_indexed(name, id),
                )
                .await
            }
        }
    }
}
