//! Publisher: turns builds into releases of a search index.
//!
//! ```text
//! pending ─▶ pre-steps ─▶ core-step ─▶ metadata-update ─▶ post-steps ─▶ success
//!                 └────────────┴──────────────┴──────────────────────────▶ failed
//! ```
//!
//! | Kind | Pre-steps | Core step | Metadata update |
//! |------|-----------|-----------|-----------------|
//! | full | structural and dry-run mapping check | fresh index, bulk load | count == build total |
//! | diff | index metadata names the old build, dry-run mapping check | diff (reused if present), sync | mapping update, count == new total |
//!
//! The metadata document is written in a single call and only once the core
//! step is complete. The release note is generated in post-steps; a failure
//! there is logged and does not fail the release. Every release, successful
//! or not, is persisted.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use biohub_core::cancel::CancelToken;
use biohub_core::mapping::{validate_mapping, Mapping};
use biohub_core::models::{
    BuildRecord, DiffReport, IndexMetadata, Release, ReleaseKind, ReleaseStage,
};
use biohub_core::release_note::{generate, ReleaseNote};
use biohub_core::{HubError, Result};

use crate::differ::Differ;
use crate::hub::{PipelineSettings, Stores};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::scheduler::{timed, TaskKind, TaskScheduler};
use crate::syncer::{SyncTarget, Syncer};

pub struct Publisher {
    stores: Stores,
    differ: Differ,
    syncer: Syncer,
    scheduler: TaskScheduler,
    settings: PipelineSettings,
    progress: Arc<dyn ProgressReporter>,
}

impl Publisher {
    pub fn new(
        stores: Stores,
        differ: Differ,
        syncer: Syncer,
        scheduler: TaskScheduler,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            stores,
            differ,
            syncer,
            scheduler,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Load `build` into a fresh `index`.
    pub async fn publish_full(&self, build: &str, index: &str) -> Result<Release> {
        let build = self.usable_build(build).await?;
        let previous = self
            .stores
            .index
            .get_metadata(index)
            .await?
            .map(|m| m.build);
        let mut release = Release::new(ReleaseKind::Full, &build.name, previous.as_deref(), index);
        self.stores.meta.save_release(&release).await?;
        info!(release = %release.id, build = %build.name, index = %index, "full release started");

        let outcome = self.run_full(&build, &mut release).await;
        self.finish(release, outcome).await
    }

    /// Move `index` from `old` to `new` by applying their diff.
    pub async fn publish_diff(&self, old: &str, new: &str, index: &str) -> Result<Release> {
        let old_build = self.usable_build(old).await?;
        let new_build = self.usable_build(new).await?;
        let mut release =
            Release::new(ReleaseKind::Diff, &new_build.name, Some(&old_build.name), index);
        self.stores.meta.save_release(&release).await?;
        info!(
            release = %release.id,
            old = %old_build.name,
            new = %new_build.name,
            index = %index,
            "diff release started"
        );

        let outcome = self.run_diff(&old_build, &new_build, &mut release).await;
        self.finish(release, outcome).await
    }

    pub async fn list_releases(&self) -> Result<Vec<Release>> {
        Ok(self.stores.meta.list_releases().await?)
    }

    /// Release note between two builds, with diff counts when the pair has
    /// already been diffed.
    pub async fn release_note(&self, old: &str, new: &str) -> Result<ReleaseNote> {
        let old_build = self.build(old).await?;
        let new_build = self.build(new).await?;
        let diff = self.differ.find_diff(old, new).await?;
        Ok(generate(&old_build, &new_build, diff.as_ref()))
    }

    async fn run_full(&self, build: &BuildRecord, release: &mut Release) -> Result<()> {
        let index = release.index.clone();
        let mapping = build.mapping.clone().unwrap_or_default();

        self.enter(release, ReleaseStage::PreSteps).await?;
        validate_mapping(&mapping)?;
        let delta = self.stores.index.validate_mapping(&index, &mapping).await?;
        if !delta.is_compatible() {
            info!(
                index = %index,
                removed = ?delta.removed,
                changed = ?delta.changed,
                "full release replaces an index with an incompatible mapping"
            );
        }

        self.enter(release, ReleaseStage::CoreStep).await?;
        let (index_ref, mapping_ref) = (&index, &mapping);
        let loaded = self
            .scheduler
            .run(TaskKind::Publish, &index, |token| async move {
                self.bulk_load(build, index_ref, mapping_ref, &token).await
            })
            .await?;
        release.documents_loaded = loaded;

        self.enter(release, ReleaseStage::MetadataUpdate).await?;
        let count = self.expected_count(build, &index).await?;
        self.write_metadata(build, release, count).await?;

        self.enter(release, ReleaseStage::PostSteps).await?;
        if let Some(previous) = release.previous_build.clone() {
            release.note = self.note_or_warn(&previous, build, None).await;
        }
        Ok(())
    }

    async fn bulk_load(
        &self,
        build: &BuildRecord,
        index: &str,
        mapping: &Mapping,
        token: &CancelToken,
    ) -> Result<u64> {
        timed(
            "create index",
            self.settings.timeout,
            self.stores.index.create_index(index, mapping),
        )
        .await?;

        let mut loaded = 0u64;
        let mut after: Option<String> = None;
        loop {
            token.check()?;
            let page = timed(
                "scan build",
                self.settings.timeout,
                self.stores.targets.list_documents(
                    &build.name,
                    after.as_deref(),
                    self.settings.build_batch,
                ),
            )
            .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            timed(
                "bulk index",
                self.settings.timeout,
                self.stores.index.bulk_index(index, &page),
            )
            .await?;
            loaded += page.len() as u64;
            self.progress.report(ProgressEvent::Indexing {
                index: index.to_string(),
                n: loaded,
                total: build.total_documents,
            });
        }
        Ok(loaded)
    }

    async fn run_diff(
        &self,
        old: &BuildRecord,
        new: &BuildRecord,
        release: &mut Release,
    ) -> Result<()> {
        let index = release.index.clone();

        self.enter(release, ReleaseStage::PreSteps).await?;
        let metadata = self
            .stores
            .index
            .get_metadata(&index)
            .await?
            .ok_or_else(|| {
                HubError::invalid_state(format!("index '{}' has no release metadata", index))
            })?;
        if metadata.build != old.name {
            return Err(HubError::invalid_state(format!(
                "index '{}' holds build '{}', not '{}'",
                index, metadata.build, old.name
            )));
        }
        if let Some(mapping) = &new.mapping {
            validate_mapping(mapping)?;
            self.stores
                .index
                .validate_mapping(&index, mapping)
                .await?
                .ensure_compatible()?;
        }

        self.enter(release, ReleaseStage::CoreStep).await?;
        let report = self.differ.diff(&old.name, &new.name).await?;
        release.diff_id = Some(report.id.clone());
        let sync = self
            .syncer
            .sync(&report.id, &SyncTarget::Index(index.clone()), false)
            .await?;
        release.documents_loaded = sync.documents_patched;
        let failed = sync.files_failed;
        release.sync = Some(sync);
        if failed > 0 {
            return Err(HubError::invalid_state(format!(
                "{} patch file(s) of diff '{}' failed to apply to index '{}'",
                failed, report.id, index
            )));
        }

        self.enter(release, ReleaseStage::MetadataUpdate).await?;
        let count = self.expected_count(new, &index).await?;
        if let Some(mapping) = &new.mapping {
            timed(
                "update mapping",
                self.settings.timeout,
                self.stores.index.update_mapping(&index, mapping),
            )
            .await?;
        }
        self.write_metadata(new, release, count).await?;

        self.enter(release, ReleaseStage::PostSteps).await?;
        release.note = self.note_or_warn(&old.name, new, Some(&report)).await;
        Ok(())
    }

    /// The index must hold exactly the build's documents before anything
    /// about the index is updated.
    async fn expected_count(&self, build: &BuildRecord, index: &str) -> Result<u64> {
        let count = timed(
            "count index",
            self.settings.timeout,
            self.stores.index.index_count(index),
        )
        .await?;
        if count != build.total_documents {
            return Err(HubError::invalid_state(format!(
                "index '{}' holds {} documents but build '{}' has {}",
                index, count, build.name, build.total_documents
            )));
        }
        Ok(count)
    }

    /// Write the metadata document in a single call.
    async fn write_metadata(&self, build: &BuildRecord, release: &Release, count: u64) -> Result<()> {
        let metadata = IndexMetadata {
            build: build.name.clone(),
            build_version: build.version.clone(),
            config_name: build.config_name.clone(),
            doc_type: build.doc_type.clone(),
            total_documents: count,
            sources: build.sources.clone(),
            mapping: build.mapping.clone(),
            release_id: release.id.clone(),
            updated_at: Utc::now(),
        };
        timed(
            "write index metadata",
            self.settings.timeout,
            self.stores.index.put_metadata(&release.index, &metadata),
        )
        .await
    }

    async fn note_or_warn(
        &self,
        old: &str,
        new: &BuildRecord,
        diff: Option<&DiffReport>,
    ) -> Option<ReleaseNote> {
        match self.stores.meta.get_build(old).await {
            Ok(Some(old_build)) => Some(generate(&old_build, new, diff)),
            Ok(None) => {
                warn!(old = %old, new = %new.name, "release note skipped: previous build unknown");
                None
            }
            Err(e) => {
                warn!(old = %old, new = %new.name, error = %e, "release note failed");
                None
            }
        }
    }

    async fn enter(&self, release: &mut Release, stage: ReleaseStage) -> Result<()> {
        release.stage = stage;
        self.stores.meta.save_release(release).await?;
        Ok(())
    }

    async fn finish(&self, mut release: Release, outcome: Result<()>) -> Result<Release> {
        release.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                release.stage = ReleaseStage::Success;
                self.stores.meta.save_release(&release).await?;
                info!(
                    release = %release.id,
                    index = %release.index,
                    documents = release.documents_loaded,
                    "release succeeded"
                );
                Ok(release)
            }
            Err(e) => {
                error!(release = %release.id, stage = ?release.stage, error = %e, "release failed");
                release.stage = ReleaseStage::Failed;
                release.error = Some(e.report());
                if let Err(save_err) = self.stores.meta.save_release(&release).await {
                    error!(release = %release.id, error = %save_err, "failed to record release failure");
                }
                Err(e)
            }
        }
    }

    async fn build(&self, name: &str) -> Result<BuildRecord> {
        self.stores
            .meta
            .get_build(name)
            .await?
            .ok_or_else(|| HubError::not_found("build", name))
    }

    async fn usable_build(&self, name: &str) -> Result<BuildRecord> {
        let build = self.build(name).await?;
        if !build.is_usable() {
            return Err(HubError::invalid_state(format!(
                "build '{}' is not usable (status {:?}, archived {})",
                name, build.status, build.archived
            )));
        }
        Ok(build)
    }
}
