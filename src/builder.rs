//! Builder: merges source collections into one target collection.
//!
//! # State machine
//!
//! ```text
//! pending ─▶ merging-root ─▶ merging-others ─▶ post-processing ─▶ success
//!    └────────────┴──────────────┴──────────────────┴──▶ failed
//! ```
//!
//! # Algorithm
//!
//! 1. Validate the configuration, resolve the merge order and every named
//!    hook, and check each source exists. Any problem here is a
//!    configuration error and nothing is created.
//! 2. Claim the configuration lock (a concurrent build is rejected as busy),
//!    create the target collection and save a `pending` build record.
//! 3. For each source, in resolved order, page through its documents. For
//!    every page: look up the existing target documents by identifier, merge
//!    or create, and write the changed documents back. Non-root sources
//!    never create documents when root sources are declared.
//! 4. Post-process: builder extension finalize, post-merge hook, mapping
//!    inference (unless the configuration carries a mapping) and count.
//!    Both hooks run under the storage timeout and receive the build's
//!    cancellation token.
//!
//! Cancellation is checked between pages. Any error, including a
//! cancellation or a storage timeout, marks the record `failed` and is
//! returned; the partially written collection stays in place for diagnosis
//! but is never marked usable.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use biohub_core::cancel::CancelToken;
use biohub_core::mapping::MappingInspector;
use biohub_core::merge::merge_documents;
use biohub_core::models::{
    BuildConfiguration, BuildRecord, BuildStage, Document, SourceInfo, SourceStats,
};
use biohub_core::order::{validate_configuration, MergeOrderResolver};
use biohub_core::{HubError, Result};

use crate::hooks::{HookRegistry, ResolvedHooks};
use crate::hub::{PipelineSettings, Stores};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::scheduler::{timed, TaskKind, TaskScheduler};

/// Source version drift since the latest successful build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceChange {
    pub source: String,
    pub built_version: Option<String>,
    pub current_version: Option<String>,
    pub current_documents: u64,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhatsNew {
    pub config: String,
    pub latest_build: Option<String>,
    pub sources: Vec<SourceChange>,
    pub needs_rebuild: bool,
}

/// Everything resolved before a build is allowed to start.
struct BuildPlan {
    order: Vec<String>,
    hooks: ResolvedHooks,
    infos: BTreeMap<String, SourceInfo>,
}

pub struct Builder {
    stores: Stores,
    hooks: HookRegistry,
    scheduler: TaskScheduler,
    settings: PipelineSettings,
    progress: Arc<dyn ProgressReporter>,
}

impl Builder {
    pub fn new(
        stores: Stores,
        hooks: HookRegistry,
        scheduler: TaskScheduler,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            stores,
            hooks,
            scheduler,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Run a build of `config` to completion.
    pub async fn build(&self, config: &BuildConfiguration) -> Result<BuildRecord> {
        self.build_with_cancel(config, CancelToken::new()).await
    }

    /// Run a build that can be cancelled through `cancel`.
    pub async fn build_with_cancel(
        &self,
        config: &BuildConfiguration,
        cancel: CancelToken,
    ) -> Result<BuildRecord> {
        let plan = self.plan(config).await?;
        let _lock = self.scheduler.try_lock_config(&config.name)?;
        let snapshot = config.clone();
        self.scheduler
            .run_with_token(TaskKind::Build, &config.name, cancel, |token| {
                self.execute(snapshot, plan, token)
            })
            .await
    }

    async fn plan(&self, config: &BuildConfiguration) -> Result<BuildPlan> {
        validate_configuration(config)?;
        let resolver = MergeOrderResolver::new(self.hooks.order_hooks().clone());
        let order = resolver.resolve(config)?;
        let hooks = self.hooks.resolve(config)?;

        let mut infos = BTreeMap::new();
        for source in &order {
            let info = timed(
                "source info",
                self.settings.timeout,
                self.stores.sources.source_info(source),
            )
            .await?
            .ok_or_else(|| {
                HubError::config(format!(
                    "build configuration '{}' requires missing source '{}'",
                    config.name, source
                ))
            })?;
            infos.insert(source.clone(), info);
        }
        Ok(BuildPlan {
            order,
            hooks,
            infos,
        })
    }

    async fn unique_name(&self, config: &BuildConfiguration) -> Result<(String, String)> {
        let version = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let base = format!("{}_{}", config.name, version);
        let mut name = base.clone();
        let mut n = 1;
        while self.stores.meta.get_build(&name).await?.is_some() {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        Ok((name, version))
    }

    async fn execute(
        &self,
        config: BuildConfiguration,
        plan: BuildPlan,
        cancel: CancelToken,
    ) -> Result<BuildRecord> {
        let (name, version) = self.unique_name(&config).await?;
        let mut record = BuildRecord::pending(name.clone(), &config, version);
        record.merge_order = plan.order.clone();
        self.stores.meta.save_build(&record).await?;
        info!(build = %name, config = %config.name, order = ?plan.order, "build started");

        match self.run_stages(&config, &plan, &mut record, &cancel).await {
            Ok(()) => {
                record.succeed()?;
                self.stores.meta.save_build(&record).await?;
                info!(
                    build = %name,
                    documents = record.total_documents,
                    duration_ms = record.duration_ms.unwrap_or(0),
                    "build succeeded"
                );
                Ok(record)
            }
            Err(e) => {
                record.fail(&e);
                if e.is_cancelled() {
                    warn!(build = %name, "build cancelled");
                } else {
                    error!(build = %name, error = %e, "build failed");
                }
                if let Err(save_err) = self.stores.meta.save_build(&record).await {
                    error!(build = %name, error = %save_err, "failed to record build failure");
                }
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        config: &BuildConfiguration,
        plan: &BuildPlan,
        record: &mut BuildRecord,
        cancel: &CancelToken,
    ) -> Result<()> {
        timed(
            "create collection",
            self.settings.timeout,
            self.stores.targets.create_collection(&record.name),
        )
        .await?;

        for source in &plan.order {
            cancel.check()?;
            let stage = if !config.root_sources.is_empty() && config.can_originate(source) {
                BuildStage::MergingRoot
            } else {
                BuildStage::MergingOthers
            };
            record.advance(stage)?;
            let stats = self
                .merge_source(config, plan, &record.name, source, cancel)
                .await?;
            info!(
                build = %record.name,
                source = %source,
                read = stats.documents,
                merged = stats.merged,
                skipped = stats.skipped,
                "source merged"
            );
            record.sources.insert(source.clone(), stats);
            self.stores.meta.save_build(record).await?;
        }

        cancel.check()?;
        record.advance(BuildStage::PostProcessing)?;
        self.stores.meta.save_build(record).await?;
        self.post_process(config, plan, record, cancel).await
    }

    async fn merge_source(
        &self,
        config: &BuildConfiguration,
        plan: &BuildPlan,
        collection: &str,
        source: &str,
        cancel: &CancelToken,
    ) -> Result<SourceStats> {
        let info = plan.infos.get(source);
        let mut stats = SourceStats {
            version: info.and_then(|i| i.version.clone()),
            updated_at: info.and_then(|i| i.updated_at),
            ..Default::default()
        };
        let total = timed(
            "source count",
            self.settings.timeout,
            self.stores.sources.source_count(source),
        )
        .await?;
        let originates = config.can_originate(source);

        let mut after: Option<String> = None;
        loop {
            cancel.check()?;
            let page = timed(
                "read source page",
                self.settings.timeout,
                self.stores
                    .sources
                    .source_documents(source, after.as_deref(), self.settings.build_batch),
            )
            .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            stats.documents += page.len() as u64;

            let incoming: Vec<Document> = match &plan.hooks.builder {
                Some(ext) => page
                    .into_iter()
                    .filter_map(|d| ext.transform(source, d))
                    .collect(),
                None => page,
            };
            let ids: Vec<String> = incoming.iter().map(|d| d.id.clone()).collect();
            let existing = timed(
                "read target documents",
                self.settings.timeout,
                self.stores.targets.get_documents(collection, &ids),
            )
            .await?;
            let mut existing: BTreeMap<String, Document> =
                existing.into_iter().map(|d| (d.id.clone(), d)).collect();

            let mut changed = Vec::with_capacity(incoming.len());
            for doc in incoming {
                match existing.remove(&doc.id) {
                    Some(mut target) => {
                        merge_documents(&mut target, doc, config.conflict_policy, source)?;
                        changed.push(target);
                        stats.merged += 1;
                    }
                    None if originates => {
                        changed.push(doc);
                        stats.merged += 1;
                    }
                    None => stats.skipped += 1,
                }
            }
            if !changed.is_empty() {
                timed(
                    "write target documents",
                    self.settings.timeout,
                    self.stores.targets.upsert_documents(collection, &changed),
                )
                .await?;
            }
            self.progress.report(ProgressEvent::Merging {
                build: collection.to_string(),
                source: source.to_string(),
                n: stats.documents,
                total,
            });
        }
        Ok(stats)
    }

    async fn post_process(
        &self,
        config: &BuildConfiguration,
        plan: &BuildPlan,
        record: &mut BuildRecord,
        cancel: &CancelToken,
    ) -> Result<()> {
        let collection = record.name.clone();
        if let Some(ext) = &plan.hooks.builder {
            cancel.check()?;
            timed(
                "builder finalize",
                self.settings.timeout,
                ext.finalize(self.stores.targets.as_ref(), &collection, cancel),
            )
            .await?;
        }
        if let Some(hook) = &plan.hooks.post_merge {
            cancel.check()?;
            let rewritten = timed(
                "post-merge hook",
                self.settings.timeout,
                hook.run(
                    self.stores.targets.as_ref(),
                    &collection,
                    self.settings.build_batch,
                    cancel,
                ),
            )
            .await?;
            info!(build = %collection, rewritten, "post-merge hook finished");
        }

        let mut inspector = MappingInspector::new();
        let mut after: Option<String> = None;
        loop {
            cancel.check()?;
            let page = timed(
                "scan target collection",
                self.settings.timeout,
                self.stores.targets.list_documents(
                    &collection,
                    after.as_deref(),
                    self.settings.build_batch,
                ),
            )
            .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            if config.mapping.is_none() {
                for doc in &page {
                    inspector.inspect(doc);
                }
            }
        }

        record.mapping = Some(match &config.mapping {
            Some(mapping) => mapping.clone(),
            None => inspector.finish(),
        });
        record.total_documents = timed(
            "count target collection",
            self.settings.timeout,
            self.stores.targets.count_documents(&collection),
        )
        .await?;
        Ok(())
    }

    pub async fn list_builds(&self, config: Option<&str>) -> Result<Vec<BuildRecord>> {
        Ok(self.stores.meta.list_builds(config).await?)
    }

    pub async fn get_build(&self, name: &str) -> Result<BuildRecord> {
        self.stores
            .meta
            .get_build(name)
            .await?
            .ok_or_else(|| HubError::not_found("build", name))
    }

    /// Most recent usable build of a configuration.
    pub async fn latest_successful(&self, config: &str) -> Result<Option<BuildRecord>> {
        let builds = self.stores.meta.list_builds(Some(config)).await?;
        Ok(builds.into_iter().rev().find(|b| b.is_usable()))
    }

    /// Drop a build's target collection but keep its record, marked archived.
    pub async fn archive_build(&self, name: &str) -> Result<BuildRecord> {
        let mut record = self.get_build(name).await?;
        if record.archived {
            return Ok(record);
        }
        if !record.stage.is_terminal() && self.scheduler.is_locked(&record.config_name) {
            return Err(HubError::Busy(record.config_name.clone()));
        }
        timed(
            "drop collection",
            self.settings.timeout,
            self.stores.targets.drop_collection(name),
        )
        .await?;
        record.archived = true;
        self.stores.meta.save_build(&record).await?;
        info!(build = %name, "build archived");
        Ok(record)
    }

    /// Compare current source versions with the latest successful build.
    pub async fn whatsnew(&self, config: &BuildConfiguration) -> Result<WhatsNew> {
        let latest = self.latest_successful(&config.name).await?;
        let mut sources = Vec::with_capacity(config.sources.len());
        for source in &config.sources {
            let current = self.stores.sources.source_info(source).await?;
            let built_version = latest
                .as_ref()
                .and_then(|b| b.sources.get(source))
                .and_then(|s| s.version.clone());
            let current_version = current.as_ref().and_then(|c| c.version.clone());
            let changed = match &latest {
                None => true,
                Some(b) => match b.sources.get(source) {
                    None => true,
                    Some(stats) => {
                        stats.version != current_version
                            || current.as_ref().map(|c| c.updated_at) != Some(stats.updated_at)
                    }
                },
            };
            sources.push(SourceChange {
                source: source.clone(),
                built_version,
                current_version,
                current_documents: current.map(|c| c.documents).unwrap_or(0),
                changed,
            });
        }
        Ok(WhatsNew {
            config: config.name.clone(),
            latest_build: latest.map(|b| b.name),
            needs_rebuild: sources.iter().any(|s| s.changed),
            sources,
        })
    }
}
