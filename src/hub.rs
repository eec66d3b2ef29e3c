//! Wiring: store handles, pipeline settings and the [`Hub`] facade.
//!
//! A [`Hub`] owns one set of stores, one [`TaskScheduler`] and one
//! [`HookRegistry`], and hands out pipeline components that share them.
//! Opening a hub from a [`Config`] uses SQLite for sources, targets, index
//! and metadata, and the filesystem for patch files; [`Hub::in_memory`]
//! runs the same pipeline against [`InMemoryStore`].

use anyhow::Result as AnyResult;
use std::sync::Arc;
use std::time::Duration;

use biohub_core::store::memory::InMemoryStore;
use biohub_core::store::{DocumentStore, MetadataStore, PatchStore, SearchIndex, SourceCollection};

use crate::builder::Builder;
use crate::config::Config;
use crate::db;
use crate::differ::Differ;
use crate::hooks::HookRegistry;
use crate::migrate;
use crate::patch_store::FsPatchStore;
use crate::progress::{NoProgress, ProgressReporter};
use crate::publisher::Publisher;
use crate::scheduler::TaskScheduler;
use crate::sqlite_store::SqliteStore;
use crate::syncer::Syncer;

/// The collaborators one pipeline runs against.
#[derive(Clone)]
pub struct Stores {
    pub sources: Arc<dyn SourceCollection>,
    pub targets: Arc<dyn DocumentStore>,
    pub index: Arc<dyn SearchIndex>,
    pub meta: Arc<dyn MetadataStore>,
    pub patches: Arc<dyn PatchStore>,
}

impl Stores {
    /// Every role served by one in-memory store.
    pub fn memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            sources: store.clone(),
            targets: store.clone(),
            index: store.clone(),
            meta: store.clone(),
            patches: store,
        }
    }

    /// SQLite for documents and metadata, files for patches.
    pub fn sqlite(store: Arc<SqliteStore>, patches: FsPatchStore) -> Self {
        Self {
            sources: store.clone(),
            targets: store.clone(),
            index: store.clone(),
            meta: store,
            patches: Arc::new(patches),
        }
    }
}

/// Batch sizes, timeouts and retry policy shared by the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Documents read per source page and per scan page.
    pub build_batch: usize,
    /// Documents per patch file.
    pub diff_batch: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            build_batch: 1000,
            diff_batch: 10_000,
            timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            build_batch: config.build.batch_size,
            diff_batch: config.diff.batch_size,
            timeout: config.storage_timeout(),
            max_retries: config.sync.max_retries,
            retry_backoff: Duration::from_millis(config.sync.retry_backoff_ms),
        }
    }
}

pub struct Hub {
    stores: Stores,
    hooks: HookRegistry,
    scheduler: TaskScheduler,
    settings: PipelineSettings,
    progress: Arc<dyn ProgressReporter>,
    sqlite: Option<Arc<SqliteStore>>,
}

impl Hub {
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
            sqlite: None,
        }
    }

    /// Hub over a fresh in-memory store with the built-in hooks.
    pub fn in_memory(settings: PipelineSettings) -> (Self, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let hub = Self::new(
            Stores::memory(store.clone()),
            HookRegistry::with_builtins(),
            TaskScheduler::new(4),
            settings,
        );
        (hub, store)
    }

    /// Open the SQLite database and patch directory named by `config`,
    /// applying migrations first.
    pub async fn open(config: &Config) -> AnyResult<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let sqlite = Arc::new(SqliteStore::new(pool));
        let patches = FsPatchStore::new(&config.storage.patch_dir);
        let mut hub = Self::new(
            Stores::sqlite(sqlite.clone(), patches),
            HookRegistry::with_builtins(),
            TaskScheduler::new(config.scheduler.max_workers),
            PipelineSettings::from_config(config),
        );
        hub.sqlite = Some(sqlite);
        Ok(hub)
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// The SQLite backend, when the hub was opened from a config file.
    pub fn sqlite(&self) -> Option<&Arc<SqliteStore>> {
        self.sqlite.as_ref()
    }

    pub fn builder(&self) -> Builder {
        Builder::new(
            self.stores.clone(),
            self.hooks.clone(),
            self.scheduler.clone(),
            self.settings.clone(),
        )
        .with_progress(self.progress.clone())
    }

    pub fn differ(&self) -> Differ {
        Differ::new(
            self.stores.clone(),
            self.scheduler.clone(),
            self.settings.clone(),
        )
        .with_progress(self.progress.clone())
    }

    pub fn syncer(&self) -> Syncer {
        Syncer::new(
            self.stores.clone(),
            self.scheduler.clone(),
            self.settings.clone(),
        )
        .with_progress(self.progress.clone())
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.stores.clone(),
            self.differ(),
            self.syncer(),
            self.scheduler.clone(),
            self.settings.clone(),
        )
        .with_progress(self.progress.clone())
    }
}
