//! Configuration parsing and validation.
//!
//! The hub is configured by a single TOML file (default
//! `./config/biohub.toml`):
//!
//! ```toml
//! [db]
//! path = "./data/biohub.sqlite"
//!
//! [storage]
//! patch_dir = "./data/patches"
//! timeout_secs = 300
//!
//! [build]
//! batch_size = 1000
//!
//! [diff]
//! batch_size = 10000
//!
//! [sync]
//! max_retries = 3
//! retry_backoff_ms = 500
//!
//! [scheduler]
//! max_workers = 4
//!
//! [[builds]]
//! name = "genes"
//! doc_type = "gene"
//! sources = ["annotations", "druglabels"]
//! root_sources = ["annotations"]
//! conflict_policy = "merge-as-list"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use biohub_core::models::BuildConfiguration;
use biohub_core::order::validate_configuration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub diff: DiffSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub builds: Vec<BuildConfiguration>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_patch_dir")]
    pub patch_dir: PathBuf,
    /// Upper bound for a single storage operation (bulk write, page read).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            patch_dir: default_patch_dir(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_patch_dir() -> PathBuf {
    PathBuf::from("./data/patches")
}
fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildSettings {
    /// Documents read per source page.
    #[serde(default = "default_build_batch")]
    pub batch_size: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            batch_size: default_build_batch(),
        }
    }
}

fn default_build_batch() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiffSettings {
    /// Documents per patch file.
    #[serde(default = "default_diff_batch")]
    pub batch_size: usize,
}

impl Default for DiffSettings {
    fn default() -> Self {
        Self {
            batch_size: default_diff_batch(),
        }
    }
}

fn default_diff_batch() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

impl Config {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.timeout_secs)
    }

    pub fn build_config(&self, name: &str) -> Option<&BuildConfiguration> {
        self.builds.iter().find(|b| b.name == name)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.storage.timeout_secs == 0 {
        bail!("storage.timeout_secs must be > 0");
    }
    if config.build.batch_size == 0 {
        bail!("build.batch_size must be > 0");
    }
    if config.diff.batch_size == 0 {
        bail!("diff.batch_size must be > 0");
    }
    if config.scheduler.max_workers == 0 {
        bail!("scheduler.max_workers must be > 0");
    }

    // Validate build configurations
    let mut names = BTreeSet::new();
    for build in &config.builds {
        if !names.insert(build.name.as_str()) {
            bail!("Duplicate build configuration name: '{}'", build.name);
        }
        validate_configuration(build)
            .with_context(|| format!("Invalid build configuration '{}'", build.name))?;
    }

    Ok(config)
}
