//! # biohub CLI (`biohub`)
//!
//! Drives the build → diff → sync → publish pipeline against the SQLite hub
//! database and patch directory named in the configuration file.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `biohub init` | Create the hub database and run schema migrations |
//! | `biohub configs` | List build configurations and registered hooks |
//! | `biohub build <config>` | Merge the configuration's sources into a new build |
//! | `biohub builds` | List builds |
//! | `biohub archive <build>` | Drop a build's collection, keep its record |
//! | `biohub whatsnew <config>` | Source versions changed since the last build |
//! | `biohub diff <old> <new>` | Compute patch files between two builds |
//! | `biohub diffs` | List diffs and where they were synced |
//! | `biohub sync <diff> <target>` | Apply a diff to `collection:<name>` or `index:<name>` |
//! | `biohub reset-synced <diff> <target>` | Clear synced flags of a target |
//! | `biohub publish full <build> <index>` | Load a build into a fresh index |
//! | `biohub publish diff <old> <new> <index>` | Move an index from `old` to `new` |
//! | `biohub releases` | List releases |
//! | `biohub note <old> <new>` | Print the release note between two builds |
//! | `biohub load-source <source> <file>` | Fill a source collection from JSON lines |
//!
//! ## Examples
//!
//! ```bash
//! biohub init --config ./config/biohub.toml
//! biohub load-source annotations ./annotations.jsonl --version 2024-06
//! biohub build genes
//! biohub diff genes_20240601000000000 genes_20240701000000000
//! biohub publish diff genes_20240601000000000 genes_20240701000000000 genes_live
//! ```

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use biohub::hub::Hub;
use biohub::progress::ProgressMode;
use biohub::{commands, config, migrate};
use biohub_core::HubError;

/// biohub: merge versioned data sources into builds and release them as
/// incremental index updates.
#[derive(Parser)]
#[command(
    name = "biohub",
    about = "biohub: build, diff and release merged document collections",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long = "config", id = "config_path", value_name = "CONFIG", global = true, default_value = "./config/biohub.toml")]
    config: PathBuf,

    /// Print structured JSON results on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the hub database schema. Idempotent.
    Init,

    /// List build configurations and the registered hooks.
    Configs,

    /// Run a build of a configuration.
    Build {
        /// Build configuration name.
        config: String,
    },

    /// List builds, oldest first.
    Builds {
        /// Only builds of this configuration.
        #[arg(long = "of")]
        of: Option<String>,
    },

    /// Drop a build's target collection, keeping its metadata.
    Archive { build: String },

    /// Compare current source versions with the latest successful build.
    Whatsnew { config: String },

    /// Compute (or reuse) the diff between two builds.
    Diff { old: String, new: String },

    /// List diffs.
    Diffs,

    /// Apply a diff's patch files to a target.
    Sync {
        diff_id: String,

        /// `collection:<name>` or `index:<name>`.
        target: String,

        /// Count operations without touching the target.
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear the synced flags a target holds on a diff.
    ResetSynced { diff_id: String, target: String },

    /// Publish a build to an index.
    Publish {
        #[command(subcommand)]
        action: PublishAction,
    },

    /// List releases.
    Releases,

    /// Print the release note between two builds.
    Note {
        old: String,
        new: String,

        /// Free-text note appended to the generated changes.
        #[arg(long)]
        message: Option<String>,
    },

    /// Load a JSON-lines file into a source collection (development helper).
    LoadSource {
        source: String,
        file: PathBuf,

        /// Source version to record.
        #[arg(long)]
        version: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum PublishAction {
    /// Bulk-load a build into a fresh index.
    Full { build: String, index: String },

    /// Apply the diff between two builds to an index holding `old`.
    Diff {
        old: String,
        new: String,
        index: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let json = cli.json;

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<HubError>() {
            Some(hub_err) if json => {
                let report = serde_json::json!({ "error": hub_err.report() });
                eprintln!("{}", report);
            }
            _ => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "biohub", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let progress = if cli.json {
        ProgressMode::Json
    } else {
        ProgressMode::default_for_tty()
    };
    let hub = Hub::open(&cfg).await?.with_progress(progress.reporter());

    let scheduler = hub.scheduler().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = scheduler.cancel_all();
            warn!(tasks = cancelled, "interrupt received, cancelling running tasks");
        }
    });

    let json = cli.json;
    match cli.command {
        Commands::Init | Commands::Completions { .. } => {}
        Commands::Configs => commands::run_configs(&cfg, &hub, json)?,
        Commands::Build { config } => commands::run_build(&cfg, &hub, &config, json).await?,
        Commands::Builds { of } => commands::run_builds(&hub, of.as_deref(), json).await?,
        Commands::Archive { build } => commands::run_archive(&hub, &build, json).await?,
        Commands::Whatsnew { config } => {
            commands::run_whatsnew(&cfg, &hub, &config, json).await?
        }
        Commands::Diff { old, new } => commands::run_diff(&hub, &old, &new, json).await?,
        Commands::Diffs => commands::run_diffs(&hub, json).await?,
        Commands::Sync {
            diff_id,
            target,
            dry_run,
        } => commands::run_sync(&hub, &diff_id, &target, dry_run, json).await?,
        Commands::ResetSynced { diff_id, target } => {
            commands::run_reset_synced(&hub, &diff_id, &target, json).await?
        }
        Commands::Publish { action } => match action {
            PublishAction::Full { build, index } => {
                commands::run_publish_full(&hub, &build, &index, json).await?
            }
            PublishAction::Diff { old, new, index } => {
                commands::run_publish_diff(&hub, &old, &new, &index, json).await?
            }
        },
        Commands::Releases => commands::run_releases(&hub, json).await?,
        Commands::Note { old, new, message } => {
            commands::run_note(&hub, &old, &new, message, json).await?
        }
        Commands::LoadSource {
            source,
            file,
            version,
        } => commands::run_load_source(&hub, &source, &file, version.as_deref(), json).await?,
    }

    Ok(())
}
