//! CLI command implementations.
//!
//! Each `run_*` function backs one `biohub` subcommand: it calls into the
//! pipeline through a [`Hub`] and prints either a human summary or, with
//! `--json`, the structured result on stdout.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

use biohub_core::models::{BuildRecord, DiffReport, Document, Release};

use crate::config::Config;
use crate::hub::Hub;
use crate::syncer::SyncTarget;

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn print_build(build: &BuildRecord) {
    println!("Build {}", build.name);
    println!("  config:     {}", build.config_name);
    println!("  status:     {:?} ({:?})", build.status, build.stage);
    println!("  documents:  {}", build.total_documents);
    println!("  order:      {}", build.merge_order.join(", "));
    if let Some(ms) = build.duration_ms {
        println!("  duration:   {} ms", ms);
    }
    for (source, stats) in &build.sources {
        println!(
            "  {:<20} read {:>8}  merged {:>8}  skipped {:>8}  version {}",
            source,
            stats.documents,
            stats.merged,
            stats.skipped,
            stats.version.as_deref().unwrap_or("-")
        );
    }
    if let Some(err) = &build.error {
        println!("  error:      {} ({})", err.message, err.kind);
    }
}

fn print_diff(report: &DiffReport) {
    println!("Diff {}", report.id);
    println!(
        "  added {}  deleted {}  updated {}  unchanged {}",
        report.stats.added, report.stats.deleted, report.stats.updated, report.stats.unchanged
    );
    println!(
        "  {} operations in {} patch file(s), {}",
        report.stats.operations,
        report.stats.patch_files,
        format_bytes(report.stats.total_bytes)
    );
    if !report.mapping_delta.added.is_empty() {
        println!("  new fields: {}", report.mapping_delta.added.join(", "));
    }
}

fn print_release(release: &Release) {
    println!(
        "Release {} ({:?}) {:?}",
        release.id, release.kind, release.stage
    );
    println!("  index:      {}", release.index);
    println!("  build:      {}", release.build);
    if let Some(prev) = &release.previous_build {
        println!("  previous:   {}", prev);
    }
    println!("  documents:  {}", release.documents_loaded);
    if let Some(err) = &release.error {
        println!("  error:      {} ({})", err.message, err.kind);
    }
}

pub fn run_configs(config: &Config, hub: &Hub, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "builds": config.builds,
            "hooks": hub.hooks().names(),
        }));
    }
    if config.builds.is_empty() {
        println!("No build configurations.");
        return Ok(());
    }
    println!(
        "{:<20} {:<12} {:<16} {}",
        "NAME", "DOC TYPE", "POLICY", "SOURCES"
    );
    println!("{}", "-".repeat(72));
    for build in &config.builds {
        let sources: Vec<String> = build
            .sources
            .iter()
            .map(|s| {
                if build.root_sources.contains(s) {
                    format!("{}*", s)
                } else {
                    s.clone()
                }
            })
            .collect();
        println!(
            "{:<20} {:<12} {:<16} {}",
            build.name,
            build.doc_type,
            format!("{:?}", build.conflict_policy),
            sources.join(", ")
        );
    }
    println!();
    println!("(* = root source)");
    Ok(())
}

pub async fn run_build(config: &Config, hub: &Hub, name: &str, json: bool) -> Result<()> {
    let Some(build_config) = config.build_config(name) else {
        bail!("Unknown build configuration: {}", name);
    };
    let record = hub.builder().build(build_config).await?;
    if json {
        print_json(&record)
    } else {
        print_build(&record);
        Ok(())
    }
}

pub async fn run_builds(hub: &Hub, config: Option<&str>, json: bool) -> Result<()> {
    let builds = hub.builder().list_builds(config).await?;
    if json {
        return print_json(&builds);
    }
    if builds.is_empty() {
        println!("No builds.");
        return Ok(());
    }
    println!(
        "{:<36} {:<10} {:>10}  {}",
        "BUILD", "STATUS", "DOCUMENTS", "STARTED"
    );
    println!("{}", "-".repeat(80));
    for b in &builds {
        let status = if b.archived {
            "archived".to_string()
        } else {
            format!("{:?}", b.status).to_lowercase()
        };
        println!(
            "{:<36} {:<10} {:>10}  {}",
            b.name,
            status,
            b.total_documents,
            b.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn run_archive(hub: &Hub, build: &str, json: bool) -> Result<()> {
    let record = hub.builder().archive_build(build).await?;
    if json {
        print_json(&record)
    } else {
        println!("Archived build {}.", record.name);
        Ok(())
    }
}

pub async fn run_whatsnew(config: &Config, hub: &Hub, name: &str, json: bool) -> Result<()> {
    let Some(build_config) = config.build_config(name) else {
        bail!("Unknown build configuration: {}", name);
    };
    let news = hub.builder().whatsnew(build_config).await?;
    if json {
        return print_json(&news);
    }
    println!(
        "Latest build: {}",
        news.latest_build.as_deref().unwrap_or("none")
    );
    for s in &news.sources {
        println!(
            "  {:<20} {:<12} -> {:<12} {}",
            s.source,
            s.built_version.as_deref().unwrap_or("-"),
            s.current_version.as_deref().unwrap_or("-"),
            if s.changed { "changed" } else { "up to date" }
        );
    }
    if news.needs_rebuild {
        println!("Rebuild needed.");
    } else {
        println!("Nothing new.");
    }
    Ok(())
}

pub async fn run_diff(hub: &Hub, old: &str, new: &str, json: bool) -> Result<()> {
    let report = hub.differ().diff(old, new).await?;
    if json {
        print_json(&report)
    } else {
        print_diff(&report);
        Ok(())
    }
}

pub async fn run_diffs(hub: &Hub, json: bool) -> Result<()> {
    let diffs = hub.differ().list_diffs().await?;
    if json {
        return print_json(&diffs);
    }
    if diffs.is_empty() {
        println!("No diffs.");
        return Ok(());
    }
    for d in &diffs {
        let targets: std::collections::BTreeSet<&String> =
            d.files.iter().flat_map(|f| f.synced.iter()).collect();
        println!(
            "{}  +{} -{} ~{}  {} file(s)  synced: {}",
            d.id,
            d.stats.added,
            d.stats.deleted,
            d.stats.updated,
            d.stats.patch_files,
            if targets.is_empty() {
                "-".to_string()
            } else {
                targets
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        );
    }
    Ok(())
}

pub async fn run_sync(
    hub: &Hub,
    diff_id: &str,
    target: &str,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let target: SyncTarget = target.parse()?;
    let result = hub.syncer().sync(diff_id, &target, dry_run).await?;
    if json {
        print_json(&result)?;
    } else {
        println!(
            "Sync {} -> {}{}",
            diff_id,
            target,
            if dry_run { " (dry run)" } else { "" }
        );
        println!(
            "  files: {} applied, {} skipped, {} failed of {}",
            result.files_applied, result.files_skipped, result.files_failed, result.files_total
        );
        println!(
            "  operations: {}  documents patched: {}",
            result.operations_applied, result.documents_patched
        );
        for file in result.files.iter().filter(|f| !f.errors.is_empty()) {
            for e in &file.errors {
                println!(
                    "  file {:05}: {:?} {} {}: {}",
                    file.seq, e.op, e.id, e.path, e.error.message
                );
            }
        }
    }
    if !result.is_success() {
        bail!("{} patch file(s) failed to apply", result.files_failed);
    }
    Ok(())
}

pub async fn run_reset_synced(hub: &Hub, diff_id: &str, target: &str, json: bool) -> Result<()> {
    let target: SyncTarget = target.parse()?;
    let cleared = hub
        .differ()
        .reset_synced(diff_id, &target.to_string())
        .await?;
    if json {
        print_json(&serde_json::json!({ "diff_id": diff_id, "target": target.to_string(), "cleared": cleared }))
    } else {
        println!("Cleared {} synced flag(s) for {}.", cleared, target);
        Ok(())
    }
}

pub async fn run_publish_full(hub: &Hub, build: &str, index: &str, json: bool) -> Result<()> {
    let release = hub.publisher().publish_full(build, index).await?;
    if json {
        print_json(&release)
    } else {
        print_release(&release);
        Ok(())
    }
}

pub async fn run_publish_diff(
    hub: &Hub,
    old: &str,
    new: &str,
    index: &str,
    json: bool,
) -> Result<()> {
    let release = hub.publisher().publish_diff(old, new, index).await?;
    if json {
        print_json(&release)
    } else {
        print_release(&release);
        Ok(())
    }
}

pub async fn run_releases(hub: &Hub, json: bool) -> Result<()> {
    let releases = hub.publisher().list_releases().await?;
    if json {
        return print_json(&releases);
    }
    if releases.is_empty() {
        println!("No releases.");
        return Ok(());
    }
    for r in &releases {
        println!(
            "{}  {:<4} {:<14} {} -> {}  {}",
            r.started_at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", r.kind).to_lowercase(),
            format!("{:?}", r.stage).to_lowercase(),
            r.build,
            r.index,
            r.id
        );
    }
    Ok(())
}

pub async fn run_note(
    hub: &Hub,
    old: &str,
    new: &str,
    note: Option<String>,
    json: bool,
) -> Result<()> {
    let mut release_note = hub.publisher().release_note(old, new).await?;
    if let Some(text) = note {
        release_note = release_note.with_note(text);
    }
    if json {
        print_json(&release_note)
    } else {
        print!("{}", release_note.render_text());
        Ok(())
    }
}

/// Fill a source collection from a JSON-lines file (one document per line).
pub async fn run_load_source(
    hub: &Hub,
    source: &str,
    file: &Path,
    version: Option<&str>,
    json: bool,
) -> Result<()> {
    let Some(store) = hub.sqlite() else {
        bail!("load-source requires the SQLite backend");
    };
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let mut lines = BufReader::new(handle).lines();
    let mut docs = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("Invalid JSON at {}:{}", file.display(), line_no))?;
        let doc = Document::from_value(value)
            .with_context(|| format!("Invalid document at {}:{}", file.display(), line_no))?;
        docs.push(doc);
    }
    let loaded = store.load_source(source, version, &docs).await?;
    if json {
        print_json(&serde_json::json!({ "source": source, "version": version, "documents": loaded }))
    } else {
        println!("Loaded {} document(s) into source '{}'.", loaded, source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
