//! Release notes: a pure comparison of two build records.
//!
//! [`generate`] never touches storage. The publisher attaches its output to
//! the release record; `render_text` gives the changelog shown by the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::mapping::{diff_mappings, Mapping};
use crate::models::{BuildRecord, DiffReport, DiffStats};

/// Document counts of one source in the old and new build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountDelta {
    pub old: u64,
    pub new: u64,
    pub delta: i64,
}

impl CountDelta {
    fn new(old: u64, new: u64) -> Self {
        Self {
            old,
            new,
            delta: new as i64 - old as i64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionChange {
    pub source: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseNote {
    pub old_build: String,
    pub new_build: String,
    pub old_version: String,
    pub new_version: String,
    pub old_date: DateTime<Utc>,
    pub new_date: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub total: CountDelta,
    pub sources: BTreeMap<String, CountDelta>,
    pub sources_added: Vec<String>,
    pub sources_removed: Vec<String>,
    pub version_changes: Vec<VersionChange>,
    pub fields_added: Vec<String>,
    pub fields_removed: Vec<String>,
    #[serde(default)]
    pub diff: Option<DiffStats>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ReleaseNote {
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Human-readable changelog.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Release note: {} -> {}",
            self.old_build, self.new_build
        );
        let _ = writeln!(
            out,
            "  version: {} ({}) -> {} ({})",
            self.old_version,
            self.old_date.format("%Y-%m-%d"),
            self.new_version,
            self.new_date.format("%Y-%m-%d")
        );
        let _ = writeln!(
            out,
            "  documents: {} -> {} ({:+})",
            self.total.old, self.total.new, self.total.delta
        );
        if let Some(note) = &self.note {
            let _ = writeln!(out, "  note: {}", note);
        }

        if !self.sources.is_empty() {
            let _ = writeln!(out, "\nSources:");
            for (name, count) in &self.sources {
                let _ = writeln!(
                    out,
                    "  {:<24} {:>10} -> {:>10} ({:+})",
                    name, count.old, count.new, count.delta
                );
            }
        }
        for name in &self.sources_added {
            let _ = writeln!(out, "  + source {}", name);
        }
        for name in &self.sources_removed {
            let _ = writeln!(out, "  - source {}", name);
        }
        if !self.version_changes.is_empty() {
            let _ = writeln!(out, "\nSource versions:");
            for change in &self.version_changes {
                let _ = writeln!(
                    out,
                    "  {}: {} -> {}",
                    change.source,
                    change.old.as_deref().unwrap_or("-"),
                    change.new.as_deref().unwrap_or("-")
                );
            }
        }
        if !self.fields_added.is_empty() || !self.fields_removed.is_empty() {
            let _ = writeln!(out, "\nFields:");
            for field in &self.fields_added {
                let _ = writeln!(out, "  + {}", field);
            }
            for field in &self.fields_removed {
                let _ = writeln!(out, "  - {}", field);
            }
        }
        if let Some(diff) = &self.diff {
            let _ = writeln!(out, "\nChanges:");
            let _ = writeln!(out, "  added:     {}", diff.added);
            let _ = writeln!(out, "  updated:   {}", diff.updated);
            let _ = writeln!(out, "  deleted:   {}", diff.deleted);
            let _ = writeln!(out, "  unchanged: {}", diff.unchanged);
            let _ = writeln!(
                out,
                "  patches:   {} files, {} operations",
                diff.patch_files, diff.operations
            );
        }
        out
    }
}

/// Compare two build records, optionally enriched with the diff between them.
pub fn generate(old: &BuildRecord, new: &BuildRecord, diff: Option<&DiffReport>) -> ReleaseNote {
    let mut sources = BTreeMap::new();
    let mut sources_added = Vec::new();
    let mut sources_removed = Vec::new();
    let mut version_changes = Vec::new();

    for (name, new_stats) in &new.sources {
        match old.sources.get(name) {
            Some(old_stats) => {
                sources.insert(
                    name.clone(),
                    CountDelta::new(old_stats.merged, new_stats.merged),
                );
                if old_stats.version != new_stats.version {
                    version_changes.push(VersionChange {
                        source: name.clone(),
                        old: old_stats.version.clone(),
                        new: new_stats.version.clone(),
                    });
                }
            }
            None => {
                sources.insert(name.clone(), CountDelta::new(0, new_stats.merged));
                sources_added.push(name.clone());
            }
        }
    }
    for (name, old_stats) in &old.sources {
        if !new.sources.contains_key(name) {
            sources.insert(name.clone(), CountDelta::new(old_stats.merged, 0));
            sources_removed.push(name.clone());
        }
    }

    let empty = Mapping::new();
    let delta = diff_mappings(
        old.mapping.as_ref().unwrap_or(&empty),
        new.mapping.as_ref().unwrap_or(&empty),
    );

    ReleaseNote {
        old_build: old.name.clone(),
        new_build: new.name.clone(),
        old_version: old.version.clone(),
        new_version: new.version.clone(),
        old_date: old.finished_at.unwrap_or(old.started_at),
        new_date: new.finished_at.unwrap_or(new.started_at),
        generated_at: Utc::now(),
        total: CountDelta::new(old.total_documents, new.total_documents),
        sources,
        sources_added,
        sources_removed,
        version_changes,
        fields_added: delta.added,
        fields_removed: delta.removed,
        diff: diff.map(|d| d.stats.clone()),
        note: None,
    }
}
