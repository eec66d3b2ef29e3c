//! Pipeline progress reporting.
//!
//! Builds, diffs and syncs report what they are doing so operators can see
//! how far a long run has come. Progress is emitted on **stderr** so stdout
//! remains parseable (`--json` results).

use std::io::Write;
use std::sync::Arc;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Merging one source into a build: `n` documents read so far.
    Merging {
        build: String,
        source: String,
        n: u64,
        total: u64,
    },
    /// Comparing two builds: `n` identifiers classified so far.
    Diffing { diff: String, n: u64 },
    /// Applying patch files to a target.
    Syncing {
        diff: String,
        target: String,
        files_done: u64,
        files_total: u64,
        documents: u64,
    },
    /// Bulk-loading a build into an index.
    Indexing { index: String, n: u64, total: u64 },
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "build genes_2024  merging annotations  1,234 / 5,000 documents".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Merging {
                build,
                source,
                n,
                total,
            } => format!(
                "build {}  merging {}  {} / {} documents\n",
                build,
                source,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Diffing { diff, n } => {
                format!("diff {}  compared {} documents\n", diff, format_number(*n))
            }
            ProgressEvent::Syncing {
                diff,
                target,
                files_done,
                files_total,
                documents,
            } => format!(
                "sync {} -> {}  {} / {} files  {} documents patched\n",
                diff,
                target,
                files_done,
                files_total,
                format_number(*documents)
            ),
            ProgressEvent::Indexing { index, n, total } => format!(
                "publish {}  indexed {} / {} documents\n",
                index,
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Merging {
                build,
                source,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "merging",
                "build": build,
                "source": source,
                "n": n,
                "total": total
            }),
            ProgressEvent::Diffing { diff, n } => serde_json::json!({
                "event": "progress",
                "phase": "diffing",
                "diff": diff,
                "n": n
            }),
            ProgressEvent::Syncing {
                diff,
                target,
                files_done,
                files_total,
                documents,
            } => serde_json::json!({
                "event": "progress",
                "phase": "syncing",
                "diff": diff,
                "target": target,
                "files_done": files_done,
                "files_total": files_total,
                "documents": documents
            }),
            ProgressEvent::Indexing { index, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "index": index,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
