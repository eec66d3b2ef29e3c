//! Error taxonomy shared by every stage of the build/diff/release pipeline.
//!
//! Store implementations return `anyhow::Result` and are converted into
//! [`HubError::Backend`] by `?`. Everything else is raised explicitly by the
//! pipeline with enough context to locate the offending document.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Result alias used by the pipeline.
pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Malformed or inconsistent build configuration. Raised before any
    /// work starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two values could not be reconciled by the configured conflict policy.
    #[error("merge conflict in source '{source_name}' for document '{id}' at '{path}': {existing} vs {incoming}")]
    MergeConflict {
        source_name: String,
        id: String,
        path: String,
        existing: Box<Value>,
        incoming: Box<Value>,
    },

    /// The new mapping removes or retypes fields of the old one.
    #[error("schema incompatibility: removed [{}], changed [{}]", removed.join(", "), changed.join(", "))]
    SchemaIncompatibility {
        removed: Vec<String>,
        changed: Vec<String>,
    },

    /// Transient failure reported by a storage backend.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// Cooperative cancellation observed between batches.
    #[error("cancelled")]
    Cancelled,

    #[error("build configuration '{0}' already has a build in progress")]
    Busy(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl HubError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Stable machine-readable tag for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::SchemaIncompatibility { .. } => "schema_incompatibility",
            Self::Backend(_) => "backend",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Busy(_) => "busy",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
        }
    }

    /// Whether retrying the same idempotent operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Structured view handed to the CLI and persisted on failed records.
    pub fn report(&self) -> ErrorReport {
        let mut context = BTreeMap::new();
        match self {
            Self::MergeConflict {
                source_name,
                id,
                path,
                existing,
                incoming,
            } => {
                context.insert("source".to_string(), Value::from(source_name.as_str()));
                context.insert("id".to_string(), Value::from(id.as_str()));
                context.insert("path".to_string(), Value::from(path.as_str()));
                context.insert("existing".to_string(), (**existing).clone());
                context.insert("incoming".to_string(), (**incoming).clone());
            }
            Self::SchemaIncompatibility { removed, changed } => {
                context.insert("removed".to_string(), Value::from(removed.clone()));
                context.insert("changed".to_string(), Value::from(changed.clone()));
            }
            Self::Timeout { operation, secs } => {
                context.insert("operation".to_string(), Value::from(operation.as_str()));
                context.insert("secs".to_string(), Value::from(*secs));
            }
            Self::Busy(config) => {
                context.insert("config".to_string(), Value::from(config.as_str()));
            }
            Self::NotFound { kind, name } => {
                context.insert("kind".to_string(), Value::from(*kind));
                context.insert("name".to_string(), Value::from(name.as_str()));
            }
            _ => {}
        }
        ErrorReport {
            kind: self.kind().to_string(),
            message: self.to_string(),
            context,
        }
    }
}

/// Serializable error description: kind, message and locating context.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}
