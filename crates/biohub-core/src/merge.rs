//! Field-level document merge with tagged conflict policies.
//!
//! Each pair of values at the same path is first classified by
//! [`merge_step`] into a [`MergeStep`]; only `Duplicate` and `Conflict`
//! outcomes consult the [`ConflictPolicy`].
//!
//! | existing \ incoming | null | scalar | list | object |
//! |---------------------|------|--------|------|--------|
//! | null                | keep | take   | take | take   |
//! | scalar              | keep | dup    | dup  | conflict |
//! | list                | keep | dup    | dup  | conflict |
//! | object              | keep | conflict | conflict | recurse |
//!
//! Equal values are always `Merged` without touching the policy.
//!
//! Under `merge-as-list`, a duplicate becomes `existing items ++ incoming
//! items` where a scalar counts as a single item. Lists of objects are
//! appended as-is; no identifier-based dedup is attempted.

use serde_json::{Map, Value};

use crate::error::{HubError, Result};
use crate::fieldpath;
use crate::models::{ConflictPolicy, Document};

/// Classification of two values found at the same path.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeStep {
    /// Reconciled without consulting the policy.
    Merged(Value),
    /// Both sides are objects; merge key by key.
    Nested(Map<String, Value>, Map<String, Value>),
    /// Differing non-object values.
    Duplicate { existing: Value, incoming: Value },
    /// Object against non-object.
    Conflict { existing: Value, incoming: Value },
}

pub fn merge_step(existing: Value, incoming: Value) -> MergeStep {
    if existing == incoming {
        return MergeStep::Merged(existing);
    }
    match (existing, incoming) {
        (Value::Null, incoming) => MergeStep::Merged(incoming),
        (existing, Value::Null) => MergeStep::Merged(existing),
        (Value::Object(a), Value::Object(b)) => MergeStep::Nested(a, b),
        (existing @ Value::Object(_), incoming) | (existing, incoming @ Value::Object(_)) => {
            MergeStep::Conflict { existing, incoming }
        }
        (existing, incoming) => MergeStep::Duplicate { existing, incoming },
    }
}

/// Where a merge is happening, for error reporting.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub source: &'a str,
    pub id: &'a str,
    pub policy: ConflictPolicy,
}

impl MergeContext<'_> {
    fn conflict(&self, path: &str, existing: Value, incoming: Value) -> HubError {
        HubError::MergeConflict {
            source_name: self.source.to_string(),
            id: self.id.to_string(),
            path: path.to_string(),
            existing: Box::new(existing),
            incoming: Box::new(incoming),
        }
    }
}

fn into_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Merge `incoming` into `existing` at `path`, returning the merged value.
pub fn merge_values(
    ctx: &MergeContext<'_>,
    path: &str,
    existing: Value,
    incoming: Value,
) -> Result<Value> {
    match merge_step(existing, incoming) {
        MergeStep::Merged(value) => Ok(value),
        MergeStep::Nested(mut target, source) => {
            merge_maps(ctx, path, &mut target, source)?;
            Ok(Value::Object(target))
        }
        MergeStep::Duplicate { existing, incoming } => match ctx.policy {
            ConflictPolicy::Ignore => Ok(existing),
            ConflictPolicy::Error => Err(ctx.conflict(path, existing, incoming)),
            ConflictPolicy::MergeAsList => {
                let mut items = into_items(existing);
                items.extend(into_items(incoming));
                Ok(Value::Array(items))
            }
        },
        MergeStep::Conflict { existing, incoming } => match ctx.policy {
            ConflictPolicy::Ignore => Ok(existing),
            ConflictPolicy::Error | ConflictPolicy::MergeAsList => {
                Err(ctx.conflict(path, existing, incoming))
            }
        },
    }
}

/// Merge every key of `source` into `target`. Keys absent from `target` are
/// inserted as-is.
pub fn merge_maps(
    ctx: &MergeContext<'_>,
    path: &str,
    target: &mut Map<String, Value>,
    source: Map<String, Value>,
) -> Result<()> {
    for (key, incoming) in source {
        let child = fieldpath::child(path, &key);
        let merged = match target.remove(&key) {
            Some(existing) => merge_values(ctx, &child, existing, incoming)?,
            None => incoming,
        };
        target.insert(key, merged);
    }
    Ok(())
}

/// Merge `incoming` into `target`. Both documents must share an id.
///
/// On error `target` may be partially merged; the builder discards the
/// document together with the failed build.
pub fn merge_documents(
    target: &mut Document,
    incoming: Document,
    policy: ConflictPolicy,
    source: &str,
) -> Result<()> {
    if target.id != incoming.id {
        return Err(HubError::invalid_state(format!(
            "cannot merge document '{}' into '{}'",
            incoming.id, target.id
        )));
    }
    let ctx = MergeContext {
        source,
        id: &incoming.id,
        policy,
    };
    merge_maps(&ctx, "", &mut target.fields, incoming.fields)
}
