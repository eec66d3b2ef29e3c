//! Mapping inspection and compatibility checks.
//!
//! A [`Mapping`] records one [`FieldType`] per dot-notation path. It is
//! inferred from the merged documents of a build (unless the build
//! configuration provides one) and compared between generations before any
//! patch is written: additions are safe, removals and type changes are not.
//!
//! # Inference rules
//!
//! - Objects record `object` and recurse into their keys.
//! - Arrays contribute the types of their elements to the same path.
//! - `integer` and `float` at the same path widen to `float`.
//! - Any other mix records `mixed`.
//! - `null` contributes nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{HubError, Result};
use crate::fieldpath;
use crate::models::Document;

pub type Mapping = BTreeMap<String, FieldType>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Object,
    Mixed,
}

impl FieldType {
    fn of(value: &Value) -> Option<FieldType> {
        match value {
            Value::Null | Value::Array(_) => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::Number(n) if n.is_f64() => Some(Self::Float),
            Value::Number(_) => Some(Self::Integer),
            Value::String(_) => Some(Self::Text),
            Value::Object(_) => Some(Self::Object),
        }
    }

    fn widen(self, other: FieldType) -> FieldType {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Integer, Self::Float) | (Self::Float, Self::Integer) => Self::Float,
            _ => Self::Mixed,
        }
    }

    /// Whether an index built with `self` can accept documents typed `next`.
    pub fn accepts(self, next: FieldType) -> bool {
        self == next || (self == Self::Float && next == Self::Integer)
    }

    /// Whether replacing `self` by `next` keeps the index readable.
    pub fn can_upgrade_to(self, next: FieldType) -> bool {
        self == next || (self == Self::Integer && next == Self::Float)
    }
}

/// Incrementally builds a [`Mapping`] from documents.
#[derive(Debug, Default)]
pub struct MappingInspector {
    mapping: Mapping,
    documents: u64,
}

impl MappingInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inspect(&mut self, doc: &Document) {
        self.documents += 1;
        for (key, value) in &doc.fields {
            let path = fieldpath::child("", key);
            self.visit(&path, value);
        }
    }

    fn visit(&mut self, path: &str, value: &Value) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.visit(path, item);
                }
            }
            Value::Object(map) => {
                self.record(path, FieldType::Object);
                for (key, child) in map {
                    let child_path = fieldpath::child(path, key);
                    self.visit(&child_path, child);
                }
            }
            other => {
                if let Some(ty) = FieldType::of(other) {
                    self.record(path, ty);
                }
            }
        }
    }

    fn record(&mut self, path: &str, ty: FieldType) {
        self.mapping
            .entry(path.to_string())
            .and_modify(|existing| *existing = existing.widen(ty))
            .or_insert(ty);
    }

    pub fn documents(&self) -> u64 {
        self.documents
    }

    pub fn finish(self) -> Mapping {
        self.mapping
    }
}

/// Infer the mapping of a set of documents.
pub fn infer_mapping<'a>(docs: impl IntoIterator<Item = &'a Document>) -> Mapping {
    let mut inspector = MappingInspector::new();
    for doc in docs {
        inspector.inspect(doc);
    }
    inspector.finish()
}

/// Field-level difference between two mappings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// `path: old -> new` descriptions of incompatible retypes.
    pub changed: Vec<String>,
}

impl MappingDelta {
    pub fn is_compatible(&self) -> bool {
        self.removed.is_empty() && self.changed.is_empty()
    }

    /// Fail with [`HubError::SchemaIncompatibility`] unless compatible.
    pub fn ensure_compatible(&self) -> Result<()> {
        if self.is_compatible() {
            Ok(())
        } else {
            Err(HubError::SchemaIncompatibility {
                removed: self.removed.clone(),
                changed: self.changed.clone(),
            })
        }
    }
}

pub fn diff_mappings(old: &Mapping, new: &Mapping) -> MappingDelta {
    let mut delta = MappingDelta::default();
    for (path, old_ty) in old {
        match new.get(path) {
            None => delta.removed.push(path.clone()),
            Some(new_ty) if !old_ty.can_upgrade_to(*new_ty) => {
                delta
                    .changed
                    .push(format!("{}: {:?} -> {:?}", path, old_ty, new_ty).to_lowercase());
            }
            Some(_) => {}
        }
    }
    for path in new.keys() {
        if !old.contains_key(path) {
            delta.added.push(path.clone());
        }
    }
    delta
}

/// Structural sanity check: every proper prefix of a mapped path that is
/// itself mapped must be an `object`.
pub fn validate_mapping(mapping: &Mapping) -> Result<()> {
    for path in mapping.keys() {
        let segments = fieldpath::split(path);
        for end in 1..segments.len() {
            let prefix = fieldpath::join(&segments[..end]);
            if let Some(ty) = mapping.get(&prefix) {
                if *ty != FieldType::Object && *ty != FieldType::Mixed {
                    return Err(HubError::SchemaIncompatibility {
                        removed: Vec::new(),
                        changed: vec![format!(
                            "{} is {:?} but has child {}",
                            prefix, ty, path
                        )
                        .to_lowercase()],
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    #[test]
    fn test_infer_nested_and_lists() {
        let docs = vec![
            doc(json!({"_id": "1", "gene": "ABL1", "pos": {"start": 10, "chr": "9"}})),
            doc(json!({"_id": "2", "aliases": ["a", "b"], "pos": {"start": 1.5}})),
        ];
        let mapping = infer_mapping(&docs);
        assert_eq!(mapping["gene"], FieldType::Text);
        assert_eq!(mapping["pos"], FieldType::Object);
        assert_eq!(mapping["pos.start"], FieldType::Float);
        assert_eq!(mapping["pos.chr"], FieldType::Text);
        assert_eq!(mapping["aliases"], FieldType::Text);
        assert!(!mapping.contains_key("_id"));
    }

    #[test]
    fn test_mixed_types_and_nulls() {
        let docs = vec![
            doc(json!({"_id": "1", "v": "x", "n": null})),
            doc(json!({"_id": "2", "v": true})),
        ];
        let mapping = infer_mapping(&docs);
        assert_eq!(mapping["v"], FieldType::Mixed);
        assert!(!mapping.contains_key("n"));
    }

    #[test]
    fn test_diff_mappings_removal_is_incompatible() {
        let old: Mapping = [
            ("notes".to_string(), FieldType::Text),
            ("v".to_string(), FieldType::Integer),
        ]
        .into();
        let new: Mapping = [("v".to_string(), FieldType::Integer)].into();
        let delta = diff_mappings(&old, &new);
        assert_eq!(delta.removed, vec!["notes"]);
        let err = delta.ensure_compatible().unwrap_err();
        assert_eq!(err.kind(), "schema_incompatibility");
    }

    #[test]
    fn test_diff_mappings_widening_and_additions_are_compatible() {
        let old: Mapping = [("v".to_string(), FieldType::Integer)].into();
        let new: Mapping = [
            ("v".to_string(), FieldType::Float),
            ("label".to_string(), FieldType::Text),
        ]
        .into();
        let delta = diff_mappings(&old, &new);
        assert!(delta.is_compatible());
        assert_eq!(delta.added, vec!["label"]);
    }

    #[test]
    fn test_diff_mappings_retype_is_incompatible() {
        let old: Mapping = [("v".to_string(), FieldType::Text)].into();
        let new: Mapping = [("v".to_string(), FieldType::Integer)].into();
        let delta = diff_mappings(&old, &new);
        assert_eq!(delta.changed, vec!["v: text -> integer"]);
        assert!(!delta.is_compatible());
    }

    #[test]
    fn test_validate_mapping_rejects_scalar_parent() {
        let ok: Mapping = [
            ("pos".to_string(), FieldType::Object),
            ("pos.start".to_string(), FieldType::Integer),
        ]
        .into();
        assert!(validate_mapping(&ok).is_ok());
        let bad: Mapping = [
            ("pos".to_string(), FieldType::Text),
            ("pos.start".to_string(), FieldType::Integer),
        ]
        .into();
        assert!(validate_mapping(&bad).is_err());
    }
}
