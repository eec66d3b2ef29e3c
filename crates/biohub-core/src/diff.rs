//! Structural per-document diff and patch application.
//!
//! [`diff_documents`] compares two versions of one document and emits the
//! field operations that turn the old version into the new one:
//!
//! - keys are visited in sorted order, so output is deterministic
//! - a value replaced at the same path is a single `replace`
//! - a key that disappears is a `remove`, a new key is an `add`
//! - nested objects recurse; lists of equal length recurse element-wise
//!   with numeric path segments, lists of different length are replaced
//!
//! Applying the same operations twice leaves the document unchanged the
//! second time, which is what the syncer relies on after a partial failure.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{HubError, Result};
use crate::fieldpath;
use crate::models::{Document, OpKind, PatchOperation};

/// Field operations turning `old` into `new`. Empty when equal.
pub fn diff_documents(old: &Document, new: &Document) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    diff_maps(&new.id, "", &old.fields, &new.fields, &mut ops);
    ops
}

fn diff_maps(
    id: &str,
    path: &str,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    ops: &mut Vec<PatchOperation>,
) {
    let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();
    for key in keys {
        let child = fieldpath::child(path, key);
        match (old.get(key.as_str()), new.get(key.as_str())) {
            (Some(_), None) => ops.push(PatchOperation::remove(id, child)),
            (None, Some(value)) => ops.push(PatchOperation::add(id, child, value.clone())),
            (Some(a), Some(b)) => diff_values(id, &child, a, b, ops),
            (None, None) => {}
        }
    }
}

fn diff_values(id: &str, path: &str, old: &Value, new: &Value, ops: &mut Vec<PatchOperation>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => diff_maps(id, path, a, b, ops),
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                let child = fieldpath::child(path, &i.to_string());
                diff_values(id, &child, x, y, ops);
            }
        }
        _ => ops.push(PatchOperation::replace(id, path.to_string(), new.clone())),
    }
}

fn missing(id: &str, segments: &[String], depth: usize) -> HubError {
    HubError::invalid_state(format!(
        "document '{}' has no container for '{}'",
        id,
        fieldpath::join(&segments[..=depth])
    ))
}

/// Set `value` at `segments[depth..]` below `node`, creating intermediate
/// objects where nothing (or `null`) is present.
fn set_at(id: &str, node: &mut Value, segments: &[String], depth: usize, value: Value) -> Result<()> {
    let seg = &segments[depth];
    let last = depth + 1 == segments.len();
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => {
            if last {
                map.insert(seg.clone(), value);
                return Ok(());
            }
            let child = map
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            set_at(id, child, segments, depth + 1, value)
        }
        Value::Array(items) => {
            let idx: usize = seg.parse().map_err(|_| missing(id, segments, depth))?;
            if last {
                if idx < items.len() {
                    items[idx] = value;
                } else if idx == items.len() {
                    items.push(value);
                } else {
                    return Err(missing(id, segments, depth));
                }
                return Ok(());
            }
            let child = items
                .get_mut(idx)
                .ok_or_else(|| missing(id, segments, depth))?;
            set_at(id, child, segments, depth + 1, value)
        }
        _ => Err(missing(id, segments, depth)),
    }
}

/// Remove the value at `segments[depth..]`. A missing path is a no-op.
fn remove_at(node: &mut Value, segments: &[String], depth: usize) {
    let seg = &segments[depth];
    let last = depth + 1 == segments.len();
    match node {
        Value::Object(map) => {
            if last {
                map.remove(seg.as_str());
            } else if let Some(child) = map.get_mut(seg.as_str()) {
                remove_at(child, segments, depth + 1);
            }
        }
        Value::Array(items) => {
            let Ok(idx) = seg.parse::<usize>() else {
                return;
            };
            if last {
                if idx < items.len() {
                    items.remove(idx);
                }
            } else if let Some(child) = items.get_mut(idx) {
                remove_at(child, segments, depth + 1);
            }
        }
        _ => {}
    }
}

/// Apply field-level operations to one document in order.
pub fn apply_field_ops(doc: &mut Document, ops: &[PatchOperation]) -> Result<()> {
    for op in ops {
        apply_field_op(doc, op)?;
    }
    Ok(())
}

pub fn apply_field_op(doc: &mut Document, op: &PatchOperation) -> Result<()> {
    let segments = fieldpath::split(&op.path);
    if segments.is_empty() {
        return Err(HubError::invalid_state(format!(
            "{:?} for '{}' has an empty field path",
            op.op, op.id
        )));
    }
    let mut root = Value::Object(std::mem::take(&mut doc.fields));
    let outcome = match op.op {
        OpKind::Add | OpKind::Replace => set_at(&doc.id, &mut root, &segments, 0, op.value.clone()),
        OpKind::Remove => {
            remove_at(&mut root, &segments, 0);
            Ok(())
        }
        OpKind::AddDocument | OpKind::DeleteDocument => Err(HubError::invalid_state(format!(
            "document-level operation {:?} for '{}' cannot be applied as a field patch",
            op.op, op.id
        ))),
    };
    if let Value::Object(fields) = root {
        doc.fields = fields;
    }
    outcome
}

/// Apply the operations of one document to its current state.
///
/// `add-document` upserts, `delete-document` deletes, field operations on a
/// missing document are an error. Returns the resulting document, `None`
/// when it was deleted.
pub fn apply_document_ops(
    current: Option<Document>,
    ops: &[PatchOperation],
) -> Result<Option<Document>> {
    let mut state = current;
    for op in ops {
        match op.op {
            OpKind::AddDocument => state = Some(Document::from_value(op.value.clone())?),
            OpKind::DeleteDocument => state = None,
            _ => match state.as_mut() {
                Some(doc) => apply_field_op(doc, op)?,
                None => {
                    return Err(HubError::invalid_state(format!(
                        "cannot apply {:?} at '{}' to missing document '{}'",
                        op.op, op.path, op.id
                    )))
                }
            },
        }
    }
    Ok(state)
}

/// Hex sha256 of arbitrary bytes, used for patch file checksums.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    #[test]
    fn test_scalar_change_is_single_replace() {
        let ops = diff_documents(&doc(json!({"_id": "X", "v": 1})), &doc(json!({"_id": "X", "v": 2})));
        assert_eq!(ops, vec![PatchOperation::replace("X", "v".into(), json!(2))]);
    }

    #[test]
    fn test_presence_changes_use_add_and_remove() {
        let ops = diff_documents(
            &doc(json!({"_id": "X", "a": 1, "b": {"c": 1}})),
            &doc(json!({"_id": "X", "b": {"c": 1, "d": true}, "e": "x"})),
        );
        assert_eq!(
            ops,
            vec![
                PatchOperation::remove("X", "a".into()),
                PatchOperation::add("X", "b.d".into(), json!(true)),
                PatchOperation::add("X", "e".into(), json!("x")),
            ]
        );
    }

    #[test]
    fn test_lists_diff_elementwise_or_replace() {
        let ops = diff_documents(
            &doc(json!({"_id": "X", "l": [1, {"k": "a"}], "m": [1]})),
            &doc(json!({"_id": "X", "l": [1, {"k": "b"}], "m": [1, 2]})),
        );
        assert_eq!(
            ops,
            vec![
                PatchOperation::replace("X", "l.1.k".into(), json!("b")),
                PatchOperation::replace("X", "m".into(), json!([1, 2])),
            ]
        );
    }

    #[test]
    fn test_key_order_is_ignored() {
        let a: Document = serde_json::from_str(r#"{"_id":"X","a":1,"b":{"x":1,"y":2}}"#).unwrap();
        let b: Document = serde_json::from_str(r#"{"b":{"y":2,"x":1},"a":1,"_id":"X"}"#).unwrap();
        assert!(diff_documents(&a, &b).is_empty());
    }

    #[test]
    fn test_apply_reproduces_new_document_and_is_idempotent() {
        let old = doc(json!({
            "_id": "X", "a": 1, "dots.key": {"n": 1}, "l": [{"k": 1}, 2], "gone": "x"
        }));
        let new = doc(json!({
            "_id": "X", "a": {"nested": true}, "dots.key": {"n": 2, "m": null},
            "l": [{"k": 3}, 2], "fresh": [1]
        }));
        let ops = diff_documents(&old, &new);
        let mut patched = old.clone();
        apply_field_ops(&mut patched, &ops).unwrap();
        assert_eq!(patched, new);
        apply_field_ops(&mut patched, &ops).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_empty_keys_roundtrip() {
        let old = doc(json!({"_id": "X", "": 1, "n": {"": "a", "k": 1}, "gone": {"": true}}));
        let new = doc(json!({"_id": "X", "": 2, "n": {"": "b"}, "fresh": {"": []}}));
        let ops = diff_documents(&old, &new);
        assert!(ops.iter().all(|op| !op.path.is_empty()));
        let mut patched = old.clone();
        apply_field_ops(&mut patched, &ops).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_document_level_ops() {
        let d = doc(json!({"_id": "N", "v": 1}));
        let out = apply_document_ops(None, &[PatchOperation::add_document(&d)]).unwrap();
        assert_eq!(out, Some(d.clone()));
        let out = apply_document_ops(Some(d.clone()), &[PatchOperation::add_document(&d)]).unwrap();
        assert_eq!(out, Some(d.clone()));
        let out = apply_document_ops(Some(d), &[PatchOperation::delete_document("N")]).unwrap();
        assert_eq!(out, None);
        let out = apply_document_ops(None, &[PatchOperation::delete_document("N")]).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn test_field_op_on_missing_document_fails() {
        let err = apply_document_ops(None, &[PatchOperation::replace("X", "v".into(), json!(2))])
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[test]
    fn test_remove_missing_path_is_noop() {
        let mut d = doc(json!({"_id": "X", "a": {"b": 1}}));
        apply_field_ops(&mut d, &[PatchOperation::remove("X", "a.zz.q".into())]).unwrap();
        apply_field_ops(&mut d, &[PatchOperation::remove("X", "nope".into())]).unwrap();
        assert_eq!(d.to_value(), json!({"_id": "X", "a": {"b": 1}}));
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
