//! Change records and JSON patches.
//!
//! A [`ChangeRecord`] is the structured description of exactly one applied
//! mutation. The same record feeds local subscribers and, unmodified, the
//! replication broadcast; its serialized form uses the shortened wire keys
//! (`a`/`c`/`r`/`p`).

use crate::error::{Result, TreeError};
use crate::node::NodeEntry;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The verb that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Add,
    Copy,
    Move,
    Remove,
    Write,
    Patch,
}

/// One applied mutation.
///
/// `tx` is the per-tree monotonic counter, assigned immediately before the
/// record is published so all listeners observe a consistent ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub op: ChangeOp,
    #[serde(rename = "targetId")]
    pub target_id: NodeId,
    pub tx: u64,
    /// Every node created by this mutation (add, copy, created intermediate
    /// directories).
    #[serde(rename = "a", skip_serializing_if = "Option::is_none")]
    pub added: Option<Vec<NodeEntry>>,
    /// Entries whose metadata changed in place (move, write, patch).
    #[serde(rename = "c", skip_serializing_if = "Option::is_none")]
    pub changed: Option<Vec<NodeEntry>>,
    /// Removed ids, each descendant preceding its parent.
    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    pub removed: Option<Vec<NodeId>>,
    /// Present only for patch mutations.
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
}

impl ChangeRecord {
    pub(crate) fn new(op: ChangeOp, target_id: NodeId) -> ChangeRecord {
        ChangeRecord {
            op,
            target_id,
            tx: 0,
            added: None,
            changed: None,
            removed: None,
            patch: None,
        }
    }
}

/// A single patch step over a file payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchVerb,
    /// JSON-pointer style path into the payload (`/a/b/0`).
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchVerb {
    Add,
    Remove,
    Replace,
}

/// An ordered patch plus the pre-image ctime it was computed against.
///
/// The ctime is the sole conflict-detection token: a receiver whose current
/// payload carries a different ctime must not apply the ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
    /// Inverse operations, when the producer computed them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undo: Option<Vec<PatchOp>>,
    pub ctime: i64,
}

impl Patch {
    pub fn new(ops: Vec<PatchOp>, ctime: i64) -> Patch {
        Patch {
            ops,
            undo: None,
            ctime,
        }
    }

    /// Apply all ops to `value` in order, returning the patched payload and
    /// the computed inverse list.
    pub fn apply(&self, value: &Value) -> Result<(Value, Vec<PatchOp>)> {
        let mut out = value.clone();
        let mut undo = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let inverse = apply_one(&mut out, op)?;
            undo.push(inverse);
        }
        // Inverses run in reverse order.
        undo.reverse();
        Ok((out, undo))
    }
}

/// Apply one op in place and return its inverse.
fn apply_one(target: &mut Value, op: &PatchOp) -> Result<PatchOp> {
    let (parent_path, key) = split_pointer(&op.path)?;
    let parent = resolve_pointer_mut(target, parent_path)
        .ok_or_else(|| TreeError::NotFound(format!("patch path {}", op.path)))?;

    match op.op {
        PatchVerb::Add => {
            let value = op
                .value
                .clone()
                .ok_or_else(|| TreeError::Protocol(format!("add op without value at {}", op.path)))?;
            match parent {
                Value::Object(map) => {
                    if map.contains_key(key) {
                        return Err(TreeError::AlreadyExists(format!("patch path {}", op.path)));
                    }
                    map.insert(key.to_string(), value);
                }
                Value::Array(items) => {
                    let idx = array_index(key, items.len() + 1, &op.path)?;
                    items.insert(idx, value);
                }
                _ => return Err(TreeError::InvalidParent(format!("patch path {}", op.path))),
            }
            Ok(PatchOp {
                op: PatchVerb::Remove,
                path: op.path.clone(),
                value: None,
            })
        }
        PatchVerb::Remove => {
            let prior = match parent {
                Value::Object(map) => map
                    .remove(key)
                    .ok_or_else(|| TreeError::NotFound(format!("patch path {}", op.path)))?,
                Value::Array(items) => {
                    let idx = array_index(key, items.len(), &op.path)?;
                    items.remove(idx)
                }
                _ => return Err(TreeError::InvalidParent(format!("patch path {}", op.path))),
            };
            Ok(PatchOp {
                op: PatchVerb::Add,
                path: op.path.clone(),
                value: Some(prior),
            })
        }
        PatchVerb::Replace => {
            let value = op.value.clone().ok_or_else(|| {
                TreeError::Protocol(format!("replace op without value at {}", op.path))
            })?;
            let slot = match parent {
                Value::Object(map) => map
                    .get_mut(key)
                    .ok_or_else(|| TreeError::NotFound(format!("patch path {}", op.path)))?,
                Value::Array(items) => {
                    let idx = array_index(key, items.len(), &op.path)?;
                    &mut items[idx]
                }
                _ => return Err(TreeError::InvalidParent(format!("patch path {}", op.path))),
            };
            let prior = std::mem::replace(slot, value);
            Ok(PatchOp {
                op: PatchVerb::Replace,
                path: op.path.clone(),
                value: Some(prior),
            })
        }
    }
}

/// Split a pointer into (parent segments, final key).
fn split_pointer(path: &str) -> Result<(Vec<&str>, &str)> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Err(TreeError::Protocol("empty patch path".to_string()));
    }
    let mut segments: Vec<&str> = trimmed.split('/').collect();
    let key = segments.pop().unwrap_or_default();
    Ok((segments, key))
}

fn resolve_pointer_mut<'a>(value: &'a mut Value, segments: Vec<&str>) -> Option<&'a mut Value> {
    let mut cursor = value;
    for seg in segments {
        cursor = match cursor {
            Value::Object(map) => map.get_mut(seg)?,
            Value::Array(items) => {
                let idx: usize = seg.parse().ok()?;
                items.get_mut(idx)?
            }
            _ => return None,
        };
    }
    Some(cursor)
}

fn array_index(key: &str, len: usize, path: &str) -> Result<usize> {
    let idx: usize = key
        .parse()
        .map_err(|_| TreeError::Protocol(format!("non-numeric array index in {}", path)))?;
    if idx >= len {
        return Err(TreeError::NotFound(format!("patch path {}", path)));
    }
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::types::{NodeId, NodeKind};

    fn patch(ops: Vec<PatchOp>) -> Patch {
        Patch::new(ops, 42)
    }

    #[test]
    fn replace_returns_inverse_with_prior_value() {
        let p = patch(vec![PatchOp {
            op: PatchVerb::Replace,
            path: "/x".to_string(),
            value: Some(json!(2)),
        }]);
        let (out, undo) = p.apply(&json!({"x": 1})).unwrap();
        assert_eq!(out, json!({"x": 2}));
        assert_eq!(undo[0].value, Some(json!(1)));
    }

    #[test]
    fn add_into_nested_array() {
        let p = patch(vec![PatchOp {
            op: PatchVerb::Add,
            path: "/items/1".to_string(),
            value: Some(json!("b")),
        }]);
        let (out, _) = p.apply(&json!({"items": ["a", "c"]})).unwrap();
        assert_eq!(out, json!({"items": ["a", "b", "c"]}));
    }

    #[test]
    fn remove_missing_key_is_not_found() {
        let p = patch(vec![PatchOp {
            op: PatchVerb::Remove,
            path: "/gone".to_string(),
            value: None,
        }]);
        let err = p.apply(&json!({})).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn ops_apply_in_order_and_undo_reverses() {
        let p = patch(vec![
            PatchOp {
                op: PatchVerb::Add,
                path: "/a".to_string(),
                value: Some(json!(1)),
            },
            PatchOp {
                op: PatchVerb::Replace,
                path: "/a".to_string(),
                value: Some(json!(2)),
            },
        ]);
        let before = json!({});
        let (after, undo) = p.apply(&before).unwrap();
        assert_eq!(after, json!({"a": 2}));

        let rollback = Patch::new(undo, 0);
        let (restored, _) = rollback.apply(&after).unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn change_record_uses_short_wire_keys() {
        let mut record = ChangeRecord::new(
            ChangeOp::Remove,
            NodeId::tagged(NodeKind::Directory, "root1"),
        );
        record.tx = 7;
        record.removed = Some(vec![NodeId::tagged(NodeKind::File, "leaf1")]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["targetId"], "droot1");
        assert_eq!(json["r"][0], "fleaf1");
        assert!(json.get("removed").is_none());
        assert!(json.get("a").is_none());
    }
}
