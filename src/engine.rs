//! Mutation Engine
//!
//! The only writer of the node store. Every verb is split into a prepare
//! phase (validate against a read snapshot, compute the replacement nodes and
//! the change record) and an apply phase (swap arena slots, bump `tx`, stamp
//! and publish the record). Drivers run prepare, perform their backing I/O,
//! then apply through the restricted [`ApplyHandle`]; nothing else in the
//! crate may reach the apply step.

use crate::change::{ChangeOp, ChangeRecord, Patch};
use crate::error::{Result, TreeError};
use crate::node::{DirectoryNode, FileNode, Node, NodeEntry};
use crate::store::NodeStore;
use crate::types::{now_ms, IdGenerator, NodeId, NodeKind};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Broadcast capacity for change subscribers; laggards see `RecvError::Lagged`.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Result of one applied verb: the terminal entry and the transaction number.
#[derive(Debug, Clone)]
pub struct VerbOutcome {
    pub entry: NodeEntry,
    pub tx: u64,
}

/// A node materialized during bulk load.
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub entry: NodeEntry,
    pub data: Option<Value>,
}

/// Arena edits computed by a prepare phase.
#[derive(Debug)]
enum ArenaOp {
    /// Insert or replace one node record.
    Upsert(Node),
    /// Drop one node record.
    Remove(NodeId),
    /// Attach `child` to `parent` (root when `None`) and re-sort siblings.
    Link {
        parent: Option<NodeId>,
        child: NodeId,
    },
    /// Detach `child` from `parent` (root when `None`).
    Unlink {
        parent: Option<NodeId>,
        child: NodeId,
    },
}

/// A validated, not-yet-applied mutation.
///
/// Holds everything apply needs; `record.tx` stays zero until stamped.
#[derive(Debug)]
pub struct PreparedChange {
    ops: Vec<ArenaOp>,
    record: ChangeRecord,
    outcome: NodeEntry,
}

impl PreparedChange {
    /// The change record as prepared (tx not yet assigned).
    pub fn record(&self) -> &ChangeRecord {
        &self.record
    }

    /// The entry the verb resolves to once applied.
    pub fn outcome(&self) -> &NodeEntry {
        &self.outcome
    }

    /// The payload this change writes to its target file, if any.
    pub(crate) fn file_payload(&self) -> Option<&Value> {
        self.ops.iter().find_map(|op| match op {
            ArenaOp::Upsert(Node::File(f)) => f.data.as_ref(),
            _ => None,
        })
    }
}

struct EngineState {
    store: NodeStore,
    tx: u64,
}

/// The mutation engine owning one node store.
pub struct MutationEngine {
    state: RwLock<EngineState>,
    changes: broadcast::Sender<Arc<ChangeRecord>>,
    idgen: Arc<dyn IdGenerator>,
}

impl MutationEngine {
    pub fn new(idgen: Arc<dyn IdGenerator>) -> Arc<MutationEngine> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(MutationEngine {
            state: RwLock::new(EngineState {
                store: NodeStore::new(),
                tx: 0,
            }),
            changes,
            idgen,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<MutationEngine> {
        MutationEngine::new(Arc::new(crate::types::UuidIdGen))
    }

    /// Run `f` against a read-only view of the store.
    pub fn with_store<R>(&self, f: impl FnOnce(&NodeStore) -> R) -> R {
        let state = self.state.read();
        f(&state.store)
    }

    /// Current transaction counter.
    pub fn tx(&self) -> u64 {
        self.state.read().tx
    }

    /// Subscribe to the change stream. Records arrive in tx order.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeRecord>> {
        self.changes.subscribe()
    }

    /// The restricted apply-side interface, handed to drivers only.
    pub(crate) fn internal_handle(self: &Arc<Self>) -> ApplyHandle {
        ApplyHandle {
            engine: Arc::clone(self),
        }
    }

    // ---- prepare phase ----------------------------------------------------

    /// Validate an `add` and compute the nodes it creates.
    ///
    /// Fails with AlreadyExists when the full path resolves; missing
    /// intermediate directories are created sharing one timestamp.
    pub fn prepare_add(&self, path: &str, data: Option<Value>) -> Result<PreparedChange> {
        let state = self.state.read();
        let store = &state.store;
        let segments = checked_segments(path)?;
        if segments.is_empty() {
            return Err(TreeError::NotFound("empty path".to_string()));
        }
        let m = store.max_path_match(&segments);
        if m.matched == segments.len() {
            return Err(TreeError::AlreadyExists(path.to_string()));
        }
        if let Some(deepest) = &m.deepest {
            if !deepest.is_directory() {
                return Err(TreeError::InvalidParent(path.to_string()));
            }
        }

        let now = now_ms();
        let mut taken = HashSet::new();
        let mut ops = Vec::new();
        let mut added = Vec::new();
        let mut parent = m.deepest.clone();
        let first_parent = m.deepest.clone();
        let remaining = &segments[m.matched..];
        let last = remaining.len() - 1;
        let mut first_new: Option<NodeId> = None;
        let mut prev_dir_children: Option<usize> = None;

        for (i, segment) in remaining.iter().enumerate() {
            let kind = if i == last && data.is_some() {
                NodeKind::File
            } else {
                NodeKind::Directory
            };
            let id = self.fresh_id(store, kind, &mut taken);
            let entry = NodeEntry {
                id: id.clone(),
                name: segment.to_string(),
                ctime: now,
                parent_id: parent.clone(),
            };
            added.push(entry.clone());
            if first_new.is_none() {
                first_new = Some(id.clone());
            }
            // Link the previous intermediate directory to this node.
            if let Some(prev) = prev_dir_children {
                if let Some(ArenaOp::Upsert(Node::Directory(dir))) = ops.get_mut(prev) {
                    dir.children.push(id.clone());
                }
            }
            let node = match kind {
                NodeKind::Directory => Node::Directory(DirectoryNode {
                    entry,
                    children: Vec::new(),
                }),
                NodeKind::File => Node::File(FileNode {
                    entry,
                    data: data.clone(),
                }),
            };
            ops.push(ArenaOp::Upsert(node));
            prev_dir_children = Some(ops.len() - 1);
            parent = Some(id);
        }

        let terminal = added.last().cloned().unwrap_or_else(|| unreachable!());
        ops.push(ArenaOp::Link {
            parent: first_parent,
            child: first_new.clone().unwrap_or_else(|| terminal.id.clone()),
        });

        let mut record = ChangeRecord::new(ChangeOp::Add, terminal.id.clone());
        record.added = Some(added);
        Ok(PreparedChange {
            ops,
            record,
            outcome: terminal,
        })
    }

    /// Validate a `move`: relink the existing node, keeping its id.
    pub fn prepare_move(&self, from: &str, to: &str) -> Result<PreparedChange> {
        let state = self.state.read();
        let store = &state.store;
        let src = store
            .resolve(from)
            .cloned()
            .ok_or_else(|| TreeError::NotFound(from.to_string()))?;
        let now = now_ms();
        let mut taken = HashSet::new();

        let dest = self.resolve_destination(store, src.name(), src.id(), to, now, &mut taken)?;
        // The destination chain hangs off an existing node; moving a
        // directory under its own subtree would orphan it.
        if src.id().is_directory() {
            if let Some(anchor) = &dest.anchor {
                if store.is_within(src.id(), anchor) {
                    return Err(TreeError::InvalidParent(to.to_string()));
                }
            }
        }

        let old_parent = src.entry().parent_id.clone();
        let new_entry = NodeEntry {
            id: src.id().clone(),
            name: dest.name.clone(),
            ctime: bump(now, src.entry().ctime),
            parent_id: dest.parent.clone(),
        };

        let mut ops = dest.ops;
        ops.push(ArenaOp::Unlink {
            parent: old_parent,
            child: src.id().clone(),
        });
        ops.push(ArenaOp::Upsert(src.with_entry(new_entry.clone())));
        ops.push(ArenaOp::Link {
            parent: dest.parent,
            child: src.id().clone(),
        });

        let mut record = ChangeRecord::new(ChangeOp::Move, src.id().clone());
        record.changed = Some(vec![new_entry.clone()]);
        if !dest.added.is_empty() {
            record.added = Some(dest.added);
        }
        Ok(PreparedChange {
            ops,
            record,
            outcome: new_entry,
        })
    }

    /// Validate a `copy`: materialize a fresh subtree with new ids.
    pub fn prepare_copy(&self, from: &str, to: &str) -> Result<PreparedChange> {
        let state = self.state.read();
        let store = &state.store;
        let src = store
            .resolve(from)
            .cloned()
            .ok_or_else(|| TreeError::NotFound(from.to_string()))?;
        let now = now_ms();
        let mut taken = HashSet::new();

        let dest = self.resolve_destination(store, src.name(), src.id(), to, now, &mut taken)?;

        let mut ops = dest.ops;
        let mut added = dest.added;
        let root_id = self.materialize_copy(
            store,
            &src,
            dest.name.clone(),
            dest.parent.clone(),
            now,
            &mut taken,
            &mut ops,
            &mut added,
        );
        ops.push(ArenaOp::Link {
            parent: dest.parent,
            child: root_id.clone(),
        });

        let outcome = added
            .iter()
            .find(|e| e.id == root_id)
            .cloned()
            .ok_or_else(|| TreeError::NotFound(to.to_string()))?;
        let mut record = ChangeRecord::new(ChangeOp::Copy, root_id);
        record.added = Some(added);
        Ok(PreparedChange {
            ops,
            record,
            outcome,
        })
    }

    /// Validate a `remove`: descendants drop before their parents.
    pub fn prepare_remove(&self, path: &str) -> Result<PreparedChange> {
        let state = self.state.read();
        let store = &state.store;
        let target = store
            .resolve(path)
            .cloned()
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;

        let order = store.descendants_child_first(target.id());
        let mut ops = Vec::with_capacity(order.len() + 1);
        ops.push(ArenaOp::Unlink {
            parent: target.entry().parent_id.clone(),
            child: target.id().clone(),
        });
        for id in &order {
            ops.push(ArenaOp::Remove(id.clone()));
        }

        let mut record = ChangeRecord::new(ChangeOp::Remove, target.id().clone());
        record.removed = Some(order);
        Ok(PreparedChange {
            ops,
            record,
            outcome: target.entry().clone(),
        })
    }

    /// Validate a whole-value `write`.
    ///
    /// Returns `Ok(None)` when the new payload equals the current one: a
    /// documented no-op with no tx bump, no event, and no I/O. An `expect`
    /// ctime, when given, must match the current one.
    pub fn prepare_write(
        &self,
        path: &str,
        data: Value,
        expect: Option<i64>,
    ) -> Result<Option<PreparedChange>> {
        let state = self.state.read();
        let store = &state.store;
        let node = store
            .resolve(path)
            .cloned()
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        let file = match node.as_ref() {
            Node::File(f) => f,
            Node::Directory(_) => return Err(TreeError::InvalidParent(path.to_string())),
        };
        if let Some(expected) = expect {
            if expected != file.entry.ctime {
                return Err(TreeError::Conflict {
                    path: path.to_string(),
                    expected,
                    found: file.entry.ctime,
                });
            }
        }
        if file.data.as_ref() == Some(&data) {
            debug!(path, "write produced no change; skipping");
            return Ok(None);
        }

        let entry = NodeEntry {
            ctime: bump(now_ms(), file.entry.ctime),
            ..file.entry.clone()
        };
        let mut record = ChangeRecord::new(ChangeOp::Write, entry.id.clone());
        record.changed = Some(vec![entry.clone()]);
        Ok(Some(PreparedChange {
            ops: vec![ArenaOp::Upsert(Node::File(FileNode {
                entry: entry.clone(),
                data: Some(data),
            }))],
            record,
            outcome: entry,
        }))
    }

    /// Validate an incremental `patch` against its pre-image ctime.
    ///
    /// The ctime check is the system's sole conflict detection: a stale
    /// pre-image always fails and never mutates the target.
    pub fn prepare_patch(&self, path: &str, patch: Patch) -> Result<Option<PreparedChange>> {
        let state = self.state.read();
        let store = &state.store;
        let node = store
            .resolve(path)
            .cloned()
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        let file = match node.as_ref() {
            Node::File(f) => f,
            Node::Directory(_) => return Err(TreeError::InvalidParent(path.to_string())),
        };
        if patch.ctime != file.entry.ctime {
            return Err(TreeError::Conflict {
                path: path.to_string(),
                expected: patch.ctime,
                found: file.entry.ctime,
            });
        }
        let data = file
            .data
            .as_ref()
            .ok_or_else(|| TreeError::NotFound(format!("payload of {}", path)))?;
        let (patched, undo) = patch.apply(data)?;
        if &patched == data {
            debug!(path, "patch produced no change; skipping");
            return Ok(None);
        }

        let entry = NodeEntry {
            ctime: bump(now_ms(), file.entry.ctime),
            ..file.entry.clone()
        };
        let mut stamped = patch;
        stamped.undo = Some(undo);
        let mut record = ChangeRecord::new(ChangeOp::Patch, entry.id.clone());
        record.changed = Some(vec![entry.clone()]);
        record.patch = Some(stamped);
        Ok(Some(PreparedChange {
            ops: vec![ArenaOp::Upsert(Node::File(FileNode {
                entry: entry.clone(),
                data: Some(patched),
            }))],
            record,
            outcome: entry,
        }))
    }

    // ---- apply phase (crate-internal; drivers go through ApplyHandle) -----

    pub(crate) fn apply_prepared(&self, prepared: PreparedChange) -> Result<VerbOutcome> {
        let mut state = self.state.write();
        for op in prepared.ops {
            apply_arena_op(&mut state.store, op);
        }
        state.tx += 1;
        let mut record = prepared.record;
        record.tx = state.tx;
        let tx = state.tx;
        // Publish while holding the lock so subscribers observe tx order.
        let _ = self.changes.send(Arc::new(record));
        Ok(VerbOutcome {
            entry: prepared.outcome,
            tx,
        })
    }

    /// Apply a change record received from a remote peer.
    ///
    /// Adopts the incoming tx before publishing. Records at or behind the
    /// current tx are skipped whole: the fan-out can race a connecting peer's
    /// snapshot, and the snapshot already carries those mutations. Unlike
    /// local verbs, removal of a missing target is tolerated: a replica may
    /// already have observed the removal through another path.
    pub(crate) fn apply_sync(&self, record: ChangeRecord) -> Result<()> {
        let mut state = self.state.write();
        if record.tx <= state.tx {
            debug!(tx = record.tx, current = state.tx, "sync record not newer; skipping");
            return Ok(());
        }
        match record.op {
            ChangeOp::Add | ChangeOp::Copy => {
                let added = record.added.clone().unwrap_or_default();
                sync_insert_entries(&mut state.store, &added);
            }
            ChangeOp::Move => {
                for entry in record.changed.clone().unwrap_or_default() {
                    sync_relink(&mut state.store, entry);
                }
            }
            ChangeOp::Remove => {
                for id in record.removed.clone().unwrap_or_default() {
                    if state.store.get(&id).is_none() {
                        // Tolerated idempotence; see the divergence note in
                        // the crate docs.
                        warn!(id = %id, "sync remove: target already absent");
                        continue;
                    }
                    let parent = state.store.entry(&id).and_then(|e| e.parent_id.clone());
                    apply_arena_op(
                        &mut state.store,
                        ArenaOp::Unlink {
                            parent,
                            child: id.clone(),
                        },
                    );
                    state.store.remove(&id);
                }
            }
            ChangeOp::Write => {
                for entry in record.changed.clone().unwrap_or_default() {
                    sync_overwrite(&mut state.store, entry);
                }
            }
            ChangeOp::Patch => {
                if let (Some(changed), Some(patch)) = (record.changed.clone(), record.patch.clone())
                {
                    for entry in changed {
                        sync_patch(&mut state.store, entry, &patch);
                    }
                }
            }
        }
        state.tx = record.tx;
        let _ = self.changes.send(Arc::new(record));
        Ok(())
    }

    /// Bulk-load the store (driver open path). Emits no per-node events.
    pub(crate) fn build(&self, nodes: Vec<BuildNode>, tx: u64) -> Result<()> {
        let mut state = self.state.write();
        state.store.clear();
        for node in &nodes {
            let materialized = match node.entry.kind() {
                NodeKind::Directory => Node::Directory(DirectoryNode {
                    entry: node.entry.clone(),
                    children: Vec::new(),
                }),
                NodeKind::File => Node::File(FileNode {
                    entry: node.entry.clone(),
                    data: node.data.clone(),
                }),
            };
            state.store.insert(materialized);
        }
        for node in &nodes {
            apply_arena_op(
                &mut state.store,
                ArenaOp::Link {
                    parent: node.entry.parent_id.clone(),
                    child: node.entry.id.clone(),
                },
            );
        }
        state.tx = tx;
        debug!(count = nodes.len(), tx, "store built");
        Ok(())
    }

    /// Fill or drop a file's payload without an event or ctime bump.
    pub(crate) fn set_file_data(&self, id: &NodeId, data: Option<Value>) -> Result<()> {
        let mut state = self.state.write();
        let node = state
            .store
            .get(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))?;
        match node.as_ref() {
            Node::File(f) => {
                let replacement = Node::File(FileNode {
                    entry: f.entry.clone(),
                    data,
                });
                state.store.insert(replacement);
                Ok(())
            }
            Node::Directory(_) => Err(TreeError::InvalidParent(id.to_string())),
        }
    }

    /// Drop all state (driver close path).
    pub(crate) fn clear(&self) {
        let mut state = self.state.write();
        state.store.clear();
        state.tx = 0;
    }

    // ---- helpers ----------------------------------------------------------

    fn fresh_id(&self, store: &NodeStore, kind: NodeKind, taken: &mut HashSet<NodeId>) -> NodeId {
        loop {
            let id = NodeId::tagged(kind, &self.idgen.short_id());
            if !store.contains(&id) && !taken.contains(&id) {
                taken.insert(id.clone());
                return id;
            }
        }
    }

    /// Resolve a copy/move destination by longest-prefix match.
    ///
    /// An existing directory target means "place inside it under the source's
    /// own basename"; otherwise the unmatched segments become new
    /// directories and the final segment becomes the new name.
    fn resolve_destination(
        &self,
        store: &NodeStore,
        src_name: &str,
        src_id: &NodeId,
        to: &str,
        now: i64,
        taken: &mut HashSet<NodeId>,
    ) -> Result<Destination> {
        let segments = checked_segments(to)?;
        let m = store.max_path_match(&segments);

        if m.matched == segments.len() {
            // Full path exists.
            match &m.deepest {
                Some(id) if id.is_directory() => {
                    if let Some(existing) = store.child_named(Some(id), src_name) {
                        if existing != src_id {
                            return Err(TreeError::AlreadyExists(format!("{}/{}", to, src_name)));
                        }
                    }
                    return Ok(Destination {
                        parent: Some(id.clone()),
                        name: src_name.to_string(),
                        ops: Vec::new(),
                        added: Vec::new(),
                        anchor: Some(id.clone()),
                    });
                }
                Some(_) => return Err(TreeError::AlreadyExists(to.to_string())),
                None => {
                    // Empty destination path: place under the root.
                    if let Some(existing) = store.child_named(None, src_name) {
                        if existing != src_id {
                            return Err(TreeError::AlreadyExists(src_name.to_string()));
                        }
                    }
                    return Ok(Destination {
                        parent: None,
                        name: src_name.to_string(),
                        ops: Vec::new(),
                        added: Vec::new(),
                        anchor: None,
                    });
                }
            }
        }

        if let Some(deepest) = &m.deepest {
            if !deepest.is_directory() {
                return Err(TreeError::InvalidParent(to.to_string()));
            }
        }

        // Unmatched intermediate segments become fresh directories; the last
        // segment is the destination name.
        let mut parent = m.deepest.clone();
        let first_parent = parent.clone();
        let mut ops = Vec::new();
        let mut added = Vec::new();
        let mut first_new: Option<NodeId> = None;
        let intermediates = &segments[m.matched..segments.len() - 1];
        let mut prev_dir: Option<usize> = None;
        for segment in intermediates {
            let id = self.fresh_id(store, NodeKind::Directory, taken);
            let entry = NodeEntry {
                id: id.clone(),
                name: segment.to_string(),
                ctime: now,
                parent_id: parent.clone(),
            };
            added.push(entry.clone());
            if first_new.is_none() {
                first_new = Some(id.clone());
            }
            if let Some(prev) = prev_dir {
                if let Some(ArenaOp::Upsert(Node::Directory(dir))) = ops.get_mut(prev) {
                    dir.children.push(id.clone());
                }
            }
            ops.push(ArenaOp::Upsert(Node::Directory(DirectoryNode {
                entry,
                children: Vec::new(),
            })));
            prev_dir = Some(ops.len() - 1);
            parent = Some(id);
        }
        if let Some(first) = first_new {
            ops.push(ArenaOp::Link {
                parent: first_parent,
                child: first,
            });
        }

        Ok(Destination {
            parent,
            name: segments.last().unwrap_or(&src_name).to_string(),
            ops,
            added,
            anchor: m.deepest,
        })
    }

    /// Clone `src`'s subtree under a new name/parent with fresh ids.
    #[allow(clippy::too_many_arguments)]
    fn materialize_copy(
        &self,
        store: &NodeStore,
        src: &Arc<Node>,
        name: String,
        parent: Option<NodeId>,
        now: i64,
        taken: &mut HashSet<NodeId>,
        ops: &mut Vec<ArenaOp>,
        added: &mut Vec<NodeEntry>,
    ) -> NodeId {
        let kind = src.kind();
        let id = self.fresh_id(store, kind, taken);
        let entry = NodeEntry {
            id: id.clone(),
            name,
            ctime: now,
            parent_id: parent,
        };
        added.push(entry.clone());
        match src.as_ref() {
            Node::File(f) => {
                ops.push(ArenaOp::Upsert(Node::File(FileNode {
                    entry,
                    data: f.data.clone(),
                })));
            }
            Node::Directory(d) => {
                let slot = ops.len();
                ops.push(ArenaOp::Upsert(Node::Directory(DirectoryNode {
                    entry,
                    children: Vec::new(),
                })));
                let mut children = Vec::with_capacity(d.children.len());
                for child_id in &d.children {
                    if let Some(child) = store.get(child_id) {
                        let child = Arc::clone(child);
                        let copied = self.materialize_copy(
                            store,
                            &child,
                            child.name().to_string(),
                            Some(id.clone()),
                            now,
                            taken,
                            ops,
                            added,
                        );
                        children.push(copied);
                    }
                }
                if let Some(ArenaOp::Upsert(Node::Directory(dir))) = ops.get_mut(slot) {
                    dir.children = children;
                }
            }
        }
        id
    }
}

struct Destination {
    parent: Option<NodeId>,
    name: String,
    ops: Vec<ArenaOp>,
    added: Vec<NodeEntry>,
    /// Deepest pre-existing node the destination hangs from.
    anchor: Option<NodeId>,
}

/// Next ctime for a mutated node: strictly past its previous value.
fn bump(now: i64, previous: i64) -> i64 {
    now.max(previous + 1)
}

/// Split a verb path, rejecting `.` and `..` segments. Node names are plain
/// labels; a traversal segment would escape the disk driver's backing root
/// and create nodes no restart scan can rediscover.
fn checked_segments(path: &str) -> Result<Vec<&str>> {
    let segments = NodeStore::split_path(path);
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(TreeError::InvalidParent(path.to_string()));
    }
    Ok(segments)
}

fn apply_arena_op(store: &mut NodeStore, op: ArenaOp) {
    match op {
        ArenaOp::Upsert(node) => store.insert(node),
        ArenaOp::Remove(id) => {
            store.remove(&id);
        }
        ArenaOp::Link { parent, child } => match parent {
            None => {
                let mut children: Vec<NodeId> = store.root_children().to_vec();
                if !children.contains(&child) {
                    children.push(child);
                }
                store.sort_siblings(&mut children);
                store.set_root_children(children);
            }
            Some(parent_id) => {
                let Some(node) = store.get(&parent_id) else {
                    warn!(parent = %parent_id, child = %child, "link: parent missing");
                    return;
                };
                if let Node::Directory(dir) = node.as_ref() {
                    let mut dir = dir.clone();
                    if !dir.children.contains(&child) {
                        dir.children.push(child);
                    }
                    store.sort_siblings(&mut dir.children);
                    store.insert(Node::Directory(dir));
                }
            }
        },
        ArenaOp::Unlink { parent, child } => match parent {
            None => {
                let mut children: Vec<NodeId> = store.root_children().to_vec();
                children.retain(|id| id != &child);
                store.set_root_children(children);
            }
            Some(parent_id) => {
                let Some(node) = store.get(&parent_id) else {
                    return;
                };
                if let Node::Directory(dir) = node.as_ref() {
                    let mut dir = dir.clone();
                    dir.children.retain(|id| id != &child);
                    store.insert(Node::Directory(dir));
                }
            }
        },
    }
}

/// Insert entries from a remote add/copy. Payloads are not carried on the
/// wire; files start unloaded and fill in through the lazy-load path.
fn sync_insert_entries(store: &mut NodeStore, added: &[NodeEntry]) {
    for entry in added {
        let node = match entry.kind() {
            NodeKind::Directory => Node::Directory(DirectoryNode {
                entry: entry.clone(),
                children: Vec::new(),
            }),
            NodeKind::File => Node::File(FileNode {
                entry: entry.clone(),
                data: None,
            }),
        };
        store.insert(node);
    }
    for entry in added {
        apply_arena_op(
            store,
            ArenaOp::Link {
                parent: entry.parent_id.clone(),
                child: entry.id.clone(),
            },
        );
    }
}

fn sync_relink(store: &mut NodeStore, entry: NodeEntry) {
    let Some(existing) = store.get(&entry.id).cloned() else {
        warn!(id = %entry.id, "sync move: target missing");
        return;
    };
    let old_parent = existing.entry().parent_id.clone();
    apply_arena_op(
        store,
        ArenaOp::Unlink {
            parent: old_parent,
            child: entry.id.clone(),
        },
    );
    let new_parent = entry.parent_id.clone();
    let child = entry.id.clone();
    store.insert(existing.with_entry(entry));
    apply_arena_op(
        store,
        ArenaOp::Link {
            parent: new_parent,
            child,
        },
    );
}

/// Adopt a remote overwrite: the new payload is not on the wire, so a cached
/// payload with a stale ctime is dropped and refetched on demand.
fn sync_overwrite(store: &mut NodeStore, entry: NodeEntry) {
    let Some(existing) = store.get(&entry.id).cloned() else {
        warn!(id = %entry.id, "sync write: target missing");
        return;
    };
    let data = match existing.as_ref() {
        Node::File(f) if f.entry.ctime == entry.ctime => f.data.clone(),
        _ => None,
    };
    store.insert(Node::File(FileNode { entry, data }));
}

/// Adopt a remote patch: apply to the cached payload only when its ctime
/// matches the pre-image; otherwise discard the stale payload rather than
/// risk corrupting it.
fn sync_patch(store: &mut NodeStore, entry: NodeEntry, patch: &Patch) {
    let Some(existing) = store.get(&entry.id).cloned() else {
        warn!(id = %entry.id, "sync patch: target missing");
        return;
    };
    let data = match existing.as_ref() {
        Node::File(f) => match (&f.data, f.entry.ctime == patch.ctime) {
            (Some(value), true) => match patch.apply(value) {
                Ok((patched, _)) => Some(patched),
                Err(err) => {
                    warn!(id = %entry.id, error = %err, "sync patch failed; dropping cached payload");
                    None
                }
            },
            (Some(_), false) => {
                debug!(id = %entry.id, "sync patch pre-image mismatch; dropping cached payload");
                None
            }
            (None, _) => None,
        },
        Node::Directory(_) => {
            warn!(id = %entry.id, "sync patch addressed a directory");
            return;
        }
    };
    store.insert(Node::File(FileNode { entry, data }));
}

/// Restricted internal interface to the apply step.
///
/// Only drivers hold one; application code goes through the repository
/// facade, which never applies directly.
#[derive(Clone)]
pub struct ApplyHandle {
    engine: Arc<MutationEngine>,
}

impl ApplyHandle {
    /// Apply a prepared mutation: swap nodes, bump tx, publish the record.
    pub fn apply(&self, prepared: PreparedChange) -> Result<VerbOutcome> {
        self.engine.apply_prepared(prepared)
    }

    /// Apply a remote change record.
    pub fn sync(&self, record: ChangeRecord) -> Result<()> {
        self.engine.apply_sync(record)
    }

    /// Bulk-load the store without per-node events.
    pub fn build(&self, nodes: Vec<BuildNode>, tx: u64) -> Result<()> {
        self.engine.build(nodes, tx)
    }

    /// Fill or drop a file payload outside the mutation path.
    pub fn set_file_data(&self, id: &NodeId, data: Option<Value>) -> Result<()> {
        self.engine.set_file_data(id, data)
    }

    /// Reset the store on driver close.
    pub fn clear(&self) {
        self.engine.clear()
    }

    pub fn engine(&self) -> &Arc<MutationEngine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{PatchOp, PatchVerb};
    use serde_json::json;

    fn apply(engine: &Arc<MutationEngine>, prepared: PreparedChange) -> VerbOutcome {
        engine.apply_prepared(prepared).unwrap()
    }

    #[test]
    fn add_creates_intermediates_and_counts_tx() {
        let engine = MutationEngine::for_tests();
        let prepared = engine
            .prepare_add("a/b/c.json", Some(json!({"x": 1})))
            .unwrap();
        assert_eq!(prepared.record().added.as_ref().unwrap().len(), 3);
        let outcome = apply(&engine, prepared);
        assert_eq!(outcome.tx, 1);
        assert_eq!(outcome.entry.name, "c.json");
        assert!(!outcome.entry.id.is_directory());

        engine.with_store(|store| {
            assert!(store.resolve("a").unwrap().is_directory());
            assert!(store.resolve("a/b").unwrap().is_directory());
            assert_eq!(
                store.resolve("a/b/c.json").unwrap().data(),
                Some(&json!({"x": 1}))
            );
        });
    }

    #[test]
    fn add_existing_path_is_already_exists() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("a/b", None).unwrap());
        let err = engine.prepare_add("a/b", None).unwrap_err();
        assert!(matches!(err, TreeError::AlreadyExists(_)));
    }

    #[test]
    fn traversal_segments_are_rejected_before_mutation() {
        let engine = MutationEngine::for_tests();
        for path in ["../escaped.json", "a/../b", "./x", "a/."] {
            let err = engine.prepare_add(path, Some(json!(1))).unwrap_err();
            assert!(matches!(err, TreeError::InvalidParent(_)), "{}", path);
        }
        engine.with_store(|s| assert!(s.is_empty()));

        apply(&engine, engine.prepare_add("a", None).unwrap());
        let err = engine.prepare_move("a", "../a").unwrap_err();
        assert!(matches!(err, TreeError::InvalidParent(_)));
        let err = engine.prepare_copy("a", "b/../c").unwrap_err();
        assert!(matches!(err, TreeError::InvalidParent(_)));
    }

    #[test]
    fn add_through_file_is_invalid_parent() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("f.json", Some(json!(1))).unwrap());
        let err = engine.prepare_add("f.json/child", None).unwrap_err();
        assert!(matches!(err, TreeError::InvalidParent(_)));
    }

    #[test]
    fn add_then_remove_restores_node_set_and_advances_tx_by_two() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("keep", None).unwrap());
        let before = engine.with_store(|s| s.len());
        let tx_before = engine.tx();

        apply(&engine, engine.prepare_add("temp/x.json", Some(json!(1))).unwrap());
        apply(&engine, engine.prepare_remove("temp").unwrap());

        assert_eq!(engine.with_store(|s| s.len()), before);
        assert_eq!(engine.tx(), tx_before + 2);
    }

    #[test]
    fn remove_records_descendants_child_first() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("d/s1/f1.json", Some(json!(1))).unwrap());
        apply(&engine, engine.prepare_add("d/s2", None).unwrap());

        let d = engine.with_store(|s| s.resolve_id("d").unwrap());
        let prepared = engine.prepare_remove("d").unwrap();
        let removed = prepared.record().removed.clone().unwrap();
        // d, s1, f1, s2 -> 4 ids, target last.
        assert_eq!(removed.len(), 4);
        assert_eq!(removed.last().unwrap(), &d);
        apply(&engine, prepared);
        engine.with_store(|s| assert!(s.is_empty()));
    }

    #[test]
    fn remove_missing_path_rejects_and_leaves_store_unchanged() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("a", None).unwrap());
        let err = engine.prepare_remove("ghost").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(engine.with_store(|s| s.len()), 1);
        assert_eq!(engine.tx(), 1);
    }

    #[test]
    fn move_keeps_id_and_creates_missing_segments() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("src/f.json", Some(json!(1))).unwrap());
        let old_id = engine.with_store(|s| s.resolve_id("src/f.json").unwrap());

        let prepared = engine.prepare_move("src/f.json", "dst/deep/moved.json").unwrap();
        // dst and dst/deep are created.
        assert_eq!(prepared.record().added.as_ref().unwrap().len(), 2);
        let outcome = apply(&engine, prepared);
        assert_eq!(outcome.entry.id, old_id);

        engine.with_store(|store| {
            assert!(store.resolve("src/f.json").is_none());
            assert_eq!(store.resolve_id("dst/deep/moved.json").unwrap(), old_id);
            assert_eq!(store.resolve("dst/deep/moved.json").unwrap().data(), Some(&json!(1)));
        });
    }

    #[test]
    fn move_into_existing_directory_uses_own_basename() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("a/f.json", Some(json!(1))).unwrap());
        apply(&engine, engine.prepare_add("b", None).unwrap());
        apply(&engine, engine.prepare_move("a/f.json", "b").unwrap());
        engine.with_store(|store| {
            assert!(store.resolve("b/f.json").is_some());
        });
    }

    #[test]
    fn move_directory_into_itself_is_rejected() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("a/b", None).unwrap());
        let err = engine.prepare_move("a", "a/b").unwrap_err();
        assert!(matches!(err, TreeError::InvalidParent(_)));
    }

    #[test]
    fn copy_materializes_new_ids_and_preserves_payloads() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("a/f.json", Some(json!({"k": true}))).unwrap());
        let src_ids: Vec<NodeId> = engine.with_store(|s| {
            vec![s.resolve_id("a").unwrap(), s.resolve_id("a/f.json").unwrap()]
        });

        let prepared = engine.prepare_copy("a", "b").unwrap();
        let added = prepared.record().added.clone().unwrap();
        assert_eq!(added.len(), 2);
        apply(&engine, prepared);

        engine.with_store(|store| {
            let copied = store.resolve("b/f.json").unwrap();
            assert_eq!(copied.data(), Some(&json!({"k": true})));
            assert!(!src_ids.contains(copied.id()));
            // Source untouched.
            assert!(store.resolve("a/f.json").is_some());
        });
    }

    #[test]
    fn write_no_change_is_noop() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("f.json", Some(json!({"v": 1}))).unwrap());
        let ctime = engine.with_store(|s| s.resolve("f.json").unwrap().entry().ctime);
        let tx = engine.tx();

        let prepared = engine.prepare_write("f.json", json!({"v": 1}), None).unwrap();
        assert!(prepared.is_none());
        assert_eq!(engine.tx(), tx);
        assert_eq!(
            engine.with_store(|s| s.resolve("f.json").unwrap().entry().ctime),
            ctime
        );
    }

    #[test]
    fn write_bumps_ctime_strictly() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("f.json", Some(json!(1))).unwrap());
        let before = engine.with_store(|s| s.resolve("f.json").unwrap().entry().ctime);
        let prepared = engine.prepare_write("f.json", json!(2), None).unwrap().unwrap();
        let outcome = apply(&engine, prepared);
        assert!(outcome.entry.ctime > before);
    }

    #[test]
    fn stale_patch_fails_without_mutation() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("f.json", Some(json!({"v": 1}))).unwrap());
        let ctime = engine.with_store(|s| s.resolve("f.json").unwrap().entry().ctime);

        let stale = Patch::new(
            vec![PatchOp {
                op: PatchVerb::Replace,
                path: "/v".to_string(),
                value: Some(json!(2)),
            }],
            ctime - 1,
        );
        let err = engine.prepare_patch("f.json", stale).unwrap_err();
        assert!(err.is_conflict());
        engine.with_store(|s| {
            assert_eq!(s.resolve("f.json").unwrap().data(), Some(&json!({"v": 1})));
        });
    }

    #[test]
    fn patch_applies_and_fills_undo() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("f.json", Some(json!({"v": 1}))).unwrap());
        let ctime = engine.with_store(|s| s.resolve("f.json").unwrap().entry().ctime);

        let patch = Patch::new(
            vec![PatchOp {
                op: PatchVerb::Replace,
                path: "/v".to_string(),
                value: Some(json!(2)),
            }],
            ctime,
        );
        let prepared = engine.prepare_patch("f.json", patch).unwrap().unwrap();
        let record_patch = prepared.record().patch.clone().unwrap();
        assert_eq!(record_patch.undo.as_ref().unwrap().len(), 1);
        apply(&engine, prepared);
        engine.with_store(|s| {
            assert_eq!(s.resolve("f.json").unwrap().data(), Some(&json!({"v": 2})));
        });
    }

    #[test]
    fn change_records_arrive_in_tx_order() {
        let engine = MutationEngine::for_tests();
        let mut rx = engine.subscribe();
        apply(&engine, engine.prepare_add("a", None).unwrap());
        apply(&engine, engine.prepare_add("b", None).unwrap());

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.tx, 1);
        assert_eq!(second.tx, 2);
    }

    #[test]
    fn sync_record_at_or_behind_current_tx_is_skipped() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("a", None).unwrap());
        let id = engine.with_store(|s| s.resolve_id("a").unwrap());
        let mut rx = engine.subscribe();

        // A fan-out duplicate of the mutation the snapshot already carried.
        let mut record = ChangeRecord::new(ChangeOp::Remove, id.clone());
        record.tx = 1;
        record.removed = Some(vec![id]);
        engine.apply_sync(record).unwrap();

        assert_eq!(engine.tx(), 1);
        engine.with_store(|s| assert!(s.resolve("a").is_some()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sync_remove_of_missing_target_is_tolerated() {
        let engine = MutationEngine::for_tests();
        let mut record = ChangeRecord::new(
            ChangeOp::Remove,
            NodeId::tagged(NodeKind::File, "ghost"),
        );
        record.tx = 9;
        record.removed = Some(vec![NodeId::tagged(NodeKind::File, "ghost")]);
        engine.apply_sync(record).unwrap();
        assert_eq!(engine.tx(), 9);
    }

    #[test]
    fn sync_add_links_entries_without_payload() {
        let engine = MutationEngine::for_tests();
        let dir = NodeEntry {
            id: NodeId::tagged(NodeKind::Directory, "p1"),
            name: "docs".to_string(),
            ctime: 10,
            parent_id: None,
        };
        let file = NodeEntry {
            id: NodeId::tagged(NodeKind::File, "c1"),
            name: "note.json".to_string(),
            ctime: 10,
            parent_id: Some(dir.id.clone()),
        };
        let mut record = ChangeRecord::new(ChangeOp::Add, file.id.clone());
        record.tx = 3;
        record.added = Some(vec![dir, file]);
        engine.apply_sync(record).unwrap();

        engine.with_store(|store| {
            let node = store.resolve("docs/note.json").unwrap();
            assert!(node.data().is_none());
        });
        assert_eq!(engine.tx(), 3);
    }

    #[test]
    fn sync_patch_with_matching_preimage_updates_cached_payload() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("f.json", Some(json!({"v": 1}))).unwrap());
        let (id, ctime) = engine.with_store(|s| {
            let n = s.resolve("f.json").unwrap();
            (n.id().clone(), n.entry().ctime)
        });

        let mut record = ChangeRecord::new(ChangeOp::Patch, id.clone());
        record.tx = 50;
        record.changed = Some(vec![NodeEntry {
            id: id.clone(),
            name: "f.json".to_string(),
            ctime: ctime + 5,
            parent_id: None,
        }]);
        record.patch = Some(Patch::new(
            vec![PatchOp {
                op: PatchVerb::Replace,
                path: "/v".to_string(),
                value: Some(json!(2)),
            }],
            ctime,
        ));
        engine.apply_sync(record).unwrap();
        engine.with_store(|s| {
            assert_eq!(s.resolve("f.json").unwrap().data(), Some(&json!({"v": 2})));
        });
    }

    #[test]
    fn sync_patch_with_stale_preimage_discards_cached_payload() {
        let engine = MutationEngine::for_tests();
        apply(&engine, engine.prepare_add("f.json", Some(json!({"v": 1}))).unwrap());
        let (id, ctime) = engine.with_store(|s| {
            let n = s.resolve("f.json").unwrap();
            (n.id().clone(), n.entry().ctime)
        });

        let mut record = ChangeRecord::new(ChangeOp::Patch, id.clone());
        record.tx = 51;
        record.changed = Some(vec![NodeEntry {
            id: id.clone(),
            name: "f.json".to_string(),
            ctime: ctime + 5,
            parent_id: None,
        }]);
        record.patch = Some(Patch::new(
            vec![PatchOp {
                op: PatchVerb::Replace,
                path: "/v".to_string(),
                value: Some(json!(2)),
            }],
            ctime - 1,
        ));
        engine.apply_sync(record).unwrap();
        engine.with_store(|s| {
            assert!(s.resolve("f.json").unwrap().data().is_none());
        });
    }
}
