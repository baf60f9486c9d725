//! Node Store
//!
//! Arena of frozen nodes indexed by id, plus the virtual root's child list.
//! Nodes are held behind `Arc` and never handed out mutably: every mutation
//! builds a replacement node and swaps the arena slot, so unaffected subtrees
//! are shared, not copied. Insertion order is preserved because the wire
//! snapshot enumerates entries in that order.

pub mod read;

use crate::node::{sibling_key, Node, NodeEntry};
use crate::types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;

/// The arena backing one tree instance.
///
/// Exclusively owned by the mutation engine; read-only views borrow it and
/// must never mutate a node in place.
#[derive(Debug, Default)]
pub struct NodeStore {
    nodes: HashMap<NodeId, Arc<Node>>,
    /// Ids in first-insertion order.
    order: Vec<NodeId>,
    /// Children of the implicit root directory.
    root_children: Vec<NodeId>,
}

impl NodeStore {
    pub fn new() -> NodeStore {
        NodeStore::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn entry(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.get(id).map(|n| n.entry())
    }

    /// Top-level child ids under the virtual root.
    pub fn root_children(&self) -> &[NodeId] {
        &self.root_children
    }

    pub(crate) fn set_root_children(&mut self, children: Vec<NodeId>) {
        self.root_children = children;
    }

    /// Children of `parent`, or the root list when `parent` is `None`.
    pub fn children_of(&self, parent: Option<&NodeId>) -> &[NodeId] {
        match parent {
            None => &self.root_children,
            Some(id) => self.nodes.get(id).map(|n| n.children()).unwrap_or(&[]),
        }
    }

    /// Insert or replace a node. A fresh id is appended to the insertion
    /// order; a replacement keeps its original position.
    pub(crate) fn insert(&mut self, node: Node) {
        let id = node.id().clone();
        if self.nodes.insert(id.clone(), Arc::new(node)).is_none() {
            self.order.push(id);
        }
    }

    pub(crate) fn remove(&mut self, id: &NodeId) -> Option<Arc<Node>> {
        let removed = self.nodes.remove(id);
        if removed.is_some() {
            self.order.retain(|o| o != id);
        }
        removed
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.order.clear();
        self.root_children.clear();
    }

    /// All live entries in insertion order (the snapshot enumeration order).
    pub fn entries(&self) -> Vec<NodeEntry> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|n| n.entry().clone())
            .collect()
    }

    /// All live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Re-sort a sibling list by (kind tag, name).
    pub(crate) fn sort_siblings(&self, ids: &mut [NodeId]) {
        ids.sort_by_cached_key(|id| {
            let name = self
                .nodes
                .get(id)
                .map(|n| n.name().to_string())
                .unwrap_or_default();
            sibling_key(id, &name)
        });
    }

    /// Whether `parent` (or the root for `None`) has a child named `name`.
    pub fn child_named(&self, parent: Option<&NodeId>, name: &str) -> Option<&NodeId> {
        self.children_of(parent)
            .iter()
            .find(|id| self.nodes.get(id).map(|n| n.name() == name).unwrap_or(false))
    }
}
