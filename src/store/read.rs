//! Read-only tree operations: path resolution, traversal, and queries.
//!
//! Everything here borrows the arena immutably. Traversal is iterative
//! depth-first pre-order with an explicit stack so arbitrarily deep trees
//! never risk stack exhaustion.

use super::NodeStore;
use crate::node::Node;
use crate::types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Visitor verdict for [`NodeStore::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Descend into this node's children.
    Continue,
    /// Skip this node's subtree, keep walking siblings.
    SkipSubtree,
    /// Stop the whole traversal.
    Abort,
}

/// Longest-prefix match of a candidate path against the tree.
#[derive(Debug, Clone)]
pub struct PathMatch {
    /// Deepest existing node along the path; `None` when nothing below the
    /// root matched.
    pub deepest: Option<NodeId>,
    /// Index into the segment list at which existing nodes stop. Equal to
    /// the segment count when the full path resolves.
    pub matched: usize,
}

/// Transient id -> path memo used within one traversal.
#[derive(Debug, Default)]
pub struct PathCache {
    paths: HashMap<NodeId, String>,
}

impl PathCache {
    pub fn new() -> PathCache {
        PathCache::default()
    }
}

impl NodeStore {
    /// Split a `/`-separated path into non-empty segments.
    pub fn split_path(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Resolve a path to its node, walking children-by-name from the root.
    pub fn resolve(&self, path: &str) -> Option<&Arc<Node>> {
        self.resolve_id(path).and_then(|id| self.get(&id))
    }

    /// Resolve a path to its node id.
    pub fn resolve_id(&self, path: &str) -> Option<NodeId> {
        let segments = Self::split_path(path);
        if segments.is_empty() {
            return None;
        }
        let m = self.max_path_match(&segments);
        if m.matched == segments.len() {
            m.deepest
        } else {
            None
        }
    }

    /// Longest-prefix match: walk `segments` from the root and report the
    /// deepest existing node plus the index where existing nodes stop. The
    /// basis for creating missing intermediate directories.
    pub fn max_path_match(&self, segments: &[&str]) -> PathMatch {
        let mut current: Option<NodeId> = None;
        let mut matched = 0;
        for segment in segments {
            // Only directories (or the root) can have children.
            if let Some(id) = &current {
                if !id.is_directory() {
                    break;
                }
            }
            match self.child_named(current.as_ref(), segment) {
                Some(child) => {
                    current = Some(child.clone());
                    matched += 1;
                }
                None => break,
            }
        }
        PathMatch {
            deepest: current,
            matched,
        }
    }

    /// Depth-first pre-order walk over the whole tree.
    ///
    /// The visitor receives each node once, parents before children and
    /// siblings in their sorted order.
    pub fn walk<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<Node>) -> Visit,
    {
        let mut stack: Vec<NodeId> = self.root_children().iter().rev().cloned().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.get(&id) else {
                continue;
            };
            match visit(node) {
                Visit::Abort => return,
                Visit::SkipSubtree => continue,
                Visit::Continue => {
                    for child in node.children().iter().rev() {
                        stack.push(child.clone());
                    }
                }
            }
        }
    }

    /// Depth-first pre-order walk of one subtree, visiting `start` first.
    pub fn walk_from<F>(&self, start: &NodeId, mut visit: F)
    where
        F: FnMut(&Arc<Node>) -> Visit,
    {
        let mut stack = vec![start.clone()];
        while let Some(id) = stack.pop() {
            let Some(node) = self.get(&id) else {
                continue;
            };
            match visit(node) {
                Visit::Abort => return,
                Visit::SkipSubtree => continue,
                Visit::Continue => {
                    for child in node.children().iter().rev() {
                        stack.push(child.clone());
                    }
                }
            }
        }
    }

    /// All descendant ids of `id`, each descendant preceding its parent.
    ///
    /// This child-to-parent order is what remove records in `removed`, so a
    /// replica replaying it never references an already-detached parent.
    pub fn descendants_child_first(&self, id: &NodeId) -> Vec<NodeId> {
        let mut pre_order = Vec::new();
        self.walk_from(id, |node| {
            pre_order.push(node.id().clone());
            Visit::Continue
        });
        pre_order.reverse();
        pre_order
    }

    /// Compute the `/`-joined path of a node by climbing its parents.
    pub fn path_of(&self, id: &NodeId) -> Option<String> {
        let mut segments = Vec::new();
        let mut cursor = id.clone();
        loop {
            let node = self.get(&cursor)?;
            segments.push(node.name().to_string());
            match &node.entry().parent_id {
                Some(parent) => cursor = parent.clone(),
                None => break,
            }
        }
        segments.reverse();
        Some(segments.join("/"))
    }

    /// Memoized variant of [`path_of`] for repeated lookups in one pass.
    pub fn path_of_cached(&self, id: &NodeId, cache: &mut PathCache) -> Option<String> {
        if let Some(path) = cache.paths.get(id) {
            return Some(path.clone());
        }
        let path = self.path_of(id)?;
        cache.paths.insert(id.clone(), path.clone());
        Some(path)
    }

    /// Whether `candidate` is `ancestor` itself or lies inside its subtree.
    pub fn is_within(&self, ancestor: &NodeId, candidate: &NodeId) -> bool {
        let mut cursor = Some(candidate.clone());
        while let Some(id) = cursor {
            if &id == ancestor {
                return true;
            }
            cursor = self.get(&id).and_then(|n| n.entry().parent_id.clone());
        }
        false
    }

    /// Ids of all files whose name ends with `suffix`, in tree order.
    pub fn files_with_suffix(&self, suffix: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk(|node| {
            if !node.is_directory() && node.name().ends_with(suffix) {
                out.push(node.id().clone());
            }
            Visit::Continue
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MutationEngine;
    use serde_json::json;

    fn seeded() -> std::sync::Arc<MutationEngine> {
        let engine = MutationEngine::for_tests();
        engine
            .apply_prepared(engine.prepare_add("a/b/c.json", Some(json!({"x": 1}))).unwrap())
            .unwrap();
        engine
            .apply_prepared(engine.prepare_add("a/d", None).unwrap())
            .unwrap();
        engine
    }

    #[test]
    fn resolve_walks_children_by_name() {
        let engine = seeded();
        engine.with_store(|store| {
            assert!(store.resolve("a/b/c.json").is_some());
            assert!(store.resolve("a/b").unwrap().is_directory());
            assert!(store.resolve("a/x").is_none());
            assert!(store.resolve("").is_none());
        });
    }

    #[test]
    fn max_path_match_reports_deepest_prefix() {
        let engine = seeded();
        engine.with_store(|store| {
            let segments = vec!["a", "b", "new", "leaf.json"];
            let m = store.max_path_match(&segments);
            assert_eq!(m.matched, 2);
            let deepest = m.deepest.unwrap();
            assert_eq!(store.path_of(&deepest).unwrap(), "a/b");
        });
    }

    #[test]
    fn walk_is_preorder_and_skip_prunes() {
        let engine = seeded();
        engine.with_store(|store| {
            let mut seen = Vec::new();
            store.walk(|node| {
                seen.push(node.name().to_string());
                if node.name() == "b" {
                    Visit::SkipSubtree
                } else {
                    Visit::Continue
                }
            });
            assert!(seen.contains(&"a".to_string()));
            assert!(seen.contains(&"b".to_string()));
            assert!(!seen.contains(&"c.json".to_string()));
        });
    }

    #[test]
    fn walk_abort_stops_everything() {
        let engine = seeded();
        engine.with_store(|store| {
            let mut count = 0;
            store.walk(|_| {
                count += 1;
                Visit::Abort
            });
            assert_eq!(count, 1);
        });
    }

    #[test]
    fn descendants_are_child_first() {
        let engine = seeded();
        engine.with_store(|store| {
            let a = store.resolve_id("a").unwrap();
            let order = store.descendants_child_first(&a);
            assert_eq!(order.len(), 4);
            // The directory itself comes last.
            assert_eq!(order.last().unwrap(), &a);
            let b = store.resolve_id("a/b").unwrap();
            let c = store.resolve_id("a/b/c.json").unwrap();
            let b_pos = order.iter().position(|id| id == &b).unwrap();
            let c_pos = order.iter().position(|id| id == &c).unwrap();
            assert!(c_pos < b_pos);
        });
    }

    #[test]
    fn path_cache_returns_same_path() {
        let engine = seeded();
        engine.with_store(|store| {
            let id = store.resolve_id("a/b/c.json").unwrap();
            let mut cache = PathCache::new();
            let first = store.path_of_cached(&id, &mut cache).unwrap();
            let second = store.path_of_cached(&id, &mut cache).unwrap();
            assert_eq!(first, "a/b/c.json");
            assert_eq!(first, second);
        });
    }
}
