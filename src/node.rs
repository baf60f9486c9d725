//! Tree node records: entries, directories, and files.
//!
//! Nodes are deeply immutable once published into the store. Every mutation
//! produces a replacement node and swaps the arena slot; readers holding an
//! `Arc<Node>` keep a consistent snapshot.

use crate::types::{NodeId, NodeKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Public, read-only projection of a node's identity and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    pub name: String,
    /// Change-time token in epoch milliseconds, strictly increasing per
    /// mutation to this node.
    pub ctime: i64,
    /// Absent for top-level nodes under the virtual root.
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
}

impl NodeEntry {
    pub fn kind(&self) -> NodeKind {
        self.id.kind()
    }
}

/// A directory and its ordered child ids.
#[derive(Debug, Clone)]
pub struct DirectoryNode {
    pub entry: NodeEntry,
    /// Sorted by (kind tag, name): directories group before files.
    pub children: Vec<NodeId>,
}

/// A file and its optional JSON payload.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub entry: NodeEntry,
    /// Absent until loaded through the driver (lazy-load boundary).
    pub data: Option<Value>,
}

/// Any node in the arena.
#[derive(Debug, Clone)]
pub enum Node {
    Directory(DirectoryNode),
    File(FileNode),
}

impl Node {
    pub fn entry(&self) -> &NodeEntry {
        match self {
            Node::Directory(d) => &d.entry,
            Node::File(f) => &f.entry,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.entry().id
    }

    pub fn name(&self) -> &str {
        &self.entry().name
    }

    pub fn kind(&self) -> NodeKind {
        self.entry().kind()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    /// Child ids for directories, empty for files.
    pub fn children(&self) -> &[NodeId] {
        match self {
            Node::Directory(d) => &d.children,
            Node::File(_) => &[],
        }
    }

    /// The file payload, if this is a loaded file.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Node::Directory(_) => None,
            Node::File(f) => f.data.as_ref(),
        }
    }

    /// Clone with a rewritten entry, keeping children/payload.
    pub(crate) fn with_entry(&self, entry: NodeEntry) -> Node {
        match self {
            Node::Directory(d) => Node::Directory(DirectoryNode {
                entry,
                children: d.children.clone(),
            }),
            Node::File(f) => Node::File(FileNode {
                entry,
                data: f.data.clone(),
            }),
        }
    }
}

/// Sibling ordering key: kind tag first, then name.
///
/// The tag characters sort directories (`d`) before files (`f`), which gives
/// the deterministic type-grouped ordering the wire snapshot relies on.
pub fn sibling_key(id: &NodeId, name: &str) -> (char, String) {
    (id.kind().tag(), name.to_string())
}
