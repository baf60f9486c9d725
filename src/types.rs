//! Core identity types: node kinds, tagged node ids, and change-time stamps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a tree node, encoded as the first character of its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeKind {
    /// Directories sort before files in sibling lists.
    Directory,
    File,
}

impl NodeKind {
    /// One-character tag prefixed to every generated id.
    pub fn tag(self) -> char {
        match self {
            NodeKind::Directory => 'd',
            NodeKind::File => 'f',
        }
    }

    /// Recover the kind from an id's leading tag character.
    pub fn from_tag(tag: char) -> Option<NodeKind> {
        match tag {
            'd' => Some(NodeKind::Directory),
            'f' => Some(NodeKind::File),
            _ => None,
        }
    }
}

/// Opaque node identifier: kind tag + generated short id.
///
/// The tag alone determines the node's kind; consumers must never assume
/// anything about the remainder of the string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Build an id from a kind tag and a generated short identifier.
    pub fn tagged(kind: NodeKind, short: &str) -> NodeId {
        let mut s = String::with_capacity(short.len() + 1);
        s.push(kind.tag());
        s.push_str(short);
        NodeId(s)
    }

    /// Parse an id received off the wire or from the index file.
    pub fn parse(raw: &str) -> Option<NodeId> {
        let tag = raw.chars().next()?;
        NodeKind::from_tag(tag)?;
        Some(NodeId(raw.to_string()))
    }

    /// The kind encoded in this id's tag.
    pub fn kind(&self) -> NodeKind {
        // Construction guarantees a valid tag.
        NodeKind::from_tag(self.0.chars().next().unwrap_or('f')).unwrap_or(NodeKind::File)
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == NodeKind::Directory
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pluggable short-id source behind [`NodeId`] generation.
///
/// The engine retries on collision, so implementations only need a reasonable
/// spread, not global uniqueness.
pub trait IdGenerator: Send + Sync {
    fn short_id(&self) -> String;
}

/// Default generator: the first segment of a v4 UUID.
#[derive(Debug, Default)]
pub struct UuidIdGen;

impl IdGenerator for UuidIdGen {
    fn short_id(&self) -> String {
        let hyphenated = uuid::Uuid::new_v4().to_string();
        hyphenated[..8].to_string()
    }
}

/// Current wall-clock change-time in epoch milliseconds.
///
/// ctimes are an optimistic-concurrency token, not a wall-clock guarantee:
/// the engine bumps past a node's previous ctime when the clock stalls.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tag_round_trips() {
        assert_eq!(NodeKind::from_tag('d'), Some(NodeKind::Directory));
        assert_eq!(NodeKind::from_tag('f'), Some(NodeKind::File));
        assert_eq!(NodeKind::from_tag('x'), None);
    }

    #[test]
    fn parse_rejects_unknown_tag() {
        assert!(NodeId::parse("zabc").is_none());
        assert!(NodeId::parse("").is_none());
        assert!(NodeId::parse("d1234").is_some());
    }

    proptest! {
        #[test]
        fn generated_ids_carry_their_kind(short in "[a-z0-9]{4,12}") {
            let dir = NodeId::tagged(NodeKind::Directory, &short);
            let file = NodeId::tagged(NodeKind::File, &short);
            prop_assert_eq!(dir.kind(), NodeKind::Directory);
            prop_assert_eq!(file.kind(), NodeKind::File);
            prop_assert!(dir.as_str().starts_with('d'));
            prop_assert!(file.as_str().starts_with('f'));
        }
    }
}
