//! Treedb: Synchronized Hierarchical JSON Document Store
//!
//! A virtual file tree of named directories and files, each file carrying a
//! JSON payload, mutated through a small transactional verb set and
//! replicated in near-real-time between one authoritative backing store and
//! any number of remote mirrors. The disk driver persists the tree as real
//! directories and files while keeping node identity stable across restarts.

pub mod change;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod logging;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod repo;
pub mod store;
pub mod types;

pub use change::{ChangeOp, ChangeRecord, Patch, PatchOp, PatchVerb};
pub use config::Config;
pub use driver::{Driver, DriverFactories};
pub use engine::{MutationEngine, VerbOutcome};
pub use error::{Result, TreeError};
pub use node::NodeEntry;
pub use repo::{Repository, RepositoryOptions};
pub use types::{NodeId, NodeKind};
