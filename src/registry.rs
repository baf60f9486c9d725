//! File-type registration and pluggable capabilities.
//!
//! The core never depends on a concrete schema engine or cache: both are
//! consumed through the narrow traits here and injected at repository
//! construction.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered file type: a logical name plus the file-name suffix that
/// identifies it on disk (e.g. `.db.json`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileType {
    pub name: String,
    pub suffix: String,
}

/// Registry of file types.
///
/// A matching suffix is what makes the disk driver eagerly parse a file at
/// open; unrecognized files stay unread until requested.
#[derive(Clone, Default)]
pub struct FileTypeRegistry {
    types: Arc<RwLock<HashMap<String, FileType>>>,
}

impl FileTypeRegistry {
    pub fn new() -> FileTypeRegistry {
        FileTypeRegistry::default()
    }

    pub fn register(&self, name: &str, suffix: &str) {
        let ftype = FileType {
            name: name.to_string(),
            suffix: suffix.to_string(),
        };
        self.types.write().insert(name.to_string(), ftype);
    }

    pub fn get(&self, name: &str) -> Option<FileType> {
        self.types.read().get(name).cloned()
    }

    /// The registered type whose suffix matches `file_name`, if any.
    pub fn match_name(&self, file_name: &str) -> Option<FileType> {
        self.types
            .read()
            .values()
            .find(|t| file_name.ends_with(&t.suffix))
            .cloned()
    }

    /// Whether `file_name` belongs to any registered type.
    pub fn is_registered(&self, file_name: &str) -> bool {
        self.match_name(file_name).is_some()
    }

    pub fn all(&self) -> Vec<FileType> {
        self.types.read().values().cloned().collect()
    }
}

/// Schema-validation capability: `validate(type_name, value)`.
///
/// Implemented by an external, swappable component; the repository consults
/// it before accepting a payload for a registered file type.
pub trait Validator: Send + Sync {
    fn validate(&self, type_name: &str, value: &Value) -> bool;
}

/// A validator that accepts everything; the default when none is injected.
#[derive(Debug, Default)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate(&self, _type_name: &str, _value: &Value) -> bool {
        true
    }
}

/// Read-through payload cache capability, keyed by entry id and change-time.
///
/// The ctime key makes stale entries unreachable without explicit
/// invalidation: a mutated file gets a new ctime and therefore a new key.
pub trait PayloadCache: Send + Sync {
    fn get(&self, id: &str, ctime: i64) -> Option<Value>;
    fn set(&self, id: &str, ctime: i64, value: Value);
    fn delete(&self, id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn suffix_match_picks_registered_type() {
        let registry = FileTypeRegistry::new();
        registry.register("db", ".db.json");
        registry.register("view", ".view.json");

        assert_eq!(registry.match_name("users.db.json").unwrap().name, "db");
        assert_eq!(registry.match_name("list.view.json").unwrap().name, "view");
        assert!(registry.match_name("readme.txt").is_none());
    }

    #[test]
    fn accept_all_validator_accepts() {
        assert!(AcceptAll.validate("anything", &json!({"x": 1})));
    }
}
