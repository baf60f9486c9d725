//! Backend drivers.
//!
//! A driver implements the actual I/O behind the verb API: the disk driver
//! persists the tree as real directories and files, the mirror driver
//! forwards verbs to a remote authority. Lifecycle is
//! `constructed -> open() -> verbs -> close()`: `open()` must populate the
//! node store before returning, `close()` persists/disconnects and clears it.
//! Drivers are the only holders of the engine's [`ApplyHandle`].

pub mod disk;
pub mod queue;

use crate::change::Patch;
use crate::config::Config;
use crate::engine::{ApplyHandle, MutationEngine, VerbOutcome};
use crate::error::{Result, TreeError};
use crate::registry::FileTypeRegistry;
use crate::types::IdGenerator;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The verb surface a concrete backend must implement.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Populate the store from the backing state. Returns the tx the store
    /// starts at.
    async fn open(&self) -> Result<u64>;

    /// Persist/disconnect, then reset the store.
    async fn close(&self) -> Result<()>;

    async fn add(&self, path: &str, data: Option<Value>) -> Result<VerbOutcome>;
    async fn copy(&self, from: &str, to: &str) -> Result<VerbOutcome>;
    /// The move verb.
    async fn rename(&self, from: &str, to: &str) -> Result<VerbOutcome>;
    async fn remove(&self, path: &str) -> Result<VerbOutcome>;
    async fn write(&self, path: &str, data: Value, expect: Option<i64>) -> Result<VerbOutcome>;
    async fn patch(&self, path: &str, patch: Patch) -> Result<VerbOutcome>;

    /// Load a file payload that was not eagerly parsed at open, filling the
    /// node's data slot as a side effect.
    async fn load(&self, path: &str) -> Result<Value>;
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Driver")
    }
}

/// Everything a factory needs to build a driver.
#[derive(Clone)]
pub struct DriverContext {
    pub engine: Arc<MutationEngine>,
    pub handle: ApplyHandle,
    pub config: Config,
    pub types: FileTypeRegistry,
    pub idgen: Arc<dyn IdGenerator>,
}

/// One driver constructor.
pub type DriverFactory = Box<dyn Fn(DriverContext) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Explicit factory table injected into the repository at construction.
///
/// Replaces any notion of a global driver registry: the set of available
/// backends is exactly what the caller registered.
#[derive(Default)]
pub struct DriverFactories {
    factories: HashMap<String, DriverFactory>,
}

impl DriverFactories {
    pub fn new() -> DriverFactories {
        DriverFactories::default()
    }

    pub fn register(&mut self, name: &str, factory: DriverFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str, context: DriverContext) -> Result<Arc<dyn Driver>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TreeError::Config(format!("no driver factory named '{}'", name)))?;
        factory(context)
    }

    /// The standard table: the disk driver under `"disk"` and the
    /// remote-proxy driver under `"mirror"`.
    pub fn standard() -> DriverFactories {
        let mut table = DriverFactories::new();
        table.register(
            "disk",
            Box::new(|ctx| Ok(Arc::new(disk::DiskDriver::new(ctx)) as Arc<dyn Driver>)),
        );
        table.register(
            "mirror",
            Box::new(|ctx| {
                Ok(Arc::new(crate::protocol::mirror::MirrorDriver::new(ctx)?) as Arc<dyn Driver>)
            }),
        );
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UuidIdGen;

    fn context() -> DriverContext {
        let engine = MutationEngine::for_tests();
        DriverContext {
            handle: engine.internal_handle(),
            engine,
            config: Config::default(),
            types: FileTypeRegistry::new(),
            idgen: Arc::new(UuidIdGen),
        }
    }

    #[test]
    fn unknown_factory_name_is_config_error() {
        let table = DriverFactories::standard();
        let err = table.create("carrier-pigeon", context()).unwrap_err();
        assert!(matches!(err, TreeError::Config(_)));
    }

    #[test]
    fn standard_table_builds_disk_driver() {
        let table = DriverFactories::standard();
        assert!(table.create("disk", context()).is_ok());
    }
}
