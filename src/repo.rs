//! Repository Facade
//!
//! Composes the node store, the mutation engine, and one driver behind a
//! single open/close/verb surface. Application code only ever talks to a
//! repository; drivers and the engine's apply handle stay internal. Driver
//! construction goes through the injected factory table; there is no
//! ambient registry.

use crate::change::{ChangeRecord, Patch};
use crate::config::Config;
use crate::driver::{Driver, DriverContext, DriverFactories};
use crate::engine::{MutationEngine, VerbOutcome};
use crate::error::{Result, TreeError};
use crate::node::NodeEntry;
use crate::registry::{AcceptAll, FileTypeRegistry, PayloadCache, Validator};
use crate::types::{IdGenerator, UuidIdGen};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Everything configurable about a repository.
pub struct RepositoryOptions {
    pub config: Config,
    /// Factory name of the backend to drive this repository.
    pub driver: String,
    pub types: FileTypeRegistry,
    /// Schema-validation capability consulted for registered file types.
    pub validator: Arc<dyn Validator>,
    /// Optional read-through payload cache keyed by (id, ctime).
    pub cache: Option<Arc<dyn PayloadCache>>,
    pub idgen: Arc<dyn IdGenerator>,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        RepositoryOptions {
            config: Config::default(),
            driver: "disk".to_string(),
            types: FileTypeRegistry::new(),
            validator: Arc::new(AcceptAll),
            cache: None,
            idgen: Arc::new(UuidIdGen),
        }
    }
}

/// One synchronized tree: store + engine + driver.
pub struct Repository {
    engine: Arc<MutationEngine>,
    driver: Arc<dyn Driver>,
    types: FileTypeRegistry,
    validator: Arc<dyn Validator>,
    cache: Option<Arc<dyn PayloadCache>>,
    opened: AtomicBool,
}

impl Repository {
    /// Build a repository; the driver comes from `factories`.
    pub fn new(options: RepositoryOptions, factories: &DriverFactories) -> Result<Repository> {
        let engine = MutationEngine::new(Arc::clone(&options.idgen));
        let context = DriverContext {
            handle: engine.internal_handle(),
            engine: Arc::clone(&engine),
            config: options.config,
            types: options.types.clone(),
            idgen: options.idgen,
        };
        let driver = factories.create(&options.driver, context)?;
        Ok(Repository {
            engine,
            driver,
            types: options.types,
            validator: options.validator,
            cache: options.cache,
            opened: AtomicBool::new(false),
        })
    }

    /// Wrap an already-built driver (used by the replication layer and tests).
    pub fn with_driver(
        engine: Arc<MutationEngine>,
        driver: Arc<dyn Driver>,
        types: FileTypeRegistry,
    ) -> Repository {
        Repository {
            engine,
            driver,
            types,
            validator: Arc::new(AcceptAll),
            cache: None,
            opened: AtomicBool::new(false),
        }
    }

    /// Populate the store from the backend.
    pub async fn open(&self) -> Result<()> {
        let tx = self.driver.open().await?;
        self.opened.store(true, Ordering::SeqCst);
        info!(tx, "repository opened");
        Ok(())
    }

    /// Persist/disconnect and reset the store.
    pub async fn close(&self) -> Result<()> {
        if self.opened.swap(false, Ordering::SeqCst) {
            self.driver.close().await?;
            debug!("repository closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TreeError::Closed)
        }
    }

    /// Create a directory (no payload) or file (with payload) at `path`,
    /// creating missing intermediate directories.
    pub async fn add(&self, path: &str, data: Option<Value>) -> Result<VerbOutcome> {
        self.ensure_open()?;
        if let Some(value) = &data {
            self.validate_payload(path, value)?;
        }
        self.driver.add(path, data).await
    }

    /// Copy a subtree; the copy gets entirely new ids.
    pub async fn copy(&self, from: &str, to: &str) -> Result<VerbOutcome> {
        self.ensure_open()?;
        self.driver.copy(from, to).await
    }

    /// Move (relink) a node; its id is preserved.
    pub async fn rename(&self, from: &str, to: &str) -> Result<VerbOutcome> {
        self.ensure_open()?;
        self.driver.rename(from, to).await
    }

    /// Remove a node and its descendants.
    pub async fn remove(&self, path: &str) -> Result<VerbOutcome> {
        self.ensure_open()?;
        self.driver.remove(path).await
    }

    /// Overwrite a file payload. `expect`, when given, must match the
    /// current ctime or the write fails with Conflict.
    pub async fn write(&self, path: &str, data: Value, expect: Option<i64>) -> Result<VerbOutcome> {
        self.ensure_open()?;
        self.validate_payload(path, &data)?;
        self.driver.write(path, data, expect).await
    }

    /// Apply an incremental patch against its pre-image ctime.
    pub async fn patch(&self, path: &str, patch: Patch) -> Result<VerbOutcome> {
        self.ensure_open()?;
        self.driver.patch(path, patch).await
    }

    /// Read a file payload, going through the driver (and the optional
    /// cache) when it is not loaded yet.
    pub async fn read(&self, path: &str) -> Result<Value> {
        self.ensure_open()?;
        let loaded = self.engine.with_store(|store| {
            store
                .resolve(path)
                .map(|n| (n.entry().clone(), n.is_directory(), n.data().cloned()))
        });
        let Some((entry, is_dir, data)) = loaded else {
            return Err(TreeError::NotFound(path.to_string()));
        };
        if is_dir {
            return Err(TreeError::InvalidParent(path.to_string()));
        }
        if let Some(value) = data {
            return Ok(value);
        }
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.get(entry.id.as_str(), entry.ctime) {
                debug!(path, "payload served from cache");
                return Ok(value);
            }
        }
        let value = self.driver.load(path).await?;
        if let Some(cache) = &self.cache {
            cache.set(entry.id.as_str(), entry.ctime, value.clone());
        }
        Ok(value)
    }

    /// Subscribe to the change stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeRecord>> {
        self.engine.subscribe()
    }

    /// All entries in store insertion order.
    pub fn entries(&self) -> Vec<NodeEntry> {
        self.engine.with_store(|store| store.entries())
    }

    /// Entries of the children of `path` (`""` for the root).
    pub fn children_of(&self, path: &str) -> Result<Vec<NodeEntry>> {
        self.engine.with_store(|store| {
            let parent = if path.is_empty() {
                None
            } else {
                Some(
                    store
                        .resolve_id(path)
                        .ok_or_else(|| TreeError::NotFound(path.to_string()))?,
                )
            };
            Ok(store
                .children_of(parent.as_ref())
                .iter()
                .filter_map(|id| store.entry(id).cloned())
                .collect())
        })
    }

    /// Entry of the node at `path`.
    pub fn entry(&self, path: &str) -> Option<NodeEntry> {
        self.engine
            .with_store(|store| store.resolve(path).map(|n| n.entry().clone()))
    }

    /// Paths of all files of a registered type, in tree order.
    pub fn files_of_type(&self, type_name: &str) -> Result<Vec<String>> {
        let ftype = self
            .types
            .get(type_name)
            .ok_or_else(|| TreeError::Config(format!("unregistered file type '{}'", type_name)))?;
        Ok(self.engine.with_store(|store| {
            store
                .files_with_suffix(&ftype.suffix)
                .iter()
                .filter_map(|id| store.path_of(id))
                .collect()
        }))
    }

    /// Current transaction counter.
    pub fn tx(&self) -> u64 {
        self.engine.tx()
    }

    pub fn engine(&self) -> &Arc<MutationEngine> {
        &self.engine
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Consult the validation capability for registered file types.
    fn validate_payload(&self, path: &str, value: &Value) -> Result<()> {
        let name = path.rsplit('/').next().unwrap_or(path);
        if let Some(ftype) = self.types.match_name(name) {
            if !self.validator.validate(&ftype.name, value) {
                return Err(TreeError::Invalid(ftype.name));
            }
        }
        Ok(())
    }
}
