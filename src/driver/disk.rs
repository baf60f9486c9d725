//! Disk Driver
//!
//! Persists the tree as real directories and files under one backing root.
//! Node identity survives restarts through the id index file
//! (`{ rid, node: { relativePath: nodeId } }`); ids, not paths, are the
//! foreign keys used by caching and replication. All verbs run through the
//! driver's FIFO [`OpQueue`], so backing I/O and the store apply/publish of
//! one operation finish before the next begins.

use super::queue::OpQueue;
use super::{Driver, DriverContext};
use crate::change::Patch;
use crate::engine::{ApplyHandle, BuildNode, MutationEngine, VerbOutcome};
use crate::error::{Result, TreeError};
use crate::node::NodeEntry;
use crate::registry::FileTypeRegistry;
use crate::store::read::PathCache;
use crate::types::{now_ms, IdGenerator, NodeId, NodeKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// Persisted id index: path -> id plus a stable resource id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IdIndex {
    rid: String,
    node: HashMap<String, String>,
}

struct DiskInner {
    root: PathBuf,
    index_path: Option<PathBuf>,
    engine: Arc<MutationEngine>,
    handle: ApplyHandle,
    types: FileTypeRegistry,
    idgen: Arc<dyn IdGenerator>,
    /// Resource id, loaded from the index or generated at first open.
    rid: Mutex<Option<String>>,
}

/// Filesystem-backed driver.
pub struct DiskDriver {
    inner: Arc<DiskInner>,
    queue: OpQueue,
}

impl DiskDriver {
    pub fn new(context: DriverContext) -> DiskDriver {
        let index_path = context.config.index_path();
        DiskDriver {
            inner: Arc::new(DiskInner {
                root: context.config.data.clone(),
                index_path,
                engine: context.engine,
                handle: context.handle,
                types: context.types,
                idgen: context.idgen,
                rid: Mutex::new(None),
            }),
            queue: OpQueue::new(),
        }
    }
}

#[async_trait]
impl Driver for DiskDriver {
    async fn open(&self) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        std::fs::create_dir_all(&inner.root)?;

        let index = inner.load_index();
        *inner.rid.lock() = Some(
            index
                .as_ref()
                .map(|i| i.rid.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        let known: HashMap<String, String> = index.map(|i| i.node).unwrap_or_default();

        let nodes = inner.scan(&known)?;
        info!(
            root = %inner.root.display(),
            count = nodes.len(),
            "disk driver opened"
        );
        inner.handle.build(nodes, 0)?;
        self.queue.start();
        Ok(0)
    }

    async fn close(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.queue
            .run(async move {
                inner.persist_index()?;
                inner.handle.clear();
                Ok(())
            })
            .await?;
        self.queue.stop().await;
        debug!("disk driver closed");
        Ok(())
    }

    async fn add(&self, path: &str, data: Option<Value>) -> Result<VerbOutcome> {
        let inner = Arc::clone(&self.inner);
        let path = path.to_string();
        self.queue
            .run(async move {
                let prepared = inner.engine.prepare_add(&path, data.clone())?;
                let full = inner.root.join(&path);
                match &data {
                    None => std::fs::create_dir_all(&full)?,
                    Some(value) => {
                        if let Some(parent) = full.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        write_json(&full, value)?;
                    }
                }
                inner.handle.apply(prepared)
            })
            .await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<VerbOutcome> {
        let inner = Arc::clone(&self.inner);
        let (from, to) = (from.to_string(), to.to_string());
        self.queue
            .run(async move {
                let prepared = inner.engine.prepare_copy(&from, &to)?;
                let src = inner.root.join(&from);
                let dest = inner.disk_path_for(prepared.outcome(), prepared.record().added.as_deref())?;
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                copy_recursive(&src, &dest)?;
                inner.handle.apply(prepared)
            })
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<VerbOutcome> {
        let inner = Arc::clone(&self.inner);
        let (from, to) = (from.to_string(), to.to_string());
        self.queue
            .run(async move {
                let prepared = inner.engine.prepare_move(&from, &to)?;
                let src = inner.root.join(&from);
                let dest = inner.disk_path_for(prepared.outcome(), prepared.record().added.as_deref())?;
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&src, &dest)?;
                inner.handle.apply(prepared)
            })
            .await
    }

    async fn remove(&self, path: &str) -> Result<VerbOutcome> {
        let inner = Arc::clone(&self.inner);
        let path = path.to_string();
        self.queue
            .run(async move {
                let prepared = inner.engine.prepare_remove(&path)?;
                let full = inner.root.join(&path);
                if full.is_dir() {
                    std::fs::remove_dir_all(&full)?;
                } else if full.exists() {
                    std::fs::remove_file(&full)?;
                }
                inner.handle.apply(prepared)
            })
            .await
    }

    async fn write(&self, path: &str, data: Value, expect: Option<i64>) -> Result<VerbOutcome> {
        let inner = Arc::clone(&self.inner);
        let path = path.to_string();
        self.queue
            .run(async move {
                inner.ensure_payload_loaded(&path)?;
                match inner.engine.prepare_write(&path, data.clone(), expect)? {
                    None => inner.current_outcome(&path),
                    Some(prepared) => {
                        write_json(&inner.root.join(&path), &data)?;
                        inner.handle.apply(prepared)
                    }
                }
            })
            .await
    }

    async fn patch(&self, path: &str, patch: Patch) -> Result<VerbOutcome> {
        let inner = Arc::clone(&self.inner);
        let path = path.to_string();
        self.queue
            .run(async move {
                inner.ensure_payload_loaded(&path)?;
                match inner.engine.prepare_patch(&path, patch)? {
                    None => inner.current_outcome(&path),
                    Some(prepared) => {
                        let patched = prepared
                            .file_payload()
                            .cloned()
                            .ok_or_else(|| TreeError::NotFound(path.clone()))?;
                        write_json(&inner.root.join(&path), &patched)?;
                        inner.handle.apply(prepared)
                    }
                }
            })
            .await
    }

    async fn load(&self, path: &str) -> Result<Value> {
        let inner = Arc::clone(&self.inner);
        let path = path.to_string();
        self.queue
            .run(async move {
                if let Some(value) = inner.cached_payload(&path)? {
                    return Ok(value);
                }
                inner.read_payload_from_disk(&path)
            })
            .await
    }
}

impl DiskInner {
    fn load_index(&self) -> Option<IdIndex> {
        let path = self.index_path.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<IdIndex>(&raw) {
            Ok(index) => Some(index),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "id index unreadable; regenerating ids");
                None
            }
        }
    }

    /// Enumerate the backing directory, sorted so parents always precede
    /// children, assigning stable ids from the index where possible.
    fn scan(&self, known: &HashMap<String, String>) -> Result<Vec<BuildNode>> {
        let mut nodes = Vec::new();
        let mut by_path: HashMap<String, NodeId> = HashMap::new();
        let mut used: HashSet<NodeId> = HashSet::new();

        let walker = walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name();
        for item in walker {
            let item = item.map_err(|e| {
                TreeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            let rel = match item.path().strip_prefix(&self.root) {
                Ok(rel) => rel_string(rel),
                Err(_) => continue,
            };
            if self
                .index_path
                .as_ref()
                .map(|p| item.path() == p)
                .unwrap_or(false)
            {
                continue;
            }

            let kind = if item.file_type().is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            };
            let id = self.stable_id(known, &rel, kind, &mut used);
            let name = item.file_name().to_string_lossy().to_string();
            let parent_id = parent_of(&rel).and_then(|p| by_path.get(p).cloned());
            let ctime = item
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or_else(now_ms);

            let data = if kind == NodeKind::File && self.types.is_registered(&name) {
                match std::fs::read_to_string(item.path())
                    .map_err(TreeError::Io)
                    .and_then(|raw| serde_json::from_str(&raw).map_err(TreeError::Codec))
                {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(path = rel, error = %err, "eager parse failed; leaving unloaded");
                        None
                    }
                }
            } else {
                None
            };

            by_path.insert(rel.clone(), id.clone());
            nodes.push(BuildNode {
                entry: NodeEntry {
                    id,
                    name,
                    ctime,
                    parent_id,
                },
                data,
            });
        }
        Ok(nodes)
    }

    /// Reuse the indexed id for a path when its kind tag still matches.
    fn stable_id(
        &self,
        known: &HashMap<String, String>,
        rel: &str,
        kind: NodeKind,
        used: &mut HashSet<NodeId>,
    ) -> NodeId {
        if let Some(raw) = known.get(rel) {
            if let Some(id) = NodeId::parse(raw) {
                if id.kind() == kind && !used.contains(&id) {
                    used.insert(id.clone());
                    return id;
                }
            }
            warn!(path = rel, id = raw, "indexed id unusable; regenerating");
        }
        loop {
            let id = NodeId::tagged(kind, &self.idgen.short_id());
            if used.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Write the id index so the next open reconstructs identical ids.
    fn persist_index(&self) -> Result<()> {
        let Some(path) = &self.index_path else {
            return Ok(());
        };
        let rid = self
            .rid
            .lock()
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let node = self.engine.with_store(|store| {
            let mut cache = PathCache::new();
            let mut map = HashMap::new();
            for entry in store.entries() {
                if let Some(rel) = store.path_of_cached(&entry.id, &mut cache) {
                    map.insert(rel, entry.id.as_str().to_string());
                }
            }
            map
        });
        let index = IdIndex { rid, node };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&index)?)?;
        debug!(path = %path.display(), count = index.node.len(), "id index persisted");
        Ok(())
    }

    /// Disk path of an entry that may hang off nodes created in the same
    /// prepared change (climbs `added` before the live store).
    fn disk_path_for(&self, entry: &NodeEntry, added: Option<&[NodeEntry]>) -> Result<PathBuf> {
        let added_by_id: HashMap<&NodeId, &NodeEntry> = added
            .unwrap_or(&[])
            .iter()
            .map(|e| (&e.id, e))
            .collect();
        let mut segments = vec![entry.name.clone()];
        let mut cursor = entry.parent_id.clone();
        while let Some(id) = cursor {
            if let Some(pending) = added_by_id.get(&id) {
                segments.push(pending.name.clone());
                cursor = pending.parent_id.clone();
                continue;
            }
            let (name, parent) = self.engine.with_store(|store| {
                store
                    .entry(&id)
                    .map(|e| (e.name.clone(), e.parent_id.clone()))
                    .ok_or_else(|| TreeError::NotFound(id.to_string()))
            })?;
            segments.push(name);
            cursor = parent;
        }
        segments.reverse();
        let mut path = self.root.clone();
        for segment in segments {
            path.push(segment);
        }
        Ok(path)
    }

    /// Read a lazy file payload into the store before a write/patch so the
    /// engine can diff against it.
    fn ensure_payload_loaded(&self, path: &str) -> Result<()> {
        let state = self.engine.with_store(|store| {
            store
                .resolve(path)
                .map(|n| (n.id().clone(), n.is_directory(), n.data().is_some()))
        });
        match state {
            Some((_, true, _)) | None => Ok(()), // Engine reports the error.
            Some((_, false, true)) => Ok(()),
            Some((id, false, false)) => {
                let full = self.root.join(path);
                if !full.exists() {
                    return Ok(());
                }
                let raw = std::fs::read_to_string(&full)?;
                let value: Value = serde_json::from_str(&raw)?;
                self.handle.set_file_data(&id, Some(value))
            }
        }
    }

    fn cached_payload(&self, path: &str) -> Result<Option<Value>> {
        self.engine.with_store(|store| {
            let node = store
                .resolve(path)
                .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
            if node.is_directory() {
                return Err(TreeError::InvalidParent(path.to_string()));
            }
            Ok(node.data().cloned())
        })
    }

    fn read_payload_from_disk(&self, path: &str) -> Result<Value> {
        let id = self
            .engine
            .with_store(|store| store.resolve_id(path))
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        let raw = std::fs::read_to_string(self.root.join(path))?;
        let value: Value = serde_json::from_str(&raw)?;
        self.handle.set_file_data(&id, Some(value.clone()))?;
        Ok(value)
    }

    /// Outcome for a no-op verb: the current entry and tx, unchanged.
    fn current_outcome(&self, path: &str) -> Result<VerbOutcome> {
        let entry = self
            .engine
            .with_store(|store| store.resolve(path).map(|n| n.entry().clone()))
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        Ok(VerbOutcome {
            entry,
            tx: self.engine.tx(),
        })
    }
}

fn rel_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_of(rel: &str) -> Option<&str> {
    rel.rsplit_once('/').map(|(parent, _)| parent)
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

fn copy_recursive(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dest)?;
        for item in std::fs::read_dir(src)? {
            let item = item?;
            copy_recursive(&item.path(), &dest.join(item.file_name()))?;
        }
    } else {
        std::fs::copy(src, dest)?;
    }
    Ok(())
}
