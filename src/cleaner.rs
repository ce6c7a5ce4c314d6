use crate::{
    errors::CakeError,
    layer::{Cake, LayerId, LayerMeta, LayerStream},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::sync::RwLock;

/// Layer graph wrapper that keeps referenced layers alive and collects
/// unused ancestors
///
/// A retained layer is never deleted. Removing an unretained layer also
/// removes its parent if that parent became a leaf, and so on up the chain
/// until an ancestor is retained, still has another child, or can't be
/// inspected.
pub struct ReferenceTracker {
    cake: Arc<dyn Cake>,
    enable_image_cleanup: bool,
    retained: Mutex<HashMap<String, usize>>,
    removal_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl ReferenceTracker {
    pub fn new(cake: Arc<dyn Cake>, enable_image_cleanup: bool) -> Self {
        ReferenceTracker {
            cake,
            enable_image_cleanup,
            retained: Mutex::new(HashMap::new()),
            removal_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Protect a layer from removal until a matching [ReferenceTracker::release]
    pub fn retain(&self, id: &LayerId) {
        let mut retained = self.retained.lock().unwrap_or_else(|e| e.into_inner());
        *retained.entry(id.graph_id()).or_insert(0) += 1;
    }

    /// Drop one retain; a layer is removable again when all are dropped
    pub fn release(&self, id: &LayerId) {
        let graph_id = id.graph_id();
        let mut retained = self.retained.lock().unwrap_or_else(|e| e.into_inner());
        match retained.get_mut(&graph_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                retained.remove(&graph_id);
            }
            None => log::error!("release of layer {} which was never retained", graph_id),
        }
    }

    /// Retain a layer for the lifetime of the returned guard
    pub fn retain_scoped(&self, id: &LayerId) -> Retained<'_> {
        self.retain(id);
        Retained {
            tracker: self,
            id: id.clone(),
        }
    }

    pub fn is_held(&self, id: &LayerId) -> bool {
        let retained = self.retained.lock().unwrap_or_else(|e| e.into_inner());
        retained.contains_key(&id.graph_id())
    }

    fn removal_lock(&self, id: &LayerId) -> Arc<RwLock<()>> {
        let mut locks = self.removal_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(id.graph_id())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Forget the lock of a layer that is gone, unless someone else is
    /// waiting on it
    fn prune_removal_lock(&self, id: &LayerId, lock: Arc<RwLock<()>>) {
        let mut locks = self.removal_locks.lock().unwrap_or_else(|e| e.into_inner());
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&id.graph_id());
        }
    }

    pub fn tracked_locks(&self) -> usize {
        let locks = self.removal_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.len()
    }

    /// Remove a single layer, reporting the parent to continue with if the
    /// cascade should go on
    async fn remove_one(&self, id: &LayerId) -> Result<Option<LayerId>, CakeError> {
        let lock = self.removal_lock(id);
        let write = lock.write().await;

        if self.is_held(id) {
            log::debug!("layer {} is retained, not removing", id);
            return Ok(None);
        }

        let parent = match self.cake.get(id).await {
            Ok(meta) => meta.parent_id(),
            Err(e) => {
                log::warn!("can't look up layer {} before removal: {}", id, e);
                None
            }
        };

        self.cake.remove(id).await?;
        log::info!("removed layer {}", id);
        drop(write);
        self.prune_removal_lock(id, lock);

        let parent = match parent {
            Some(parent) if self.enable_image_cleanup => parent,
            _ => return Ok(None),
        };
        match self.cake.is_leaf(&parent).await {
            Ok(true) => Ok(Some(parent)),
            Ok(false) => Ok(None),
            Err(e) => {
                log::warn!("can't check whether layer {} is a leaf: {}", parent, e);
                Ok(None)
            }
        }
    }
}

/// Guard returned by [ReferenceTracker::retain_scoped]
pub struct Retained<'a> {
    tracker: &'a ReferenceTracker,
    id: LayerId,
}

impl Drop for Retained<'_> {
    fn drop(&mut self) {
        self.tracker.release(&self.id);
    }
}

#[async_trait]
impl Cake for ReferenceTracker {
    async fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> Result<(), CakeError> {
        self.cake.create(id, parent).await
    }

    async fn get(&self, id: &LayerId) -> Result<LayerMeta, CakeError> {
        let lock = self.removal_lock(id);
        let read = lock.read().await;
        let result = self.cake.get(id).await;
        drop(read);
        if let Err(CakeError::LayerNotFound(_)) = result {
            self.prune_removal_lock(id, lock);
        }
        result
    }

    async fn remove(&self, id: &LayerId) -> Result<(), CakeError> {
        let mut next = self.remove_one(id).await?;
        while let Some(ancestor) = next {
            next = match self.remove_one(&ancestor).await {
                Ok(parent) => parent,
                Err(e) => {
                    log::warn!("stopping cleanup at layer {}: {}", ancestor, e);
                    None
                }
            };
        }
        Ok(())
    }

    async fn path(&self, id: &LayerId) -> Result<PathBuf, CakeError> {
        self.cake.path(id).await
    }

    async fn register(&self, meta: LayerMeta, layer: LayerStream) -> Result<(), CakeError> {
        self.cake.register(meta, layer).await
    }

    async fn is_leaf(&self, id: &LayerId) -> Result<bool, CakeError> {
        self.cake.is_leaf(id).await
    }
}
