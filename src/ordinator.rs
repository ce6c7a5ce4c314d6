use crate::{
    cleaner::ReferenceTracker,
    creator::{ContainerRootfs, LayerCreator},
    errors::CakeError,
    fetcher::ImageFetcher,
    layer::{Cake, LayerId},
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Which bytes count against a container's disk quota
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaScope {
    /// image layers and the container's own writes
    Total,
    /// only the container's own writes; fetching the image is not limited
    Exclusive,
}

impl Default for QuotaScope {
    fn default() -> Self {
        QuotaScope::Total
    }
}

/// What a container's root filesystem should be built from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootfsSpec {
    /// local directory, or `docker://[host[:port]]/repo[#tag]`
    pub rootfs: String,
    /// build on a copy of the image with translated file ownership
    pub namespaced: bool,
    pub quota_size: u64,
    pub quota_scope: QuotaScope,
}

impl RootfsSpec {
    fn fetch_budget(&self) -> u64 {
        match self.quota_scope {
            QuotaScope::Total => self.quota_size,
            QuotaScope::Exclusive => u64::MAX,
        }
    }
}

/// Entry point for building and removing container root filesystems
///
/// Creation of any number of containers runs concurrently, but never
/// overlaps with a removal, so garbage collection can't delete a layer
/// between a fetch finding it and a container being created on it.
pub struct CakeOrdinator {
    tracker: Arc<ReferenceTracker>,
    fetcher: Arc<dyn ImageFetcher>,
    creator: LayerCreator,
    lock: RwLock<()>,
}

impl CakeOrdinator {
    pub fn new(
        tracker: Arc<ReferenceTracker>,
        fetcher: Arc<dyn ImageFetcher>,
        creator: LayerCreator,
    ) -> Self {
        CakeOrdinator {
            tracker,
            fetcher,
            creator,
            lock: RwLock::new(()),
        }
    }

    pub async fn create(
        &self,
        container_id: &str,
        spec: &RootfsSpec,
        cancel: &CancellationToken,
    ) -> Result<ContainerRootfs, CakeError> {
        let _read = self.lock.read().await;
        log::debug!("creating rootfs for {} from {}", container_id, spec.rootfs);
        let image = self
            .fetcher
            .fetch(&spec.rootfs, spec.fetch_budget(), cancel)
            .await?;
        self.creator
            .create(container_id, image, spec.namespaced)
            .await
    }

    pub async fn remove(&self, id: &LayerId) -> Result<(), CakeError> {
        let _write = self.lock.write().await;
        self.tracker.remove(id).await
    }

    /// Keep a layer, and so its ancestors, from being collected
    pub fn retain(&self, id: &LayerId) {
        self.tracker.retain(id);
    }
}
