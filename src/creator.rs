use crate::{
    errors::CakeError,
    fetcher::Image,
    layer::{Cake, LayerId},
    lock::LayerLock,
    namespace::Namespacer,
};
use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

/// A container's root filesystem, ready to use
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerRootfs {
    pub path: PathBuf,
    pub env: HashMap<String, String>,
}

/// Builds container layers on top of fetched images
pub struct LayerCreator {
    cake: Arc<dyn Cake>,
    namespacer: Arc<dyn Namespacer>,
    locks: LayerLock,
}

impl LayerCreator {
    pub fn new(cake: Arc<dyn Cake>, namespacer: Arc<dyn Namespacer>) -> Self {
        LayerCreator {
            cake,
            namespacer,
            locks: LayerLock::new(),
        }
    }

    pub async fn create(
        &self,
        container_id: &str,
        image: Image,
        should_namespace: bool,
    ) -> Result<ContainerRootfs, CakeError> {
        let mut parent = LayerId::DockerImage(image.image_id.clone());
        if should_namespace {
            parent = self.namespaced(&image.image_id).await?;
        }

        let id = LayerId::Container(container_id.to_owned());
        self.cake.create(&id, Some(&parent)).await?;
        let path = self.cake.path(&id).await?;
        log::info!("container {} rootfs at {:?} on {}", container_id, path, parent);

        for volume in &image.volumes {
            create_volume(&path, volume).await?;
        }

        Ok(ContainerRootfs {
            path,
            env: image.env,
        })
    }

    /// Find or build the namespaced copy of an image
    async fn namespaced(&self, image_id: &str) -> Result<LayerId, CakeError> {
        let id = LayerId::Namespaced {
            base: image_id.to_owned(),
            cache_key: self.namespacer.cache_key(),
        };
        let _lock = self.locks.acquire(&id.graph_id()).await;

        if self.cake.get(&id).await.is_ok() {
            log::debug!("reusing namespaced layer {} for image {}", id, image_id);
            return Ok(id);
        }

        let base = LayerId::DockerImage(image_id.to_owned());
        self.cake.create(&id, Some(&base)).await?;
        let result = match self.cake.path(&id).await {
            Ok(path) => self.namespacer.namespace(&path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("namespacing image {} failed: {}", image_id, e);
            if let Err(remove_err) = self.cake.remove(&id).await {
                log::warn!("can't remove partial layer {}: {}", id, remove_err);
            }
            return Err(e);
        }
        log::info!("created namespaced layer {} for image {}", id, image_id);
        Ok(id)
    }
}

/// Resolve a volume path lexically under `root`, never above it
fn volume_path(root: &Path, volume: &str) -> PathBuf {
    let mut relative = PathBuf::new();
    for component in Path::new(volume).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::ParentDir => {
                relative.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    root.join(relative)
}

async fn create_volume(root: &Path, volume: &str) -> Result<(), CakeError> {
    let path = volume_path(root, volume);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(CakeError::VolumeNotDirectory(volume.to_owned())),
        Err(_) => {
            log::debug!("creating volume directory {:?}", path);
            tokio::fs::create_dir_all(&path).await?;
            Ok(())
        }
    }
}
