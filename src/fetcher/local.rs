use crate::{
    errors::CakeError,
    fetcher::{cancellable, Image, ImageFetcher},
    layer::{Cake, LayerId, LayerMeta},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::Mutex, task};
use tokio_util::{io::SyncIoBridge, sync::CancellationToken};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Imports a directory on the host as a single-layer image
///
/// The layer id includes the directory's modification time, so touching the
/// directory makes the next fetch import it again. Imports are serialized.
pub struct LocalFetcher {
    cake: Arc<dyn Cake>,
    default_rootfs: PathBuf,
    import_lock: Mutex<()>,
}

impl LocalFetcher {
    pub fn new(cake: Arc<dyn Cake>, default_rootfs: PathBuf) -> Self {
        LocalFetcher {
            cake,
            default_rootfs,
            import_lock: Mutex::new(()),
        }
    }

    async fn resolve(&self, rootfs: &str) -> Result<(PathBuf, LayerId), CakeError> {
        let path = if rootfs.is_empty() {
            self.default_rootfs.clone()
        } else {
            PathBuf::from(rootfs)
        };
        let real_path = tokio::fs::canonicalize(&path).await?;
        let modified = tokio::fs::metadata(&real_path).await?.modified()?;
        let id = LayerId::local(&real_path, modified);
        Ok((real_path, id))
    }

    async fn import(&self, source: &Path, id: &LayerId) -> Result<(), CakeError> {
        log::info!("importing local rootfs {:?} as {}", source, id);
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(writer);
        let source = source.to_path_buf();
        let builder = task::spawn_blocking(move || -> io::Result<()> {
            let mut archive = tar::Builder::new(bridge);
            archive.follow_symlinks(false);
            archive.append_dir_all(".", &source)?;
            archive.into_inner()?.shutdown()
        });

        let meta = LayerMeta {
            id: id.graph_id(),
            parent: None,
            size: 0,
        };
        self.cake.register(meta, Box::new(reader)).await?;
        builder.await?.map_err(CakeError::from_io)
    }
}

#[async_trait]
impl ImageFetcher for LocalFetcher {
    async fn fetch(
        &self,
        rootfs: &str,
        _max_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Image, CakeError> {
        let _import = self.import_lock.lock().await;
        let (path, id) = self.resolve(rootfs).await?;
        let graph_id = id.graph_id();

        if self.cake.get(&id).await.is_ok() {
            log::debug!("local rootfs {:?} already imported as {}", path, graph_id);
        } else {
            cancellable(cancel, self.import(&path, &id)).await?;
        }

        Ok(Image {
            image_id: graph_id.clone(),
            layer_ids: vec![graph_id],
            env: HashMap::new(),
            volumes: vec![],
        })
    }

    async fn fetch_id(&self, rootfs: &str) -> Result<LayerId, CakeError> {
        Ok(self.resolve(rootfs).await?.1)
    }
}
