use crate::{
    errors::CakeError,
    fetcher::{cancellable, FetchRequest, Image, VersionedFetcher},
    layer::{Cake, LayerId, LayerMeta},
    lock::LayerLock,
    quota::QuotaedReader,
    registry::{ImageJson, Manifest},
};
use async_trait::async_trait;
use std::sync::{atomic::Ordering, Arc};
use tokio_util::sync::CancellationToken;

/// Fetches images from registries speaking the V2 protocol
///
/// Each blob digest is locked while its layer is checked and downloaded, so
/// two fetches sharing a layer download it once.
pub struct RemoteV2Fetcher {
    cake: Arc<dyn Cake>,
    locks: Arc<LayerLock>,
}

impl RemoteV2Fetcher {
    pub fn new(cake: Arc<dyn Cake>, locks: Arc<LayerLock>) -> Self {
        RemoteV2Fetcher { cake, locks }
    }

    async fn manifest(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<(Manifest, Vec<ImageJson>), CakeError> {
        let manifest = cancellable(
            cancel,
            request.session.get_v2_image_manifest(
                &request.endpoint,
                &request.remote_path,
                &request.tag,
            ),
        )
        .await
        .map_err(|e| request.wrap("GetV2ImageManifest", e))?;

        if manifest.fs_layers.is_empty() || manifest.fs_layers.len() != manifest.history.len() {
            return Err(request.wrap(
                "GetV2ImageManifest",
                CakeError::InvalidManifest(format!(
                    "{} layers with {} history entries",
                    manifest.fs_layers.len(),
                    manifest.history.len()
                )),
            ));
        }

        let images = manifest
            .history
            .iter()
            .map(|h| ImageJson::parse(h.v1_compatibility.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| request.wrap("GetV2ImageManifest", e))?;
        Ok((manifest, images))
    }

    async fn fetch_layer(
        &self,
        request: &FetchRequest,
        image: &ImageJson,
        digest: &str,
        remaining: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, CakeError> {
        let _lock = self.locks.acquire(digest).await;

        let id = LayerId::DockerImage(image.id.clone());
        if let Ok(meta) = self.cake.get(&id).await {
            log::debug!("layer {} already present", id);
            return Ok(meta.size);
        }

        log::info!("downloading layer {} blob {}", image.id, digest);
        let blob = cancellable(
            cancel,
            request.session.get_v2_image_blob_reader(
                &request.endpoint,
                &request.remote_path,
                digest,
            ),
        )
        .await
        .map_err(|e| request.wrap("GetV2ImageBlobReader", e))?;

        let meta = LayerMeta {
            id: image.id.clone(),
            parent: image.parent.clone(),
            size: image.size,
        };
        let quotaed = QuotaedReader::new(blob, remaining);
        let streamed = quotaed.delivered();
        cancellable(cancel, self.cake.register(meta, Box::new(quotaed))).await?;
        // the declared size may be missing or wrong
        Ok(image.size.max(streamed.load(Ordering::Relaxed)))
    }
}

#[async_trait]
impl VersionedFetcher for RemoteV2Fetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Image, CakeError> {
        let (manifest, images) = self.manifest(request, cancel).await?;

        let mut remaining = request.max_size;
        for (layer, image) in manifest.fs_layers.iter().zip(&images).rev() {
            let size = self
                .fetch_layer(request, image, &layer.blob_sum, remaining, cancel)
                .await?;
            remaining = remaining.checked_sub(size).ok_or_else(|| {
                log::warn!("{} exceeds its quota at layer {}", request.repo_path, image.id);
                CakeError::QuotaExceeded
            })?;
        }

        let leaf = &images[0];
        Ok(Image {
            image_id: leaf.id.clone(),
            layer_ids: images.iter().rev().map(|image| image.id.clone()).collect(),
            env: leaf.env(),
            volumes: leaf.volumes(),
        })
    }

    async fn fetch_id(&self, request: &FetchRequest) -> Result<LayerId, CakeError> {
        let (_, images) = self.manifest(request, &CancellationToken::new()).await?;
        Ok(LayerId::DockerImage(images[0].id.clone()))
    }
}
