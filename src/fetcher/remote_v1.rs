use crate::{
    cleaner::{ReferenceTracker, Retained},
    errors::CakeError,
    fetcher::{cancellable, FetchRequest, Image, VersionedFetcher},
    layer::{Cake, LayerId, LayerMeta},
    quota::QuotaedReader,
    registry::ImageJson,
};
use async_trait::async_trait;
use std::sync::{atomic::Ordering, Arc};
use tokio_util::sync::CancellationToken;

/// Fetches images from registries speaking the V1 protocol
///
/// Every layer is retained before the graph is checked for it, and stays
/// retained until the fetch is over, so a concurrent cleanup can't remove a
/// layer this fetch is about to build on.
pub struct RemoteV1Fetcher {
    cake: Arc<ReferenceTracker>,
}

impl RemoteV1Fetcher {
    pub fn new(cake: Arc<ReferenceTracker>) -> Self {
        RemoteV1Fetcher { cake }
    }

    async fn resolve_tag(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<String>, String), CakeError> {
        let session = &request.session;
        let repo_data = cancellable(cancel, session.get_repository_data(&request.remote_path))
            .await
            .map_err(|e| request.wrap("GetRepositoryData", e))?;

        let tags = cancellable(
            cancel,
            session.get_remote_tags(&repo_data.endpoints, &request.remote_path),
        )
        .await
        .map_err(|e| request.wrap("GetRemoteTags", e))?;

        match tags.get(&request.tag) {
            Some(image_id) => Ok((repo_data.endpoints, image_id.clone())),
            None => Err(request.wrap(
                "GetRemoteTags",
                CakeError::TagNotFound(request.tag.clone()),
            )),
        }
    }

    async fn fetch_from_endpoint(
        &self,
        request: &FetchRequest,
        endpoint: &str,
        image_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Image, CakeError> {
        let history = cancellable(
            cancel,
            request.session.get_remote_history(image_id, endpoint),
        )
        .await
        .map_err(|e| request.wrap("GetRemoteHistory", e))?;

        let mut retained: Vec<Retained<'_>> = Vec::with_capacity(history.len());
        let mut remaining = request.max_size;
        let mut leaf = None;

        for layer_id in history.iter().rev() {
            let id = LayerId::DockerImage(layer_id.clone());
            retained.push(self.cake.retain_scoped(&id));
            let (image, size) = self
                .fetch_layer(request, endpoint, &id, remaining, cancel)
                .await?;
            remaining = remaining.checked_sub(size).ok_or(CakeError::QuotaExceeded)?;
            leaf = image;
        }

        let leaf = match leaf {
            Some(image) if image.id == image_id => image,
            _ => self.image_json(request, endpoint, image_id, cancel).await?.0,
        };

        Ok(Image {
            image_id: image_id.to_owned(),
            layer_ids: history.iter().rev().cloned().collect(),
            env: leaf.env(),
            volumes: leaf.volumes(),
        })
    }

    async fn image_json(
        &self,
        request: &FetchRequest,
        endpoint: &str,
        image_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(ImageJson, u64), CakeError> {
        let (data, reported_size) = cancellable(
            cancel,
            request.session.get_remote_image_json(image_id, endpoint),
        )
        .await
        .map_err(|e| request.wrap("GetRemoteImageJSON", e))?;
        let image = ImageJson::parse(&data).map_err(|e| request.wrap("GetRemoteImageJSON", e))?;
        let size = reported_size.unwrap_or(image.size);
        Ok((image, size))
    }

    /// Make sure one layer is in the graph, returning its image json if it
    /// had to be downloaded, and the larger of its declared and streamed size
    async fn fetch_layer(
        &self,
        request: &FetchRequest,
        endpoint: &str,
        id: &LayerId,
        remaining: u64,
        cancel: &CancellationToken,
    ) -> Result<(Option<ImageJson>, u64), CakeError> {
        if let Ok(meta) = self.cake.get(id).await {
            log::debug!("layer {} already present", id);
            return Ok((None, meta.size));
        }

        let (image, size) = self
            .image_json(request, endpoint, &id.graph_id(), cancel)
            .await?;
        log::info!("downloading layer {} ({} bytes) from {}", image.id, size, endpoint);
        let layer = cancellable(
            cancel,
            request.session.get_remote_image_layer(&image.id, endpoint),
        )
        .await
        .map_err(|e| request.wrap("GetRemoteImageLayer", e))?;

        let meta = LayerMeta {
            id: image.id.clone(),
            parent: image.parent.clone(),
            size,
        };
        let quotaed = QuotaedReader::new(layer, remaining);
        let streamed = quotaed.delivered();
        cancellable(cancel, self.cake.register(meta, Box::new(quotaed))).await?;
        Ok((Some(image), size.max(streamed.load(Ordering::Relaxed))))
    }
}

#[async_trait]
impl VersionedFetcher for RemoteV1Fetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Image, CakeError> {
        let (endpoints, image_id) = self.resolve_tag(request, cancel).await?;

        let mut last_error = CakeError::RegistryResponse("repository has no endpoints".into());
        for endpoint in &endpoints {
            match self
                .fetch_from_endpoint(request, endpoint, &image_id, cancel)
                .await
            {
                Ok(image) => return Ok(image),
                Err(e @ CakeError::QuotaExceeded) | Err(e @ CakeError::Cancelled) => return Err(e),
                Err(e) => {
                    log::warn!("fetch of {} from {} failed: {}", request.repo_path, endpoint, e);
                    last_error = e;
                }
            }
        }
        Err(request.wrap(
            "fetchFromEndPoint",
            CakeError::AllEndpointsFailed(Box::new(last_error)),
        ))
    }

    async fn fetch_id(&self, request: &FetchRequest) -> Result<LayerId, CakeError> {
        let (_, image_id) = self
            .resolve_tag(request, &CancellationToken::new())
            .await?;
        Ok(LayerId::DockerImage(image_id))
    }
}
