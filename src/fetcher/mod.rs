//! Fetching root filesystem images into the layer graph

mod composite;
mod local;
mod remote_v1;
mod remote_v2;

pub use composite::{CompositeFetcher, FetchRequestCreator};
pub use local::LocalFetcher;
pub use remote_v1::RemoteV1Fetcher;
pub use remote_v2::RemoteV2Fetcher;

use crate::{
    errors::CakeError,
    layer::LayerId,
    registry::{Endpoint, Session},
};
use async_trait::async_trait;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

/// A fetched image, ready to be turned into a container root filesystem
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Image {
    /// graph id of the leaf layer
    pub image_id: String,
    /// graph ids of every layer, root first
    pub layer_ids: Vec<String>,
    pub env: HashMap<String, String>,
    pub volumes: Vec<String>,
}

/// Everything a registry fetcher needs to know about one fetch
#[derive(Clone)]
pub struct FetchRequest {
    pub session: Arc<dyn Session>,
    pub endpoint: Endpoint,
    /// repository path as written in the image url
    pub repo_path: String,
    /// repository path as the registry knows it
    pub remote_path: String,
    pub tag: String,
    /// byte budget for all layer data downloaded by this fetch
    pub max_size: u64,
}

impl FetchRequest {
    fn wrap(&self, context: &'static str, err: CakeError) -> CakeError {
        CakeError::fetch(context, &self.endpoint.host(), &self.repo_path, err)
    }
}

/// Fetches images given the `rootfs` string from a container spec
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(
        &self,
        rootfs: &str,
        max_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Image, CakeError>;

    /// Work out the id of the image's leaf layer without fetching layers
    async fn fetch_id(&self, rootfs: &str) -> Result<LayerId, CakeError>;
}

/// Fetcher for one registry protocol version
#[async_trait]
pub trait VersionedFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Image, CakeError>;

    async fn fetch_id(&self, request: &FetchRequest) -> Result<LayerId, CakeError>;
}

/// Run a fetch stage, giving up with [CakeError::Cancelled] if the token
/// fires first
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, stage: F) -> Result<T, CakeError>
where
    F: Future<Output = Result<T, CakeError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CakeError::Cancelled),
        result = stage => result,
    }
}
