use crate::{
    errors::CakeError,
    fetcher::{cancellable, FetchRequest, Image, ImageFetcher, VersionedFetcher},
    layer::LayerId,
    registry::{ApiVersion, DefaultRegistry, RegistryProvider},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

const DOCKER_SCHEME: &str = "docker";
const DEFAULT_TAG: &str = "latest";

/// Turns `docker://` urls into [FetchRequest]s
///
/// The host defaults to the default registry, the tag comes from the url
/// fragment and defaults to `latest`.
pub struct FetchRequestCreator {
    provider: Arc<dyn RegistryProvider>,
    default_registry: DefaultRegistry,
}

impl FetchRequestCreator {
    pub fn new(provider: Arc<dyn RegistryProvider>, default_registry: DefaultRegistry) -> Self {
        FetchRequestCreator {
            provider,
            default_registry,
        }
    }

    pub async fn create_fetch_request(
        &self,
        url: &Url,
        max_size: u64,
    ) -> Result<FetchRequest, CakeError> {
        let host = url.host_str().filter(|h| !h.is_empty()).map(|h| match url.port() {
            Some(port) => format!("{}:{}", h, port),
            None => h.to_owned(),
        });
        let repo_path = url.path().trim_start_matches('/');
        if repo_path.is_empty() || repo_path.ends_with('/') {
            return Err(CakeError::InvalidUrl(url.to_string()));
        }

        let (registry, remote_path) = self.default_registry.resolve(host.as_deref(), repo_path);
        let (session, endpoint) = self
            .provider
            .provide_registry(&registry)
            .await
            .map_err(|e| CakeError::fetch("ProvideRegistry", &registry, repo_path, e))?;

        let tag = url
            .fragment()
            .filter(|tag| !tag.is_empty())
            .unwrap_or(DEFAULT_TAG);

        log::debug!(
            "fetch request for {} on {} ({}), remote path {}, tag {}",
            repo_path,
            registry,
            endpoint.version,
            remote_path,
            tag
        );
        Ok(FetchRequest {
            session,
            endpoint,
            repo_path: repo_path.to_owned(),
            remote_path,
            tag: tag.to_owned(),
            max_size,
        })
    }
}

enum ImageSource {
    Local(String),
    Docker(Url),
}

fn parse_source(rootfs: &str) -> Result<ImageSource, CakeError> {
    match Url::parse(rootfs) {
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(ImageSource::Local(rootfs.to_owned())),
        Err(e) => Err(CakeError::InvalidUrl(format!("{}: {}", rootfs, e))),
        Ok(url) if url.scheme() == DOCKER_SCHEME => Ok(ImageSource::Docker(url)),
        Ok(_) => Err(CakeError::InvalidUrl(rootfs.to_owned())),
    }
}

/// Dispatches each fetch to the local fetcher or the registry fetcher for
/// the protocol version the registry speaks
pub struct CompositeFetcher {
    local: Arc<dyn ImageFetcher>,
    v1: Arc<dyn VersionedFetcher>,
    v2: Arc<dyn VersionedFetcher>,
    request_creator: FetchRequestCreator,
}

impl CompositeFetcher {
    pub fn new(
        local: Arc<dyn ImageFetcher>,
        v1: Arc<dyn VersionedFetcher>,
        v2: Arc<dyn VersionedFetcher>,
        request_creator: FetchRequestCreator,
    ) -> Self {
        CompositeFetcher {
            local,
            v1,
            v2,
            request_creator,
        }
    }

    fn versioned(&self, version: ApiVersion) -> &dyn VersionedFetcher {
        match version {
            ApiVersion::V1 => self.v1.as_ref(),
            ApiVersion::V2 => self.v2.as_ref(),
        }
    }
}

#[async_trait]
impl ImageFetcher for CompositeFetcher {
    async fn fetch(
        &self,
        rootfs: &str,
        max_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Image, CakeError> {
        match parse_source(rootfs)? {
            ImageSource::Local(path) => self.local.fetch(&path, max_size, cancel).await,
            ImageSource::Docker(url) => {
                let request = cancellable(
                    cancel,
                    self.request_creator.create_fetch_request(&url, max_size),
                )
                .await?;
                self.versioned(request.endpoint.version)
                    .fetch(&request, cancel)
                    .await
            }
        }
    }

    async fn fetch_id(&self, rootfs: &str) -> Result<LayerId, CakeError> {
        match parse_source(rootfs)? {
            ImageSource::Local(path) => self.local.fetch_id(&path).await,
            ImageSource::Docker(url) => {
                let request = self.request_creator.create_fetch_request(&url, 0).await?;
                self.versioned(request.endpoint.version)
                    .fetch_id(&request)
                    .await
            }
        }
    }
}
