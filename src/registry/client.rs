use crate::{
    errors::CakeError,
    layer::LayerStream,
    registry::{
        auth::Auth, media_types, ApiVersion, Endpoint, Manifest, RegistryProvider,
        RepositoryData, Session,
    },
};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use http::header::HeaderValue;
use reqwest::{
    header::{self, HeaderMap},
    Certificate, Client, ClientBuilder, Response, StatusCode,
};
use std::{collections::HashMap, io, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use url::Url;

const API_VERSION_HEADER: &str = "docker-distribution-api-version";
const DOCKER_TOKEN_HEADER: &str = "x-docker-token";
const DOCKER_ENDPOINTS_HEADER: &str = "x-docker-endpoints";
const DOCKER_SIZE_HEADER: &str = "x-docker-size";

/// Builder for configuring custom [HttpRegistryProvider] instances
pub struct HttpRegistryProviderBuilder {
    network: ClientBuilder,
    insecure_registries: Vec<String>,
}

impl Default for HttpRegistryProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRegistryProviderBuilder {
    /// Start constructing a custom registry provider
    pub fn new() -> Self {
        HttpRegistryProviderBuilder {
            network: Client::builder().user_agent(HttpRegistryProvider::default_user_agent()),
            insecure_registries: vec![],
        }
    }

    /// Hosts (with optional port) that may be contacted over plain HTTP
    ///
    /// Every registry is tried over HTTPS first. Only the hosts listed here
    /// fall back to HTTP when that fails.
    pub fn insecure_registries(mut self, hosts: Vec<String>) -> Self {
        self.insecure_registries = hosts;
        self
    }

    /// Set a timeout for each network request
    ///
    /// This timeout applies from the beginning of a request until the last
    /// byte has been received, so it also bounds layer downloads. By default
    /// there is no timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.timeout(timeout);
        self
    }

    /// Set a timeout for only the initial connect phase of each network request
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.connect_timeout(timeout);
        self
    }

    /// Sets the `User-Agent` header used for every registry request
    pub fn user_agent<V>(mut self, value: V) -> Self
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        self.network = self.network.user_agent(value);
        self
    }

    /// Set the default headers for every HTTP request
    pub fn default_request_headers(mut self, headers: HeaderMap) -> Self {
        self.network = self.network.default_headers(headers);
        self
    }

    /// Trust an additional root certificate
    pub fn add_root_certificate(mut self, certificate: Certificate) -> Self {
        self.network = self.network.add_root_certificate(certificate);
        self
    }

    pub fn build(self) -> Result<HttpRegistryProvider, CakeError> {
        Ok(HttpRegistryProvider {
            req: self.network.build()?,
            insecure_registries: self.insecure_registries,
        })
    }
}

/// Probes registry hosts over the network and opens [HttpSession]s
pub struct HttpRegistryProvider {
    req: Client,
    insecure_registries: Vec<String>,
}

impl HttpRegistryProvider {
    pub fn new() -> Result<Self, CakeError> {
        HttpRegistryProviderBuilder::new().build()
    }

    pub fn builder() -> HttpRegistryProviderBuilder {
        HttpRegistryProviderBuilder::new()
    }

    /// Return the default `User-Agent` that we use if no other is set
    pub fn default_user_agent() -> HeaderValue {
        static USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
        HeaderValue::from_static(USER_AGENT)
    }

    fn is_insecure_allowed(&self, host: &str) -> bool {
        self.insecure_registries.iter().any(|allowed| allowed == host)
    }

    /// Find out which protocol version a registry base url speaks
    async fn ping(&self, base: &Url) -> Result<ApiVersion, CakeError> {
        let v2 = base.join("v2/").map_err(invalid_url)?;
        log::debug!("probing {}", v2);
        match self.req.get(v2).send().await {
            Ok(response) => {
                let advertised = response
                    .headers()
                    .get(API_VERSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.split_whitespace().any(|word| word == "registry/2.0"))
                    .unwrap_or(false);
                let status = response.status();
                if status.is_success() || (status == StatusCode::UNAUTHORIZED && advertised) {
                    return Ok(ApiVersion::V2);
                }
            }
            Err(e) if e.is_connect() || e.is_timeout() => return Err(e.into()),
            Err(e) => log::debug!("v2 probe of {} failed: {}", base, e),
        }

        let v1 = base.join("v1/_ping").map_err(invalid_url)?;
        log::debug!("probing {}", v1);
        self.req.get(v1).send().await?.error_for_status()?;
        Ok(ApiVersion::V1)
    }
}

#[async_trait]
impl RegistryProvider for HttpRegistryProvider {
    async fn provide_registry(
        &self,
        host: &str,
    ) -> Result<(Arc<dyn Session>, Endpoint), CakeError> {
        let secure = Url::parse(&format!("https://{}/", host)).map_err(invalid_url)?;
        let endpoint = match self.ping(&secure).await {
            Ok(version) => Endpoint::new(secure, version),
            Err(cause) => {
                if !self.is_insecure_allowed(host) {
                    return Err(CakeError::InsecureRegistry {
                        cause: cause.to_string(),
                        endpoint: host.to_owned(),
                        allow_list: self.insecure_registries.clone(),
                    });
                }
                log::warn!("falling back to http for insecure registry {}: {}", host, cause);
                let plain = Url::parse(&format!("http://{}/", host)).map_err(invalid_url)?;
                let version = self.ping(&plain).await?;
                Endpoint::new(plain, version)
            }
        };
        log::info!("registry {} speaks {} at {}", host, endpoint.version, endpoint.url);
        let session = HttpSession::new(self.req.clone(), endpoint.clone());
        Ok((Arc::new(session), endpoint))
    }
}

/// One fetch's conversation with a registry over HTTP
///
/// Tokens obtained during the session are reused for its later requests.
pub struct HttpSession {
    req: Client,
    index: Endpoint,
    auth: Mutex<Auth>,
}

impl HttpSession {
    pub fn new(req: Client, index: Endpoint) -> Self {
        HttpSession {
            req,
            index,
            auth: Mutex::new(Auth::default()),
        }
    }

    /// GET a url, answering one bearer challenge if the registry sends it
    async fn get(&self, url: Url, headers: HeaderMap) -> Result<Response, CakeError> {
        log::debug!("GET {}", url);
        let request = self.req.get(url.clone()).headers(headers.clone());
        let request = self.auth.lock().await.include_token(request);
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response.error_for_status()?);
        }
        let challenge = match response.headers().get(header::WWW_AUTHENTICATE) {
            Some(value) => value
                .to_str()
                .map_err(|_| CakeError::UnsupportedAuthentication(format!("{:?}", value)))?
                .to_owned(),
            None => return Ok(response.error_for_status()?),
        };
        let request = {
            let mut auth = self.auth.lock().await;
            auth.authenticate(&self.req, &challenge).await?;
            auth.include_token(self.req.get(url).headers(headers))
        };
        Ok(request.send().await?.error_for_status()?)
    }

    fn v1_url(endpoint: &str, path: &str) -> Result<Url, CakeError> {
        let base = if endpoint.ends_with('/') {
            endpoint.to_owned()
        } else {
            format!("{}/", endpoint)
        };
        Url::parse(&base)
            .and_then(|base| base.join(path))
            .map_err(invalid_url)
    }

    fn v2_url(endpoint: &Endpoint, path: &str) -> Result<Url, CakeError> {
        endpoint
            .url
            .join(&format!("v2/{}", path))
            .map_err(invalid_url)
    }
}

fn invalid_url(err: url::ParseError) -> CakeError {
    CakeError::InvalidUrl(err.to_string())
}

fn stream_body(response: Response) -> LayerStream {
    let stream = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    Box::new(StreamReader::new(Box::pin(stream)))
}

#[async_trait]
impl Session for HttpSession {
    async fn get_repository_data(&self, remote: &str) -> Result<RepositoryData, CakeError> {
        let url = HttpSession::v1_url(
            self.index.url.as_str(),
            &format!("v1/repositories/{}/images", remote),
        )?;
        let mut headers = HeaderMap::new();
        headers.insert(DOCKER_TOKEN_HEADER, HeaderValue::from_static("true"));
        let response = self.get(url, headers).await?;

        let header_list = |name: &str| -> Vec<String> {
            response
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
                .collect()
        };
        let tokens = header_list(DOCKER_TOKEN_HEADER);
        let scheme = self.index.url.scheme();
        let mut endpoints: Vec<String> = header_list(DOCKER_ENDPOINTS_HEADER)
            .into_iter()
            .map(|host| format!("{}://{}/v1/", scheme, host))
            .collect();
        if endpoints.is_empty() {
            endpoints.push(format!("{}v1/", self.index.url));
        }
        if let Some(token) = tokens.first() {
            self.auth.lock().await.set_docker_token(token.clone());
        }
        Ok(RepositoryData { endpoints, tokens })
    }

    async fn get_remote_tags(
        &self,
        endpoints: &[String],
        remote: &str,
    ) -> Result<HashMap<String, String>, CakeError> {
        let mut last_error = CakeError::RegistryResponse("no endpoints to ask for tags".into());
        for endpoint in endpoints {
            let url = HttpSession::v1_url(endpoint, &format!("repositories/{}/tags", remote))?;
            let result = match self.get(url, HeaderMap::new()).await {
                Ok(response) => response.json::<HashMap<String, String>>().await,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };
            match result {
                Ok(tags) => return Ok(tags),
                Err(e) => last_error = e.into(),
            }
        }
        Err(last_error)
    }

    async fn get_remote_history(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<Vec<String>, CakeError> {
        let url = HttpSession::v1_url(endpoint, &format!("images/{}/ancestry", image_id))?;
        Ok(self.get(url, HeaderMap::new()).await?.json().await?)
    }

    async fn get_remote_image_json(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<(Vec<u8>, Option<u64>), CakeError> {
        let url = HttpSession::v1_url(endpoint, &format!("images/{}/json", image_id))?;
        let response = self.get(url, HeaderMap::new()).await?;
        let size = response
            .headers()
            .get(DOCKER_SIZE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        Ok((response.bytes().await?.to_vec(), size))
    }

    async fn get_remote_image_layer(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<LayerStream, CakeError> {
        let url = HttpSession::v1_url(endpoint, &format!("images/{}/layer", image_id))?;
        Ok(stream_body(self.get(url, HeaderMap::new()).await?))
    }

    async fn get_v2_image_manifest(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        tag: &str,
    ) -> Result<Manifest, CakeError> {
        let url = HttpSession::v2_url(endpoint, &format!("{}/manifests/{}", remote, tag))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(media_types::MANIFEST_V1_SIGNED),
        );
        headers.append(header::ACCEPT, HeaderValue::from_static(media_types::MANIFEST_V1));
        let body = self.get(url, headers).await?.bytes().await?;
        log::trace!("raw json manifest, {}", String::from_utf8_lossy(&body));
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_v2_image_blob_reader(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        digest: &str,
    ) -> Result<LayerStream, CakeError> {
        let url = HttpSession::v2_url(endpoint, &format!("{}/blobs/{}", remote, digest))?;
        Ok(stream_body(self.get(url, HeaderMap::new()).await?))
    }
}
