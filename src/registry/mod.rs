//! Registry protocol calls for image fetching
//!
//! The fetchers only talk to a registry through the [Session] trait, which
//! covers both the V1 and V2 protocols. [RegistryProvider] finds the right
//! endpoint for a host and hands out sessions. [HttpRegistryProvider] is the
//! network implementation of both.

mod auth;
mod client;
mod default;

pub use client::{HttpRegistryProvider, HttpRegistryProviderBuilder, HttpSession};
pub use default::DefaultRegistry;

use crate::{errors::CakeError, layer::LayerStream};
use async_trait::async_trait;
use std::{collections::HashMap, fmt, sync::Arc};
use url::Url;

/// Registry protocol version negotiated for an endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    V1,
    V2,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiVersion::V1 => write!(f, "v1"),
            ApiVersion::V2 => write!(f, "v2"),
        }
    }
}

/// A registry server we've probed, and the protocol it speaks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub url: Url,
    pub version: ApiVersion,
}

impl Endpoint {
    pub fn new(url: Url, version: ApiVersion) -> Self {
        Endpoint { url, version }
    }

    /// Host and port, as used in error messages
    pub fn host(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_owned(),
            (None, _) => self.url.to_string(),
        }
    }
}

/// Answer to the V1 repository images call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepositoryData {
    /// V1 registry base urls holding this repository's layers, in order of
    /// preference
    pub endpoints: Vec<String>,
    pub tokens: Vec<String>,
}

/// Per-layer image JSON, as served by V1 and embedded in V2 schema 1
/// manifests
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ImageJson {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ImageConfig {
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Volumes", default)]
    pub volumes: Option<HashMap<String, serde_json::Value>>,
}

impl ImageJson {
    pub fn parse(data: &[u8]) -> Result<Self, CakeError> {
        let image: ImageJson = serde_json::from_slice(data)?;
        if image.id.is_empty() {
            return Err(CakeError::RegistryResponse("image json has no id".into()));
        }
        Ok(image)
    }

    /// Environment as a map, splitting each `KEY=value` at the first `=`
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(vars) = self.config.as_ref().and_then(|c| c.env.as_ref()) {
            for var in vars {
                match var.split_once('=') {
                    Some((key, value)) => env.insert(key.to_owned(), value.to_owned()),
                    None => env.insert(var.clone(), String::new()),
                };
            }
        }
        env
    }

    /// Declared volume paths, sorted for a stable order
    pub fn volumes(&self) -> Vec<String> {
        let mut volumes: Vec<String> = self
            .config
            .as_ref()
            .and_then(|c| c.volumes.as_ref())
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default();
        volumes.sort();
        volumes
    }
}

/// Partial implementation of the image manifest v2 schema 1
///
/// Both lists are ordered newest layer first.
///
/// Reference: <https://docs.docker.com/registry/spec/manifest-v2-1/>
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<History>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

pub mod media_types {
    pub const MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
}

/// Registry protocol operations used by the fetchers
#[async_trait]
pub trait Session: Send + Sync {
    async fn get_repository_data(&self, remote: &str) -> Result<RepositoryData, CakeError>;

    /// Map of tag name to image id, asking each V1 endpoint in turn
    async fn get_remote_tags(
        &self,
        endpoints: &[String],
        remote: &str,
    ) -> Result<HashMap<String, String>, CakeError>;

    /// Ancestry of an image, newest first, starting with the image itself
    async fn get_remote_history(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<Vec<String>, CakeError>;

    /// Raw image JSON, plus the layer size if the registry reported one
    async fn get_remote_image_json(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<(Vec<u8>, Option<u64>), CakeError>;

    async fn get_remote_image_layer(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<LayerStream, CakeError>;

    async fn get_v2_image_manifest(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        tag: &str,
    ) -> Result<Manifest, CakeError>;

    async fn get_v2_image_blob_reader(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        digest: &str,
    ) -> Result<LayerStream, CakeError>;
}

/// Finds a registry endpoint for a host and opens a session to it
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    async fn provide_registry(
        &self,
        host: &str,
    ) -> Result<(Arc<dyn Session>, Endpoint), CakeError>;
}
