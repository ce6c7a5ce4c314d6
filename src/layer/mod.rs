//! Layer identity and the layer graph interface

mod vfs;

pub use vfs::VfsCake;

use crate::errors::CakeError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::io::AsyncRead;

/// Stream of tar data (optionally gzip compressed) for one layer
pub type LayerStream = Box<dyn AsyncRead + Send + Unpin>;

/// Identifies a layer in the graph
///
/// Each variant maps to a graph id string, which is the key the graph stores
/// the layer under. Two ids that produce the same graph id refer to the same
/// stored layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LayerId {
    /// Image layer from a registry, or any layer known only by graph id
    DockerImage(String),
    /// Read-write layer belonging to one container
    Container(String),
    /// Single-layer image imported from a local directory
    LocalImage { path: PathBuf, modified: SystemTime },
    /// Copy of `base` with ownership translated by a uid/gid mapping
    Namespaced { base: String, cache_key: String },
}

impl LayerId {
    pub fn graph_id(&self) -> String {
        match self {
            LayerId::DockerImage(id) | LayerId::Container(id) => id.clone(),
            LayerId::LocalImage { path, modified } => {
                let nanos = modified
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                let mut hasher = Sha256::new();
                hasher.update(path.as_os_str().to_string_lossy().as_bytes());
                hasher.update(nanos.to_string().as_bytes());
                format!("{:x}", hasher.finalize())
            }
            LayerId::Namespaced { base, cache_key } => {
                let mut hasher = Sha256::new();
                hasher.update(base.as_bytes());
                hasher.update(cache_key.as_bytes());
                format!("{:x}", hasher.finalize())
            }
        }
    }

    pub fn local(path: &Path, modified: SystemTime) -> Self {
        LayerId::LocalImage {
            path: path.to_path_buf(),
            modified,
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.graph_id())
    }
}

/// What the graph knows about a stored layer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMeta {
    /// graph id of this layer
    pub id: String,
    /// graph id of the parent layer, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// size in bytes as reported when the layer was registered
    #[serde(default)]
    pub size: u64,
}

impl LayerMeta {
    pub fn parent_id(&self) -> Option<LayerId> {
        self.parent.clone().map(LayerId::DockerImage)
    }
}

/// Content-addressed graph of filesystem layers
///
/// This is the graph driver interface. Implementations physically create,
/// populate and delete layers; everything in this crate above it only
/// manipulates the graph through these operations.
#[async_trait]
pub trait Cake: Send + Sync {
    /// Create an empty layer on top of `parent`, or a root layer
    async fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> Result<(), CakeError>;

    /// Look up a layer, failing with [CakeError::LayerNotFound] if absent
    async fn get(&self, id: &LayerId) -> Result<LayerMeta, CakeError>;

    /// Delete one layer
    async fn remove(&self, id: &LayerId) -> Result<(), CakeError>;

    /// Host path of the layer's root filesystem
    async fn path(&self, id: &LayerId) -> Result<PathBuf, CakeError>;

    /// Create the layer `meta.id` on top of `meta.parent` and apply a tar
    /// stream to it
    async fn register(&self, meta: LayerMeta, layer: LayerStream) -> Result<(), CakeError>;

    /// Does the layer have no children?
    async fn is_leaf(&self, id: &LayerId) -> Result<bool, CakeError>;
}
