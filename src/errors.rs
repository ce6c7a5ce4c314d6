//! Error types you might see while fetching images or managing layers

use std::{error::Error as StdError, fmt, io};
use thiserror::Error;

/// Errors from any stage of image fetching, layer creation or cleanup
#[derive(Error, Debug)]
pub enum CakeError {
    /// image reference url is missing a path or uses an unknown scheme
    #[error("invalid image url: {0:?}")]
    InvalidUrl(String),

    /// streamed layer data exceeded the caller's disk quota
    #[error("quota exceeded")]
    QuotaExceeded,

    /// registry can only be reached without TLS, and it isn't on the allow list
    #[error("registry {endpoint} is not in the insecure registry list {allow_list:?}: {cause}")]
    InsecureRegistry {
        cause: String,
        endpoint: String,
        allow_list: Vec<String>,
    },

    /// a registry protocol call failed
    #[error("{context} for {registry}/{repo}: {cause}")]
    Fetch {
        context: &'static str,
        registry: String,
        repo: String,
        #[source]
        cause: Box<CakeError>,
    },

    /// all endpoints for a repository were tried without success
    #[error("all endpoints failed: {0}")]
    AllEndpointsFailed(#[source] Box<CakeError>),

    /// registry server answered with something we can't use
    #[error("unexpected registry response: {0}")]
    RegistryResponse(String),

    /// registry server requested an unsupported type of authentication
    #[error("registry server requested an unsupported type of authentication: {0:?}")]
    UnsupportedAuthentication(String),

    /// tag is not present in the remote repository
    #[error("tag {0:?} not found")]
    TagNotFound(String),

    /// manifest contents are inconsistent
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// the fetch was cancelled by the caller
    #[error("fetch cancelled")]
    Cancelled,

    /// no layer with this id exists in the graph
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// a layer with this id already exists in the graph
    #[error("layer already exists: {0}")]
    LayerExists(String),

    /// layer still has children built on it, only leaves may be removed
    #[error("layer {0} still has child layers")]
    LayerHasChildren(String),

    /// graph id can't be used as a storage name
    #[error("invalid layer id: {0:?}")]
    InvalidLayerId(String),

    /// a volume path exists but is not a directory
    #[error("volume path {0:?} exists and is not a directory")]
    VolumeNotDirectory(String),

    /// storage io error
    #[error("storage io error: {0}")]
    Storage(#[from] io::Error),

    /// json error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// network request error
    #[error("network request error: {0}")]
    NetworkRequest(#[from] reqwest::Error),

    /// asynchronous task failed
    #[error("asynchronous task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl CakeError {
    /// Wrap a registry protocol failure with the stage it happened in
    ///
    /// Quota, cancellation and insecure registry errors pass through
    /// unchanged, so callers can always match on them directly.
    pub fn fetch(context: &'static str, registry: &str, repo: &str, cause: CakeError) -> Self {
        match cause {
            CakeError::QuotaExceeded
            | CakeError::Cancelled
            | CakeError::InsecureRegistry { .. } => cause,
            cause => CakeError::Fetch {
                context,
                registry: registry.to_owned(),
                repo: repo.to_owned(),
                cause: Box::new(cause),
            },
        }
    }

    /// Convert an io error, recognizing a [QuotaExceeded] marker anywhere in
    /// its chain
    pub fn from_io(err: io::Error) -> Self {
        if chain_has_quota_marker(&err) {
            CakeError::QuotaExceeded
        } else {
            CakeError::Storage(err)
        }
    }

    /// Is this a quota error, either directly or as the cause of a fetch error?
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            CakeError::QuotaExceeded => true,
            CakeError::Fetch { cause, .. } | CakeError::AllEndpointsFailed(cause) => {
                cause.is_quota_exceeded()
            }
            CakeError::Storage(err) => chain_has_quota_marker(err),
            _ => false,
        }
    }
}

/// Marker carried inside an [io::Error] by [crate::QuotaedReader]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded;

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quota exceeded")
    }
}

impl StdError for QuotaExceeded {}

impl From<QuotaExceeded> for io::Error {
    fn from(marker: QuotaExceeded) -> Self {
        io::Error::new(io::ErrorKind::Other, marker)
    }
}

// io::Error::source() skips over its own custom payload, so each io::Error
// in the chain has to be unwrapped by hand.
fn chain_has_quota_marker(err: &(dyn StdError + 'static)) -> bool {
    if err.is::<QuotaExceeded>() {
        return true;
    }
    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        if let Some(inner) = io_err.get_ref() {
            return chain_has_quota_marker(inner);
        }
    }
    match err.source() {
        Some(source) => chain_has_quota_marker(source),
        None => false,
    }
}
