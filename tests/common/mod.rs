#![allow(dead_code)]

use async_trait::async_trait;
use layercake::{
    errors::CakeError,
    fetcher::FetchRequest,
    layer::{Cake, LayerId, LayerMeta, LayerStream},
    registry::{
        ApiVersion, Endpoint, FsLayer, History, ImageConfig, ImageJson, Manifest,
        RegistryProvider, RepositoryData, Session,
    },
};
use std::{
    collections::{HashMap, HashSet},
    io::{self, Cursor},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use tokio::{
    io::AsyncReadExt,
    sync::{mpsc, Semaphore},
};
use url::Url;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory layer graph that records what happens to it
pub struct FakeCake {
    dir: TempDir,
    layers: Mutex<HashMap<String, LayerMeta>>,
    registered: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    fail_remove: Mutex<HashSet<String>>,
    remove_gate: Mutex<Option<(mpsc::UnboundedSender<String>, Arc<Semaphore>)>>,
}

impl FakeCake {
    pub fn new() -> Self {
        FakeCake {
            dir: tempfile::tempdir().unwrap(),
            layers: Default::default(),
            registered: Default::default(),
            removed: Default::default(),
            fail_remove: Default::default(),
            remove_gate: Default::default(),
        }
    }

    pub fn insert(&self, id: &str, parent: Option<&str>) {
        std::fs::create_dir_all(self.dir.path().join(id)).unwrap();
        self.layers.lock().unwrap().insert(
            id.to_owned(),
            LayerMeta {
                id: id.to_owned(),
                parent: parent.map(str::to_owned),
                size: 0,
            },
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.layers.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.layers.lock().unwrap().len()
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn fail_remove_of(&self, id: &str) {
        self.fail_remove.lock().unwrap().insert(id.to_owned());
    }

    /// Make every remove report itself on the channel, then wait for a
    /// permit on the semaphore
    pub fn gate_removes(&self) -> (mpsc::UnboundedReceiver<String>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        *self.remove_gate.lock().unwrap() = Some((tx, gate.clone()));
        (rx, gate)
    }
}

#[async_trait]
impl Cake for FakeCake {
    async fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> Result<(), CakeError> {
        let graph_id = id.graph_id();
        if self.contains(&graph_id) {
            return Err(CakeError::LayerExists(graph_id));
        }
        self.insert(&graph_id, parent.map(LayerId::graph_id).as_deref());
        Ok(())
    }

    async fn get(&self, id: &LayerId) -> Result<LayerMeta, CakeError> {
        self.layers
            .lock()
            .unwrap()
            .get(&id.graph_id())
            .cloned()
            .ok_or_else(|| CakeError::LayerNotFound(id.graph_id()))
    }

    async fn remove(&self, id: &LayerId) -> Result<(), CakeError> {
        let gate = self.remove_gate.lock().unwrap().clone();
        if let Some((tx, gate)) = gate {
            let _ = tx.send(id.graph_id());
            gate.acquire().await.unwrap().forget();
        }
        let graph_id = id.graph_id();
        if self.fail_remove.lock().unwrap().contains(&graph_id) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected remove failure").into());
        }
        match self.layers.lock().unwrap().remove(&graph_id) {
            Some(_) => {
                self.removed.lock().unwrap().push(graph_id);
                Ok(())
            }
            None => Err(CakeError::LayerNotFound(graph_id)),
        }
    }

    async fn path(&self, id: &LayerId) -> Result<PathBuf, CakeError> {
        let graph_id = id.graph_id();
        if self.contains(&graph_id) {
            Ok(self.dir.path().join(graph_id))
        } else {
            Err(CakeError::LayerNotFound(graph_id))
        }
    }

    async fn register(&self, mut meta: LayerMeta, mut layer: LayerStream) -> Result<(), CakeError> {
        let mut data = Vec::new();
        layer
            .read_to_end(&mut data)
            .await
            .map_err(CakeError::from_io)?;
        meta.size = meta.size.max(data.len() as u64);
        if self.contains(&meta.id) {
            return Err(CakeError::LayerExists(meta.id));
        }
        std::fs::create_dir_all(self.dir.path().join(&meta.id))?;
        self.registered.lock().unwrap().push(meta.id.clone());
        self.layers.lock().unwrap().insert(meta.id.clone(), meta);
        Ok(())
    }

    async fn is_leaf(&self, id: &LayerId) -> Result<bool, CakeError> {
        let graph_id = id.graph_id();
        let layers = self.layers.lock().unwrap();
        if !layers.contains_key(&graph_id) {
            return Err(CakeError::LayerNotFound(graph_id));
        }
        Ok(!layers
            .values()
            .any(|meta| meta.parent.as_deref() == Some(graph_id.as_str())))
    }
}

/// One layer of a scripted image: id, reported size, bytes served
#[derive(Clone)]
pub struct FakeLayer {
    pub id: String,
    pub size: u64,
    pub data: Vec<u8>,
}

impl FakeLayer {
    pub fn new(id: &str, size: u64) -> Self {
        FakeLayer {
            id: id.to_owned(),
            size,
            data: format!("layer data for {}", id).into_bytes(),
        }
    }

    pub fn with_data_len(mut self, len: usize) -> Self {
        self.data = vec![0x5a; len];
        self
    }

    pub fn digest(&self) -> String {
        format!("sha256:{}", self.id)
    }
}

/// Registry session serving one image, with a log of every call
#[derive(Default)]
pub struct FakeSession {
    pub endpoints: Vec<String>,
    pub broken_endpoints: HashSet<String>,
    pub tag: String,
    /// root first
    pub layers: Vec<FakeLayer>,
    pub manifest_override: Option<Manifest>,
    requests: Mutex<Vec<String>>,
}

impl FakeSession {
    pub fn new(layers: Vec<FakeLayer>) -> Self {
        FakeSession {
            endpoints: vec!["https://reg-a.example.com/v1/".into()],
            tag: "latest".into(),
            layers,
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn log(&self, request: String) {
        self.requests.lock().unwrap().push(request);
    }

    pub fn leaf_id(&self) -> String {
        self.layers.last().unwrap().id.clone()
    }

    fn image_json(&self, index: usize) -> ImageJson {
        let layer = &self.layers[index];
        let config = if index + 1 == self.layers.len() {
            Some(ImageConfig {
                env: Some(vec!["PATH=/usr/bin:/bin".into(), "LANG=C".into()]),
                volumes: Some(
                    vec![("/data".to_owned(), serde_json::json!({}))]
                        .into_iter()
                        .collect(),
                ),
            })
        } else {
            None
        };
        ImageJson {
            id: layer.id.clone(),
            parent: index.checked_sub(1).map(|i| self.layers[i].id.clone()),
            size: layer.size,
            config,
        }
    }

    fn index_of(&self, id: &str) -> Result<usize, CakeError> {
        self.layers
            .iter()
            .position(|layer| layer.id == id)
            .ok_or_else(|| CakeError::RegistryResponse(format!("no image {}", id)))
    }

    fn check_endpoint(&self, endpoint: &str) -> Result<(), CakeError> {
        if self.broken_endpoints.contains(endpoint) {
            Err(CakeError::RegistryResponse(format!("{} is down", endpoint)))
        } else {
            Ok(())
        }
    }

    pub fn manifest(&self) -> Manifest {
        if let Some(manifest) = &self.manifest_override {
            return manifest.clone();
        }
        let indexes = (0..self.layers.len()).rev();
        Manifest {
            name: "library/fake".into(),
            tag: self.tag.clone(),
            fs_layers: indexes
                .clone()
                .map(|i| FsLayer {
                    blob_sum: self.layers[i].digest(),
                })
                .collect(),
            history: indexes
                .map(|i| History {
                    v1_compatibility: serde_json::to_string(&self.image_json(i)).unwrap(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn get_repository_data(&self, remote: &str) -> Result<RepositoryData, CakeError> {
        self.log(format!("repository {}", remote));
        Ok(RepositoryData {
            endpoints: self.endpoints.clone(),
            tokens: vec![],
        })
    }

    async fn get_remote_tags(
        &self,
        _endpoints: &[String],
        remote: &str,
    ) -> Result<HashMap<String, String>, CakeError> {
        self.log(format!("tags {}", remote));
        let mut tags = HashMap::new();
        if !self.layers.is_empty() {
            tags.insert(self.tag.clone(), self.leaf_id());
        }
        Ok(tags)
    }

    async fn get_remote_history(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<Vec<String>, CakeError> {
        self.log(format!("history {} {}", image_id, endpoint));
        self.check_endpoint(endpoint)?;
        let index = self.index_of(image_id)?;
        Ok(self.layers[..=index]
            .iter()
            .rev()
            .map(|layer| layer.id.clone())
            .collect())
    }

    async fn get_remote_image_json(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<(Vec<u8>, Option<u64>), CakeError> {
        self.log(format!("json {} {}", image_id, endpoint));
        self.check_endpoint(endpoint)?;
        let index = self.index_of(image_id)?;
        let image = self.image_json(index);
        Ok((serde_json::to_vec(&image)?, Some(image.size)))
    }

    async fn get_remote_image_layer(
        &self,
        image_id: &str,
        endpoint: &str,
    ) -> Result<LayerStream, CakeError> {
        self.log(format!("layer {} {}", image_id, endpoint));
        self.check_endpoint(endpoint)?;
        let index = self.index_of(image_id)?;
        Ok(Box::new(Cursor::new(self.layers[index].data.clone())))
    }

    async fn get_v2_image_manifest(
        &self,
        _endpoint: &Endpoint,
        remote: &str,
        tag: &str,
    ) -> Result<Manifest, CakeError> {
        self.log(format!("manifest {} {}", remote, tag));
        if tag != self.tag {
            return Err(CakeError::TagNotFound(tag.to_owned()));
        }
        Ok(self.manifest())
    }

    async fn get_v2_image_blob_reader(
        &self,
        _endpoint: &Endpoint,
        _remote: &str,
        digest: &str,
    ) -> Result<LayerStream, CakeError> {
        self.log(format!("blob {}", digest));
        let layer = self
            .layers
            .iter()
            .find(|layer| layer.digest() == digest)
            .ok_or_else(|| CakeError::RegistryResponse(format!("no blob {}", digest)))?;
        Ok(Box::new(Cursor::new(layer.data.clone())))
    }
}

/// Provider handing out one session, at a fixed protocol version
pub struct FakeProvider {
    pub session: Arc<FakeSession>,
    pub version: ApiVersion,
    pub insecure_hosts: HashSet<String>,
    hosts: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(session: Arc<FakeSession>, version: ApiVersion) -> Self {
        FakeProvider {
            session,
            version,
            insecure_hosts: HashSet::new(),
            hosts: Default::default(),
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

pub fn endpoint_for(host: &str, version: ApiVersion) -> Endpoint {
    Endpoint::new(Url::parse(&format!("https://{}/", host)).unwrap(), version)
}

#[async_trait]
impl RegistryProvider for FakeProvider {
    async fn provide_registry(
        &self,
        host: &str,
    ) -> Result<(Arc<dyn Session>, Endpoint), CakeError> {
        self.hosts.lock().unwrap().push(host.to_owned());
        if self.insecure_hosts.contains(host) {
            return Err(CakeError::InsecureRegistry {
                cause: "tls handshake failed".into(),
                endpoint: host.to_owned(),
                allow_list: vec![],
            });
        }
        let session: Arc<dyn Session> = self.session.clone();
        Ok((session, endpoint_for(host, self.version)))
    }
}

pub fn fetch_request(session: Arc<FakeSession>, version: ApiVersion, max_size: u64) -> FetchRequest {
    FetchRequest {
        session,
        endpoint: endpoint_for("registry.example.com", version),
        repo_path: "fake".into(),
        remote_path: "library/fake".into(),
        tag: "latest".into(),
        max_size,
    }
}
