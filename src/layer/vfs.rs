use crate::{
    errors::CakeError,
    layer::{Cake, LayerId, LayerMeta, LayerStream},
    quota::QuotaedReader,
};
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use regex::Regex;
use std::{
    fs, io,
    os::unix::fs::{lchown, symlink, MetadataExt},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tar::{Archive, EntryType};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    task,
};
use tokio_util::io::SyncIoBridge;
use walkdir::WalkDir;

const META_FILE: &str = "meta.json";
const ROOTFS_DIR: &str = "rootfs";
const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Graph driver that stores every layer as a full copy of its parent
///
/// Each layer lives at `<root>/layers/<graph id>/` with a `meta.json` and a
/// `rootfs/` directory. New layers are assembled in `<root>/tmp/` and renamed
/// into place, so a layer is either fully present or absent. Registered tar
/// streams may be gzip compressed, and docker-style whiteout entries are
/// applied against the parent's contents. A registered layer records the
/// larger of its declared size and the bytes actually streamed.
///
/// Only leaves can be removed.
#[derive(Clone, Debug)]
pub struct VfsCake {
    root: PathBuf,
    preserve_ownership: bool,
}

impl VfsCake {
    pub fn new(root: PathBuf) -> Self {
        VfsCake {
            root,
            preserve_ownership: unsafe { libc::geteuid() } == 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, id: &LayerId) -> Result<PathBuf, CakeError> {
        let graph_id = id.graph_id();
        check_graph_id(&graph_id)?;
        let mut path = self.root.join("layers");
        path.push(graph_id);
        Ok(path)
    }

    fn temp_dir(&self) -> PathBuf {
        let mut path = self.root.join("tmp");
        path.push(format!("{}-{}", std::process::id(), rand::random::<u64>()));
        path
    }

    fn read_meta(&self, id: &LayerId) -> Result<LayerMeta, CakeError> {
        let path = self.layer_dir(id)?.join(META_FILE);
        match fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CakeError::LayerNotFound(id.graph_id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build a staging directory holding a copy of the parent's files
    fn stage(&self, meta: &LayerMeta) -> Result<Staging, CakeError> {
        let dest = self.layer_dir(&LayerId::DockerImage(meta.id.clone()))?;
        if dest.exists() {
            return Err(CakeError::LayerExists(meta.id.clone()));
        }
        let staging = Staging::new(self.temp_dir());
        fs::create_dir_all(staging.rootfs())?;
        if let Some(parent) = &meta.parent {
            let parent_dir = self.layer_dir(&LayerId::DockerImage(parent.clone()))?;
            if !parent_dir.join(META_FILE).exists() {
                return Err(CakeError::LayerNotFound(parent.clone()));
            }
            copy_tree(
                &parent_dir.join(ROOTFS_DIR),
                &staging.rootfs(),
                self.preserve_ownership,
            )?;
        }
        Ok(staging)
    }

    /// Write `meta` into the staging directory and move it into the graph
    fn commit(&self, mut staging: Staging, meta: &LayerMeta) -> Result<(), CakeError> {
        let dest = self.layer_dir(&LayerId::DockerImage(meta.id.clone()))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            return Err(CakeError::LayerExists(meta.id.clone()));
        }
        fs::write(staging.path.join(META_FILE), serde_json::to_vec(meta)?)?;
        fs::rename(&staging.path, &dest)?;
        staging.committed = true;
        log::debug!("layer committed, {} -> {:?}", meta.id, dest);
        Ok(())
    }

    fn children_of(&self, graph_id: &str) -> Result<usize, CakeError> {
        let layers = self.root.join("layers");
        let entries = match fs::read_dir(&layers) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut count = 0;
        for entry in entries {
            let meta_path = entry?.path().join(META_FILE);
            let data = match fs::read(&meta_path) {
                Ok(data) => data,
                // raced with a remove
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let meta: LayerMeta = serde_json::from_slice(&data)?;
            if meta.parent.as_deref() == Some(graph_id) {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl Cake for VfsCake {
    async fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> Result<(), CakeError> {
        let meta = LayerMeta {
            id: id.graph_id(),
            parent: parent.map(LayerId::graph_id),
            size: 0,
        };
        log::debug!("vfs create, {} on {:?}", meta.id, meta.parent);
        let cake = self.clone();
        task::spawn_blocking(move || {
            let staging = cake.stage(&meta)?;
            cake.commit(staging, &meta)
        })
        .await?
    }

    async fn get(&self, id: &LayerId) -> Result<LayerMeta, CakeError> {
        let cake = self.clone();
        let id = id.clone();
        task::spawn_blocking(move || cake.read_meta(&id)).await?
    }

    async fn remove(&self, id: &LayerId) -> Result<(), CakeError> {
        let cake = self.clone();
        let id = id.clone();
        task::spawn_blocking(move || {
            let dir = cake.layer_dir(&id)?;
            if !dir.join(META_FILE).exists() {
                return Err(CakeError::LayerNotFound(id.graph_id()));
            }
            if cake.children_of(&id.graph_id())? > 0 {
                return Err(CakeError::LayerHasChildren(id.graph_id()));
            }
            // Move it out of the graph first so it disappears atomically
            let doomed = cake.temp_dir();
            if let Some(parent) = doomed.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&dir, &doomed)?;
            fs::remove_dir_all(&doomed)?;
            log::debug!("vfs remove, {}", id);
            Ok(())
        })
        .await?
    }

    async fn path(&self, id: &LayerId) -> Result<PathBuf, CakeError> {
        let dir = self.layer_dir(id)?;
        if tokio::fs::metadata(dir.join(META_FILE)).await.is_err() {
            return Err(CakeError::LayerNotFound(id.graph_id()));
        }
        Ok(dir.join(ROOTFS_DIR))
    }

    async fn register(&self, mut meta: LayerMeta, layer: LayerStream) -> Result<(), CakeError> {
        log::debug!("vfs register, {} on {:?}", meta.id, meta.parent);
        let cake = self.clone();
        let staging = {
            let meta = meta.clone();
            task::spawn_blocking(move || cake.stage(&meta)).await??
        };

        // unlimited, only counting
        let counted = QuotaedReader::new(layer, u64::MAX);
        let streamed = counted.delivered();
        let mut buffered = BufReader::new(counted);
        let is_gzip = buffered
            .fill_buf()
            .await
            .map(|head| head.starts_with(&GZIP_MAGIC))
            .map_err(CakeError::from_io)?;
        let decoded: Box<dyn AsyncRead + Send + Unpin> = if is_gzip {
            Box::new(GzipDecoder::new(buffered))
        } else {
            Box::new(buffered)
        };

        let bridge = SyncIoBridge::new(decoded);
        let rootfs = staging.rootfs();
        let abandoned = staging.abandoned.clone();
        let preserve_ownership = self.preserve_ownership;
        task::spawn_blocking(move || {
            let applied = apply_layer(bridge, &rootfs, preserve_ownership, &abandoned);
            if abandoned.load(Ordering::SeqCst) {
                // the registration went away while this task was blocked on its stream
                if let Some(staging) = rootfs.parent() {
                    let _ = remove_any(staging);
                }
            }
            applied
        })
        .await?
        .map_err(CakeError::from_io)?;

        meta.size = meta.size.max(streamed.load(Ordering::Relaxed));
        let cake = self.clone();
        task::spawn_blocking(move || cake.commit(staging, &meta)).await?
    }

    async fn is_leaf(&self, id: &LayerId) -> Result<bool, CakeError> {
        let cake = self.clone();
        let id = id.clone();
        task::spawn_blocking(move || {
            cake.read_meta(&id)?;
            Ok(cake.children_of(&id.graph_id())? == 0)
        })
        .await?
    }
}

fn check_graph_id(graph_id: &str) -> Result<(), CakeError> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-]*$").unwrap();
    }
    if RE.is_match(graph_id) {
        Ok(())
    } else {
        Err(CakeError::InvalidLayerId(graph_id.to_owned()))
    }
}

/// A layer being assembled under `tmp/`
///
/// Dropped before it is committed, the directory is removed and any
/// extraction still writing into it is told to stop.
struct Staging {
    path: PathBuf,
    abandoned: Arc<AtomicBool>,
    committed: bool,
}

impl Staging {
    fn new(path: PathBuf) -> Self {
        Staging {
            path,
            abandoned: Arc::new(AtomicBool::new(false)),
            committed: false,
        }
    }

    fn rootfs(&self) -> PathBuf {
        self.path.join(ROOTFS_DIR)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.abandoned.store(true, Ordering::SeqCst);
        if let Err(e) = remove_any(&self.path) {
            log::warn!("can't clean up staging directory {:?}: {}", self.path, e);
        }
    }
}

/// Apply one tar layer on top of the files already at `rootfs`
fn apply_layer<R: io::Read>(
    reader: R,
    rootfs: &Path,
    preserve_ownership: bool,
    abandoned: &AtomicBool,
) -> io::Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(preserve_ownership);
    archive.set_unpack_xattrs(false);
    for entry in archive.entries()? {
        if abandoned.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "layer registration abandoned",
            ));
        }
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let file_name = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_owned(),
            None => {
                entry.unpack_in(rootfs)?;
                continue;
            }
        };
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !is_contained(&parent) {
            log::warn!("skipping tar entry outside the layer root, {:?}", path);
            continue;
        }
        if file_name == WHITEOUT_OPAQUE {
            let dir = rootfs.join(&parent);
            if let Ok(children) = fs::read_dir(&dir) {
                for child in children {
                    remove_any(&child?.path())?;
                }
            }
        } else if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            remove_any(&rootfs.join(&parent).join(hidden))?;
        } else {
            match entry.header().entry_type() {
                EntryType::XGlobalHeader | EntryType::XHeader => (),
                _ => {
                    entry.unpack_in(rootfs)?;
                }
            }
        }
    }
    Ok(())
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    }
}

fn copy_tree(from: &Path, to: &Path, preserve_ownership: bool) -> io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let dest = to.join(relative);
        let meta = entry.path().symlink_metadata()?;
        let kind = meta.file_type();
        if kind.is_dir() {
            fs::create_dir(&dest)?;
            fs::set_permissions(&dest, meta.permissions())?;
        } else if kind.is_symlink() {
            symlink(fs::read_link(entry.path())?, &dest)?;
        } else if kind.is_file() {
            fs::copy(entry.path(), &dest)?;
        } else {
            log::warn!("skipping special file during layer copy, {:?}", entry.path());
            continue;
        }
        if preserve_ownership {
            lchown(&dest, Some(meta.uid()), Some(meta.gid()))?;
        }
    }
    Ok(())
}
