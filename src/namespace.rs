//! Translating file ownership into a user namespace's id ranges

use crate::errors::CakeError;
use async_trait::async_trait;
use std::{
    fmt, fs, io,
    os::unix::fs::{lchown, MetadataExt},
    path::{Path, PathBuf},
};
use tokio::task;
use walkdir::WalkDir;

/// One contiguous range of ids, `size` long, starting at `container_id`
/// inside the namespace and at `host_id` outside it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl Mapping {
    fn translate(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.container_id, self.host_id, self.size)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mappings(pub Vec<Mapping>);

impl Mappings {
    /// Host id for a container id, using the first range that covers it.
    /// Ids outside every range map to themselves.
    pub fn map(&self, id: u32) -> u32 {
        self.0
            .iter()
            .find_map(|mapping| mapping.translate(id))
            .unwrap_or(id)
    }
}

impl fmt::Display for Mappings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, mapping) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", mapping)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdTranslator {
    pub uid_mappings: Mappings,
    pub gid_mappings: Mappings,
}

impl IdTranslator {
    pub fn new(uid_mappings: Mappings, gid_mappings: Mappings) -> Self {
        IdTranslator {
            uid_mappings,
            gid_mappings,
        }
    }

    /// Host ownership for a file owned by `(uid, gid)` in the container, or
    /// None if the translation leaves it unchanged
    pub fn translate(&self, uid: u32, gid: u32) -> Option<(u32, u32)> {
        let mapped = (self.uid_mappings.map(uid), self.gid_mappings.map(gid));
        if mapped == (uid, gid) {
            None
        } else {
            Some(mapped)
        }
    }

    pub fn cache_key(&self) -> String {
        format!("uid:{}+gid:{}", self.uid_mappings, self.gid_mappings)
    }
}

/// Rewrites ownership in a root filesystem
#[async_trait]
pub trait Namespacer: Send + Sync {
    /// Identifies the translation, so namespaced layers can be shared
    fn cache_key(&self) -> String;

    async fn namespace(&self, rootfs: &Path) -> Result<(), CakeError>;
}

pub struct UidNamespacer {
    translator: IdTranslator,
}

impl UidNamespacer {
    pub fn new(translator: IdTranslator) -> Self {
        UidNamespacer { translator }
    }
}

fn translate_tree(root: &Path, translator: &IdTranslator) -> io::Result<usize> {
    let mut changed = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let meta = entry.path().symlink_metadata()?;
        let (uid, gid) = match translator.translate(meta.uid(), meta.gid()) {
            Some(ids) => ids,
            None => continue,
        };
        lchown(entry.path(), Some(uid), Some(gid))?;
        // chown clears setuid and setgid bits
        if !meta.file_type().is_symlink() {
            fs::set_permissions(entry.path(), meta.permissions())?;
        }
        changed += 1;
    }
    Ok(changed)
}

#[async_trait]
impl Namespacer for UidNamespacer {
    fn cache_key(&self) -> String {
        self.translator.cache_key()
    }

    async fn namespace(&self, rootfs: &Path) -> Result<(), CakeError> {
        let root: PathBuf = rootfs.to_path_buf();
        let translator = self.translator.clone();
        log::debug!("translating ownership under {:?} with {}", root, translator.cache_key());
        let changed = task::spawn_blocking(move || translate_tree(&root, &translator))
            .await?
            .map_err(CakeError::from_io)?;
        log::debug!("changed ownership of {} entries", changed);
        Ok(())
    }
}
