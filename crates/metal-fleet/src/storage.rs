//! Durable object storage for cluster state and artifacts.
//!
//! Objects are opaque byte blobs keyed by slash-separated paths such as
//! `provider-state` or `tools/releases/agent-1.0.0-amd64.tgz`.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{FleetError, Result};

/// Prefix of temporary files written by [`FileStorage`].
const TMP_PREFIX: &str = ".tmp-";

/// Key-value blob store with list-by-prefix.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Read an object.
    ///
    /// Fails with [`FleetError::ObjectNotFound`] when it does not exist.
    async fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Create or replace an object.
    async fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Names of all objects starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Delete every object.
    async fn remove_all(&self) -> Result<()>;
}

/// In-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::ObjectNotFound(name.to_string()))
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.objects
            .write()
            .await
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.objects.write().await.remove(name);
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        self.objects.write().await.clear();
        Ok(())
    }
}

/// Storage backed by a local directory tree.
///
/// Objects live under `<root>/objects`. Nothing outside that directory is
/// read, written or removed, and the root itself is never deleted.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    objects: PathBuf,
}

/// Subdirectory of the storage root holding the objects.
const OBJECTS_DIR: &str = "objects";

impl FileStorage {
    /// Create a file storage rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            objects: root.join(OBJECTS_DIR),
            root,
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the objects.
    #[must_use]
    pub fn objects_dir(&self) -> &Path {
        &self.objects
    }

    /// Resolve an object name to a path below the objects directory.
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(FleetError::Storage(format!("invalid object name {name:?}")));
        }
        Ok(self.objects.join(relative))
    }

    fn storage_error(action: &str, path: &Path, err: &std::io::Error) -> FleetError {
        FleetError::Storage(format!("failed to {action} {}: {err}", path.display()))
    }

    /// Object names and subdirectories below the objects directory.
    ///
    /// Directories are returned parents first.
    async fn walk(&self) -> Result<(Vec<String>, Vec<PathBuf>)> {
        let mut names = Vec::new();
        let mut dirs = Vec::new();
        let mut pending = vec![self.objects.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::storage_error("list", &dir, &e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::storage_error("list", &dir, &e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::storage_error("stat", &path, &e))?;
                if file_type.is_dir() {
                    dirs.push(path.clone());
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.objects) else {
                    continue;
                };
                names.push(
                    relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                );
            }
        }

        Ok((names, dirs))
    }
}

#[async_trait]
impl ObjectStorage for FileStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FleetError::ObjectNotFound(name.to_string()))
            }
            Err(e) => Err(Self::storage_error("read", &path, &e)),
        }
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;
        let parent = path.parent().unwrap_or(self.objects.as_path());
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Self::storage_error("create directory", parent, &e))?;

        // Write then rename so readers never observe a partial object.
        let tmp = parent.join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, data)
            .await
            .map_err(|e| Self::storage_error("write", &tmp, &e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::storage_error("rename", &path, &e))?;

        debug!(object = %name, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let (names, _) = self.walk().await?;
        let mut names: Vec<String> = names
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::storage_error("remove", &path, &e)),
        }
    }

    async fn remove_all(&self) -> Result<()> {
        let (names, dirs) = self.walk().await?;
        for name in &names {
            self.remove(name).await?;
        }

        // Prune emptied directories, deepest first. A directory that still
        // holds something (e.g. a leftover temp file) is kept.
        for dir in dirs.iter().rev().chain(std::iter::once(&self.objects)) {
            if let Err(e) = fs::remove_dir(dir).await {
                debug!(dir = %dir.display(), error = %e, "Keeping storage directory");
            }
        }

        debug!(objects = names.len(), "Removed all objects");
        Ok(())
    }
}
