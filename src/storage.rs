// src/storage.rs
//
// Source image storage. `FileStorage` reads `{root}/{id}.jpg`; `StorageLoader`
// plugs any storage into the cache as its miss-path loader.

use crate::cache::Loader;
use crate::context::Context;
use crate::error::{ImageDeliveryError, Result};
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Raw image bytes by id. Missing ids fail with `StorageNotFound`.
pub trait Storage: Send + Sync {
    fn get(&self, ctx: &Context, id: &str) -> Result<Bytes>;
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open a storage rooted at `root`, which must exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::metadata(root).map_err(|e| {
            ImageDeliveryError::storage_read_failed(root.display().to_string(), e)
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        // Ids are flat names; anything that could escape the root is treated as absent.
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return None;
        }
        Some(self.root.join(format!("{id}.jpg")))
    }
}

impl Storage for FileStorage {
    fn get(&self, ctx: &Context, id: &str) -> Result<Bytes> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let path = self
            .path_for(id)
            .ok_or_else(|| ImageDeliveryError::storage_not_found(id.to_string()))?;

        match std::fs::read(&path) {
            Ok(data) => {
                debug!(id, bytes = data.len(), "read source image");
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ImageDeliveryError::storage_not_found(id.to_string()))
            }
            Err(e) => Err(ImageDeliveryError::storage_read_failed(id.to_string(), e)),
        }
    }
}

/// Cache loader backed by a [`Storage`].
#[derive(Clone)]
pub struct StorageLoader {
    storage: Arc<dyn Storage>,
}

impl StorageLoader {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl Loader for StorageLoader {
    fn load(&self, ctx: &Context, key: &str) -> Result<Bytes> {
        self.storage.get(ctx, key)
    }
}
