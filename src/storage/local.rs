use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::fs;

use super::StorageBackend;
use crate::checksum::{ChecksumProvider, checksums_equal};
use crate::errors::{Result, UpdaterError};

/// Directory-backed object store. Anything that can serve static files
/// (nginx, a synced bucket mount) turns its root into a distribution URL,
/// which makes it the reference backend for local and CI publishes.
pub struct LocalDirStorage {
    root: PathBuf,
    check: Arc<dyn ChecksumProvider>,
}

impl LocalDirStorage {
    pub fn new(root: PathBuf, check: Arc<dyn ChecksumProvider>) -> Self {
        Self { root, check }
    }

    fn object_path(&self, object_key: &str) -> PathBuf {
        self.root.join(object_key)
    }
}

#[async_trait]
impl StorageBackend for LocalDirStorage {
    async fn upload(&self, object_key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(object_key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                UpdaterError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| UpdaterError::Storage(format!("failed to store {object_key}: {e}")))?;
        debug!("storage: stored {} ({} bytes)", object_key, bytes.len());
        Ok(())
    }

    async fn download(&self, object_key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.object_path(object_key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(UpdaterError::Storage(format!(
                "failed to read {object_key}: {err}"
            ))),
        }
    }

    async fn check_same(&self, object_key: &str, checksum: &str) -> Result<bool> {
        let Some(bytes) = self.download(object_key).await? else {
            return Ok(false);
        };
        let stored = self.check.calculate_bytes(&bytes);
        Ok(checksums_equal(&stored, checksum))
    }
}
