use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumProvider;
use crate::errors::{Result, UpdaterError};

pub mod local;

/// Optional CDN invalidation capability of a storage backend. Backends
/// without it simply skip invalidation; absence is not an error.
#[async_trait]
pub trait CdnRefresh: Send + Sync {
    /// Invalidate every cached object under the distribution path.
    async fn purge_path(&self) -> Result<()>;
    /// Proactively warm the cache with freshly uploaded keys.
    async fn prefetch(&self, object_keys: &[String]) -> Result<()>;
}

/// Uniform capability over heterogeneous object stores, consumed by the
/// publisher. Object keys are forward-slash relative paths.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn upload(&self, object_key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch an object; `None` when the key does not exist.
    async fn download(&self, object_key: &str) -> Result<Option<Vec<u8>>>;

    /// Cheap metadata check whether the stored object already matches
    /// `checksum` (of the compressed bytes). Missing objects are not-same.
    async fn check_same(&self, object_key: &str, checksum: &str) -> Result<bool>;

    fn cdn(&self) -> Option<&dyn CdnRefresh> {
        None
    }
}

/// Settings for the directory-backed store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalStorageConfig {
    pub root: String,
}

/// Resolve the configured backend name to a concrete store, once per session.
pub fn resolve(
    storage: &str,
    local_config: Option<&LocalStorageConfig>,
    check: Arc<dyn ChecksumProvider>,
) -> Result<Arc<dyn StorageBackend>> {
    match storage {
        "local" => {
            let config = local_config.ok_or_else(|| {
                UpdaterError::Config("storage `local` selected but `local` settings missing".into())
            })?;
            Ok(Arc::new(local::LocalDirStorage::new(
                config.root.clone().into(),
                check,
            )))
        }
        other => Err(UpdaterError::Config(format!(
            "no effective storage provider for {other:?}"
        ))),
    }
}
