use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha512};

use crate::checksum::{self, ChecksumProvider};
use crate::compression::{self, CompressionProvider};
use crate::errors::{Result, UpdaterError};
use crate::manifest::{DEFAULT_LOCALE, DESCRIPTION_KEY, DistFile, DistManifest, DistUpdateLog};
use crate::storage::{self, LocalStorageConfig, StorageBackend};
use crate::util;

pub mod scanner;

use scanner::{DistScanner, ScannedFile};

const UPLOAD_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Publisher configuration (`config.json`). Wire names are camelCase like
/// the manifest itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadConfig {
    /// Display name shown at the user side.
    pub project_name: String,
    /// The files root to distribute.
    pub distribution_root: String,
    pub version_string: String,
    /// Requested build id; the published id is forced monotonic over the
    /// previously published manifest.
    pub build_id: u64,
    /// When set, the resolved build id is written back into this config.
    pub auto_increase_build_id: bool,
    /// Channel name; becomes the install subdirectory at the user side.
    pub channel: String,
    pub update_logs: Vec<DistUpdateLog>,
    /// Object keys to skip; directories end with `/`.
    pub ignored: Vec<String>,
    pub compression: String,
    /// Relative path of the entry point (`bin/program.exe`).
    pub executable: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osx_app_bundle: Option<String>,
    pub checksum: String,
    /// Storage backend name.
    pub storage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalStorageConfig>,
    /// Pass the build id to the launched executable as `--<passBuildId>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_build_id: Option<String>,
    /// Clients upgrading from below any of these wipe the channel first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reinstall_build_id: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_log_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_icon_url: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            project_name: "Default Project Name".into(),
            distribution_root: "./dist".into(),
            version_string: "0.0.1".into(),
            build_id: 100,
            auto_increase_build_id: true,
            channel: "release".into(),
            update_logs: Vec::new(),
            ignored: Vec::new(),
            compression: "brotli".into(),
            executable: String::new(),
            osx_app_bundle: None,
            checksum: "crc64".into(),
            storage: "local".into(),
            local: None,
            pass_build_id: None,
            reinstall_build_id: Vec::new(),
            update_log_url: None,
            app_icon_url: None,
        }
    }
}

/// What a publish run changed.
pub struct PublishOutcome {
    pub manifest: DistManifest,
    /// Object keys actually (re)uploaded, manifest key included.
    pub uploaded_keys: Vec<String>,
    /// Files skipped because the remote copy already matched.
    pub skipped: usize,
}

/// Resolve the build id to publish: strictly greater than the previous
/// manifest's, and equal to the configured id only when that id already is.
pub fn resolve_build_id(configured: u64, previous: Option<u64>) -> u64 {
    match previous {
        Some(prev) => configured.max(prev + 1),
        None => configured,
    }
}

/// Scan the distribution root, upload what changed and publish the manifest.
///
/// The manifest goes up last, and only if every file upload succeeded, so a
/// reader never observes a manifest referencing missing objects. On success
/// the resolved build id and any new update logs are written back into
/// `config` for the caller to persist.
pub async fn publish(
    config: &mut UploadConfig,
    update_log_lines: &[String],
) -> Result<PublishOutcome> {
    info!(
        "publish: providers {} {} {}",
        config.storage, config.checksum, config.compression
    );
    let check = checksum::resolve(&config.checksum)?;
    let compress = compression::resolve(&config.compression);
    let storage = storage::resolve(&config.storage, config.local.as_ref(), check.clone())?;

    let scanner = DistScanner::new(&config.distribution_root, config.ignored.clone());
    let items = scanner.scan()?;
    info!(
        "publish: {} files under {}",
        items.len(),
        config.distribution_root
    );

    let previous = load_previous_manifest(storage.as_ref()).await;
    let compression_mismatch = previous
        .as_ref()
        .map(|prev| prev.compression != config.compression)
        .unwrap_or(true);
    if compression_mismatch {
        info!("publish: compression changed or no previous manifest; re-uploading every file");
    }

    let build_id = resolve_build_id(config.build_id, previous.as_ref().map(|p| p.build_id));
    if build_id == config.build_id {
        info!("publish: using configured build id {build_id}");
    } else {
        info!("publish: increased build id to {build_id}");
    }

    let workers = util::max_workers();
    let results: Vec<Result<(DistFile, Option<String>)>> = stream::iter(items)
        .map(|item| {
            let check = check.clone();
            let compress = compress.clone();
            let storage = storage.clone();
            async move {
                publish_file(item, check, compress, storage, compression_mismatch).await
            }
        })
        .buffer_unordered(workers)
        .collect()
        .await;

    let mut files = Vec::new();
    let mut uploaded_keys = Vec::new();
    let mut skipped = 0usize;
    for result in results {
        match result {
            Ok((file, Some(key))) => {
                files.push(file);
                uploaded_keys.push(key);
            }
            Ok((file, None)) => {
                files.push(file);
                skipped += 1;
            }
            Err(err) => {
                error!("publish: aborting, file upload failed: {err}");
                return Err(err);
            }
        }
    }
    files.sort_by(|a, b| a.object_key.cmp(&b.object_key));

    let mut manifest = DistManifest {
        project_name: config.project_name.clone(),
        version_string: config.version_string.clone(),
        build_id,
        channel: config.channel.clone(),
        compression: config.compression.clone(),
        checksum: config.checksum.clone(),
        executable: config.executable.clone(),
        osx_app_bundle: config.osx_app_bundle.clone(),
        files,
        update_logs: config.update_logs.clone(),
        pass_build_id: config.pass_build_id.clone(),
        reinstall_build_id: config.reinstall_build_id.clone(),
        update_log_url: config.update_log_url.clone(),
        app_icon_url: config.app_icon_url.clone(),
    };

    if let Some(entry) = new_update_log(build_id, &config.version_string, update_log_lines) {
        info!("publish: appending update log for build {build_id}");
        manifest.update_logs.push(entry.clone());
        config.update_logs.push(entry);
    }
    if config.auto_increase_build_id {
        config.build_id = build_id;
    }

    let body = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| UpdaterError::Config(format!("failed to serialize manifest: {e}")))?;
    storage.upload(DESCRIPTION_KEY, &body).await?;
    uploaded_keys.push(DESCRIPTION_KEY.to_owned());
    info!("publish: manifest uploaded (build {build_id})");

    if let Some(cdn) = storage.cdn() {
        info!("publish: refreshing CDN");
        cdn.purge_path().await?;
        cdn.prefetch(&uploaded_keys).await?;
    }

    Ok(PublishOutcome {
        manifest,
        uploaded_keys,
        skipped,
    })
}

async fn load_previous_manifest(storage: &dyn StorageBackend) -> Option<DistManifest> {
    match storage.download(DESCRIPTION_KEY).await {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!("publish: previous manifest unreadable, treating as first publish: {err}");
                None
            }
        },
        Ok(None) => {
            warn!("publish: no previous manifest found");
            None
        }
        Err(err) => {
            warn!("publish: failed to fetch previous manifest ({err}); treating as first publish");
            None
        }
    }
}

async fn publish_file(
    item: ScannedFile,
    check: Arc<dyn ChecksumProvider>,
    compress: Arc<dyn CompressionProvider>,
    storage: Arc<dyn StorageBackend>,
    force_upload: bool,
) -> Result<(DistFile, Option<String>)> {
    let raw = tokio::fs::read(&item.path).await.map_err(|e| {
        UpdaterError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read {}: {e}", item.path.display()),
        ))
    })?;
    let compressed = compress.compress(&raw)?;
    let digest = check.calculate_bytes(&compressed);
    let file_digest = check.calculate_bytes(&raw);

    let file = DistFile {
        object_key: item.object_key.clone(),
        checksum: digest.clone(),
        file_checksum: Some(file_digest),
        download_size: compressed.len() as u64,
        file_size: raw.len() as u64,
    };

    let upload = if force_upload {
        true
    } else {
        let same = storage.check_same(&item.object_key, &digest).await?;
        debug!(
            "publish: {} -> {}",
            item.object_key,
            if same { "same" } else { "changed" }
        );
        !same
    };
    if !upload {
        return Ok((file, None));
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match storage.upload(&item.object_key, &compressed).await {
            Ok(()) => {
                debug!("publish: uploaded {}", item.object_key);
                return Ok((file, Some(item.object_key)));
            }
            Err(err) if attempt < UPLOAD_ATTEMPTS => {
                warn!(
                    "publish: upload {} failed (attempt {attempt}): {err}",
                    item.object_key
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Build a changelog entry from raw CLI lines: blanks dropped, duplicates
/// collapsed, order preserved, tagged with the resolved build id.
fn new_update_log(
    build_id: u64,
    version_string: &str,
    lines: &[String],
) -> Option<DistUpdateLog> {
    let mut seen = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || seen.iter().any(|s| s == line) {
            continue;
        }
        seen.push(line.to_owned());
    }
    if seen.is_empty() {
        return None;
    }
    Some(DistUpdateLog {
        build_id,
        version_string: version_string.to_owned(),
        items: BTreeMap::from([(DEFAULT_LOCALE.to_owned(), seen)]),
    })
}

/// Publish one platform's agent binary for the self-update channel: the
/// brotli-compressed binary, its SHA-512 digest (hex, over the raw bytes)
/// and the build-id marker the client polls.
pub async fn publish_agent(
    storage: Arc<dyn StorageBackend>,
    runtime: &str,
    path: &Path,
    build_id: u64,
) -> Result<()> {
    let raw = tokio::fs::read(path).await.map_err(UpdaterError::Io)?;
    let digest = hex::encode(Sha512::digest(&raw));
    let compressed = compression::resolve("brotli").compress(&raw)?;

    storage
        .upload(&format!("agent-{runtime}.sha512"), digest.as_bytes())
        .await?;
    storage
        .upload(&format!("agent-{runtime}"), &compressed)
        .await?;
    storage
        .upload(
            &format!("{runtime}-build-id"),
            build_id.to_string().as_bytes(),
        )
        .await?;
    info!("publish: agent {runtime} build {build_id} ({} bytes)", raw.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    #[test]
    fn build_id_resolution_is_monotonic() {
        // R > P always; R == C iff C > P.
        for (configured, previous, expected) in [
            (100, Some(99), 100),
            (100, Some(100), 101),
            (100, Some(150), 151),
            (13000, Some(12902), 13000),
            (100, None, 100),
        ] {
            let resolved = resolve_build_id(configured, previous);
            assert_eq!(resolved, expected);
            if let Some(prev) = previous {
                assert!(resolved > prev);
                assert_eq!(resolved == configured, configured > prev);
            }
        }
    }

    #[test]
    fn update_log_lines_are_deduplicated_and_blank_free() {
        let entry = new_update_log(
            7,
            "1.0",
            &[
                "fix a".into(),
                "  ".into(),
                "fix a".into(),
                "fix b".into(),
            ],
        )
        .unwrap();
        assert_eq!(entry.build_id, 7);
        assert_eq!(
            entry.items[DEFAULT_LOCALE],
            vec!["fix a".to_owned(), "fix b".to_owned()]
        );
        assert!(new_update_log(7, "1.0", &["".into()]).is_none());
    }

    fn test_config(dist_root: &Path, storage_root: &Path) -> UploadConfig {
        UploadConfig {
            project_name: "Demo".into(),
            distribution_root: dist_root.to_string_lossy().into_owned(),
            version_string: "1.0.0".into(),
            build_id: 100,
            channel: "release".into(),
            compression: "gzip".into(),
            checksum: "crc64".into(),
            executable: "app".into(),
            storage: "local".into(),
            local: Some(LocalStorageConfig {
                root: storage_root.to_string_lossy().into_owned(),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_uploads_everything_once_then_only_the_manifest() {
        let dist = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        fs::write(dist.path().join("app"), b"binary").unwrap();
        fs::create_dir_all(dist.path().join("data")).unwrap();
        fs::write(dist.path().join("data/level.dat"), b"level").unwrap();

        let mut config = test_config(dist.path(), store.path());
        let first = publish(&mut config, &[]).await.unwrap();
        assert_eq!(first.manifest.build_id, 100);
        assert_eq!(first.manifest.files.len(), 2);
        assert_eq!(first.uploaded_keys.len(), 3); // two files + manifest
        assert_eq!(config.build_id, 100);

        // Nothing changed: only the manifest is rewritten, build id moves on.
        let second = publish(&mut config, &[]).await.unwrap();
        assert_eq!(second.uploaded_keys, vec![DESCRIPTION_KEY.to_owned()]);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.manifest.build_id, 101);
    }

    #[tokio::test]
    async fn compression_change_forces_full_reupload() {
        let dist = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        fs::write(dist.path().join("app"), b"binary").unwrap();

        let mut config = test_config(dist.path(), store.path());
        publish(&mut config, &[]).await.unwrap();

        config.compression = "brotli".into();
        let outcome = publish(&mut config, &[]).await.unwrap();
        assert_eq!(outcome.skipped, 0);
        assert!(outcome.uploaded_keys.contains(&"app".to_owned()));
    }

    #[tokio::test]
    async fn update_logs_accumulate_across_publishes() {
        let dist = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        fs::write(dist.path().join("app"), b"binary").unwrap();

        let mut config = test_config(dist.path(), store.path());
        publish(&mut config, &["first release".into()]).await.unwrap();
        let outcome = publish(&mut config, &["bugfixes".into()]).await.unwrap();

        let logs = &outcome.manifest.update_logs;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].build_id, 100);
        assert_eq!(logs[1].build_id, 101);
        assert_eq!(logs[1].items[DEFAULT_LOCALE], vec!["bugfixes".to_owned()]);
    }

    #[tokio::test]
    async fn published_agent_digest_verifies() {
        use sha2::{Digest as _, Sha512};

        let store = tempfile::tempdir().unwrap();
        let binary = store.path().join("agent-binary");
        fs::write(&binary, b"agent payload").unwrap();

        let check = checksum::resolve("crc64").unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(
            crate::storage::local::LocalDirStorage::new(store.path().to_path_buf(), check),
        );
        publish_agent(storage.clone(), "linux", &binary, 5)
            .await
            .unwrap();

        let marker = storage.download("linux-build-id").await.unwrap().unwrap();
        assert_eq!(marker, b"5");

        let digest = storage.download("agent-linux.sha512").await.unwrap().unwrap();
        let compressed = storage.download("agent-linux").await.unwrap().unwrap();
        let payload = compression::resolve("brotli").decompress(&compressed).unwrap();
        assert_eq!(payload, b"agent payload");
        assert_eq!(
            String::from_utf8(digest).unwrap(),
            hex::encode(Sha512::digest(b"agent payload"))
        );
    }
}
