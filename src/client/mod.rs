use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use tokio::fs;

use crate::checksum::{self, ChecksumProvider, checksums_equal};
use crate::compression::{self, CompressionProvider};
use crate::errors::{Result, UpdaterError};
use crate::manifest::{DESCRIPTION_KEY, DistFile, DistManifest, DistUpdateLog};
use crate::selfupdate;
use crate::sources;
use crate::util;

const RETRY_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How persistently a failed per-file download is retried.
#[derive(Clone, Copy, Debug)]
pub enum RetryPolicy {
    Bounded(u32),
    /// Keep retrying until the download goes through. For unattended runs
    /// that must eventually converge once the network comes back.
    Unbounded,
}

impl RetryPolicy {
    fn exhausted(&self, attempts: u32) -> bool {
        match self {
            RetryPolicy::Bounded(limit) => attempts >= *limit,
            RetryPolicy::Unbounded => false,
        }
    }
}

pub struct ReconcileOptions {
    /// Directory the channel subdirectory is created under.
    pub install_root: PathBuf,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub cancel: Arc<AtomicBool>,
}

pub struct ReconcileOutcome {
    pub build_id: u64,
    pub previous_build_id: Option<u64>,
    /// Files actually fetched; the rest already matched on disk.
    pub downloaded: usize,
    /// Entries newer than the previously applied build, newest first.
    pub update_logs: Vec<DistUpdateLog>,
    pub channel_root: PathBuf,
    pub executable: PathBuf,
}

/// Fetch the current release description from a distribution root.
pub async fn fetch_manifest(
    client: &reqwest::Client,
    distribution_url: &str,
) -> Result<DistManifest> {
    let bytes = get_bytes(client, distribution_url, DESCRIPTION_KEY).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| UpdaterError::Network(format!("malformed release description: {e}")))
}

/// Bring the channel directory in sync with `manifest`.
///
/// Every manifest file is verified against its compressed checksum by
/// recompressing the local copy; only mismatching or absent files are
/// fetched. The local manifest snapshot is written only after every needed
/// file verified and installed, so an interrupted run is retried from the
/// previous consistent state.
pub async fn reconcile(
    client: &reqwest::Client,
    manifest: &DistManifest,
    distribution_url: &str,
    options: &ReconcileOptions,
    progress: &(dyn Fn(u64) + Send + Sync),
) -> Result<ReconcileOutcome> {
    let check = checksum::resolve(&manifest.checksum)?;
    let compress = compression::resolve(&manifest.compression);

    let channel_root = options.install_root.join(&manifest.channel);
    let previous = read_local_manifest(&channel_root).await;
    let previous_build_id = previous.as_ref().map(|p| p.build_id);

    if let Some(prev) = previous_build_id
        && manifest.needs_reinstall(prev)
    {
        info!(
            "client: build {prev} predates a reinstall threshold, wiping {}",
            channel_root.display()
        );
        match fs::remove_dir_all(&channel_root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(UpdaterError::Io(err)),
        }
    }
    fs::create_dir_all(&channel_root)
        .await
        .map_err(UpdaterError::Io)?;

    // First pass: decide what actually needs fetching.
    let checks: Vec<Result<Option<DistFile>>> = stream::iter(manifest.files.iter().cloned())
        .map(|file| {
            let check = check.clone();
            let compress = compress.clone();
            let target = channel_root.join(&file.object_key);
            async move {
                if needs_download(&target, &file, compress.as_ref(), check.as_ref()).await? {
                    Ok(Some(file))
                } else {
                    Ok(None)
                }
            }
        })
        .buffer_unordered(options.workers)
        .collect()
        .await;

    let mut pending = Vec::new();
    for result in checks {
        if let Some(file) = result? {
            pending.push(file);
        }
    }
    pending.sort_by(|a, b| a.object_key.cmp(&b.object_key));
    info!(
        "client: {} of {} files need download",
        pending.len(),
        manifest.files.len()
    );

    let downloaded = pending.len();
    let results: Vec<Result<()>> = stream::iter(pending)
        .map(|file| {
            let check = check.clone();
            let compress = compress.clone();
            let cancel = options.cancel.clone();
            let target = channel_root.join(&file.object_key);
            async move {
                download_with_retry(
                    client,
                    distribution_url,
                    &file,
                    &target,
                    compress.as_ref(),
                    check.as_ref(),
                    options.retry,
                    &cancel,
                    progress,
                )
                .await
            }
        })
        .buffer_unordered(options.workers)
        .collect()
        .await;
    for result in results {
        if let Err(err) = result {
            options.cancel.store(true, Ordering::SeqCst);
            error!("client: reconcile aborted: {err}");
            return Err(err);
        }
    }

    write_local_manifest(&channel_root, manifest).await?;
    info!(
        "client: channel {} now at build {}",
        manifest.channel, manifest.build_id
    );

    Ok(ReconcileOutcome {
        build_id: manifest.build_id,
        previous_build_id,
        downloaded,
        // A fresh install has no baseline to diff against; history is noise.
        update_logs: previous_build_id
            .map(|prev| manifest.update_logs_since(prev))
            .unwrap_or_default(),
        executable: channel_root.join(&manifest.executable),
        channel_root,
    })
}

async fn read_local_manifest(channel_root: &Path) -> Option<DistManifest> {
    let bytes = fs::read(channel_root.join(DESCRIPTION_KEY)).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!("client: local manifest unreadable, treating as fresh install: {err}");
            None
        }
    }
}

async fn write_local_manifest(channel_root: &Path, manifest: &DistManifest) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest)
        .map_err(|e| UpdaterError::Config(format!("failed to serialize manifest: {e}")))?;
    fs::write(channel_root.join(DESCRIPTION_KEY), &bytes)
        .await
        .map_err(UpdaterError::Io)
}

/// Whether the installed copy of `file` is absent or stale. The installed
/// file is recompressed and compared by compressed checksum; the manifest's
/// digest of what the publisher uploaded is the source of truth.
async fn needs_download(
    target: &Path,
    file: &DistFile,
    compress: &dyn CompressionProvider,
    check: &dyn ChecksumProvider,
) -> Result<bool> {
    let raw = match fs::read(target).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(UpdaterError::Io(err)),
    };
    let local = check.calculate_bytes(&compress.compress(&raw)?);
    let same = checksums_equal(&local, &file.checksum);
    if !same {
        debug!("client: {} changed (local {local})", file.object_key);
    }
    Ok(!same)
}

#[allow(clippy::too_many_arguments)]
async fn download_with_retry(
    client: &reqwest::Client,
    distribution_url: &str,
    file: &DistFile,
    target: &Path,
    compress: &dyn CompressionProvider,
    check: &dyn ChecksumProvider,
    retry: RetryPolicy,
    cancel: &Arc<AtomicBool>,
    progress: &(dyn Fn(u64) + Send + Sync),
) -> Result<()> {
    let mut attempts = 0u32;
    loop {
        if util::cancel_requested(cancel) {
            return Err(UpdaterError::Network("download cancelled".into()));
        }
        attempts += 1;
        match download_one(client, distribution_url, file, target, compress, check, cancel, progress)
            .await
        {
            Ok(()) => return Ok(()),
            Err(err) if !retry.exhausted(attempts) && !util::cancel_requested(cancel) => {
                warn!(
                    "client: {} failed (attempt {attempts}): {err}",
                    file.object_key
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => {
                // Signal the sibling downloads; they bail at their next
                // chunk boundary instead of streaming to completion.
                cancel.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn download_one(
    client: &reqwest::Client,
    distribution_url: &str,
    file: &DistFile,
    target: &Path,
    compress: &dyn CompressionProvider,
    check: &dyn ChecksumProvider,
    cancel: &Arc<AtomicBool>,
    progress: &(dyn Fn(u64) + Send + Sync),
) -> Result<()> {
    let url = format!(
        "{}/{}",
        distribution_url.trim_end_matches('/'),
        file.object_key
    );
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| UpdaterError::Network(format!("{}: request failed: {e}", file.object_key)))?
        .error_for_status()
        .map_err(|e| UpdaterError::Network(format!("{}: {e}", file.object_key)))?;

    // The digest runs over the wire bytes while they stream in.
    let mut digest = check.streaming();
    let mut compressed = Vec::with_capacity(file.download_size as usize);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if util::cancel_requested(cancel) {
            return Err(UpdaterError::Network("download cancelled".into()));
        }
        let chunk = chunk.map_err(|e| {
            UpdaterError::Network(format!("{}: read failed: {e}", file.object_key))
        })?;
        digest.update(&chunk);
        progress(chunk.len() as u64);
        compressed.extend_from_slice(&chunk);
    }

    let digest = digest.finish();
    if !checksums_equal(&digest, &file.checksum) {
        return Err(UpdaterError::Integrity(format!(
            "{}: downloaded checksum {digest} does not match manifest {}",
            file.object_key, file.checksum
        )));
    }

    let raw = compress.decompress(&compressed)?;
    install_file(target, &raw).await?;
    debug!("client: installed {} ({} bytes)", file.object_key, raw.len());
    Ok(())
}

async fn get_bytes(
    client: &reqwest::Client,
    distribution_url: &str,
    object_key: &str,
) -> Result<Vec<u8>> {
    let url = format!("{}/{object_key}", distribution_url.trim_end_matches('/'));
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| UpdaterError::Network(format!("{object_key}: request failed: {e}")))?
        .error_for_status()
        .map_err(|e| UpdaterError::Network(format!("{object_key}: {e}")))?;
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| UpdaterError::Network(format!("{object_key}: read failed: {e}")))?;
    Ok(bytes.to_vec())
}

/// Install bytes under `target` atomically: write a sibling temp file, drop
/// any existing copy, then rename into place. A crash mid-install leaves
/// either the old file or nothing, never a torn file.
async fn install_file(target: &Path, raw: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| UpdaterError::Config(format!("invalid target path {}", target.display())))?;
    fs::create_dir_all(parent).await.map_err(UpdaterError::Io)?;

    let file_name = target
        .file_name()
        .ok_or_else(|| UpdaterError::Config(format!("invalid target path {}", target.display())))?;
    let staging = parent.join(format!(".{}.part", file_name.to_string_lossy()));
    fs::write(&staging, raw).await.map_err(UpdaterError::Io)?;

    match fs::remove_file(target).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(UpdaterError::Io(err)),
    }
    fs::rename(&staging, target).await.map_err(UpdaterError::Io)
}

/// Hand off to the installed product and return the running child.
pub fn launch_payload(
    manifest: &DistManifest,
    channel_root: &Path,
) -> Result<std::process::Child> {
    let args = manifest.pass_build_args();

    if cfg!(target_os = "macos")
        && let Some(bundle) = manifest
            .osx_app_bundle
            .as_deref()
            .filter(|b| !b.trim().is_empty())
    {
        let bundle_path = channel_root.join(bundle);
        info!("client: opening {}", bundle_path.display());
        let mut command = std::process::Command::new("open");
        command.arg(&bundle_path);
        if !args.is_empty() {
            command.arg("--args").args(&args);
        }
        return command.spawn().map_err(UpdaterError::Io);
    }

    let executable = channel_root.join(&manifest.executable);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755))
            .map_err(UpdaterError::Io)?;
    }
    let workdir = executable
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| channel_root.to_path_buf());
    info!("client: launching {}", executable.display());
    std::process::Command::new(&executable)
        .args(&args)
        .current_dir(workdir)
        .spawn()
        .map_err(UpdaterError::Io)
}

pub struct RunOptions {
    pub sources_path: Option<PathBuf>,
    pub install_root: Option<PathBuf>,
    /// Unattended mode: retry downloads until they succeed and skip the
    /// final launch.
    pub batch: bool,
    pub skip_self_update: bool,
}

/// The full client session: sources, self-update, reconcile, launch.
pub async fn run(options: RunOptions) -> Result<()> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| UpdaterError::Network(format!("failed to build http client: {e}")))?;

    let (sources_path, loaded) = sources::load(options.sources_path.as_deref()).await?;

    if !options.skip_self_update
        && let Some(url) = loaded
            .custom_downloader_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
    {
        if selfupdate::maybe_self_update(&client, url).await? {
            // The staged copy takes over and relaunches us.
            return Ok(());
        }
    }

    let refreshed = sources::refresh(&client, &sources_path, loaded).await;
    let source = refreshed.select_source()?;
    info!(
        "client: following source {} at {}",
        source.id, source.distribution_url
    );

    let manifest = fetch_manifest(&client, &source.distribution_url).await?;
    info!(
        "client: {} {} build {} on channel {}",
        manifest.project_name, manifest.version_string, manifest.build_id, manifest.channel
    );

    let total: u64 = manifest.files.iter().map(|f| f.download_size).sum();
    let bar = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} {bytes_per_sec} {msg}")
    {
        bar.set_style(style);
    }

    let reconcile_options = ReconcileOptions {
        install_root: options
            .install_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(".")),
        retry: if options.batch {
            RetryPolicy::Unbounded
        } else {
            RetryPolicy::Bounded(3)
        },
        workers: util::max_workers(),
        cancel: Arc::new(AtomicBool::new(false)),
    };
    let outcome = reconcile(
        &client,
        &manifest,
        &source.distribution_url,
        &reconcile_options,
        &|delta| bar.inc(delta),
    )
    .await?;
    bar.finish_and_clear();
    info!(
        "client: {} files downloaded, build {} ready",
        outcome.downloaded, outcome.build_id
    );

    let locale = system_locale();
    for entry in &outcome.update_logs {
        println!("== {} (build {})", entry.version_string, entry.build_id);
        for line in entry.localized_items(&locale) {
            println!("  - {line}");
        }
    }

    if options.batch {
        return Ok(());
    }
    launch_payload(&manifest, &outcome.channel_root)?;
    Ok(())
}

/// Two-letter locale from `LANG` (`de_DE.UTF-8` -> `de`), falling back to
/// the default update-log locale.
fn system_locale() -> String {
    std::env::var("LANG")
        .ok()
        .and_then(|lang| {
            let prefix: String = lang
                .chars()
                .take_while(|c| c.is_ascii_alphabetic())
                .take(2)
                .collect();
            (prefix.len() == 2).then(|| prefix.to_ascii_lowercase())
        })
        .unwrap_or_else(|| crate::manifest::DEFAULT_LOCALE.to_owned())
}
