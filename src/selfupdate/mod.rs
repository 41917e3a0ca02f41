use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use sha2::{Digest as _, Sha512};

use crate::compression;
use crate::errors::{Result, UpdaterError};

/// Build id of this agent binary; the remote `<runtime>-build-id` marker is
/// compared against it. Bump on every agent release.
pub const AGENT_BUILD_ID: u64 = 100;

const RETRY_DELAY: Duration = Duration::from_secs(1);
const REPLACE_ATTEMPTS: u32 = 10;
const DELETE_ATTEMPTS: u32 = 5;

/// Runtime tag used in self-update object keys (`agent-<runtime>`).
pub fn runtime_string() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "osx"
    } else {
        "linux"
    }
}

/// Latest published agent build id, or `None` when the marker is absent or
/// unreadable. Self-update is best effort; failures never block the session.
pub async fn check_latest(client: &reqwest::Client, base_url: &str) -> Option<u64> {
    let key = format!("{}-build-id", runtime_string());
    match get_object(client, base_url, &key).await {
        Ok(bytes) => match String::from_utf8_lossy(&bytes).trim().parse() {
            Ok(build_id) => Some(build_id),
            Err(err) => {
                warn!("selfupdate: malformed build-id marker: {err}");
                None
            }
        },
        Err(err) => {
            warn!("selfupdate: no build-id marker: {err}");
            None
        }
    }
}

/// Download, verify and stage a newer agent if one is published.
///
/// The payload is decompressed and its SHA-512 digest checked in this
/// process, before anything is staged or spawned; on mismatch the running
/// agent is left untouched and the session continues on the current build.
/// Returns `true` when the staged copy was spawned and this process should
/// exit so it can be replaced.
pub async fn maybe_self_update(client: &reqwest::Client, base_url: &str) -> Result<bool> {
    let Some(latest) = check_latest(client, base_url).await else {
        return Ok(false);
    };
    if latest <= AGENT_BUILD_ID {
        return Ok(false);
    }
    info!("selfupdate: build {latest} available (running {AGENT_BUILD_ID})");

    // Like the build-id check, fetching the replacement is best effort: any
    // failure here logs and leaves the session running on the current build.
    let runtime = runtime_string();
    let fetched = async {
        let digest = get_object(client, base_url, &format!("agent-{runtime}.sha512")).await?;
        let compressed = get_object(client, base_url, &format!("agent-{runtime}")).await?;
        let payload = compression::resolve("brotli").decompress(&compressed)?;
        Ok::<_, UpdaterError>((digest, payload))
    }
    .await;
    let (digest, payload) = match fetched {
        Ok(pair) => pair,
        Err(err) => {
            warn!("selfupdate: fetch failed, staying on build {AGENT_BUILD_ID}: {err}");
            return Ok(false);
        }
    };

    let expected = String::from_utf8_lossy(&digest);
    if !digest_matches(&payload, &expected) {
        warn!("selfupdate: digest mismatch, staying on build {AGENT_BUILD_ID}");
        return Ok(false);
    }

    let staged = staged_path(latest);
    tokio::fs::write(&staged, &payload)
        .await
        .map_err(UpdaterError::Io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .map_err(UpdaterError::Io)?;
    }

    let current = std::env::current_exe().map_err(UpdaterError::Io)?;
    info!("selfupdate: handing off to {}", staged.display());
    std::process::Command::new(&staged)
        .arg("update-self")
        .arg("--program-path")
        .arg(&current)
        .spawn()
        .map_err(UpdaterError::Io)?;
    Ok(true)
}

/// Verify a payload against a hex SHA-512 digest string.
fn digest_matches(payload: &[u8], expected: &str) -> bool {
    let actual = hex::encode(Sha512::digest(payload));
    actual.eq_ignore_ascii_case(expected.trim())
}

fn staged_path(build_id: u64) -> PathBuf {
    let suffix = if cfg!(target_os = "windows") {
        ".exe"
    } else {
        ""
    };
    std::env::temp_dir().join(format!("distsync-agent-{build_id}{suffix}"))
}

/// Entry point of the staged copy: overwrite the original agent binary with
/// ourselves, then relaunch it and ask it to delete this staged file. The
/// original may still be exiting and holding its file lock, so the copy is
/// retried.
pub async fn run_update_self(program_path: &Path) -> Result<()> {
    let current = std::env::current_exe().map_err(UpdaterError::Io)?;

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match std::fs::copy(&current, program_path) {
            Ok(_) => break,
            Err(err) if attempts < REPLACE_ATTEMPTS => {
                warn!(
                    "selfupdate: replace attempt {attempts} failed ({err}), waiting for {}",
                    program_path.display()
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => return Err(UpdaterError::Io(err)),
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(program_path, std::fs::Permissions::from_mode(0o755))
            .map_err(UpdaterError::Io)?;
    }

    info!("selfupdate: relaunching {}", program_path.display());
    std::process::Command::new(program_path)
        .arg("--delete")
        .arg(&current)
        .spawn()
        .map_err(UpdaterError::Io)?;
    Ok(())
}

/// Remove a staged agent copy left behind by a completed self-update. The
/// staged process may still be exiting, so deletion is retried briefly and
/// gives up quietly.
pub async fn delete_staged(path: &Path) {
    for _ in 0..DELETE_ATTEMPTS {
        tokio::time::sleep(RETRY_DELAY).await;
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!("selfupdate: removed staged copy {}", path.display());
                return;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(_) => {}
        }
    }
    warn!("selfupdate: could not remove staged copy {}", path.display());
}

async fn get_object(client: &reqwest::Client, base_url: &str, object_key: &str) -> Result<Vec<u8>> {
    let url = format!("{}/{object_key}", base_url.trim_end_matches('/'));
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
