use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::errors::{Result, UpdaterError};

/// One distribution endpoint a client can follow. Only one source should be
/// enabled at a time; predefining `release`/`debug` entries lets users switch
/// channels by flipping `enable`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Source {
    pub id: String,
    pub enable: bool,
    /// Root URL under which `__description.json` and the file objects live.
    pub distribution_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_icon: Option<String>,
}

/// The client-local pointer config (`sources.json`). Ships with the installed
/// product and is never created by the client; it may be refreshed in place
/// from `sourcesUrl` when the remote copy carries a higher `version`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sources {
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources_url: Option<String>,
    /// Agent self-update endpoint; self-update is skipped when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_downloader_url: Option<String>,
    pub disable_sources_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_source_id: Option<String>,
    pub sources: Vec<Source>,
}

impl Sources {
    /// The source to reconcile against: the unique enabled entry, falling
    /// back to `defaultSourceId`. Anything else is a fatal, user-correctable
    /// configuration error.
    pub fn select_source(&self) -> Result<&Source> {
        let enabled: Vec<&Source> = self.sources.iter().filter(|s| s.enable).collect();
        if enabled.len() == 1 {
            return Ok(enabled[0]);
        }
        if let Some(default_id) = self
            .default_source_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            && let Some(source) = self.sources.iter().find(|s| s.id == default_id)
        {
            return Ok(source);
        }
        Err(UpdaterError::Config(
            "exactly one source must be enabled, or defaultSourceId must name one".into(),
        ))
    }
}

/// Locate and read `sources.json`: an explicit path, the working directory,
/// then the directory of the running executable.
pub async fn load(explicit: Option<&Path>) -> Result<(PathBuf, Sources)> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    } else {
        candidates.push(PathBuf::from("./sources.json"));
        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            candidates.push(dir.join("sources.json"));
        }
    }

    for path in candidates {
        match fs::read(&path).await {
            Ok(bytes) => {
                let sources: Sources = serde_json::from_slice(&bytes).map_err(|e| {
                    UpdaterError::Config(format!(
                        "failed to parse {}: {e}",
                        path.display()
                    ))
                })?;
                debug!("sources: loaded {}", path.display());
                return Ok((path, sources));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(UpdaterError::Io(err));
            }
        }
    }

    Err(UpdaterError::Config("sources.json not found".into()))
}

pub async fn save(path: &Path, sources: &Sources) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(sources)
        .map_err(|e| UpdaterError::Config(format!("failed to serialize sources: {e}")))?;
    fs::write(path, &bytes)
        .await
        .map_err(UpdaterError::Io)
}

/// Fetch the remote copy of `sources.json` and replace the local file if the
/// remote `version` is higher. A source the user switched to by hand is kept
/// enabled in the replacement (matched by `distributionUrl`). Failures only
/// log; the current config stays in effect.
pub async fn refresh(client: &reqwest::Client, path: &Path, current: Sources) -> Sources {
    let Some(url) = current
        .sources_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
    else {
        return current;
    };
    if current.disable_sources_update {
        debug!("sources: refresh disabled");
        return current;
    }

    let mut remote = match fetch_remote(client, url).await {
        Ok(remote) => remote,
        Err(err) => {
            warn!("sources: refresh failed: {err}");
            return current;
        }
    };

    if remote.version <= current.version {
        debug!(
            "sources: remote version {} not newer than {}",
            remote.version, current.version
        );
        return current;
    }

    carry_over_selection(&current, &mut remote);

    if let Err(err) = save(path, &remote).await {
        warn!("sources: failed to write refreshed file: {err}");
        return current;
    }
    info!(
        "sources: refreshed {} -> version {}",
        path.display(),
        remote.version
    );
    remote
}

async fn fetch_remote(client: &reqwest::Client, url: &str) -> Result<Sources> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| UpdaterError::Network(format!("sources fetch failed: {e}")))?
        .error_for_status()
        .map_err(|e| UpdaterError::Network(format!("sources fetch status error: {e}")))?;
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| UpdaterError::Network(format!("sources fetch body error: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| UpdaterError::Config(format!("failed to parse remote sources: {e}")))
}

/// Keep the user's channel choice across a sources refresh.
fn carry_over_selection(current: &Sources, remote: &mut Sources) {
    let Ok(selected) = current.select_source() else {
        return;
    };
    let selected_url = selected.distribution_url.clone();

    let user_switched = current
        .default_source_id
        .as_deref()
        .is_some_and(|default_id| !selected.id.is_empty() && selected.id != default_id);
    let remote_has_enabled = remote.sources.iter().any(|s| s.enable);

    if (user_switched || !remote_has_enabled)
        && remote
            .sources
            .iter()
            .any(|s| s.distribution_url == selected_url)
    {
        for source in &mut remote.sources {
            source.enable = source.distribution_url == selected_url;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str, enable: bool) -> Source {
        Source {
            id: id.to_owned(),
            enable,
            distribution_url: format!("https://dist.example/{id}"),
            ..Default::default()
        }
    }

    #[test]
    fn selects_the_unique_enabled_source() {
        let sources = Sources {
            sources: vec![source("release", true), source("debug", false)],
            ..Default::default()
        };
        assert_eq!(sources.select_source().unwrap().id, "release");
    }

    #[test]
    fn ambiguous_selection_falls_back_to_default_id() {
        let sources = Sources {
            default_source_id: Some("debug".into()),
            sources: vec![source("release", true), source("debug", true)],
            ..Default::default()
        };
        assert_eq!(sources.select_source().unwrap().id, "debug");

        let none_enabled = Sources {
            default_source_id: Some("release".into()),
            sources: vec![source("release", false), source("debug", false)],
            ..Default::default()
        };
        assert_eq!(none_enabled.select_source().unwrap().id, "release");
    }

    #[test]
    fn unresolvable_selection_is_a_config_error() {
        let sources = Sources {
            sources: vec![source("release", true), source("debug", true)],
            ..Default::default()
        };
        assert!(matches!(
            sources.select_source(),
            Err(UpdaterError::Config(_))
        ));
    }

    #[test]
    fn refresh_preserves_a_user_switched_source() {
        let current = Sources {
            version: 1,
            default_source_id: Some("release".into()),
            sources: vec![source("release", false), source("debug", true)],
            ..Default::default()
        };
        let mut remote = Sources {
            version: 2,
            default_source_id: Some("release".into()),
            sources: vec![source("release", true), source("debug", false)],
            ..Default::default()
        };
        carry_over_selection(&current, &mut remote);
        assert!(!remote.sources[0].enable);
        assert!(remote.sources[1].enable);
    }

    #[test]
    fn refresh_enables_current_source_when_remote_enables_none() {
        let current = Sources {
            version: 1,
            sources: vec![source("release", true)],
            ..Default::default()
        };
        let mut remote = Sources {
            version: 2,
            sources: vec![source("release", false), source("debug", false)],
            ..Default::default()
        };
        carry_over_selection(&current, &mut remote);
        assert!(remote.sources[0].enable);
        assert!(!remote.sources[1].enable);
    }

    #[tokio::test]
    async fn load_reads_an_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        let sources = Sources {
            version: 3,
            sources: vec![source("release", true)],
            ..Default::default()
        };
        save(&path, &sources).await.unwrap();

        let (loaded_path, loaded) = load(Some(&path)).await.unwrap();
        assert_eq!(loaded_path, path);
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.sources.len(), 1);
    }

    #[tokio::test]
    async fn missing_sources_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load(Some(&missing)).await,
            Err(UpdaterError::Config(_)) | Err(UpdaterError::Io(_))
        ));
    }
}
