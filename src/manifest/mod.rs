use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Object key of the manifest document, both remotely and in the local
/// channel directory (where it records the last successfully applied state).
pub const DESCRIPTION_KEY: &str = "__description.json";

/// Fallback locale key for update-log lines.
pub const DEFAULT_LOCALE: &str = "_";

/// One distributable file: the object key doubles as the local relative path
/// and the storage key. `checksum` covers the compressed representation and
/// is only comparable across manifests sharing the same compression and
/// checksum algorithms.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DistFile {
    pub object_key: String,
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_checksum: Option<String>,
    pub download_size: u64,
    pub file_size: u64,
}

/// Changelog entry tagged with the build that introduced it. `items` maps
/// two-letter locale keys to lines, with `"_"` as the fallback.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DistUpdateLog {
    pub build_id: u64,
    pub version_string: String,
    pub items: BTreeMap<String, Vec<String>>,
}

impl DistUpdateLog {
    pub fn localized_items(&self, locale: &str) -> &[String] {
        self.items
            .get(locale)
            .or_else(|| self.items.get(DEFAULT_LOCALE))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// The versioned release description: the wire contract between publisher
/// and client. Immutable once published under a given `build_id`; the
/// `__description.json` key is overwritten to point at the latest build.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DistManifest {
    pub project_name: String,
    pub version_string: String,
    /// Monotonically increasing release identity; the sole freshness signal.
    pub build_id: u64,
    /// Local installation subdirectory; distinct channels are independent.
    pub channel: String,
    pub compression: String,
    pub checksum: String,
    pub executable: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osx_app_bundle: Option<String>,
    pub files: Vec<DistFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub update_logs: Vec<DistUpdateLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_build_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reinstall_build_id: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_log_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_icon_url: Option<String>,
}

impl DistManifest {
    /// Update-log entries newer than the previously applied build, newest
    /// first. These are the entries worth surfacing to the user.
    pub fn update_logs_since(&self, previous_build_id: u64) -> Vec<DistUpdateLog> {
        let mut logs: Vec<DistUpdateLog> = self
            .update_logs
            .iter()
            .filter(|log| log.build_id > previous_build_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.build_id.cmp(&a.build_id));
        logs
    }

    /// Whether upgrading from `previous_build_id` requires wiping the whole
    /// channel directory before reconciling.
    pub fn needs_reinstall(&self, previous_build_id: u64) -> bool {
        self.reinstall_build_id
            .iter()
            .any(|&threshold| previous_build_id < threshold)
    }

    /// Extra arguments for the launched executable when `passBuildId` is set.
    pub fn pass_build_args(&self) -> Vec<String> {
        match self.pass_build_id.as_deref() {
            Some(name) if !name.trim().is_empty() => {
                vec![format!("--{name}"), self.build_id.to_string()]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(build_id: u64) -> DistUpdateLog {
        DistUpdateLog {
            build_id,
            version_string: format!("1.0.{build_id}"),
            items: BTreeMap::from([(DEFAULT_LOCALE.to_owned(), vec![format!("change {build_id}")])]),
        }
    }

    #[test]
    fn selects_update_logs_newer_than_previous_build() {
        let manifest = DistManifest {
            update_logs: vec![log(3), log(5), log(6), log(8)],
            ..Default::default()
        };
        let selected = manifest.update_logs_since(5);
        let ids: Vec<u64> = selected.iter().map(|l| l.build_id).collect();
        assert_eq!(ids, vec![8, 6]);
    }

    #[test]
    fn reinstall_when_any_threshold_exceeds_previous_build() {
        let manifest = DistManifest {
            reinstall_build_id: vec![10, 25],
            ..Default::default()
        };
        assert!(manifest.needs_reinstall(9));
        assert!(manifest.needs_reinstall(24));
        assert!(!manifest.needs_reinstall(25));
        assert!(!manifest.needs_reinstall(30));

        let none = DistManifest::default();
        assert!(!none.needs_reinstall(0));
    }

    #[test]
    fn pass_build_args_follow_the_configured_flag() {
        let manifest = DistManifest {
            build_id: 42,
            pass_build_id: Some("dist-build".into()),
            ..Default::default()
        };
        assert_eq!(manifest.pass_build_args(), vec!["--dist-build", "42"]);
        assert!(DistManifest::default().pass_build_args().is_empty());
    }

    #[test]
    fn localized_items_fall_back_to_default_locale() {
        let entry = DistUpdateLog {
            build_id: 1,
            version_string: "1.0".into(),
            items: BTreeMap::from([
                ("_".to_owned(), vec!["default".to_owned()]),
                ("de".to_owned(), vec!["deutsch".to_owned()]),
            ]),
        };
        assert_eq!(entry.localized_items("de"), ["deutsch".to_owned()]);
        assert_eq!(entry.localized_items("fr"), ["default".to_owned()]);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let manifest = DistManifest {
            project_name: "Demo".into(),
            version_string: "1.2.3".into(),
            build_id: 7,
            channel: "release".into(),
            compression: "brotli".into(),
            checksum: "crc64".into(),
            executable: "bin/app".into(),
            files: vec![DistFile {
                object_key: "bin/app".into(),
                checksum: "AAFF".into(),
                file_checksum: Some("BBEE".into()),
                download_size: 10,
                file_size: 20,
            }],
            pass_build_id: Some("build".into()),
            reinstall_build_id: vec![3],
            ..Default::default()
        };
        let json = serde_json::to_string(&manifest).unwrap();
        for field in [
            "projectName",
            "versionString",
            "buildId",
            "objectKey",
            "fileChecksum",
            "downloadSize",
            "fileSize",
            "passBuildId",
            "reinstallBuildId",
        ] {
            assert!(json.contains(field), "missing wire field {field}");
        }
        // Unset optional fields stay off the wire.
        assert!(!json.contains("osxAppBundle"));
        assert!(!json.contains("updateLogUrl"));

        let parsed: DistManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.build_id, 7);
        assert_eq!(parsed.files[0].object_key, "bin/app");
    }

    #[test]
    fn unknown_fields_are_tolerated_on_read() {
        let json = r#"{"projectName":"x","buildId":1,"futureField":true}"#;
        let parsed: DistManifest = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.project_name, "x");
        assert_eq!(parsed.build_id, 1);
    }
}
