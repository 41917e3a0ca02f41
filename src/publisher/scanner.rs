use std::path::{Path, PathBuf};

use log::{debug, trace};
use walkdir::WalkDir;

use crate::errors::{Result, UpdaterError};

/// A file picked up by the scan: its on-disk path and the forward-slash
/// relative key it will be stored and installed under.
#[derive(Clone, Debug)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub object_key: String,
}

/// Walks a distribution root and yields candidate files. Ignore entries match
/// files by exact object key and directories by a trailing-slash key
/// (`bin/`, `crash/`); ignored directories are pruned, not descended into.
pub struct DistScanner {
    root: PathBuf,
    ignored: Vec<String>,
}

impl DistScanner {
    pub fn new(root: impl Into<PathBuf>, ignored: Vec<String>) -> Self {
        Self {
            root: root.into(),
            ignored,
        }
    }

    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        let mut items = Vec::new();
        let walker = WalkDir::new(&self.root).into_iter().filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            match self.object_key(entry.path()) {
                // The root itself maps to an empty key.
                Some(key) if !key.is_empty() => {
                    let pruned = self.ignored.contains(&format!("{key}/"));
                    if pruned {
                        trace!("scan: ignored directory {key}/");
                    }
                    !pruned
                }
                _ => true,
            }
        });

        for entry in walker {
            let entry = entry.map_err(|e| {
                UpdaterError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk failed")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(object_key) = self.object_key(entry.path()) else {
                continue;
            };
            if self.ignored.contains(&object_key) {
                trace!("scan: ignored file {object_key}");
                continue;
            }
            trace!("scan: found {object_key}");
            items.push(ScannedFile {
                path: entry.path().to_path_buf(),
                object_key,
            });
        }

        // Stable ordering keeps the manifest diff-friendly.
        items.sort_by(|a, b| a.object_key.cmp(&b.object_key));
        debug!("scan: {} files under {}", items.len(), self.root.display());
        Ok(items)
    }

    fn object_key(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn scans_recursively_with_forward_slash_keys() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "app.exe", "a");
        write(dir.path(), "bin/lib.so", "b");
        write(dir.path(), "bin/deep/asset.dat", "c");

        let scanner = DistScanner::new(dir.path(), Vec::new());
        let keys: Vec<String> = scanner
            .scan()
            .unwrap()
            .into_iter()
            .map(|f| f.object_key)
            .collect();
        assert_eq!(keys, vec!["app.exe", "bin/deep/asset.dat", "bin/lib.so"]);
    }

    #[test]
    fn ignores_files_by_key_and_prunes_directories() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "app.exe", "a");
        write(dir.path(), "skip.log", "b");
        write(dir.path(), "crash/dump1.bin", "c");
        write(dir.path(), "crash/nested/dump2.bin", "d");

        let scanner = DistScanner::new(
            dir.path(),
            vec!["skip.log".to_owned(), "crash/".to_owned()],
        );
        let keys: Vec<String> = scanner
            .scan()
            .unwrap()
            .into_iter()
            .map(|f| f.object_key)
            .collect();
        assert_eq!(keys, vec!["app.exe"]);
    }
}
