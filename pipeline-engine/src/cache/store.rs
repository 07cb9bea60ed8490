use super::CacheError;
use crate::utils::{copy_recursive, is_contained, sanitize_component};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "paths.json";
const DATA_DIR: &str = "data";

/// Storage boundary for cache entries
pub trait CacheStore: Send + Sync {
    /// Restore the entry for `key` into `workspace`; `None` on a miss
    fn get(&self, key: &str, workspace: &Path) -> Result<Option<Vec<PathBuf>>, CacheError>;

    /// Save `paths` (relative to `workspace`) under `key`, replacing any existing entry
    fn put(&self, key: &str, workspace: &Path, paths: &[String]) -> Result<(), CacheError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryManifest {
    key: String,
    paths: Vec<String>,
}

/// Filesystem cache store.
///
/// Each entry is a directory holding a manifest plus copies of the saved
/// paths. Writers stage into a private directory and rename it into place, so
/// readers never observe a partial entry and concurrent writers of one key
/// resolve to whichever renames last.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    root: PathBuf,
}

impl LocalCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location: `~/.pipeline-engine/cache`
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pipeline-engine")
            .join("cache")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_component(key))
    }

    fn read_manifest(&self, key: &str, entry: &Path) -> Result<EntryManifest, CacheError> {
        let manifest_path = entry.join(MANIFEST_FILE);
        let content =
            fs::read_to_string(&manifest_path).map_err(|e| CacheError::io(&manifest_path, e))?;
        serde_json::from_str(&content).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

impl Default for LocalCacheStore {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

impl CacheStore for LocalCacheStore {
    fn get(&self, key: &str, workspace: &Path) -> Result<Option<Vec<PathBuf>>, CacheError> {
        let entry = self.entry_dir(key);
        if !entry.join(MANIFEST_FILE).exists() {
            return Ok(None);
        }

        let manifest = self.read_manifest(key, &entry)?;
        if manifest.key != key {
            // Sanitized key collision
            return Ok(None);
        }

        if let Some(relative) = manifest.paths.iter().find(|p| !is_contained(p)) {
            return Err(CacheError::Corrupt {
                key: key.to_string(),
                message: format!("path '{}' escapes the workspace", relative),
            });
        }

        let mut restored = Vec::with_capacity(manifest.paths.len());
        let mut created = Vec::new();
        for relative in &manifest.paths {
            let source = entry.join(DATA_DIR).join(relative);
            let target = workspace.join(relative);
            let existed = target.exists();
            if let Err(e) = copy_recursive(&source, &target) {
                // Undo what this restore added; pre-existing paths keep any copied files
                if !existed {
                    created.push(target);
                }
                remove_all(&created);
                return Err(CacheError::io(&source, e));
            }
            if !existed {
                created.push(target.clone());
            }
            restored.push(target);
        }

        log::debug!("restored cache entry {} ({} paths)", key, restored.len());
        Ok(Some(restored))
    }

    fn put(&self, key: &str, workspace: &Path, paths: &[String]) -> Result<(), CacheError> {
        let present: Vec<&String> = paths
            .iter()
            .filter(|p| is_contained(p) && workspace.join(p).exists())
            .collect();
        if present.is_empty() {
            log::debug!("nothing to save for cache entry {}", key);
            return Ok(());
        }

        fs::create_dir_all(&self.root).map_err(|e| CacheError::io(&self.root, e))?;

        let staging = self
            .root
            .join(format!(".staging-{}", uuid::Uuid::new_v4()));
        let result = stage_entry(&staging, key, workspace, &present)
            .and_then(|()| publish(&staging, &self.entry_dir(key)));

        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }
}

fn stage_entry(
    staging: &Path,
    key: &str,
    workspace: &Path,
    paths: &[&String],
) -> Result<(), CacheError> {
    let data = staging.join(DATA_DIR);
    fs::create_dir_all(&data).map_err(|e| CacheError::io(&data, e))?;

    for relative in paths {
        let source = workspace.join(relative);
        copy_recursive(&source, &data.join(relative)).map_err(|e| CacheError::io(&source, e))?;
    }

    let manifest = EntryManifest {
        key: key.to_string(),
        paths: paths.iter().map(|p| p.to_string()).collect(),
    };
    let manifest_path = staging.join(MANIFEST_FILE);
    let content = serde_json::to_string_pretty(&manifest).map_err(|e| CacheError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    fs::write(&manifest_path, content).map_err(|e| CacheError::io(&manifest_path, e))
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        if let Err(e) = result {
            if path.exists() {
                log::warn!("cannot roll back restored cache path {}: {}", path.display(), e);
            }
        }
    }
}

/// Last writer wins: replace any existing entry with the staged one
fn publish(staging: &Path, entry: &Path) -> Result<(), CacheError> {
    for _ in 0..3 {
        if entry.exists() {
            let _ = fs::remove_dir_all(entry);
        }
        match fs::rename(staging, entry) {
            Ok(()) => return Ok(()),
            // Another writer renamed in between our remove and rename
            Err(_) if entry.exists() => continue,
            Err(e) => return Err(CacheError::io(entry, e)),
        }
    }

    fs::rename(staging, entry).map_err(|e| CacheError::io(entry, e))
}
