// Artifact Pipeline
// Per-run registry of named outputs, persisted through a pluggable store

use crate::utils::{copy_recursive, is_contained, sanitize_component};

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact '{name}': path '{path}' does not exist")]
    PathMissing { name: String, path: String },

    #[error("artifact '{0}' was already registered in this run")]
    Duplicate(String),

    #[error("artifact '{0}' not found")]
    NotFound(String),

    #[error("artifact '{name}': path '{path}' is outside the working directory")]
    InvalidPath { name: String, path: String },

    #[error("artifact '{name}': paths '{first}' and '{second}' would both be stored as '{file}'")]
    PathConflict {
        name: String,
        file: String,
        first: String,
        second: String,
    },

    #[error("artifact store error for '{name}': {message}")]
    Store { name: String, message: String },
}

/// A registered artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Name, unique within the run
    pub name: String,
    /// Stored paths
    pub paths: Vec<PathBuf>,
    /// Retention period in days
    pub retention_days: Option<u32>,
    /// Id of the producing job instance
    pub producer: String,
}

/// Storage boundary for artifact contents
pub trait ArtifactStore: Send + Sync {
    /// Persist `sources` under (`run_id`, `name`), returning the stored paths
    fn put(&self, run_id: &str, name: &str, sources: &[PathBuf]) -> Result<Vec<PathBuf>, ArtifactError>;

    /// Stored paths for (`run_id`, `name`)
    fn get(&self, run_id: &str, name: &str) -> Result<Vec<PathBuf>, ArtifactError>;
}

/// Records source paths without copying
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: Mutex<HashMap<(String, String), Vec<PathBuf>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, run_id: &str, name: &str, sources: &[PathBuf]) -> Result<Vec<PathBuf>, ArtifactError> {
        let mut entries = self.entries.lock().map_err(|_| ArtifactError::Store {
            name: name.to_string(),
            message: "store lock poisoned".to_string(),
        })?;
        entries.insert((run_id.to_string(), name.to_string()), sources.to_vec());
        Ok(sources.to_vec())
    }

    fn get(&self, run_id: &str, name: &str) -> Result<Vec<PathBuf>, ArtifactError> {
        let entries = self.entries.lock().map_err(|_| ArtifactError::Store {
            name: name.to_string(),
            message: "store lock poisoned".to_string(),
        })?;
        entries
            .get(&(run_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(name.to_string()))
    }
}

/// Copies artifacts to `<root>/<run id>/<name>/`
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn artifact_dir(&self, run_id: &str, name: &str) -> PathBuf {
        self.root
            .join(sanitize_component(run_id))
            .join(sanitize_component(name))
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn put(&self, run_id: &str, name: &str, sources: &[PathBuf]) -> Result<Vec<PathBuf>, ArtifactError> {
        let dir = self.artifact_dir(run_id, name);
        let store_err = |e: std::io::Error| ArtifactError::Store {
            name: name.to_string(),
            message: format!("{}: {}", dir.display(), e),
        };

        // Sources land flat under the artifact directory; resolve every target first
        let mut targets: HashMap<OsString, &PathBuf> = HashMap::new();
        let mut plan = Vec::with_capacity(sources.len());
        for source in sources {
            let file_name = source.file_name().map(|n| n.to_os_string()).ok_or_else(|| {
                ArtifactError::InvalidPath {
                    name: name.to_string(),
                    path: source.display().to_string(),
                }
            })?;
            if let Some(first) = targets.insert(file_name.clone(), source) {
                return Err(ArtifactError::PathConflict {
                    name: name.to_string(),
                    file: file_name.to_string_lossy().into_owned(),
                    first: first.display().to_string(),
                    second: source.display().to_string(),
                });
            }
            plan.push((source, dir.join(file_name)));
        }

        fs::create_dir_all(&dir).map_err(store_err)?;

        let mut stored = Vec::with_capacity(plan.len());
        for (source, target) in plan {
            copy_recursive(source, &target).map_err(store_err)?;
            stored.push(target);
        }

        Ok(stored)
    }

    fn get(&self, run_id: &str, name: &str) -> Result<Vec<PathBuf>, ArtifactError> {
        let dir = self.artifact_dir(run_id, name);
        let entries = fs::read_dir(&dir).map_err(|_| ArtifactError::NotFound(name.to_string()))?;

        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();
        Ok(paths)
    }
}

/// One registration request, already interpolated
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub name: String,
    /// Declared paths, relative to `base_dir`
    pub paths: Vec<String>,
    pub base_dir: PathBuf,
    pub optional: bool,
    pub allow_empty: bool,
    pub retention_days: Option<u32>,
    pub producer: String,
}

#[derive(Default)]
struct RegistryState {
    reserved: HashSet<String>,
    artifacts: IndexMap<String, Artifact>,
}

/// Artifacts of one run. Names are write-once for the lifetime of the registry.
#[derive(Clone)]
pub struct ArtifactRegistry {
    run_id: String,
    store: Arc<dyn ArtifactStore>,
    state: Arc<Mutex<RegistryState>>,
}

impl ArtifactRegistry {
    pub fn new(run_id: impl Into<String>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            run_id: run_id.into(),
            store,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    /// Registry backed by a `MemoryArtifactStore`
    pub fn in_memory(run_id: impl Into<String>) -> Self {
        Self::new(run_id, Arc::new(MemoryArtifactStore::new()))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Register an artifact.
    ///
    /// Returns `Ok(None)` for an optional artifact none of whose paths exist.
    pub fn register(&self, request: ArtifactRequest) -> Result<Option<Artifact>, ArtifactError> {
        let mut existing = Vec::new();
        let mut missing = None;

        for declared in &request.paths {
            if !is_contained(declared) {
                return Err(ArtifactError::InvalidPath {
                    name: request.name.clone(),
                    path: declared.clone(),
                });
            }
            let path = request.base_dir.join(declared);
            if path.exists() {
                existing.push(path);
            } else if missing.is_none() {
                missing = Some(declared.clone());
            }
        }

        if existing.is_empty() && request.optional {
            log::debug!("optional artifact '{}' has no paths, skipping", request.name);
            return Ok(None);
        }
        if let Some(path) = missing {
            if !request.allow_empty {
                return Err(ArtifactError::PathMissing {
                    name: request.name,
                    path,
                });
            }
        }

        self.reserve(&request.name)?;

        match self.store.put(&self.run_id, &request.name, &existing) {
            Ok(stored) => {
                let artifact = Artifact {
                    name: request.name.clone(),
                    paths: stored,
                    retention_days: request.retention_days,
                    producer: request.producer,
                };
                self.commit(artifact.clone());
                Ok(Some(artifact))
            }
            Err(e) => {
                self.release(&request.name);
                Err(e)
            }
        }
    }

    /// Look up a registered artifact by name
    pub fn get(&self, name: &str) -> Option<Artifact> {
        self.lock().artifacts.get(name).cloned()
    }

    /// Stored paths for a registered artifact, read back from the store
    pub fn fetch(&self, name: &str) -> Result<Vec<PathBuf>, ArtifactError> {
        if self.get(name).is_none() {
            return Err(ArtifactError::NotFound(name.to_string()));
        }
        self.store.get(&self.run_id, name)
    }

    /// All artifacts in registration order
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.lock().artifacts.values().cloned().collect()
    }

    /// Name to stored paths, for `${{ artifacts.<name> }}`, read back from the store
    pub fn snapshot(&self) -> HashMap<String, Vec<PathBuf>> {
        self.artifacts()
            .into_iter()
            .map(|artifact| {
                let paths = self.fetch(&artifact.name).unwrap_or_else(|e| {
                    log::warn!("{}; using recorded paths", e);
                    artifact.paths.clone()
                });
                (artifact.name, paths)
            })
            .collect()
    }

    fn reserve(&self, name: &str) -> Result<(), ArtifactError> {
        let mut state = self.lock();
        if !state.reserved.insert(name.to_string()) {
            return Err(ArtifactError::Duplicate(name.to_string()));
        }
        Ok(())
    }

    fn commit(&self, artifact: Artifact) {
        self.lock().artifacts.insert(artifact.name.clone(), artifact);
    }

    fn release(&self, name: &str) {
        self.lock().reserved.remove(name);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        // State stays consistent across a panic: every mutation is a single insert/remove
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
