// Instance Workspaces
// Directories job instances run in

use crate::execution::matrix::JobInstance;
use crate::utils::{copy_recursive, sanitize_component};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Entries never copied into an isolated workspace
const DEFAULT_EXCLUDES: &[&str] = &[".git"];

/// Provides the directory each job instance runs in
pub trait WorkspaceProvider: Send + Sync {
    /// Directory for `instance` in run `run_id`, ready for its first step
    fn prepare(&self, run_id: &str, instance: &JobInstance) -> io::Result<PathBuf>;

    /// Called once the run has finished
    fn finish(&self, _run_id: &str) {}
}

/// Every instance runs directly in one directory
#[derive(Debug, Clone)]
pub struct SharedWorkspace {
    dir: PathBuf,
}

impl SharedWorkspace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl WorkspaceProvider for SharedWorkspace {
    fn prepare(&self, _run_id: &str, _instance: &JobInstance) -> io::Result<PathBuf> {
        Ok(self.dir.clone())
    }
}

/// Each instance gets a private copy of the source tree under
/// `<root>/<run id>/<instance id>/`.
///
/// Copies are removed when the run finishes unless `keep` is set.
#[derive(Debug, Clone)]
pub struct IsolatedWorkspace {
    source: PathBuf,
    root: PathBuf,
    exclude: Vec<String>,
    keep: bool,
}

impl IsolatedWorkspace {
    pub fn new(source: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            root: root.into(),
            exclude: DEFAULT_EXCLUDES.iter().map(|e| e.to_string()).collect(),
            keep: false,
        }
    }

    /// Default location: `~/.pipeline-engine/workspaces`
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pipeline-engine")
            .join("workspaces")
    }

    /// Top-level entry names left out of the copy
    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(sanitize_component(run_id))
    }

    fn skipped(&self, entry: &Path) -> bool {
        let excluded = entry
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| self.exclude.iter().any(|e| e == n))
            .unwrap_or(false);
        // The workspace root may live inside the source tree
        excluded || self.root.starts_with(entry)
    }
}

impl WorkspaceProvider for IsolatedWorkspace {
    fn prepare(&self, run_id: &str, instance: &JobInstance) -> io::Result<PathBuf> {
        let dir = self.run_dir(run_id).join(sanitize_component(&instance.id()));
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        if self.source.is_dir() {
            for entry in fs::read_dir(&self.source)? {
                let path = entry?.path();
                if self.skipped(&path) {
                    continue;
                }
                if let Some(name) = path.file_name() {
                    copy_recursive(&path, &dir.join(name))?;
                }
            }
        }

        log::debug!("{}: workspace {}", instance.id(), dir.display());
        Ok(dir)
    }

    fn finish(&self, run_id: &str) {
        if self.keep {
            return;
        }
        let dir = self.run_dir(run_id);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::warn!("cannot remove workspaces {}: {}", dir.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::MatrixExpander;
    use crate::models::JobTemplate;
    use tempfile::TempDir;

    fn instances() -> Vec<JobInstance> {
        MatrixExpander::expand(&JobTemplate::new("test").with_axis("os", ["linux", "macos"]))
    }

    fn source() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        dir
    }

    #[test]
    fn test_each_instance_gets_its_own_copy() {
        let src = source();
        let root = TempDir::new().unwrap();
        let provider = IsolatedWorkspace::new(src.path(), root.path());
        let instances = instances();

        let linux = provider.prepare("run-1", &instances[0]).unwrap();
        let macos = provider.prepare("run-1", &instances[1]).unwrap();

        assert_ne!(linux, macos);
        assert!(linux.starts_with(root.path().join("run-1")));
        assert_eq!(fs::read_to_string(macos.join("src/main.rs")).unwrap(), "fn main() {}");
        assert!(!linux.join(".git").exists());

        fs::write(linux.join("out.txt"), "linux").unwrap();
        assert!(!macos.join("out.txt").exists());
        assert!(!src.path().join("out.txt").exists());
    }

    #[test]
    fn test_finish_removes_run_unless_kept() {
        let src = source();
        let root = TempDir::new().unwrap();
        let instance = &instances()[0];

        let provider = IsolatedWorkspace::new(src.path(), root.path());
        provider.prepare("run-1", instance).unwrap();
        provider.finish("run-1");
        assert!(!root.path().join("run-1").exists());

        let kept = IsolatedWorkspace::new(src.path(), root.path()).keep(true);
        let dir = kept.prepare("run-2", instance).unwrap();
        kept.finish("run-2");
        assert!(dir.exists());
    }

    #[test]
    fn test_root_inside_source_is_not_copied() {
        let src = source();
        let provider = IsolatedWorkspace::new(src.path(), src.path().join(".workspaces"));

        let dir = provider.prepare("run-1", &instances()[0]).unwrap();

        assert!(dir.join("src/main.rs").exists());
        assert!(!dir.join(".workspaces").exists());
    }

    #[test]
    fn test_shared_workspace_hands_out_one_dir() {
        let dir = TempDir::new().unwrap();
        let provider = SharedWorkspace::new(dir.path());
        for instance in instances() {
            assert_eq!(provider.prepare("run-1", &instance).unwrap(), dir.path());
        }
    }
}
