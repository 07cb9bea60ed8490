// Platform Build Strategies
// Per-OS packaging steps and artifacts appended to `platform-build` jobs

use crate::execution::matrix::JobInstance;
use crate::models::{ArtifactSpec, Step};

use std::collections::HashMap;
use std::sync::Arc;

/// Packaging recipe for one platform family
pub trait PlatformStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Steps appended after the template's own steps
    fn steps(&self, instance: &JobInstance) -> Vec<Step>;

    /// Artifacts registered once the steps complete
    fn artifacts(&self, instance: &JobInstance) -> Vec<ArtifactSpec>;
}

/// Release build + MSI installer
pub struct WindowsStrategy;

impl PlatformStrategy for WindowsStrategy {
    fn name(&self) -> &str {
        "windows"
    }

    fn steps(&self, _instance: &JobInstance) -> Vec<Step> {
        vec![
            release_build(),
            Step::run("Build installer", "cargo wix --no-build --nocapture")
                .with_id("installer"),
        ]
    }

    fn artifacts(&self, _instance: &JobInstance) -> Vec<ArtifactSpec> {
        vec![
            ArtifactSpec::new(
                "executable",
                ["target/release/${{ env.BINARY_NAME }}.exe"],
            )
            .per_instance(),
            ArtifactSpec::new("installer", ["target/wix"]).per_instance(),
        ]
    }
}

/// Release build + app bundle + disk image
pub struct MacosStrategy;

impl PlatformStrategy for MacosStrategy {
    fn name(&self) -> &str {
        "macos"
    }

    fn steps(&self, _instance: &JobInstance) -> Vec<Step> {
        vec![
            release_build(),
            Step::run("Bundle application", "cargo bundle --release").with_id("bundle"),
            Step::run(
                "Create disk image",
                "hdiutil create -volname \"${{ env.BINARY_NAME }}\" -srcfolder target/release/bundle/osx -ov -format UDZO target/release/${{ env.BINARY_NAME }}.dmg",
            )
            .with_id("dmg"),
        ]
    }

    fn artifacts(&self, _instance: &JobInstance) -> Vec<ArtifactSpec> {
        vec![ArtifactSpec::new(
            "disk-image",
            ["target/release/${{ env.BINARY_NAME }}.dmg"],
        )
        .per_instance()]
    }
}

/// Release build + tar.gz archive + AppImage
pub struct LinuxStrategy;

impl PlatformStrategy for LinuxStrategy {
    fn name(&self) -> &str {
        "linux"
    }

    fn steps(&self, _instance: &JobInstance) -> Vec<Step> {
        vec![
            release_build(),
            Step::run(
                "Create archive",
                "tar -czf target/release/${{ env.BINARY_NAME }}.tar.gz -C target/release ${{ env.BINARY_NAME }}",
            )
            .with_id("archive"),
            Step::run(
                "Build AppImage",
                "linuxdeploy --appdir AppDir --executable target/release/${{ env.BINARY_NAME }} --output appimage",
            )
            .with_id("appimage")
            .continue_on_error(),
        ]
    }

    fn artifacts(&self, _instance: &JobInstance) -> Vec<ArtifactSpec> {
        vec![
            ArtifactSpec::new(
                "archive",
                ["target/release/${{ env.BINARY_NAME }}.tar.gz"],
            )
            .per_instance(),
            ArtifactSpec::new("appimage", ["${{ env.BINARY_NAME }}-x86_64.AppImage"])
                .per_instance()
                .optional(),
        ]
    }
}

fn release_build() -> Step {
    Step::run("Release build", "cargo build --release --locked").with_id("release-build")
}

/// Maps runner identities to strategies
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn PlatformStrategy>>,
    aliases: HashMap<String, String>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `windows`, `macos` and `linux` strategies
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WindowsStrategy));
        registry.register(Arc::new(MacosStrategy));
        registry.register(Arc::new(LinuxStrategy));
        registry.alias("ubuntu", "linux");
        registry.alias("osx", "macos");
        registry.alias("win", "windows");
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn PlatformStrategy>) {
        self.strategies
            .insert(strategy.name().to_ascii_lowercase(), strategy);
    }

    /// Route runners starting with `prefix` to the strategy `target`
    pub fn alias(&mut self, prefix: impl Into<String>, target: impl Into<String>) {
        self.aliases
            .insert(prefix.into().to_ascii_lowercase(), target.into().to_ascii_lowercase());
    }

    /// Resolve a runner identity: exact name first, then the longest matching prefix
    pub fn resolve(&self, runner: &str) -> Option<Arc<dyn PlatformStrategy>> {
        let runner = runner.to_ascii_lowercase();

        if let Some(strategy) = self.strategies.get(&runner) {
            return Some(strategy.clone());
        }

        let candidates = self
            .strategies
            .keys()
            .map(|name| (name.as_str(), name.as_str()))
            .chain(self.aliases.iter().map(|(p, t)| (p.as_str(), t.as_str())));

        candidates
            .filter(|(prefix, _)| runner.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .and_then(|(_, target)| self.strategies.get(target).cloned())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::MatrixExpander;
    use crate::models::JobTemplate;

    fn instance(runner: &str) -> JobInstance {
        let template = JobTemplate::new("package")
            .runs_on("${{ matrix.os }}")
            .with_axis("os", [runner]);
        MatrixExpander::expand(&template).remove(0)
    }

    #[test]
    fn test_resolve_exact_and_prefix() {
        let registry = StrategyRegistry::with_defaults();

        assert_eq!(registry.resolve("windows").unwrap().name(), "windows");
        assert_eq!(registry.resolve("windows-latest").unwrap().name(), "windows");
        assert_eq!(registry.resolve("macos-14").unwrap().name(), "macos");
        assert_eq!(registry.resolve("Ubuntu-22.04").unwrap().name(), "linux");
        assert!(registry.resolve("freebsd").is_none());
        assert!(registry.resolve("local").is_none());
    }

    #[test]
    fn test_windows_strategy() {
        let strategy = WindowsStrategy;
        let inst = instance("windows-latest");

        let commands: Vec<_> = strategy.steps(&inst).into_iter().map(|s| s.run).collect();
        assert_eq!(commands[0], "cargo build --release --locked");
        assert!(commands[1].starts_with("cargo wix"));

        let names: Vec<_> = strategy.artifacts(&inst).into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["executable", "installer"]);
    }

    #[test]
    fn test_linux_appimage_is_optional() {
        let artifacts = LinuxStrategy.artifacts(&instance("ubuntu-latest"));
        assert_eq!(artifacts.len(), 2);
        assert!(!artifacts[0].optional);
        assert!(artifacts[1].optional);
        assert!(artifacts.iter().all(|a| a.suffix_instance));
    }

    #[test]
    fn test_macos_produces_disk_image() {
        let steps = MacosStrategy.steps(&instance("macos-latest"));
        assert!(steps.iter().any(|s| s.run.starts_with("hdiutil create")));
        assert_eq!(
            MacosStrategy.artifacts(&instance("macos-latest"))[0].name,
            "disk-image"
        );
    }
}
