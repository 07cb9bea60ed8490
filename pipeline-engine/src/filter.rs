// Trigger and Path Filters
// Decide whether a run, or a single job template, applies to the triggering event

use crate::context::RunContext;
use crate::models::{EventKind, PathFilter, TriggerFilter};

use glob_match::glob_match;

impl PathFilter {
    /// Whether any changed path is relevant to this filter.
    ///
    /// A path is relevant when it matches `paths` (or `paths` is empty) and does
    /// not match `paths_ignore`. Manual runs and runs without a changed-path list
    /// are never filtered.
    pub fn applies_to(&self, run: &RunContext) -> bool {
        if self.paths.is_empty() && self.paths_ignore.is_empty() {
            return true;
        }
        if run.event == EventKind::Manual || run.changed_paths.is_empty() {
            return true;
        }

        run.changed_paths.iter().any(|path| self.is_relevant(path))
    }

    fn is_relevant(&self, path: &str) -> bool {
        let included = self.paths.is_empty() || self.paths.iter().any(|p| glob_match(p, path));
        let ignored = self.paths_ignore.iter().any(|p| glob_match(p, path));
        included && !ignored
    }
}

impl TriggerFilter {
    /// Whether the run's event, branch and changed paths pass this filter.
    pub fn admits(&self, run: &RunContext) -> bool {
        if !self.events.is_empty() && !self.events.contains(&run.event) {
            return false;
        }

        if !self.branches.is_empty() {
            match run.branch.as_deref() {
                Some(branch) => {
                    if !self.branches.iter().any(|p| glob_match(p, branch)) {
                        return false;
                    }
                }
                None if run.event != EventKind::Manual => return false,
                None => {}
            }
        }

        self.paths.applies_to(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(paths: &[&str]) -> RunContext {
        RunContext::new("ci", EventKind::Push)
            .with_branch("main")
            .with_changed_paths(paths.iter().copied())
    }

    #[test]
    fn test_paths_ignore_excludes_docs_only_change() {
        let filter = PathFilter {
            paths: Vec::new(),
            paths_ignore: vec!["docs/**".to_string(), "**/*.md".to_string()],
        };

        assert!(!filter.applies_to(&push(&["docs/guide.txt", "notes/README.md"])));
        assert!(filter.applies_to(&push(&["docs/guide.txt", "src/main.rs"])));
    }

    #[test]
    fn test_paths_include() {
        let filter = PathFilter {
            paths: vec!["src/**".to_string(), "Cargo.lock".to_string()],
            paths_ignore: Vec::new(),
        };

        assert!(filter.applies_to(&push(&["src/lib.rs"])));
        assert!(filter.applies_to(&push(&["Cargo.lock"])));
        assert!(!filter.applies_to(&push(&["assets/icon.png"])));
    }

    #[test]
    fn test_manual_runs_are_not_path_filtered() {
        let filter = PathFilter {
            paths: vec!["src/**".to_string()],
            paths_ignore: Vec::new(),
        };
        let run = RunContext::new("ci", EventKind::Manual).with_changed_paths(["docs/a.md"]);
        assert!(filter.applies_to(&run));
    }

    #[test]
    fn test_trigger_events_and_branches() {
        let trigger = TriggerFilter {
            events: vec![EventKind::Push, EventKind::PullRequest],
            branches: vec!["main".to_string(), "release/*".to_string()],
            paths: PathFilter::default(),
        };

        assert!(trigger.admits(&push(&["src/lib.rs"])));
        assert!(trigger.admits(
            &RunContext::new("ci", EventKind::Push).with_branch("release/1.0")
        ));
        assert!(!trigger.admits(&RunContext::new("ci", EventKind::Push).with_branch("feature/x")));
        assert!(!trigger.admits(&RunContext::new("ci", EventKind::Manual).with_branch("main")));
    }
}
