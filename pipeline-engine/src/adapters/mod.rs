// Step Executor Adapters
// Uniform boundary between the job runner and whatever actually runs a step

pub mod shell;
#[cfg(test)]
pub mod testing;

pub use shell::{CommandAdapter, Shell, ShellAdapter};

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Callback for output lines as they are produced (`line`, `is_stderr`)
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Everything an executor needs to run one step
#[derive(Clone)]
pub struct StepInvocation {
    /// Step label, for diagnostics
    pub step_name: String,
    /// Command (interpolated)
    pub command: String,
    /// Arguments (interpolated)
    pub args: Vec<String>,
    /// Full environment for the step
    pub env: HashMap<String, String>,
    /// Directory the step runs in
    pub working_dir: PathBuf,
    /// Hard limit on the step's run time
    pub timeout: Option<Duration>,
    /// File that receives the captured output
    pub log_path: Option<PathBuf>,
    /// Live output sink
    pub on_output: Option<OutputCallback>,
}

impl StepInvocation {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let command = command.into();
        Self {
            step_name: command.clone(),
            command,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: working_dir.into(),
            timeout: None,
            log_path: None,
            on_output: None,
        }
    }
}

impl fmt::Debug for StepInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInvocation")
            .field("step_name", &self.step_name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

/// Result of running a step
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Process exit code, if the process exited normally
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Named outputs (`::set-output name=<k>::<v>`)
    pub outputs: HashMap<String, String>,
    /// Where the captured output was written
    pub log_path: Option<PathBuf>,
    /// The step hit its timeout and was killed
    pub timed_out: bool,
}

impl StepOutcome {
    pub fn succeeded() -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            success: false,
            ..Default::default()
        }
    }

    /// Captured output, stdout first
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Errors raised before or while starting a step
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no step executor registered as '{0}'")]
    UnknownExecutor(String),

    #[error("command '{command}' not found: {source}")]
    CommandNotFound {
        command: String,
        #[source]
        source: which::Error,
    },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs a single step
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute the invocation; a non-zero exit is an `Ok` outcome with `success == false`
    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutcome, AdapterError>;
}

/// Executor registry keyed by the name steps reference in `uses`
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// Registry with the built-in `shell`, `bash` and `command` executors
    pub fn new() -> Self {
        Self::empty()
            .with("shell", Arc::new(ShellAdapter::new()))
            .with("bash", Arc::new(ShellAdapter::with_shell(Shell::Bash)))
            .with("command", Arc::new(CommandAdapter::new()))
    }

    /// Registry without any executors
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one with the same name
    pub fn with(mut self, name: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(name, executor);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StepExecutor>, AdapterError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownExecutor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `::set-output name=<k>::<v>` lines
pub(crate) fn parse_set_output(output: &str) -> HashMap<String, String> {
    let mut outputs = HashMap::new();

    for line in output.lines() {
        let Some(rest) = line.trim_start().strip_prefix("::set-output ") else {
            continue;
        };
        let Some((props, value)) = rest.split_once("::") else {
            continue;
        };
        for prop in props.split(',') {
            if let Some(name) = prop.trim().strip_prefix("name=") {
                if !name.is_empty() {
                    outputs.insert(name.to_string(), value.to_string());
                }
            }
        }
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_output() {
        let output = r#"
Compiling app v0.1.0
::set-output name=version::1.2.3
  ::set-output name=dmg::target/App.dmg
::set-output name=::ignored
::set-output malformed
done
"#;

        let outputs = parse_set_output(output);

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs.get("version"), Some(&"1.2.3".to_string()));
        assert_eq!(outputs.get("dmg"), Some(&"target/App.dmg".to_string()));
    }

    #[test]
    fn test_registry_defaults() {
        let registry = ExecutorRegistry::new();
        assert_eq!(registry.names(), vec!["bash", "command", "shell"]);
        assert!(matches!(
            registry.get("docker"),
            Err(AdapterError::UnknownExecutor(name)) if name == "docker"
        ));
    }

    #[test]
    fn test_combined_output() {
        let outcome = StepOutcome {
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            ..StepOutcome::failed(1)
        };
        assert_eq!(outcome.combined_output(), "out\nerr");
        assert_eq!(StepOutcome::succeeded().combined_output(), "");
    }
}
