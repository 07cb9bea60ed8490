// Scripted executor for tests: behaves per command without spawning processes

use super::{AdapterError, StepExecutor, StepInvocation, StepOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Behaviour for one command
#[derive(Debug, Clone, Default)]
pub struct Script {
    exit_code: i32,
    stdout: String,
    outputs: Vec<(String, String)>,
    delay: Option<Duration>,
    files: Vec<(String, String)>,
}

impl Script {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    pub fn stdout(mut self, text: impl Into<String>) -> Self {
        self.stdout = text.into();
        self
    }

    pub fn output(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.push((name.into(), value.into()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Write a file relative to the invocation's working directory
    pub fn writes(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }
}

/// Records every invocation; unknown commands succeed immediately
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    scripts: Arc<HashMap<String, Script>>,
    invocations: Arc<Mutex<Vec<StepInvocation>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, command: impl Into<String>, script: Script) -> Self {
        Arc::make_mut(&mut self.scripts).insert(command.into(), script);
        self
    }

    /// Commands in invocation order
    pub fn commands(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|inv| inv.command.clone())
            .collect()
    }

    pub fn invocations(&self) -> Vec<StepInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    /// Highest number of invocations in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutcome, AdapterError> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(self.running.clone());

        let script = self
            .scripts
            .get(&invocation.command)
            .cloned()
            .unwrap_or_default();

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        for (path, content) in &script.files {
            let target = invocation.working_dir.join(path);
            let spawn_err = |source| AdapterError::Spawn {
                command: invocation.command.clone(),
                source,
            };
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(spawn_err)?;
            }
            std::fs::write(&target, content).map_err(spawn_err)?;
        }

        Ok(StepOutcome {
            exit_code: Some(script.exit_code),
            success: script.exit_code == 0,
            stdout: script.stdout,
            outputs: script.outputs.into_iter().collect(),
            ..Default::default()
        })
    }
}
