// Run and Job Contexts
// Immutable run-wide state plus the job-scoped environment threaded through steps

use crate::execution::matrix::JobInstance;
use crate::models::{Condition, EventKind, JobTemplate};

use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;

/// Run-wide state, created once at run start and read-only afterwards.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique run identifier
    pub run_id: String,
    /// Pipeline name
    pub pipeline_name: String,
    /// Triggering event
    pub event: EventKind,
    /// Target branch
    pub branch: Option<String>,
    /// Paths changed by the triggering event
    pub changed_paths: Vec<String>,
    /// Pipeline-level environment variables
    pub env: HashMap<String, String>,
}

impl RunContext {
    pub fn new(pipeline_name: impl Into<String>, event: EventKind) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            pipeline_name: pipeline_name.into(),
            event,
            branch: None,
            changed_paths: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

/// Job-scoped mutable environment for a single job instance.
#[derive(Debug, Clone, Default)]
pub struct JobEnvironment {
    /// Matrix assignment
    pub matrix: IndexMap<String, String>,
    /// Resolved runner identity
    pub runner: String,
    /// Environment variables (pipeline, job and matrix)
    pub env: HashMap<String, String>,
    /// Step outputs (step id -> output name -> value)
    pub outputs: HashMap<String, HashMap<String, String>>,
    /// Artifacts visible to this job (name -> stored paths)
    pub artifacts: HashMap<String, Vec<PathBuf>>,
    /// A step failed without continue-on-error
    pub failed: bool,
    /// The job is being cancelled
    pub cancelled: bool,
}

impl JobEnvironment {
    /// Build the environment for an instance: pipeline env, then job env, then matrix values.
    pub fn for_instance(instance: &JobInstance, template: &JobTemplate, run: &RunContext) -> Self {
        let mut env = run.env.clone();
        env.extend(template.env.clone());
        for (axis, value) in &instance.matrix {
            env.insert(format!("MATRIX_{}", env_key(axis)), value.clone());
        }

        let mut job_env = Self {
            matrix: instance.matrix.clone(),
            runner: instance.runner.clone(),
            env: HashMap::new(),
            ..Default::default()
        };

        // Job env values may reference matrix values and the runner
        let resolved: HashMap<String, String> = env
            .into_iter()
            .map(|(k, v)| {
                let value = job_env.interpolate(&v, run);
                (k, value)
            })
            .collect();
        job_env.env = resolved;

        job_env
    }

    /// Make upstream artifacts visible for `${{ artifacts.<name> }}`.
    pub fn with_artifacts(mut self, artifacts: HashMap<String, Vec<PathBuf>>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Record outputs produced by a step
    pub fn record_outputs(&mut self, step_id: &str, outputs: HashMap<String, String>) {
        if outputs.is_empty() {
            return;
        }
        self.outputs
            .entry(step_id.to_string())
            .or_default()
            .extend(outputs);
    }

    /// Look up `steps.<step>.outputs.<name>`
    pub fn output(&self, step: &str, name: &str) -> Option<&str> {
        self.outputs
            .get(step)
            .and_then(|o| o.get(name))
            .map(String::as_str)
    }

    /// Environment for a step invocation: job env overlaid with interpolated step env
    pub fn step_env(&self, step_env: &HashMap<String, String>, run: &RunContext) -> HashMap<String, String> {
        let mut env = self.env.clone();
        for (k, v) in step_env {
            env.insert(k.clone(), self.interpolate(v, run));
        }
        env
    }

    /// Evaluate a condition against the job status and contexts.
    ///
    /// Conditions without a status function only hold while the job is healthy.
    pub fn evaluate(&self, condition: &Condition, run: &RunContext) -> bool {
        if !condition.is_status_aware() && (self.failed || self.cancelled) {
            return false;
        }
        self.evaluate_inner(condition, run)
    }

    /// Default gate for steps without a condition
    pub fn healthy(&self) -> bool {
        !self.failed && !self.cancelled
    }

    fn evaluate_inner(&self, condition: &Condition, run: &RunContext) -> bool {
        match condition {
            Condition::Always => true,
            Condition::Success => self.healthy(),
            Condition::Failure => self.failed,
            Condition::Cancelled => self.cancelled,
            Condition::Event(kind) => run.event == *kind,
            Condition::Branch(pattern) => run
                .branch
                .as_deref()
                .map(|b| glob_match::glob_match(pattern, b))
                .unwrap_or(false),
            Condition::Output(cond) => match self.output(&cond.step, &cond.name) {
                Some(value) => match &cond.equals {
                    Some(expected) => value == expected,
                    None => !value.is_empty(),
                },
                None => false,
            },
            Condition::All(items) => items.iter().all(|c| self.evaluate_inner(c, run)),
            Condition::Any(items) => items.iter().any(|c| self.evaluate_inner(c, run)),
            Condition::Not(inner) => !self.evaluate_inner(inner, run),
        }
    }

    /// Substitute `${{ ... }}` references; unknown references are left verbatim.
    pub fn interpolate(&self, text: &str, run: &RunContext) -> String {
        interpolate(text, |reference| self.resolve(reference, run))
    }

    fn resolve(&self, reference: &str, run: &RunContext) -> Option<String> {
        let mut parts = reference.splitn(2, '.');
        let scope = parts.next()?;
        let rest = parts.next();

        match (scope, rest) {
            ("runner", None) => Some(self.runner.clone()),
            ("matrix", Some(axis)) => self.matrix.get(axis).cloned(),
            ("env", Some(name)) => self
                .env
                .get(name)
                .or_else(|| run.env.get(name))
                .cloned(),
            ("run", Some("id")) => Some(run.run_id.clone()),
            ("run", Some("event")) => Some(run.event.to_string()),
            ("run", Some("branch")) => run.branch.clone(),
            ("steps", Some(path)) => {
                // <id>.outputs.<name>
                let (step, output) = path.split_once(".outputs.")?;
                self.output(step, output).map(String::from)
            }
            ("artifacts", Some(name)) => self.artifacts.get(name).map(|paths| {
                paths
                    .iter()
                    .map(|p| p.to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
            _ => None,
        }
    }
}

/// Replace every `${{ reference }}` for which `resolve` returns a value.
pub fn interpolate<F>(text: &str, resolve: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                let reference = after[..end].trim();
                match resolve(reference) {
                    Some(value) => result.push_str(&value),
                    None => result.push_str(&rest[start..start + 3 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    result.push_str(rest);
    result
}

/// Upper-case an axis name for use in an environment variable
fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
