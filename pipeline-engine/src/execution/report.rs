// Run Reports
// Per-step, per-instance and per-run results

use crate::artifacts::Artifact;
use crate::cache::CacheOutcome;
use crate::models::{JobStatus, RunStatus, StepStatus};

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Result of a single step
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub id: Option<String>,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// The step failed but was marked continue-on-error
    pub continue_on_error: bool,
    pub outputs: HashMap<String, String>,
    pub log_path: Option<PathBuf>,
    pub duration: Duration,
}

/// First failure of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    /// Step label, or the phase that failed (`artifacts`, `platform strategy`)
    pub step: String,
    pub step_index: Option<usize>,
    pub exit_code: Option<i32>,
    /// Captured output of the failing step
    pub output: String,
    pub error: Option<String>,
}

/// Result of a job instance
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub template_id: String,
    /// `build` or `build (linux-stable)`
    pub instance_id: String,
    pub label: String,
    pub matrix: IndexMap<String, String>,
    pub runner: String,
    pub status: JobStatus,
    pub steps: Vec<StepReport>,
    pub failure: Option<FailureDetail>,
    /// Names of artifacts this instance registered
    pub artifacts: Vec<String>,
    pub cache: Option<CacheOutcome>,
    pub duration: Duration,
}

impl JobReport {
    /// Report for an instance that never ran
    pub fn not_run(
        template_id: impl Into<String>,
        instance_id: impl Into<String>,
        label: impl Into<String>,
        matrix: IndexMap<String, String>,
        runner: impl Into<String>,
        status: JobStatus,
    ) -> Self {
        Self {
            template_id: template_id.into(),
            instance_id: instance_id.into(),
            label: label.into(),
            matrix,
            runner: runner.into(),
            status,
            steps: Vec::new(),
            failure: None,
            artifacts: Vec::new(),
            cache: None,
            duration: Duration::ZERO,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps
            .iter()
            .find(|s| s.name == name || s.id.as_deref() == Some(name))
    }
}

/// Result of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    /// Every instance (and every template that never expanded), in topological order
    pub jobs: Vec<JobReport>,
    pub artifacts: Vec<Artifact>,
    pub duration: Duration,
}

impl RunReport {
    /// Look up a report by instance id
    pub fn job(&self, instance_id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.instance_id == instance_id)
    }

    /// All reports of one template
    pub fn instances(&self, template_id: &str) -> Vec<&JobReport> {
        self.jobs
            .iter()
            .filter(|j| j.template_id == template_id)
            .collect()
    }

    /// Number of reports with the given status
    pub fn count(&self, status: &JobStatus) -> usize {
        self.jobs.iter().filter(|j| &j.status == status).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
