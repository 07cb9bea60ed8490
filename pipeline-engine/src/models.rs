// Pipeline Definition Models
// Job templates, steps, conditions, caches, artifacts and run statuses

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A complete pipeline definition: an ordered list of job templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (shown in reports)
    #[serde(default)]
    pub name: Option<String>,

    /// Run-level trigger filter
    #[serde(default)]
    pub trigger: Option<TriggerFilter>,

    /// Pipeline-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Job templates in evaluation order
    #[serde(default)]
    pub jobs: Vec<JobTemplate>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job: JobTemplate) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerFilter) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn job(&self, id: &str) -> Option<&JobTemplate> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// A declared unit of work with optional matrix axes and dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobTemplate {
    /// Unique job identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Jobs that must succeed before this one runs
    #[serde(default)]
    pub needs: JobNeeds,

    /// Runner selector, may reference matrix values (`${{ matrix.os }}`)
    #[serde(default)]
    pub runs_on: Option<String>,

    /// Matrix axes in declaration order
    #[serde(default, deserialize_with = "deserialize_axes")]
    pub matrix: IndexMap<String, Vec<String>>,

    /// Cancel queued siblings when one matrix instance fails
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// Maximum instances of this template running at once
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Job-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Changed-path filter; a template that does not match never expands
    #[serde(default)]
    pub paths: Option<PathFilter>,

    /// Cache declaration
    #[serde(default)]
    pub cache: Option<CacheSpec>,

    /// Append the platform strategy for the instance's runner
    #[serde(default)]
    pub platform_build: bool,

    /// Ordered steps
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Artifacts registered after all steps complete
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
}

fn default_fail_fast() -> bool {
    true
}

impl JobTemplate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            needs: JobNeeds::None,
            runs_on: None,
            matrix: IndexMap::new(),
            fail_fast: default_fail_fast(),
            max_parallel: None,
            env: HashMap::new(),
            paths: None,
            cache: None,
            platform_build: false,
            steps: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn needs<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = JobNeeds::Multiple(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_axis<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.matrix
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactSpec) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn runs_on(mut self, selector: impl Into<String>) -> Self {
        self.runs_on = Some(selector.into());
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = Some(limit);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_cache(mut self, cache: CacheSpec) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_paths(mut self, filter: PathFilter) -> Self {
        self.paths = Some(filter);
        self
    }

    /// Display name, falling back to the identifier
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Job dependencies: `needs: build` or `needs: [build, lint]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobNeeds {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl JobNeeds {
    /// Convert to a vector of job IDs.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            JobNeeds::None => vec![],
            JobNeeds::Single(s) => vec![s.clone()],
            JobNeeds::Multiple(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            JobNeeds::None => true,
            JobNeeds::Single(_) => false,
            JobNeeds::Multiple(v) => v.is_empty(),
        }
    }
}

/// Matrix axes accept scalar values of any YAML type; they are bound as strings.
fn deserialize_axes<'de, D>(deserializer: D) -> Result<IndexMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: IndexMap<String, Vec<serde_yaml::Value>> = IndexMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(axis, values)| {
            let values = values
                .iter()
                .map(|v| {
                    scalar_to_string(v)
                        .ok_or_else(|| format!("axis '{}' has a non-scalar value", axis))
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(serde::de::Error::custom)?;
            Ok((axis, values))
        })
        .collect()
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A single step of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    /// Identifier used to reference outputs (`steps.<id>.outputs.<name>`)
    #[serde(default)]
    pub id: Option<String>,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Executor that runs this step (registry key)
    #[serde(default = "default_executor")]
    pub uses: String,

    /// Command handed to the executor
    #[serde(default)]
    pub run: String,

    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory relative to the job working directory
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Condition predicate
    #[serde(default, rename = "if")]
    pub condition: Option<Condition>,

    /// Record a failure without failing the job
    #[serde(default)]
    pub continue_on_error: bool,

    /// Step-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Timeout in minutes (overrides the executor default)
    #[serde(default)]
    pub timeout_minutes: Option<u64>,

    /// Artifacts registered as soon as this step succeeds
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
}

pub(crate) fn default_executor() -> String {
    "shell".to_string()
}

impl Default for Step {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            uses: default_executor(),
            run: String::new(),
            args: Vec::new(),
            working_directory: None,
            condition: None,
            continue_on_error: false,
            env: HashMap::new(),
            timeout_minutes: None,
            artifacts: Vec::new(),
        }
    }
}

impl Step {
    /// Create a shell step running the given command
    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            run: command.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn uses(mut self, executor: impl Into<String>) -> Self {
        self.uses = executor.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactSpec) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Label used in events and reports
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or(&self.run)
    }
}

/// Condition predicate for steps and artifacts.
///
/// A condition without a status function (`always`, `failure`, `cancelled`,
/// `success`) implicitly requires that no earlier step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Run regardless of job status
    Always,
    /// Run only if no earlier step failed
    Success,
    /// Run only if an earlier step failed
    Failure,
    /// Run only if the job is being cancelled
    Cancelled,
    /// Triggering event matches
    Event(EventKind),
    /// Branch matches (glob pattern)
    Branch(String),
    /// A prior step produced an output
    Output(OutputCondition),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Whether the condition inspects job status itself
    pub fn is_status_aware(&self) -> bool {
        match self {
            Condition::Always | Condition::Success | Condition::Failure | Condition::Cancelled => {
                true
            }
            Condition::Event(_) | Condition::Branch(_) | Condition::Output(_) => false,
            Condition::All(items) | Condition::Any(items) => {
                items.iter().any(Condition::is_status_aware)
            }
            Condition::Not(inner) => inner.is_status_aware(),
        }
    }
}

/// Matches when `steps.<step>.outputs.<name>` is set (and equals `equals`, if given).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCondition {
    pub step: String,
    pub name: String,
    #[serde(default)]
    pub equals: Option<String>,
}

/// Event that triggered a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[default]
    Manual,
    PullRequest,
    Push,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Manual => write!(f, "manual"),
            EventKind::PullRequest => write!(f, "pull_request"),
            EventKind::Push => write!(f, "push"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown event kind '{0}' (expected manual, pull_request or push)")]
pub struct ParseEventError(String);

impl FromStr for EventKind {
    type Err = ParseEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" | "workflow_dispatch" => Ok(EventKind::Manual),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            "push" => Ok(EventKind::Push),
            other => Err(ParseEventError(other.to_string())),
        }
    }
}

/// Changed-path filter (glob patterns).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathFilter {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub paths_ignore: Vec<String>,
}

/// Run-level trigger filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFilter {
    /// Accepted events (empty = all)
    #[serde(default)]
    pub events: Vec<EventKind>,

    /// Accepted branches as glob patterns (empty = all)
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(flatten)]
    pub paths: PathFilter,
}

/// Cache declaration for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheSpec {
    /// Key discriminator (defaults to `<job id>-<runner>`)
    #[serde(default)]
    pub key: Option<String>,

    /// Files whose content makes up the key (glob patterns allowed)
    #[serde(default)]
    pub hash_files: Vec<String>,

    /// Paths restored before and saved after the job
    #[serde(default)]
    pub paths: Vec<String>,
}

impl CacheSpec {
    pub fn new<H, P, S>(hash_files: H, paths: P) -> Self
    where
        H: IntoIterator<Item = S>,
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: None,
            hash_files: hash_files.into_iter().map(Into::into).collect(),
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

/// Artifact declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArtifactSpec {
    /// Artifact name, unique within a run
    pub name: String,

    /// Source paths relative to the job working directory
    #[serde(default)]
    pub paths: Vec<String>,

    /// Absence of every path is not an error
    #[serde(default)]
    pub optional: bool,

    /// Missing paths are tolerated
    #[serde(default)]
    pub allow_empty: bool,

    /// Append the matrix instance label to the name
    #[serde(default)]
    pub suffix_instance: bool,

    /// Retention period in days
    #[serde(default)]
    pub retention_days: Option<u32>,

    /// Registration condition
    #[serde(default, rename = "if")]
    pub condition: Option<Condition>,
}

impl ArtifactSpec {
    pub fn new<I, S>(name: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    pub fn per_instance(mut self) -> Self {
        self.suffix_instance = true;
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Why a job instance did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// An upstream template did not fully succeed
    DependencyFailed { dependency: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{}' did not succeed", dependency)
            }
        }
    }
}

/// Terminal status of a job instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Succeeded,
    Failed,
    Cancelled,
    Skipped(SkipReason),
    /// Filtered out by path/trigger filters; never expanded
    NotApplicable,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Skipped(reason) => write!(f, "skipped ({})", reason),
            JobStatus::NotApplicable => write!(f, "not applicable"),
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failure => write!(f, "failure"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aware_conditions() {
        assert!(Condition::Always.is_status_aware());
        assert!(Condition::Failure.is_status_aware());
        assert!(!Condition::Branch("main".to_string()).is_status_aware());
        assert!(Condition::All(vec![
            Condition::Always,
            Condition::Event(EventKind::Push)
        ])
        .is_status_aware());
        assert!(!Condition::Not(Box::new(Condition::Event(EventKind::Push))).is_status_aware());
    }

    #[test]
    fn test_event_kind_from_str() {
        assert_eq!("push".parse::<EventKind>().unwrap(), EventKind::Push);
        assert_eq!(
            "pull_request".parse::<EventKind>().unwrap(),
            EventKind::PullRequest
        );
        assert_eq!("manual".parse::<EventKind>().unwrap(), EventKind::Manual);
        assert!("schedule".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_job_needs_to_vec() {
        assert!(JobNeeds::None.to_vec().is_empty());
        assert_eq!(JobNeeds::Single("a".to_string()).to_vec(), vec!["a"]);
        let job = JobTemplate::new("deploy").needs(["test", "lint"]);
        assert_eq!(job.needs.to_vec(), vec!["test", "lint"]);
    }

    #[test]
    fn test_step_label_fallbacks() {
        let named = Step::run("Build", "cargo build");
        assert_eq!(named.label(), "Build");

        let anonymous = Step {
            run: "cargo test".to_string(),
            ..Default::default()
        };
        assert_eq!(anonymous.label(), "cargo test");
    }
}
