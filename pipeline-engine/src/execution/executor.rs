// Pipeline Executor
// Orchestrates a run with dependency-driven scheduling of job instances

use crate::adapters::{ExecutorRegistry, StepExecutor};
use crate::artifacts::{ArtifactRegistry, ArtifactStore, LocalArtifactStore, MemoryArtifactStore};
use crate::cache::{CacheStore, LocalCacheStore};
use crate::context::RunContext;
use crate::execution::cancel::CancelSignal;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{ExecutionGraph, GraphError, JobNode};
use crate::execution::matrix::{JobInstance, MatrixExpander, DEFAULT_RUNNER};
use crate::execution::report::{FailureDetail, JobReport, RunReport};
use crate::execution::runner::{InstanceCancel, JobRunner};
use crate::execution::workspace::{IsolatedWorkspace, SharedWorkspace, WorkspaceProvider};
use crate::models::{JobStatus, JobTemplate, PipelineDefinition, RunStatus, SkipReason};
use crate::strategy::StrategyRegistry;

use indexmap::IndexMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum job instances running at once (0 = unlimited)
    pub max_parallel_jobs: usize,
    /// Default timeout for steps (in minutes, 0 = none)
    pub default_step_timeout: u64,
    /// Source tree the run works on
    pub working_dir: PathBuf,
    /// Run each instance in a private copy of `working_dir`
    pub isolate_instances: bool,
    /// Root for instance copies (defaults to `~/.pipeline-engine/workspaces`)
    pub workspace_root: Option<PathBuf>,
    /// Leave instance copies in place after the run
    pub keep_workspaces: bool,
    /// Cache root (defaults to `~/.pipeline-engine/cache`)
    pub cache_dir: Option<PathBuf>,
    /// Copy artifacts under this directory instead of recording them in memory
    pub artifact_dir: Option<PathBuf>,
    /// Write per-step logs under this directory
    pub log_dir: Option<PathBuf>,
    /// Whether job caches are restored and saved
    pub enable_cache: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 0,
            default_step_timeout: 60,
            working_dir: PathBuf::from("."),
            isolate_instances: true,
            workspace_root: None,
            keep_workspaces: false,
            cache_dir: None,
            artifact_dir: None,
            log_dir: None,
            enable_cache: true,
        }
    }
}

/// How a template ended, as seen by its dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateOutcome {
    /// Every instance succeeded (or there were none)
    Success,
    /// Filtered out; dependents are filtered too
    NotApplicable,
    /// At least one instance did not succeed
    Unsuccessful,
}

/// Scheduling state of one template, indexed by topological position
struct TemplateState {
    template: Arc<JobTemplate>,
    dependencies: Vec<String>,
    promoted: bool,
    pending: VecDeque<JobInstance>,
    running: usize,
    remaining: usize,
    all_succeeded: bool,
    matrix_cancel: CancelSignal,
    outcome: Option<TemplateOutcome>,
}

impl TemplateState {
    fn new(node: &JobNode) -> Self {
        Self {
            template: Arc::new(node.template.clone()),
            dependencies: node.dependencies.clone(),
            promoted: false,
            pending: VecDeque::new(),
            running: 0,
            remaining: 0,
            all_succeeded: true,
            matrix_cancel: CancelSignal::new(),
            outcome: None,
        }
    }

    fn can_dispatch(&self) -> bool {
        let limit = self.template.max_parallel.unwrap_or(usize::MAX);
        !self.pending.is_empty() && self.running < limit
    }
}

/// Pipeline executor
pub struct PipelineExecutor {
    /// Execution graph
    graph: ExecutionGraph,
    /// Configuration
    config: ExecutorConfig,
    /// Progress event sender
    event_tx: Option<ProgressSender>,
    /// Step executors by name
    executors: ExecutorRegistry,
    /// Overrides the configured cache store
    cache_store: Option<Arc<dyn CacheStore>>,
    /// Overrides the configured artifact store
    artifact_store: Option<Arc<dyn ArtifactStore>>,
    /// Platform strategies for `platform-build` jobs
    strategies: StrategyRegistry,
    /// Overrides the configured instance workspaces
    workspaces: Option<Arc<dyn WorkspaceProvider>>,
    /// Run-wide abort
    abort: CancelSignal,
}

impl PipelineExecutor {
    /// Create a new executor from a pipeline definition
    pub fn from_pipeline(pipeline: &PipelineDefinition) -> Result<Self, GraphError> {
        let graph = ExecutionGraph::from_pipeline(pipeline)?;
        Ok(Self::new(graph))
    }

    /// Create a new executor from an execution graph
    pub fn new(graph: ExecutionGraph) -> Self {
        Self {
            graph,
            config: ExecutorConfig::default(),
            event_tx: None,
            executors: ExecutorRegistry::new(),
            cache_store: None,
            artifact_store: None,
            strategies: StrategyRegistry::with_defaults(),
            workspaces: None,
            abort: CancelSignal::new(),
        }
    }

    /// Set executor configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Register (or replace) a step executor
    pub fn with_executor(mut self, name: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.register(name, executor);
        self
    }

    /// Replace the whole executor registry
    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifact_store = Some(store);
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_workspaces(mut self, workspaces: Arc<dyn WorkspaceProvider>) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    /// Handle that aborts a run in progress: queued instances are cancelled
    /// and running steps are interrupted. An aborted executor stays aborted.
    pub fn abort_handle(&self) -> CancelSignal {
        self.abort.clone()
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Execute the pipeline
    pub async fn execute(&self, run: RunContext) -> RunReport {
        let start = Instant::now();
        let run = self.prepare_context(run);

        let artifacts = ArtifactRegistry::new(&run.run_id, self.artifact_store());
        let workspaces = self.workspace_provider();
        let runner = Arc::new(self.job_runner(artifacts.clone(), workspaces.clone()));
        let run = Arc::new(run);

        let order = self.graph.topological_order();
        let total_jobs = order
            .iter()
            .map(|node| MatrixExpander::count(&node.template))
            .sum();

        self.event_tx.send_event(ExecutionEvent::RunStarted {
            run_id: run.run_id.clone(),
            pipeline_name: run.pipeline_name.clone(),
            total_jobs,
        });

        let mut states: Vec<TemplateState> = order.iter().map(|node| TemplateState::new(node)).collect();
        let mut reports: Vec<(usize, usize, JobReport)> = Vec::new();

        let admitted = self
            .graph
            .trigger
            .as_ref()
            .map(|trigger| trigger.admits(&run))
            .unwrap_or(true);

        let aborted = if admitted {
            self.schedule(&mut states, &mut reports, &runner, &run).await
        } else {
            log::info!("run {} not triggered by {} event", run.run_id, run.event);
            for (pos, state) in states.iter_mut().enumerate() {
                self.finish_not_applicable(pos, state, &mut reports);
            }
            false
        };

        workspaces.finish(&run.run_id);

        reports.sort_by_key(|(pos, index, _)| (*pos, *index));
        let jobs: Vec<JobReport> = reports.into_iter().map(|(_, _, report)| report).collect();

        let status = if aborted {
            RunStatus::Cancelled
        } else if jobs.iter().any(|j| j.status.is_failure()) {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };

        let duration = start.elapsed();
        self.event_tx.send_event(ExecutionEvent::RunCompleted {
            run_id: run.run_id.clone(),
            status,
            duration,
        });

        RunReport {
            run_id: run.run_id.clone(),
            pipeline_name: run.pipeline_name.clone(),
            status,
            jobs,
            artifacts: artifacts.artifacts(),
            duration,
        }
    }

    /// Dispatch loop. Returns whether the run was aborted.
    async fn schedule(
        &self,
        states: &mut [TemplateState],
        reports: &mut Vec<(usize, usize, JobReport)>,
        runner: &Arc<JobRunner>,
        run: &Arc<RunContext>,
    ) -> bool {
        let mut join_set = JoinSet::new();
        let mut running_total = 0usize;
        let mut aborted = false;

        loop {
            if !aborted && self.abort.is_cancelled() {
                aborted = true;
                log::info!("run {} aborted", run.run_id);
                self.cancel_waiting(states, reports, "run aborted");
            }

            if !aborted {
                self.promote(states, reports, run);
                self.dispatch(states, &mut join_set, &mut running_total, runner, run);
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { break };
                    let (pos, report) = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            log::error!("scheduler task failed: {}", e);
                            continue;
                        }
                    };
                    running_total -= 1;
                    self.record_result(pos, report, states, reports);
                }
                _ = self.abort.cancelled(), if !aborted => {}
            }
        }

        aborted
    }

    /// Promote every template whose dependencies have all finished
    fn promote(
        &self,
        states: &mut [TemplateState],
        reports: &mut Vec<(usize, usize, JobReport)>,
        run: &RunContext,
    ) {
        let mut changed = true;
        while changed {
            changed = false;

            for pos in 0..states.len() {
                if states[pos].promoted {
                    continue;
                }

                let mut blocked = false;
                let mut failed_dependency = None;
                let mut filtered = false;
                for dependency in &states[pos].dependencies {
                    match states
                        .iter()
                        .find(|s| &s.template.id == dependency)
                        .and_then(|s| s.outcome)
                    {
                        None => blocked = true,
                        Some(TemplateOutcome::Unsuccessful) => {
                            failed_dependency.get_or_insert_with(|| dependency.clone());
                        }
                        Some(TemplateOutcome::NotApplicable) => filtered = true,
                        Some(TemplateOutcome::Success) => {}
                    }
                }
                if blocked {
                    continue;
                }

                changed = true;
                let state = &mut states[pos];
                state.promoted = true;

                if let Some(dependency) = failed_dependency {
                    self.skip_template(pos, state, dependency, reports);
                    continue;
                }

                let applies = state
                    .template
                    .paths
                    .as_ref()
                    .map(|filter| filter.applies_to(run))
                    .unwrap_or(true);
                if filtered || !applies {
                    self.finish_not_applicable(pos, state, reports);
                    continue;
                }

                let instances = MatrixExpander::expand(&state.template);
                log::debug!("job '{}' expanded to {} instance(s)", state.template.id, instances.len());
                if instances.is_empty() {
                    state.outcome = Some(TemplateOutcome::Success);
                    continue;
                }
                state.remaining = instances.len();
                state.pending = instances.into();
            }
        }
    }

    fn dispatch(
        &self,
        states: &mut [TemplateState],
        join_set: &mut JoinSet<(usize, JobReport)>,
        running_total: &mut usize,
        runner: &Arc<JobRunner>,
        run: &Arc<RunContext>,
    ) {
        let global_limit = match self.config.max_parallel_jobs {
            0 => usize::MAX,
            limit => limit,
        };

        for (pos, state) in states.iter_mut().enumerate() {
            while *running_total < global_limit && state.can_dispatch() {
                let Some(instance) = state.pending.pop_front() else {
                    break;
                };
                state.running += 1;
                *running_total += 1;

                let runner = runner.clone();
                let template = state.template.clone();
                let run = run.clone();
                let cancel = InstanceCancel::new(self.abort.clone(), state.matrix_cancel.clone());

                join_set.spawn(async move {
                    // A panicking executor fails its instance instead of the scheduler
                    let task_instance = instance.clone();
                    let handle = tokio::spawn(async move {
                        runner.run(&task_instance, &template, &run, &cancel).await
                    });
                    let report = match handle.await {
                        Ok(report) => report,
                        Err(e) => panicked_report(&instance, e.to_string()),
                    };
                    (pos, report)
                });
            }
        }
    }

    fn record_result(
        &self,
        pos: usize,
        report: JobReport,
        states: &mut [TemplateState],
        reports: &mut Vec<(usize, usize, JobReport)>,
    ) {
        let state = &mut states[pos];
        state.running -= 1;
        state.remaining -= 1;

        if !report.status.is_success() {
            state.all_succeeded = false;
        }

        if report.status.is_failure() && state.template.fail_fast && !state.matrix_cancel.is_cancelled() {
            log::info!("{} failed, cancelling remaining instances of '{}'", report.instance_id, state.template.id);
            state.matrix_cancel.cancel();
            let reason = format!("fail-fast: {} failed", report.instance_id);
            drain_pending(pos, state, reports, &reason, &self.event_tx);
        }

        let index = instance_index(&report, state);
        reports.push((pos, index, report));
        finalize_if_done(state);
    }

    /// Cancel everything that has not been dispatched yet
    fn cancel_waiting(
        &self,
        states: &mut [TemplateState],
        reports: &mut Vec<(usize, usize, JobReport)>,
        reason: &str,
    ) {
        for (pos, state) in states.iter_mut().enumerate() {
            if !state.promoted {
                state.promoted = true;
                let instances = MatrixExpander::expand(&state.template);
                state.remaining = instances.len();
                state.pending = instances.into();
            }
            drain_pending(pos, state, reports, reason, &self.event_tx);
            finalize_if_done(state);
        }
    }

    fn skip_template(
        &self,
        pos: usize,
        state: &mut TemplateState,
        dependency: String,
        reports: &mut Vec<(usize, usize, JobReport)>,
    ) {
        let status = JobStatus::Skipped(SkipReason::DependencyFailed { dependency });
        for instance in MatrixExpander::expand(&state.template) {
            let report = not_run_report(&instance, status.clone());
            self.event_tx.send_event(ExecutionEvent::JobSkipped {
                job_id: report.instance_id.clone(),
                status: status.clone(),
            });
            reports.push((pos, instance.index, report));
        }
        state.outcome = Some(TemplateOutcome::Unsuccessful);
    }

    fn finish_not_applicable(
        &self,
        pos: usize,
        state: &mut TemplateState,
        reports: &mut Vec<(usize, usize, JobReport)>,
    ) {
        let template = &state.template;
        let report = JobReport::not_run(
            &template.id,
            &template.id,
            &template.id,
            IndexMap::new(),
            template.runs_on.as_deref().unwrap_or(DEFAULT_RUNNER),
            JobStatus::NotApplicable,
        );
        self.event_tx.send_event(ExecutionEvent::JobSkipped {
            job_id: template.id.clone(),
            status: JobStatus::NotApplicable,
        });
        reports.push((pos, 0, report));
        state.promoted = true;
        state.outcome = Some(TemplateOutcome::NotApplicable);
    }

    fn prepare_context(&self, mut run: RunContext) -> RunContext {
        if run.pipeline_name.is_empty() {
            run.pipeline_name = self.graph.name.clone().unwrap_or_default();
        }
        let mut env = self.graph.env.clone();
        env.extend(std::mem::take(&mut run.env));
        run.env = env;
        run
    }

    fn job_runner(&self, artifacts: ArtifactRegistry, workspaces: Arc<dyn WorkspaceProvider>) -> JobRunner {
        let mut runner = JobRunner::new(self.executors.clone(), artifacts, self.config.clone())
            .with_strategies(self.strategies.clone())
            .with_workspaces(workspaces);
        if let Some(store) = self.cache_store() {
            runner = runner.with_cache(store);
        }
        if let Some(tx) = &self.event_tx {
            runner = runner.with_progress(tx.clone());
        }
        runner
    }

    fn cache_store(&self) -> Option<Arc<dyn CacheStore>> {
        if !self.config.enable_cache {
            return None;
        }
        match &self.cache_store {
            Some(store) => Some(store.clone()),
            None => {
                let root = self
                    .config
                    .cache_dir
                    .clone()
                    .unwrap_or_else(LocalCacheStore::default_dir);
                Some(Arc::new(LocalCacheStore::new(root)))
            }
        }
    }

    fn workspace_provider(&self) -> Arc<dyn WorkspaceProvider> {
        if let Some(workspaces) = &self.workspaces {
            return workspaces.clone();
        }
        if !self.config.isolate_instances {
            return Arc::new(SharedWorkspace::new(self.config.working_dir.clone()));
        }
        let root = self
            .config
            .workspace_root
            .clone()
            .unwrap_or_else(IsolatedWorkspace::default_root);
        Arc::new(
            IsolatedWorkspace::new(self.config.working_dir.clone(), root)
                .keep(self.config.keep_workspaces),
        )
    }

    fn artifact_store(&self) -> Arc<dyn ArtifactStore> {
        match (&self.artifact_store, &self.config.artifact_dir) {
            (Some(store), _) => store.clone(),
            (None, Some(dir)) => Arc::new(LocalArtifactStore::new(dir)),
            (None, None) => Arc::new(MemoryArtifactStore::new()),
        }
    }
}

/// Report every queued instance of a template as cancelled
fn drain_pending(
    pos: usize,
    state: &mut TemplateState,
    reports: &mut Vec<(usize, usize, JobReport)>,
    reason: &str,
    event_tx: &Option<ProgressSender>,
) {
    while let Some(instance) = state.pending.pop_front() {
        let report = not_run_report(&instance, JobStatus::Cancelled);
        event_tx.send_event(ExecutionEvent::JobCancelled {
            job_id: report.instance_id.clone(),
            reason: reason.to_string(),
        });
        reports.push((pos, instance.index, report));
        state.remaining -= 1;
        state.all_succeeded = false;
    }
}

fn finalize_if_done(state: &mut TemplateState) {
    if state.outcome.is_none() && state.promoted && state.remaining == 0 && state.running == 0 {
        state.outcome = Some(if state.all_succeeded {
            TemplateOutcome::Success
        } else {
            TemplateOutcome::Unsuccessful
        });
    }
}

/// Position of a finished instance within its template's expansion
fn instance_index(report: &JobReport, state: &TemplateState) -> usize {
    MatrixExpander::expand(&state.template)
        .iter()
        .position(|i| i.id() == report.instance_id)
        .unwrap_or(usize::MAX)
}

fn not_run_report(instance: &JobInstance, status: JobStatus) -> JobReport {
    JobReport::not_run(
        &instance.template_id,
        instance.id(),
        &instance.label,
        instance.matrix.clone(),
        &instance.runner,
        status,
    )
}

fn panicked_report(instance: &JobInstance, message: String) -> JobReport {
    log::error!("job {} panicked: {}", instance.id(), message);
    let mut report = not_run_report(instance, JobStatus::Failed);
    report.failure = Some(FailureDetail {
        step: "runner".to_string(),
        step_index: None,
        exit_code: None,
        output: String::new(),
        error: Some(format!("job runner panicked: {}", message)),
    });
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{Script, ScriptedExecutor};
    use crate::adapters::{AdapterError, StepInvocation, StepOutcome};
    use crate::artifacts::ArtifactError;
    use crate::cache::CacheOutcome;
    use crate::execution::events::progress_channel;
    use crate::models::{ArtifactSpec, CacheSpec, EventKind, PathFilter, Step, TriggerFilter};
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        workspace: TempDir,
        instance_root: TempDir,
        executor: ScriptedExecutor,
    }

    impl Fixture {
        fn new(executor: ScriptedExecutor) -> Self {
            Self {
                workspace: TempDir::new().unwrap(),
                instance_root: TempDir::new().unwrap(),
                executor,
            }
        }

        fn config(&self) -> ExecutorConfig {
            ExecutorConfig {
                working_dir: self.workspace.path().to_path_buf(),
                workspace_root: Some(self.instance_root.path().to_path_buf()),
                enable_cache: false,
                ..Default::default()
            }
        }

        fn executor_for(&self, pipeline: &PipelineDefinition) -> PipelineExecutor {
            self.with_config(pipeline, self.config())
        }

        fn with_config(&self, pipeline: &PipelineDefinition, config: ExecutorConfig) -> PipelineExecutor {
            PipelineExecutor::from_pipeline(pipeline)
                .unwrap()
                .with_config(config)
                .with_executors(
                    ExecutorRegistry::empty().with("shell", Arc::new(self.executor.clone())),
                )
        }
    }

    fn push() -> RunContext {
        RunContext::new("ci", EventKind::Push).with_branch("main")
    }

    fn job(id: &str) -> JobTemplate {
        JobTemplate::new(id).with_step(Step::run(id, id))
    }

    fn statuses(report: &RunReport) -> Vec<(String, JobStatus)> {
        report
            .jobs
            .iter()
            .map(|j| (j.instance_id.clone(), j.status.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_dependencies_run_in_topological_order() {
        let fixture = Fixture::new(ScriptedExecutor::new());
        let pipeline = PipelineDefinition::new("ci")
            .with_job(job("deploy").needs(["test", "lint"]))
            .with_job(job("test").needs(["build"]))
            .with_job(job("lint").needs(["build"]))
            .with_job(job("build"));

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.status, RunStatus::Success);
        let commands = fixture.executor.commands();
        let position = |c: &str| commands.iter().position(|x| x == c).unwrap();
        assert_eq!(position("build"), 0);
        assert!(position("test") < position("deploy"));
        assert!(position("lint") < position("deploy"));

        let ids: Vec<_> = report.jobs.iter().map(|j| j.instance_id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"build"));
        assert_eq!(ids.last(), Some(&"deploy"));
    }

    #[tokio::test]
    async fn test_matrix_expands_to_unique_instances() {
        let fixture = Fixture::new(ScriptedExecutor::new());
        let pipeline = PipelineDefinition::new("ci").with_job(
            JobTemplate::new("test")
                .runs_on("${{ matrix.os }}")
                .with_axis("os", ["linux", "macos", "windows"])
                .with_axis("toolchain", ["stable", "nightly"])
                .with_step(Step::run("Test", "cargo +${{ matrix.toolchain }} test")),
        );

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.jobs.len(), 6);
        assert_eq!(report.count(&JobStatus::Succeeded), 6);
        let labels: HashSet<_> = report.jobs.iter().map(|j| j.label.clone()).collect();
        assert_eq!(labels.len(), 6);
        assert_eq!(report.jobs[0].instance_id, "test (linux-stable)");
        assert_eq!(report.jobs[1].instance_id, "test (linux-nightly)");
        assert_eq!(report.jobs[5].runner, "windows");
        assert_eq!(fixture.executor.count("cargo +nightly test"), 3);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_queued_siblings() {
        let executor = ScriptedExecutor::new().script("test linux", Script::fail(1));
        let fixture = Fixture::new(executor);
        let pipeline = PipelineDefinition::new("ci")
            .with_job(
                JobTemplate::new("test")
                    .with_axis("os", ["linux", "macos", "windows"])
                    .max_parallel(1)
                    .with_step(Step::run("Test", "test ${{ matrix.os }}")),
            )
            .with_job(job("deploy").needs(["test"]));

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.status, RunStatus::Failure);
        assert_eq!(
            statuses(&report),
            vec![
                ("test (linux)".to_string(), JobStatus::Failed),
                ("test (macos)".to_string(), JobStatus::Cancelled),
                ("test (windows)".to_string(), JobStatus::Cancelled),
                (
                    "deploy".to_string(),
                    JobStatus::Skipped(SkipReason::DependencyFailed {
                        dependency: "test".to_string()
                    })
                ),
            ]
        );
        assert_eq!(fixture.executor.commands(), vec!["test linux"]);
    }

    #[tokio::test]
    async fn test_without_fail_fast_siblings_finish() {
        let executor = ScriptedExecutor::new().script("test linux", Script::fail(1));
        let fixture = Fixture::new(executor);
        let pipeline = PipelineDefinition::new("ci")
            .with_job(
                JobTemplate::new("test")
                    .with_axis("os", ["linux", "macos", "windows"])
                    .max_parallel(1)
                    .fail_fast(false)
                    .with_step(Step::run("Test", "test ${{ matrix.os }}")),
            )
            .with_job(job("deploy").needs(["test"]));

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.status, RunStatus::Failure);
        assert_eq!(report.job("test (macos)").unwrap().status, JobStatus::Succeeded);
        assert_eq!(report.job("test (windows)").unwrap().status, JobStatus::Succeeded);
        assert!(matches!(report.job("deploy").unwrap().status, JobStatus::Skipped(_)));
        assert_eq!(fixture.executor.count("deploy"), 0);
    }

    #[tokio::test]
    async fn test_skip_propagates_transitively() {
        let executor = ScriptedExecutor::new().script("build", Script::fail(2));
        let fixture = Fixture::new(executor);
        let pipeline = PipelineDefinition::new("ci")
            .with_job(job("build"))
            .with_job(job("test").needs(["build"]))
            .with_job(job("deploy").needs(["test"]))
            .with_job(job("audit"));

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.status, RunStatus::Failure);
        assert_eq!(
            report.job("deploy").unwrap().status,
            JobStatus::Skipped(SkipReason::DependencyFailed {
                dependency: "test".to_string()
            })
        );
        assert_eq!(report.job("audit").unwrap().status, JobStatus::Succeeded);
        assert_eq!(report.count(&JobStatus::Failed), 1);
    }

    #[tokio::test]
    async fn test_continue_on_error_lets_dependents_run() {
        let executor = ScriptedExecutor::new().script("cargo audit", Script::fail(1));
        let fixture = Fixture::new(executor);
        let pipeline = PipelineDefinition::new("ci")
            .with_job(
                JobTemplate::new("audit")
                    .with_step(Step::run("Audit", "cargo audit").continue_on_error()),
            )
            .with_job(job("release").needs(["audit"]));

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.job("release").unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_path_filter_marks_templates_not_applicable() {
        let fixture = Fixture::new(ScriptedExecutor::new());
        let pipeline = PipelineDefinition::new("ci")
            .with_job(job("docs").with_paths(PathFilter {
                paths: vec!["docs/**".to_string()],
                paths_ignore: Vec::new(),
            }))
            .with_job(job("publish-docs").needs(["docs"]))
            .with_job(job("build"));
        let run = push().with_changed_paths(["src/main.rs"]);

        let report = fixture.executor_for(&pipeline).execute(run).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.job("docs").unwrap().status, JobStatus::NotApplicable);
        assert_eq!(report.job("publish-docs").unwrap().status, JobStatus::NotApplicable);
        assert_eq!(fixture.executor.commands(), vec!["build"]);
    }

    #[tokio::test]
    async fn test_trigger_filter_rejects_run() {
        let fixture = Fixture::new(ScriptedExecutor::new());
        let pipeline = PipelineDefinition::new("ci")
            .with_trigger(TriggerFilter {
                events: vec![EventKind::PullRequest],
                ..Default::default()
            })
            .with_job(job("build"))
            .with_job(job("test").needs(["build"]));

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.count(&JobStatus::NotApplicable), 2);
        assert!(fixture.executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_artifacts_flow_downstream() {
        let executor = ScriptedExecutor::new().script(
            "make dist",
            Script::ok().writes("dist/app.tar.gz", "archive"),
        );
        let fixture = Fixture::new(executor);
        let pipeline = PipelineDefinition::new("release")
            .with_job(
                JobTemplate::new("package")
                    .with_step(Step::run("Dist", "make dist"))
                    .with_artifact(ArtifactSpec::new("dist", ["dist/app.tar.gz"])),
            )
            .with_job(
                JobTemplate::new("publish")
                    .needs(["package"])
                    .with_step(Step::run("Upload", "upload ${{ artifacts.dist }}")),
            );

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].producer, "package");
        let upload = &fixture.executor.commands()[1];
        assert!(upload.ends_with("dist/app.tar.gz"), "{}", upload);
    }

    #[tokio::test]
    async fn test_duplicate_artifact_within_run_but_not_across_runs() {
        let executor = ScriptedExecutor::new().script(
            "make",
            Script::ok().writes("out/app", "bin"),
        );
        let fixture = Fixture::new(executor);
        let build = |id: &str| {
            JobTemplate::new(id)
                .with_step(Step::run("Make", "make"))
                .with_artifact(ArtifactSpec::new("app", ["out/app"]))
        };
        let pipeline = PipelineDefinition::new("ci")
            .with_job(build("first"))
            .with_job(build("second").needs(["first"]));
        let executor = fixture.executor_for(&pipeline);

        let report = executor.execute(push()).await;
        assert_eq!(report.job("first").unwrap().status, JobStatus::Succeeded);
        let second = report.job("second").unwrap();
        assert_eq!(second.status, JobStatus::Failed);
        assert_eq!(
            second.failure.as_ref().unwrap().error,
            Some(ArtifactError::Duplicate("app".to_string()).to_string())
        );

        // A new run starts with an empty registry
        let pipeline = PipelineDefinition::new("ci").with_job(build("first"));
        let executor = fixture.executor_for(&pipeline);
        assert_eq!(executor.execute(push()).await.status, RunStatus::Success);
        assert_eq!(executor.execute(push()).await.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_cache_hit_on_second_run() {
        let executor = ScriptedExecutor::new().script(
            "cargo build",
            Script::ok().writes("target/app", "bin"),
        );
        let fixture = Fixture::new(executor);
        let cache_dir = TempDir::new().unwrap();
        std::fs::write(fixture.workspace.path().join("Cargo.lock"), "v1").unwrap();

        let pipeline = PipelineDefinition::new("ci").with_job(
            JobTemplate::new("build")
                .with_cache(CacheSpec::new(["Cargo.lock"], ["target"]))
                .with_step(Step::run("Build", "cargo build")),
        );
        let config = ExecutorConfig {
            cache_dir: Some(cache_dir.path().to_path_buf()),
            enable_cache: true,
            ..fixture.config()
        };
        let executor = fixture.with_config(&pipeline, config);

        let first = executor.execute(push()).await;
        assert!(matches!(first.jobs[0].cache, Some(CacheOutcome::Saved { .. })));

        let second = executor.execute(push()).await;
        assert!(second.jobs[0].cache.as_ref().unwrap().is_hit());

        std::fs::write(fixture.workspace.path().join("Cargo.lock"), "v2").unwrap();
        let third = executor.execute(push()).await;
        assert!(matches!(third.jobs[0].cache, Some(CacheOutcome::Saved { .. })));
    }

    #[tokio::test]
    async fn test_abort_cancels_running_and_waiting_jobs() {
        let executor = ScriptedExecutor::new()
            .script("sleep", Script::ok().delay(Duration::from_secs(30)));
        let fixture = Fixture::new(executor);
        let pipeline = PipelineDefinition::new("ci")
            .with_job(JobTemplate::new("slow").with_step(Step::run("Sleep", "sleep")))
            .with_job(job("after").needs(["slow"]));
        let executor = fixture.executor_for(&pipeline);

        let abort = executor.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), executor.execute(push()))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.job("slow").unwrap().status, JobStatus::Cancelled);
        assert_eq!(report.job("after").unwrap().status, JobStatus::Cancelled);
        assert_eq!(fixture.executor.count("after"), 0);
    }

    #[tokio::test]
    async fn test_global_parallel_limit() {
        let slow = Script::ok().delay(Duration::from_millis(50));
        let executor = ["a", "b", "c", "d"]
            .iter()
            .fold(ScriptedExecutor::new(), |e, id| e.script(*id, slow.clone()));
        let fixture = Fixture::new(executor);
        let pipeline = ["a", "b", "c", "d"]
            .iter()
            .fold(PipelineDefinition::new("ci"), |p, id| p.with_job(job(id)));
        let config = ExecutorConfig {
            max_parallel_jobs: 2,
            ..fixture.config()
        };

        let report = fixture.with_config(&pipeline, config).execute(push()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(fixture.executor.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_matrix_parallel_limit() {
        let executor = ScriptedExecutor::new();
        let executor = ["1", "2", "3"].iter().fold(executor, |e, shard| {
            e.script(format!("shard {}", shard), Script::ok().delay(Duration::from_millis(20)))
        });
        let fixture = Fixture::new(executor);
        let pipeline = PipelineDefinition::new("ci").with_job(
            JobTemplate::new("test")
                .with_axis("shard", ["1", "2", "3"])
                .max_parallel(1)
                .with_step(Step::run("Shard", "shard ${{ matrix.shard }}")),
        );

        let report = fixture.executor_for(&pipeline).execute(push()).await;

        assert_eq!(report.count(&JobStatus::Succeeded), 3);
        assert_eq!(fixture.executor.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_matrix_instances_work_in_separate_directories() {
        let executor = ["linux", "macos"].iter().fold(ScriptedExecutor::new(), |e, os| {
            e.script(
                format!("build {}", os),
                Script::ok()
                    .writes("target/release/app", *os)
                    .delay(Duration::from_millis(50)),
            )
        });
        let fixture = Fixture::new(executor);
        std::fs::write(fixture.workspace.path().join("Cargo.toml"), "[package]").unwrap();
        let artifact_dir = TempDir::new().unwrap();
        let pipeline = PipelineDefinition::new("release").with_job(
            JobTemplate::new("build")
                .with_axis("os", ["linux", "macos"])
                .with_step(Step::run("Build", "build ${{ matrix.os }}"))
                .with_artifact(ArtifactSpec::new("app", ["target/release/app"]).per_instance()),
        );
        let config = ExecutorConfig {
            artifact_dir: Some(artifact_dir.path().to_path_buf()),
            ..fixture.config()
        };

        let report = fixture.with_config(&pipeline, config).execute(push()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(fixture.executor.peak_concurrency(), 2);
        for os in ["linux", "macos"] {
            let artifact = report
                .artifacts
                .iter()
                .find(|a| a.name == format!("app-{}", os))
                .unwrap();
            assert_eq!(std::fs::read_to_string(&artifact.paths[0]).unwrap(), os);
        }

        let dirs: HashSet<_> = fixture
            .executor
            .invocations()
            .into_iter()
            .map(|inv| inv.working_dir)
            .collect();
        assert_eq!(dirs.len(), 2);
        assert!(!fixture.workspace.path().join("target").exists());
        // Instance copies are gone once the run has finished
        assert_eq!(std::fs::read_dir(fixture.instance_root.path()).unwrap().count(), 0);
    }

    struct PanickingExecutor;

    #[async_trait::async_trait]
    impl crate::adapters::StepExecutor for PanickingExecutor {
        async fn execute(&self, _invocation: &StepInvocation) -> Result<StepOutcome, AdapterError> {
            panic!("executor bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_the_instance() {
        let fixture = Fixture::new(ScriptedExecutor::new());
        let pipeline = PipelineDefinition::new("ci")
            .with_job(JobTemplate::new("broken").with_step(Step::run("Boom", "boom").uses("panic")))
            .with_job(job("next").needs(["broken"]));

        let report = fixture
            .executor_for(&pipeline)
            .with_executor("panic", Arc::new(PanickingExecutor))
            .execute(push())
            .await;

        assert_eq!(report.status, RunStatus::Failure);
        let broken = report.job("broken").unwrap();
        assert_eq!(broken.status, JobStatus::Failed);
        assert!(broken.failure.as_ref().unwrap().error.as_ref().unwrap().contains("panicked"));
        assert!(matches!(report.job("next").unwrap().status, JobStatus::Skipped(_)));
    }

    #[tokio::test]
    async fn test_progress_events_bracket_the_run() {
        let fixture = Fixture::new(ScriptedExecutor::new());
        let pipeline = PipelineDefinition::new("ci").with_job(job("build"));
        let (tx, mut rx) = progress_channel();

        let report = fixture
            .executor_for(&pipeline)
            .with_progress(tx)
            .execute(push())
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(matches!(
            events.first(),
            Some(ExecutionEvent::RunStarted { total_jobs: 1, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::RunCompleted { status: RunStatus::Success, .. })
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::StepCompleted { job_id, .. } if job_id == "build")));
        assert_eq!(report.pipeline_name, "ci");
    }
}
