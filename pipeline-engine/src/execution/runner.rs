// Job Runner
// Executes the ordered steps of one job instance

use crate::adapters::{ExecutorRegistry, OutputCallback, StepInvocation, StepOutcome};
use crate::artifacts::{Artifact, ArtifactError, ArtifactRegistry, ArtifactRequest};
use crate::cache::{CacheKeyResolver, CacheOutcome, CacheStore};
use crate::context::{JobEnvironment, RunContext};
use crate::execution::cancel::CancelSignal;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::ExecutorConfig;
use crate::execution::matrix::JobInstance;
use crate::execution::report::{FailureDetail, JobReport, StepReport};
use crate::execution::workspace::{SharedWorkspace, WorkspaceProvider};
use crate::models::{ArtifactSpec, CacheSpec, JobStatus, JobTemplate, Step, StepStatus};
use crate::strategy::StrategyRegistry;
use crate::utils::sanitize_component;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation sources for one instance: the whole run, or its matrix (fail-fast)
#[derive(Debug, Clone, Default)]
pub struct InstanceCancel {
    pub run: CancelSignal,
    pub matrix: CancelSignal,
}

impl InstanceCancel {
    pub fn new(run: CancelSignal, matrix: CancelSignal) -> Self {
        Self { run, matrix }
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled() || self.matrix.is_cancelled()
    }

    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.run.cancelled() => {}
            _ = self.matrix.cancelled() => {}
        }
    }
}

/// Cache key awaiting a save once the job succeeds
struct PendingSave {
    key: String,
    paths: Vec<String>,
}

/// Runs job instances: conditions, executors, cache and artifacts
#[derive(Clone)]
pub struct JobRunner {
    executors: ExecutorRegistry,
    cache: Option<Arc<dyn CacheStore>>,
    artifacts: ArtifactRegistry,
    strategies: StrategyRegistry,
    workspaces: Arc<dyn WorkspaceProvider>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
}

impl JobRunner {
    /// Runner whose instances all work in `config.working_dir`
    pub fn new(executors: ExecutorRegistry, artifacts: ArtifactRegistry, config: ExecutorConfig) -> Self {
        Self {
            executors,
            cache: None,
            artifacts,
            strategies: StrategyRegistry::with_defaults(),
            workspaces: Arc::new(SharedWorkspace::new(config.working_dir.clone())),
            config,
            event_tx: None,
        }
    }

    pub fn with_workspaces(mut self, workspaces: Arc<dyn WorkspaceProvider>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn artifacts(&self) -> &ArtifactRegistry {
        &self.artifacts
    }

    /// Run one instance to a terminal status
    pub async fn run(
        &self,
        instance: &JobInstance,
        template: &JobTemplate,
        run: &RunContext,
        cancel: &InstanceCancel,
    ) -> JobReport {
        let start = Instant::now();
        let job_id = instance.id();
        let mut report = JobReport::not_run(
            &instance.template_id,
            &job_id,
            &instance.label,
            instance.matrix.clone(),
            &instance.runner,
            JobStatus::Succeeded,
        );

        if cancel.is_cancelled() {
            report.status = JobStatus::Cancelled;
            self.event_tx.send_event(ExecutionEvent::JobCancelled {
                job_id,
                reason: "cancelled before start".to_string(),
            });
            return report;
        }

        let mut steps = template.steps.clone();
        let mut artifact_specs = template.artifacts.clone();
        if template.platform_build {
            match self.strategies.resolve(&instance.runner) {
                Some(strategy) => {
                    log::debug!("{}: appending {} platform strategy", job_id, strategy.name());
                    steps.extend(strategy.steps(instance));
                    artifact_specs.extend(strategy.artifacts(instance));
                }
                None => {
                    let message = format!("no platform strategy for runner '{}'", instance.runner);
                    self.fail_before_start(&mut report, "platform strategy", message, start);
                    return report;
                }
            }
        }

        let working_dir = match self.workspaces.prepare(&run.run_id, instance) {
            Ok(dir) => dir,
            Err(e) => {
                let message = format!("cannot prepare workspace: {}", e);
                self.fail_before_start(&mut report, "workspace", message, start);
                return report;
            }
        };

        self.event_tx.send_event(ExecutionEvent::JobStarted {
            job_id: job_id.clone(),
            template_id: instance.template_id.clone(),
            runner: instance.runner.clone(),
            total_steps: steps.len(),
        });

        let mut env = JobEnvironment::for_instance(instance, template, run)
            .with_artifacts(self.artifacts.snapshot());

        let mut pending_save = None;
        if let Some(spec) = &template.cache {
            let (outcome, pending) =
                self.restore_cache(spec, instance, &env, run, &job_id, &working_dir);
            report.cache = outcome;
            pending_save = pending;
        }

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                env.cancelled = true;
            }

            let name = env.interpolate(step.label(), run);
            let should_run = match &step.condition {
                Some(condition) => env.evaluate(condition, run),
                None => env.healthy(),
            };

            if !should_run {
                let status = if env.cancelled {
                    StepStatus::Cancelled
                } else {
                    StepStatus::Skipped
                };
                self.event_tx.send_event(ExecutionEvent::StepSkipped {
                    job_id: job_id.clone(),
                    step_name: name.clone(),
                    step_index: index,
                });
                report.steps.push(skipped_step(step, name, status));
                continue;
            }

            let step_report = self
                .run_step(step, index, name, instance, run, &job_id, &working_dir, &mut env, &mut report, cancel)
                .await;
            report.steps.push(step_report);
        }

        if !env.cancelled {
            for spec in &artifact_specs {
                let wanted = match &spec.condition {
                    Some(condition) => env.evaluate(condition, run),
                    None => env.healthy(),
                };
                if !wanted {
                    continue;
                }
                if let Err(e) =
                    self.register_artifact(spec, instance, run, &job_id, &working_dir, &mut env, &mut report)
                {
                    self.fail_on_artifact(e, None, &job_id, &mut env, &mut report);
                }
            }
        }

        if let Some(pending) = pending_save {
            report.cache = Some(self.save_cache(pending, &env, &job_id, &working_dir));
        }

        report.status = if env.failed {
            JobStatus::Failed
        } else if env.cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Succeeded
        };

        self.complete(&mut report, start);
        report
    }

    fn fail_before_start(&self, report: &mut JobReport, step: &str, message: String, start: Instant) {
        self.event_tx
            .send_event(ExecutionEvent::error(&message, Some(report.instance_id.clone())));
        report.status = JobStatus::Failed;
        report.failure = Some(FailureDetail {
            step: step.to_string(),
            step_index: None,
            exit_code: None,
            output: String::new(),
            error: Some(message),
        });
        self.complete(report, start);
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        step: &Step,
        index: usize,
        name: String,
        instance: &JobInstance,
        run: &RunContext,
        job_id: &str,
        working_dir: &Path,
        env: &mut JobEnvironment,
        report: &mut JobReport,
        cancel: &InstanceCancel,
    ) -> StepReport {
        let start = Instant::now();

        self.event_tx.send_event(ExecutionEvent::StepStarted {
            job_id: job_id.to_string(),
            step_name: name.clone(),
            step_index: index,
        });

        let invocation = self.invocation(step, index, &name, env, run, job_id, working_dir);

        let result = match self.executors.get(&step.uses) {
            Ok(executor) if env.cancelled => Some(executor.execute(&invocation).await),
            Ok(executor) => {
                tokio::select! {
                    result = executor.execute(&invocation) => Some(result),
                    _ = cancel.cancelled() => None,
                }
            }
            Err(e) => Some(Err(e)),
        };

        let mut step_report = StepReport {
            name: name.clone(),
            id: step.id.clone(),
            status: StepStatus::Succeeded,
            exit_code: None,
            continue_on_error: false,
            outputs: Default::default(),
            log_path: invocation.log_path.clone(),
            duration: Duration::ZERO,
        };

        let (outcome, error) = match result {
            None => {
                log::debug!("{}: step '{}' interrupted by cancellation", job_id, name);
                env.cancelled = true;
                step_report.status = StepStatus::Cancelled;
                step_report.duration = start.elapsed();
                self.emit_step_completed(job_id, &step_report, index);
                return step_report;
            }
            Some(Ok(outcome)) => (outcome, None),
            Some(Err(e)) => (StepOutcome::default(), Some(e.to_string())),
        };

        step_report.exit_code = outcome.exit_code;
        step_report.outputs = outcome.outputs.clone();
        if let Some(id) = &step.id {
            env.record_outputs(id, outcome.outputs.clone());
        }

        if outcome.success && error.is_none() {
            for spec in &step.artifacts {
                let wanted = match &spec.condition {
                    Some(condition) => env.evaluate(condition, run),
                    None => true,
                };
                if !wanted {
                    continue;
                }
                if let Err(e) =
                    self.register_artifact(spec, instance, run, job_id, working_dir, env, report)
                {
                    step_report.status = StepStatus::Failed;
                    self.fail_on_artifact(e, Some(index), job_id, env, report);
                    break;
                }
            }
        } else {
            step_report.status = StepStatus::Failed;
            if step.continue_on_error {
                step_report.continue_on_error = true;
                self.event_tx.send_event(ExecutionEvent::warning(
                    format!("step '{}' failed (continue-on-error)", name),
                    Some(job_id.to_string()),
                ));
            } else {
                env.failed = true;
                if report.failure.is_none() {
                    report.failure = Some(FailureDetail {
                        step: name.clone(),
                        step_index: Some(index),
                        exit_code: outcome.exit_code,
                        output: outcome.combined_output(),
                        error,
                    });
                }
            }
        }

        step_report.duration = start.elapsed();
        self.emit_step_completed(job_id, &step_report, index);
        step_report
    }

    #[allow(clippy::too_many_arguments)]
    fn invocation(
        &self,
        step: &Step,
        index: usize,
        name: &str,
        env: &JobEnvironment,
        run: &RunContext,
        job_id: &str,
        working_dir: &Path,
    ) -> StepInvocation {
        let step_dir = match &step.working_directory {
            Some(dir) => working_dir.join(env.interpolate(dir, run)),
            None => working_dir.to_path_buf(),
        };

        let minutes = step.timeout_minutes.unwrap_or(self.config.default_step_timeout);
        let timeout = (minutes > 0).then(|| Duration::from_secs(minutes * 60));

        let log_path = self.config.log_dir.as_ref().map(|dir| {
            dir.join(sanitize_component(&run.run_id))
                .join(sanitize_component(job_id))
                .join(format!("{:02}-{}.log", index + 1, sanitize_component(name)))
        });

        StepInvocation {
            step_name: name.to_string(),
            command: env.interpolate(&step.run, run),
            args: step.args.iter().map(|a| env.interpolate(a, run)).collect(),
            env: env.step_env(&step.env, run),
            working_dir: step_dir,
            timeout,
            log_path,
            on_output: self.output_sink(job_id, index),
        }
    }

    fn output_sink(&self, job_id: &str, index: usize) -> Option<OutputCallback> {
        let tx = self.event_tx.clone()?;
        let job_id = job_id.to_string();
        Some(Arc::new(move |line: &str, is_error: bool| {
            tx.send_event(ExecutionEvent::StepOutput {
                job_id: job_id.clone(),
                step_index: index,
                output: line.to_string(),
                is_error,
            });
        }))
    }

    fn restore_cache(
        &self,
        spec: &CacheSpec,
        instance: &JobInstance,
        env: &JobEnvironment,
        run: &RunContext,
        job_id: &str,
        working_dir: &Path,
    ) -> (Option<CacheOutcome>, Option<PendingSave>) {
        let Some(store) = &self.cache else {
            return (None, None);
        };

        let discriminator = match &spec.key {
            Some(key) => env.interpolate(key, run),
            None => format!("{}-{}", instance.template_id, instance.runner),
        };
        let inputs: Vec<String> = spec.hash_files.iter().map(|h| env.interpolate(h, run)).collect();

        let key = match CacheKeyResolver::resolve(&discriminator, &inputs, working_dir) {
            Ok(key) => key,
            Err(e) => {
                self.cache_warning(format!("cache key unavailable: {}", e), job_id);
                return (
                    Some(CacheOutcome::Unavailable {
                        reason: e.to_string(),
                    }),
                    None,
                );
            }
        };

        match store.get(&key, working_dir) {
            Ok(Some(paths)) => {
                log::debug!("{}: cache hit {} ({} paths)", job_id, key, paths.len());
                self.event_tx.send_event(ExecutionEvent::CacheRestored {
                    job_id: job_id.to_string(),
                    key: key.clone(),
                });
                (Some(CacheOutcome::Hit { key }), None)
            }
            result => {
                if let Err(e) = result {
                    self.cache_warning(format!("cache restore failed, treating as miss: {}", e), job_id);
                }
                self.event_tx.send_event(ExecutionEvent::CacheMiss {
                    job_id: job_id.to_string(),
                    key: key.clone(),
                });
                let paths = spec.paths.iter().map(|p| env.interpolate(p, run)).collect();
                (
                    Some(CacheOutcome::Miss { key: key.clone() }),
                    Some(PendingSave { key, paths }),
                )
            }
        }
    }

    fn save_cache(
        &self,
        pending: PendingSave,
        env: &JobEnvironment,
        job_id: &str,
        working_dir: &Path,
    ) -> CacheOutcome {
        let PendingSave { key, paths } = pending;

        let Some(store) = self.cache.as_ref().filter(|_| env.healthy()) else {
            return CacheOutcome::Miss { key };
        };

        match store.put(&key, working_dir, &paths) {
            Ok(()) => {
                self.event_tx.send_event(ExecutionEvent::CacheSaved {
                    job_id: job_id.to_string(),
                    key: key.clone(),
                });
                CacheOutcome::Saved { key }
            }
            Err(e) => {
                self.cache_warning(format!("cache save skipped: {}", e), job_id);
                CacheOutcome::Miss { key }
            }
        }
    }

    fn cache_warning(&self, message: String, job_id: &str) {
        log::warn!("{}: {}", job_id, message);
        self.event_tx
            .send_event(ExecutionEvent::warning(message, Some(job_id.to_string())));
    }

    #[allow(clippy::too_many_arguments)]
    fn register_artifact(
        &self,
        spec: &ArtifactSpec,
        instance: &JobInstance,
        run: &RunContext,
        job_id: &str,
        working_dir: &Path,
        env: &mut JobEnvironment,
        report: &mut JobReport,
    ) -> Result<Option<Artifact>, ArtifactError> {
        let mut name = env.interpolate(&spec.name, run);
        if spec.suffix_instance && instance.has_matrix() {
            name = format!("{}-{}", name, instance.label);
        }

        let request = ArtifactRequest {
            name,
            paths: spec.paths.iter().map(|p| env.interpolate(p, run)).collect(),
            base_dir: working_dir.to_path_buf(),
            optional: spec.optional,
            allow_empty: spec.allow_empty,
            retention_days: spec.retention_days,
            producer: job_id.to_string(),
        };

        let registered = self.artifacts.register(request)?;
        if let Some(artifact) = &registered {
            env.artifacts
                .insert(artifact.name.clone(), artifact.paths.clone());
            report.artifacts.push(artifact.name.clone());
            self.event_tx.send_event(ExecutionEvent::ArtifactRegistered {
                job_id: job_id.to_string(),
                name: artifact.name.clone(),
                paths: artifact.paths.len(),
            });
        }
        Ok(registered)
    }

    fn fail_on_artifact(
        &self,
        error: ArtifactError,
        step_index: Option<usize>,
        job_id: &str,
        env: &mut JobEnvironment,
        report: &mut JobReport,
    ) {
        let message = error.to_string();
        self.event_tx
            .send_event(ExecutionEvent::error(&message, Some(job_id.to_string())));
        env.failed = true;
        if report.failure.is_none() {
            report.failure = Some(FailureDetail {
                step: "artifacts".to_string(),
                step_index,
                exit_code: None,
                output: String::new(),
                error: Some(message),
            });
        }
    }

    fn emit_step_completed(&self, job_id: &str, step: &StepReport, index: usize) {
        self.event_tx.send_event(ExecutionEvent::StepCompleted {
            job_id: job_id.to_string(),
            step_name: step.name.clone(),
            step_index: index,
            status: step.status,
            duration: step.duration,
            exit_code: step.exit_code,
        });
    }

    fn complete(&self, report: &mut JobReport, start: Instant) {
        report.duration = start.elapsed();
        self.event_tx.send_event(ExecutionEvent::JobCompleted {
            job_id: report.instance_id.clone(),
            status: report.status.clone(),
            duration: report.duration,
        });
    }
}

fn skipped_step(step: &Step, name: String, status: StepStatus) -> StepReport {
    StepReport {
        name,
        id: step.id.clone(),
        status,
        exit_code: None,
        continue_on_error: false,
        outputs: Default::default(),
        log_path: None,
        duration: Duration::ZERO,
    }
}

/// Directory that receives step logs for a run, if logging to files is enabled
pub fn run_log_dir(config: &ExecutorConfig, run_id: &str) -> Option<PathBuf> {
    config
        .log_dir
        .as_ref()
        .map(|dir| dir.join(sanitize_component(run_id)))
}
