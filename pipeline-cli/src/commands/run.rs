use crate::commands::{load_pipeline, pipeline_name, working_dir, TriggerArgs};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::execution::runner::run_log_dir;
use pipeline_engine::execution::{progress_channel, LogLevel};
use pipeline_engine::{ExecutionEvent, ExecutorConfig, PipelineExecutor, RunReport, RunStatus};

/// Execute a pipeline locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub trigger: TriggerArgs,

    /// Working directory for execution
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Run every job instance directly in the working directory
    #[arg(long)]
    pub shared_workspace: bool,

    /// Root for per-instance copies of the working directory
    #[arg(long, value_name = "DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Keep per-instance copies after the run
    #[arg(long)]
    pub keep_workspaces: bool,

    /// Maximum job instances running at once (0 = unlimited)
    #[arg(long, short = 'j', default_value_t = 0, value_name = "N")]
    pub max_parallel: usize,

    /// Default step timeout in minutes (0 = none)
    #[arg(long, default_value_t = 60, value_name = "MINUTES")]
    pub step_timeout: u64,

    /// Cache directory (default: ~/.pipeline-engine/cache)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Disable cache restore and save
    #[arg(long)]
    pub no_cache: bool,

    /// Copy registered artifacts under this directory
    #[arg(long, value_name = "DIR")]
    pub artifact_dir: Option<PathBuf>,

    /// Write per-step logs under this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    output::status("Parsing", &format!("{}", args.pipeline.display()));
    let pipeline = load_pipeline(&args.pipeline)?;
    let name = pipeline_name(&pipeline, &args.pipeline);

    output::info(&format!(
        "Pipeline '{}': {} jobs, {} steps",
        name,
        pipeline.jobs.len(),
        pipeline.jobs.iter().map(|j| j.steps.len()).sum::<usize>()
    ));

    let context = args.trigger.run_context(&name)?;
    let config = ExecutorConfig {
        max_parallel_jobs: args.max_parallel,
        default_step_timeout: args.step_timeout,
        working_dir: working_dir(&args.working_dir),
        isolate_instances: !args.shared_workspace,
        workspace_root: args.workspace_dir.clone(),
        keep_workspaces: args.keep_workspaces,
        cache_dir: args.cache_dir.clone(),
        artifact_dir: args.artifact_dir.clone(),
        log_dir: args.log_dir.clone(),
        enable_cache: !args.no_cache,
    };

    let (tx, mut rx) = progress_channel();
    let executor = PipelineExecutor::from_pipeline(&pipeline)
        .map_err(|e| color_eyre::eyre::eyre!("Failed to build execution graph: {}", e.message))?
        .with_config(config.clone())
        .with_progress(tx);

    // Ctrl-C aborts the run; a second Ctrl-C falls through to the default handler
    let abort = executor.abort_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling run...");
            abort.cancel();
        }
    });

    let exec_handle = tokio::spawn(async move { executor.execute(context).await });

    while let Some(event) = rx.recv().await {
        render_event(&event);
    }

    let report = exec_handle.await?;
    interrupt.abort();

    print_summary(&report);

    if let Some(dir) = run_log_dir(&config, &report.run_id) {
        output::info(&format!("Step logs in {}", dir.display()));
    }

    if let Some(path) = &args.report {
        std::fs::write(path, report.to_json()?)?;
        output::info(&format!("Report written to {}", path.display()));
    }

    match report.status {
        RunStatus::Success => Ok(()),
        RunStatus::Failure => std::process::exit(1),
        RunStatus::Cancelled => std::process::exit(130),
    }
}

fn render_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            pipeline_name,
            total_jobs,
            run_id,
        } => {
            println!();
            output::header(&format!(
                "Run {} of '{}' ({} job instances)",
                run_id, pipeline_name, total_jobs
            ));
        }

        ExecutionEvent::RunCompleted {
            status, duration, ..
        } => {
            println!();
            let message = format!("Run {} after {:.2}s", status, duration.as_secs_f64());
            match status {
                RunStatus::Success => output::success(&message),
                _ => output::failure(&message),
            }
        }

        ExecutionEvent::JobStarted {
            job_id,
            runner,
            total_steps,
            ..
        } => {
            println!("    Job '{}' on {} ({} steps)", job_id, runner, total_steps);
        }

        ExecutionEvent::JobCompleted {
            job_id,
            status,
            duration,
        } => {
            output::job_line(
                status,
                &format!(
                    "    Job '{}' {} ({:.2}s)",
                    job_id,
                    output::job_symbol(status),
                    duration.as_secs_f64()
                ),
            );
        }

        ExecutionEvent::JobSkipped { job_id, status } => {
            output::warning(&format!("    Job '{}' {}", job_id, status));
        }

        ExecutionEvent::JobCancelled { job_id, reason } => {
            output::warning(&format!("    Job '{}' cancelled: {}", job_id, reason));
        }

        ExecutionEvent::StepStarted {
            job_id,
            step_name,
            step_index,
        } => {
            println!("      [{} #{}] {}", job_id, step_index + 1, step_name);
        }

        ExecutionEvent::StepOutput {
            job_id,
            output,
            is_error,
            ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::step_error(job_id, line);
                } else {
                    output::step_output(job_id, line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            status,
            duration,
            exit_code,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let message = format!(
                "        {} ({:.2}s){}",
                output::step_symbol(*status),
                duration.as_secs_f64(),
                exit_info
            );
            match status {
                pipeline_engine::StepStatus::Succeeded => output::dim_success(&message),
                pipeline_engine::StepStatus::Failed => output::dim_failure(&message),
                _ => output::dim(&message),
            }
        }

        ExecutionEvent::StepSkipped { step_name, .. } => {
            output::dim(&format!("        {} skipped", step_name));
        }

        ExecutionEvent::CacheRestored { job_id, key } => {
            output::dim(&format!("    [{}] cache restored: {}", job_id, key));
        }

        ExecutionEvent::CacheMiss { job_id, key } => {
            output::dim(&format!("    [{}] cache miss: {}", job_id, key));
        }

        ExecutionEvent::CacheSaved { job_id, key } => {
            output::dim(&format!("    [{}] cache saved: {}", job_id, key));
        }

        ExecutionEvent::ArtifactRegistered {
            job_id,
            name,
            paths,
        } => {
            output::check(&format!("[{}] artifact '{}' ({} paths)", job_id, name, paths));
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            _ => output::dim(message),
        },
    }
}

fn print_summary(report: &RunReport) {
    println!();
    output::header("Summary");
    for job in &report.jobs {
        output::job_line(
            &job.status,
            &format!(
                "  {:<10} {} ({:.2}s)",
                output::job_symbol(&job.status),
                job.instance_id,
                job.duration.as_secs_f64()
            ),
        );
        if let Some(failure) = &job.failure {
            let detail = failure
                .error
                .clone()
                .or_else(|| failure.exit_code.map(|c| format!("exit code {}", c)))
                .unwrap_or_default();
            output::dim_failure(&format!("             step '{}': {}", failure.step, detail));
        }
    }
    for artifact in &report.artifacts {
        output::dim(&format!(
            "  artifact {} ({} paths) from {}",
            artifact.name,
            artifact.paths.len(),
            artifact.producer
        ));
    }
}
