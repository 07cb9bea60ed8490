use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{
    ExecutorRegistry, MatrixExpander, PipelineDefinition, PipelineParser, StrategyRegistry,
};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Treat warnings as errors
    #[arg(long)]
    pub strict: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Validating", &format!("{}", pipeline_path.display()));

    // Step 1: Parse YAML syntax
    let pipeline = match PipelineParser::from_file(pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            std::process::exit(1);
        }
    };

    output::check("YAML syntax valid");

    let instances: usize = pipeline.jobs.iter().map(MatrixExpander::count).sum();
    let steps: usize = pipeline.jobs.iter().map(|j| j.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs ({} instances), {} steps",
        pipeline.jobs.len(),
        instances,
        steps
    ));

    // Step 2: Graph and semantic validation
    match PipelineParser::validate(&pipeline) {
        Ok(()) => output::check("Dependency graph is acyclic"),
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    }

    // Step 3: Executors and platform strategies
    let warnings = lint(&pipeline, &ExecutorRegistry::new(), &StrategyRegistry::with_defaults());
    for warning in &warnings {
        output::warning(warning);
    }

    if !warnings.is_empty() && args.strict {
        output::failure(&format!("{} warning(s) with --strict", warnings.len()));
        std::process::exit(1);
    }

    println!();
    output::success("Pipeline is valid");

    Ok(())
}

/// Problems that only surface at run time
fn lint(
    pipeline: &PipelineDefinition,
    executors: &ExecutorRegistry,
    strategies: &StrategyRegistry,
) -> Vec<String> {
    let mut warnings = Vec::new();

    for job in &pipeline.jobs {
        for step in &job.steps {
            if !executors.contains(&step.uses) {
                warnings.push(format!(
                    "Job '{}' step '{}' uses unknown executor '{}' (available: {})",
                    job.id,
                    step.label(),
                    step.uses,
                    executors.names().join(", ")
                ));
            }
        }

        if job.platform_build {
            for instance in MatrixExpander::expand(job) {
                if strategies.resolve(&instance.runner).is_none() {
                    warnings.push(format!(
                        "Job '{}' has no platform strategy for runner '{}'",
                        instance.id(),
                        instance.runner
                    ));
                }
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_engine::{JobTemplate, Step};

    #[test]
    fn test_lint_reports_unknown_executor_and_runner() {
        let mut package = JobTemplate::new("package")
            .runs_on("${{ matrix.os }}")
            .with_axis("os", ["ubuntu-latest", "plan9"]);
        package.platform_build = true;

        let pipeline = PipelineDefinition::new("ci")
            .with_job(JobTemplate::new("build").with_step(Step::run("Image", "build").uses("docker")))
            .with_job(package);

        let warnings = lint(&pipeline, &ExecutorRegistry::new(), &StrategyRegistry::with_defaults());

        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("unknown executor 'docker'"));
        assert!(warnings[1].contains("runner 'plan9'"));
    }
}
