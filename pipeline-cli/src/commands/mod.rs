pub mod plan;
pub mod run;
pub mod validate;

use crate::output;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::Result;

use pipeline_engine::utils::resolve_working_dir;
use pipeline_engine::{EventKind, PipelineDefinition, PipelineParser, RunContext};

/// Describes the triggering event of a run
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Triggering event (manual, push, pull_request)
    #[arg(long, default_value = "manual", value_name = "EVENT")]
    pub event: EventKind,

    /// Target branch
    #[arg(long, value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Changed path (can be repeated)
    #[arg(long = "changed", value_name = "PATH")]
    pub changed_paths: Vec<String>,

    /// Set a pipeline variable (can be repeated, format: name=value)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,
}

impl TriggerArgs {
    pub fn run_context(&self, pipeline_name: &str) -> Result<RunContext> {
        let mut variables = HashMap::new();
        for var_str in &self.variables {
            match var_str.split_once('=') {
                Some((name, value)) => {
                    variables.insert(name.to_string(), value.to_string());
                }
                None => color_eyre::eyre::bail!(
                    "Invalid variable format '{}'. Expected name=value",
                    var_str
                ),
            }
        }

        let mut context = RunContext::new(pipeline_name, self.event)
            .with_changed_paths(self.changed_paths.iter().cloned())
            .with_env(variables);
        if let Some(branch) = &self.branch {
            context = context.with_branch(branch);
        }
        Ok(context)
    }
}

/// Parse and validate a pipeline file, printing the error and exiting on failure
pub fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    if !path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", path.display());
    }

    let pipeline = match PipelineParser::from_file(path) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            std::process::exit(1);
        }
    };

    if let Err(e) = PipelineParser::validate(&pipeline) {
        output::error(&format!("Invalid pipeline: {}", e));
        std::process::exit(1);
    }

    Ok(pipeline)
}

/// Pipeline name, falling back to the file stem
pub fn pipeline_name(pipeline: &PipelineDefinition, path: &Path) -> String {
    pipeline.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("pipeline")
            .to_string()
    })
}

/// Working directory, defaulting to the enclosing repository root
pub fn working_dir(dir: &Option<PathBuf>) -> PathBuf {
    dir.clone().unwrap_or_else(resolve_working_dir)
}
