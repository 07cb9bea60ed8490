use crate::error::{EngineError, EngineResult};
use crate::execution::graph::ExecutionGraph;
use crate::models::PipelineDefinition;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parser for pipeline definition YAML files.
pub struct PipelineParser;

impl PipelineParser {
    /// Parse a definition from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<PipelineDefinition> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a definition from a YAML string.
    pub fn parse(content: &str) -> EngineResult<PipelineDefinition> {
        let definition: PipelineDefinition = serde_yaml::from_str(content)?;
        Ok(definition)
    }

    /// Parse and validate a definition from a YAML string.
    ///
    /// This performs additional validation beyond basic YAML parsing, including
    /// building the execution graph (unknown dependencies and cycles).
    pub fn parse_and_validate(content: &str) -> EngineResult<PipelineDefinition> {
        let definition = Self::parse(content)?;
        Self::validate(&definition)?;
        Ok(definition)
    }

    /// Validate a parsed definition for semantic correctness.
    pub fn validate(definition: &PipelineDefinition) -> EngineResult<()> {
        ExecutionGraph::from_pipeline(definition)?;

        for job in &definition.jobs {
            if job.steps.is_empty() && !job.platform_build {
                return Err(EngineError::InvalidInput(format!(
                    "Job '{}' has no steps",
                    job.id
                )));
            }

            let mut step_ids = HashSet::new();
            for (step_idx, step) in job.steps.iter().enumerate() {
                if step.run.trim().is_empty() {
                    return Err(EngineError::InvalidInput(format!(
                        "Step {} '{}' in job '{}' has no command",
                        step_idx,
                        step.name.as_deref().unwrap_or("unnamed"),
                        job.id
                    )));
                }

                if let Some(id) = &step.id {
                    if !step_ids.insert(id.as_str()) {
                        return Err(EngineError::InvalidInput(format!(
                            "Job '{}' declares step id '{}' more than once",
                            job.id, id
                        )));
                    }
                }
            }

            for (axis, values) in &job.matrix {
                if values.is_empty() {
                    return Err(EngineError::InvalidInput(format!(
                        "Matrix axis '{}' in job '{}' has no values",
                        axis, job.id
                    )));
                }
                let mut seen = HashSet::new();
                if let Some(dup) = values.iter().find(|v| !seen.insert(v.as_str())) {
                    return Err(EngineError::InvalidInput(format!(
                        "Matrix axis '{}' in job '{}' repeats value '{}'",
                        axis, job.id, dup
                    )));
                }
            }

            if job.max_parallel == Some(0) {
                return Err(EngineError::InvalidInput(format!(
                    "Job '{}' sets max-parallel to 0",
                    job.id
                )));
            }
        }

        Ok(())
    }
}
