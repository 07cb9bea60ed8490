use crate::commands::{load_pipeline, pipeline_name, TriggerArgs};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use serde::Serialize;

use pipeline_engine::{ExecutionGraph, JobInstance, MatrixExpander, RunContext};

/// Show the job instances a run would schedule, level by level
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub trigger: TriggerArgs,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct PlannedJob {
    id: String,
    needs: Vec<String>,
    applicable: bool,
    instances: Vec<JobInstance>,
}

#[derive(Debug, Serialize)]
struct Plan {
    pipeline: String,
    triggered: bool,
    levels: Vec<Vec<PlannedJob>>,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let pipeline = load_pipeline(&args.pipeline)?;
    let name = pipeline_name(&pipeline, &args.pipeline);
    let context = args.trigger.run_context(&name)?;

    let graph = ExecutionGraph::from_pipeline(&pipeline)
        .map_err(|e| color_eyre::eyre::eyre!("Failed to build execution graph: {}", e.message))?;
    let plan = build_plan(&graph, &name, &context);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    output::header(&format!("Plan for '{}' ({} event)", plan.pipeline, context.event));
    if !plan.triggered {
        output::warning("The trigger filter rejects this event; no jobs would run");
    }

    for (depth, level) in plan.levels.iter().enumerate() {
        println!("  Level {}", depth + 1);
        for job in level {
            let needs = if job.needs.is_empty() {
                String::new()
            } else {
                format!(" (needs {})", job.needs.join(", "))
            };
            if !job.applicable {
                output::dim(&format!("    {}{}: not applicable", job.id, needs));
                continue;
            }
            println!("    {}{}: {} instance(s)", job.id, needs, job.instances.len());
            for instance in job.instances.iter().filter(|i| i.has_matrix()) {
                output::dim(&format!("      {} on {}", instance.id(), instance.runner));
            }
        }
    }

    let total: usize = plan
        .levels
        .iter()
        .flatten()
        .map(|job| job.instances.len())
        .sum();
    println!();
    output::info(&format!("{} job instance(s) would be scheduled", total));

    Ok(())
}

/// Group templates by dependency depth and expand the applicable ones.
///
/// A template is applicable when the trigger admits the run, its own path
/// filter matches and none of its dependencies were filtered out.
fn build_plan(graph: &ExecutionGraph, name: &str, context: &RunContext) -> Plan {
    let triggered = graph
        .trigger
        .as_ref()
        .map(|t| t.admits(context))
        .unwrap_or(true);

    let mut filtered: Vec<String> = Vec::new();
    let mut levels = Vec::new();

    for level in graph.parallel_levels() {
        let mut planned = Vec::new();
        for node in level {
            let template = &node.template;
            let applicable = triggered
                && !node.dependencies.iter().any(|d| filtered.contains(d))
                && template
                    .paths
                    .as_ref()
                    .map(|p| p.applies_to(context))
                    .unwrap_or(true);
            if !applicable {
                filtered.push(template.id.clone());
            }

            planned.push(PlannedJob {
                id: template.id.clone(),
                needs: node.dependencies.clone(),
                applicable,
                instances: if applicable {
                    MatrixExpander::expand(template)
                } else {
                    Vec::new()
                },
            });
        }
        levels.push(planned);
    }

    Plan {
        pipeline: name.to_string(),
        triggered,
        levels,
    }
}
