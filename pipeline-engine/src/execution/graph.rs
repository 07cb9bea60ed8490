// Execution Graph (DAG) Builder
// Builds a directed acyclic graph of job templates for execution ordering

use crate::models::{JobTemplate, PipelineDefinition, TriggerFilter};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to unknown job
    UnknownDependency,
    /// Two templates share an identifier
    DuplicateJob,
    /// Invalid pipeline structure
    InvalidStructure,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn duplicate_job(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateJob,
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
        }
    }
}

/// Execution graph representing the DAG of job templates
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    /// All job templates in declaration order
    pub jobs: Vec<JobNode>,
    /// Quick lookup of job index by id
    job_indices: HashMap<String, usize>,
    /// Pipeline name
    pub name: Option<String>,
    /// Run-level trigger filter
    pub trigger: Option<TriggerFilter>,
    /// Pipeline-level environment variables
    pub env: HashMap<String, String>,
}

/// A node representing a job template in the execution graph
#[derive(Debug, Clone)]
pub struct JobNode {
    /// Job definition
    pub template: JobTemplate,
    /// Ids of templates this one needs
    pub dependencies: Vec<String>,
}

impl JobNode {
    pub fn id(&self) -> &str {
        &self.template.id
    }
}

impl ExecutionGraph {
    /// Build an execution graph from a pipeline definition
    pub fn from_pipeline(pipeline: &PipelineDefinition) -> Result<Self, GraphError> {
        let mut jobs = Vec::with_capacity(pipeline.jobs.len());
        let mut job_indices = HashMap::new();

        for (i, template) in pipeline.jobs.iter().enumerate() {
            if template.id.trim().is_empty() {
                return Err(GraphError::invalid_structure(format!(
                    "job #{} has an empty id",
                    i + 1
                )));
            }
            if job_indices.insert(template.id.clone(), i).is_some() {
                return Err(GraphError::duplicate_job(format!(
                    "job '{}' is declared more than once",
                    template.id
                )));
            }

            let mut dependencies = Vec::new();
            for dep in template.needs.to_vec() {
                if !dependencies.contains(&dep) {
                    dependencies.push(dep);
                }
            }

            jobs.push(JobNode {
                template: template.clone(),
                dependencies,
            });
        }

        let graph = Self {
            jobs,
            job_indices,
            name: pipeline.name.clone(),
            trigger: pipeline.trigger.clone(),
            env: pipeline.env.clone(),
        };

        // Validate the graph
        graph.validate()?;

        Ok(graph)
    }

    /// Validate the execution graph (check for cycles and unknown dependencies)
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.jobs {
            for dep in &node.dependencies {
                if !self.job_indices.contains_key(dep) {
                    return Err(GraphError::unknown_dependency(format!(
                        "job '{}' depends on unknown job '{}'",
                        node.id(),
                        dep
                    )));
                }
            }
        }

        self.detect_cycles()
    }

    /// Detect cycles in job dependencies using DFS
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();

        for node in &self.jobs {
            if !visited.contains(node.id()) {
                if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut path) {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected: {}",
                        cycle.join(" -> ")
                    )));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &JobNode,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        let name = node.id().to_string();
        visited.insert(name.clone());
        path.push(name);

        for dep in &node.dependencies {
            if let Some(start) = path.iter().position(|p| p == dep) {
                // Close the loop: a -> b -> a
                let mut cycle = path[start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(&idx) = self.job_indices.get(dep) {
                    if let Some(cycle) = self.dfs_cycle(&self.jobs[idx], visited, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        None
    }

    /// Get jobs in topological order (respecting dependencies).
    ///
    /// Ties are broken by declaration order.
    pub fn topological_order(&self) -> Vec<&JobNode> {
        // Kahn's algorithm for topological sort
        let mut in_degree: Vec<usize> = vec![0; self.jobs.len()];
        let mut adj_list: Vec<Vec<usize>> = vec![Vec::new(); self.jobs.len()];

        for (i, node) in self.jobs.iter().enumerate() {
            for dep in &node.dependencies {
                if let Some(&dep_idx) = self.job_indices.get(dep) {
                    adj_list[dep_idx].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut result = Vec::with_capacity(self.jobs.len());

        while let Some(idx) = queue.pop_front() {
            result.push(&self.jobs[idx]);

            let mut ready = Vec::new();
            for &neighbor in &adj_list[idx] {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    ready.push(neighbor);
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }

        result
    }

    /// Get jobs that can run in parallel, grouped by dependency depth
    pub fn parallel_levels(&self) -> Vec<Vec<&JobNode>> {
        let mut levels: Vec<Vec<&JobNode>> = Vec::new();
        let mut assigned: HashMap<&str, usize> = HashMap::new();

        for node in self.topological_order() {
            let level = node
                .dependencies
                .iter()
                .filter_map(|dep| assigned.get(dep.as_str()))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);

            assigned.insert(node.id(), level);

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(node);
        }

        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Step;

    fn make_job(id: &str, needs: &[&str]) -> JobTemplate {
        JobTemplate::new(id)
            .needs(needs.iter().copied())
            .with_step(Step::run("noop", "true"))
    }

    fn make_pipeline(jobs: Vec<JobTemplate>) -> PipelineDefinition {
        PipelineDefinition {
            jobs,
            ..Default::default()
        }
    }

    fn position(order: &[&JobNode], id: &str) -> usize {
        order.iter().position(|n| n.id() == id).unwrap()
    }

    #[test]
    fn test_simple_linear_jobs() {
        let pipeline = make_pipeline(vec![
            make_job("build", &[]),
            make_job("test", &["build"]),
            make_job("deploy", &["test"]),
        ]);

        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();

        let order: Vec<_> = graph.topological_order().iter().map(|n| n.id()).collect();
        assert_eq!(order, vec!["build", "test", "deploy"]);
    }

    #[test]
    fn test_topological_order_respects_every_edge() {
        let pipeline = make_pipeline(vec![
            make_job("package", &["compile", "lint"]),
            make_job("publish", &["package", "docs"]),
            make_job("compile", &[]),
            make_job("docs", &["compile"]),
            make_job("lint", &[]),
        ]);

        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();
        let order = graph.topological_order();
        assert_eq!(order.len(), 5);

        for node in &graph.jobs {
            for dep in &node.dependencies {
                assert!(
                    position(&order, dep) < position(&order, node.id()),
                    "{} must precede {}",
                    dep,
                    node.id()
                );
            }
        }

        // Independent roots keep declaration order
        assert!(position(&order, "compile") < position(&order, "lint"));
    }

    #[test]
    fn test_parallel_levels() {
        let pipeline = make_pipeline(vec![
            make_job("build", &[]),
            make_job("unit", &["build"]),
            make_job("integration", &["build"]),
            make_job("deploy", &["unit", "integration"]),
        ]);

        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();

        let parallel = graph.parallel_levels();
        assert_eq!(parallel.len(), 3);

        assert_eq!(parallel[0].len(), 1);
        assert_eq!(parallel[0][0].id(), "build");

        // unit and integration can run in parallel
        assert_eq!(parallel[1].len(), 2);

        assert_eq!(parallel[2].len(), 1);
        assert_eq!(parallel[2][0].id(), "deploy");
    }

    #[test]
    fn test_cycle_detection_names_cycle() {
        let pipeline = make_pipeline(vec![
            make_job("a", &["c"]),
            make_job("b", &["a"]),
            make_job("c", &["b"]),
        ]);

        let err = ExecutionGraph::from_pipeline(&pipeline).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert!(err.message.contains("a -> c -> b -> a"), "{}", err.message);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let pipeline = make_pipeline(vec![make_job("loop", &["loop"])]);

        let err = ExecutionGraph::from_pipeline(&pipeline).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert!(err.message.contains("loop -> loop"));
    }

    #[test]
    fn test_unknown_dependency() {
        let pipeline = make_pipeline(vec![
            make_job("build", &[]),
            make_job("test", &["unknown"]),
        ]);

        let err = ExecutionGraph::from_pipeline(&pipeline).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
    }

    #[test]
    fn test_duplicate_job() {
        let pipeline = make_pipeline(vec![make_job("build", &[]), make_job("build", &[])]);

        let err = ExecutionGraph::from_pipeline(&pipeline).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateJob);
    }

    #[test]
    fn test_independent_jobs_share_a_level() {
        let pipeline = make_pipeline(vec![make_job("build", &[]), make_job("lint", &[])]);

        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();

        let parallel = graph.parallel_levels();
        assert_eq!(parallel.len(), 1);
        assert_eq!(parallel[0].len(), 2);
    }
}
