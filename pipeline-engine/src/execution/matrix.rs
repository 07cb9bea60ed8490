// Matrix Expansion
// Expands job template axes into concrete job instances

use crate::context::interpolate;
use crate::models::JobTemplate;

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;

/// Runner identity used when a template has no `runs-on`
pub const DEFAULT_RUNNER: &str = "local";

/// A job template bound to one concrete axis assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInstance {
    /// Template this instance was expanded from
    pub template_id: String,
    /// Axis values in declaration order
    pub matrix: IndexMap<String, String>,
    /// Axis values joined in declaration order (`linux-stable`)
    pub label: String,
    /// Resolved runner identity
    pub runner: String,
    /// Position within the template's expansion
    pub index: usize,
}

impl JobInstance {
    /// Instance identifier: `build` or `build (linux-stable)`
    pub fn id(&self) -> String {
        if self.matrix.is_empty() {
            self.template_id.clone()
        } else {
            format!("{} ({})", self.template_id, self.label)
        }
    }

    pub fn has_matrix(&self) -> bool {
        !self.matrix.is_empty()
    }
}

/// Matrix expander for job templates
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a template into its instances.
    ///
    /// The cross product is taken in axis declaration order, so the last axis
    /// varies fastest. A template without axes yields one instance; an axis
    /// with no values yields none.
    ///
    /// Labels are unique within the expansion. When joined values collide
    /// (`x-y` + `z` vs `x` + `y-z`) every label is qualified with its axis
    /// names, and any label still shared gets its position appended.
    pub fn expand(template: &JobTemplate) -> Vec<JobInstance> {
        let mut instances: Vec<JobInstance> = Self::combinations(template)
            .into_iter()
            .enumerate()
            .map(|(index, matrix)| {
                let label = if matrix.is_empty() {
                    template.id.clone()
                } else {
                    matrix.values().cloned().collect::<Vec<_>>().join("-")
                };
                let runner = Self::resolve_runner(template, &matrix);

                JobInstance {
                    template_id: template.id.clone(),
                    matrix,
                    label,
                    runner,
                    index,
                }
            })
            .collect();

        if has_collisions(&instances) {
            for instance in &mut instances {
                instance.label = instance
                    .matrix
                    .iter()
                    .map(|(axis, value)| format!("{}={}", axis, value))
                    .collect::<Vec<_>>()
                    .join(",");
            }
        }
        if has_collisions(&instances) {
            let mut seen = HashSet::new();
            for instance in &mut instances {
                let mut label = instance.label.clone();
                let mut n = instance.index + 1;
                while !seen.insert(label.clone()) {
                    label = format!("{}#{}", instance.label, n);
                    n += 1;
                }
                instance.label = label;
            }
        }

        instances
    }

    /// Number of instances a template expands to, without materializing them
    pub fn count(template: &JobTemplate) -> usize {
        template.matrix.values().map(Vec::len).product()
    }

    fn combinations(template: &JobTemplate) -> Vec<IndexMap<String, String>> {
        let mut combos = vec![IndexMap::new()];

        for (axis, values) in &template.matrix {
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(axis.clone(), value.clone());
                    next.push(extended);
                }
            }
            combos = next;
        }

        combos
    }

    /// Interpolate `runs-on` with the instance's matrix values
    fn resolve_runner(template: &JobTemplate, matrix: &IndexMap<String, String>) -> String {
        match template.runs_on.as_deref() {
            Some(selector) => interpolate(selector, |reference| {
                reference
                    .strip_prefix("matrix.")
                    .and_then(|axis| matrix.get(axis).cloned())
            }),
            None => DEFAULT_RUNNER.to_string(),
        }
    }
}

fn has_collisions(instances: &[JobInstance]) -> bool {
    let mut seen = HashSet::new();
    !instances.iter().all(|i| seen.insert(i.label.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_cross_product() {
        let template = JobTemplate::new("test")
            .runs_on("${{ matrix.os }}")
            .with_axis("os", ["windows", "macos", "linux"])
            .with_axis("toolchain", ["stable", "nightly"]);

        let instances = MatrixExpander::expand(&template);

        assert_eq!(instances.len(), 6);
        assert_eq!(MatrixExpander::count(&template), 6);

        let labels: HashSet<_> = instances.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels.len(), 6);
        assert!(labels.contains("linux-nightly"));

        // Declaration order, last axis fastest
        assert_eq!(instances[0].label, "windows-stable");
        assert_eq!(instances[1].label, "windows-nightly");
        assert_eq!(instances[5].label, "linux-nightly");

        for (i, instance) in instances.iter().enumerate() {
            assert_eq!(instance.index, i);
            assert_eq!(&instance.runner, &instance.matrix["os"]);
        }
        assert_eq!(instances[2].id(), "test (macos-stable)");
    }

    #[test]
    fn test_no_axes_yields_single_instance() {
        let template = JobTemplate::new("lint").runs_on("ubuntu-latest");

        let instances = MatrixExpander::expand(&template);

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].label, "lint");
        assert_eq!(instances[0].id(), "lint");
        assert_eq!(instances[0].runner, "ubuntu-latest");
        assert!(!instances[0].has_matrix());
    }

    #[test]
    fn test_empty_axis_yields_no_instances() {
        let template = JobTemplate::new("test")
            .with_axis("os", ["linux"])
            .with_axis("toolchain", Vec::<String>::new());

        assert!(MatrixExpander::expand(&template).is_empty());
        assert_eq!(MatrixExpander::count(&template), 0);
    }

    #[test]
    fn test_colliding_joined_values_get_qualified_labels() {
        let template = JobTemplate::new("t")
            .with_axis("a", ["x-y", "x"])
            .with_axis("b", ["z", "y-z"]);

        let instances = MatrixExpander::expand(&template);
        let labels: Vec<_> = instances.iter().map(|i| i.label.as_str()).collect();

        assert_eq!(labels, vec!["a=x-y,b=z", "a=x-y,b=y-z", "a=x,b=z", "a=x,b=y-z"]);
        assert_eq!(instances[2].id(), "t (a=x,b=z)");
    }

    #[test]
    fn test_repeated_axis_values_stay_distinct() {
        let template = JobTemplate::new("t").with_axis("os", ["linux", "linux"]);

        let instances = MatrixExpander::expand(&template);
        let ids: HashSet<_> = instances.iter().map(JobInstance::id).collect();

        assert_eq!(instances.len(), 2);
        assert_eq!(ids.len(), 2);
        assert_eq!(instances[0].label, "os=linux");
        assert_eq!(instances[1].label, "os=linux#2");
    }

    #[test]
    fn test_default_runner() {
        let template = JobTemplate::new("build");
        assert_eq!(MatrixExpander::expand(&template)[0].runner, DEFAULT_RUNNER);
    }
}
