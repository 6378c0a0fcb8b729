//! Execution plan compilation (Kahn levels).

use super::model::{PipelineDefinition, StageDefinition};
use crate::errors::ConfigError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

/// Ordered batches of stages.
///
/// Every stage in batch `i` depends only on stages in batches `0..i`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    batches: Vec<Vec<StageDefinition>>,
    queues: BTreeMap<String, usize>,
}

impl ExecutionPlan {
    /// Compiles a validated definition into batches.
    ///
    /// Stages become ready when all of their dependencies are placed; each
    /// level keeps declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Cycle`] if some stages can never become ready,
    /// and [`ConfigError::UnknownDependency`] for dangling edges.
    pub fn compile(definition: &PipelineDefinition) -> Result<Self, ConfigError> {
        let stages = &definition.stages;
        let index: HashMap<&str, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; stages.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            let unique: HashSet<&str> = stage.depends_on.iter().map(String::as_str).collect();
            for dep in unique {
                let &d = index.get(dep).ok_or_else(|| ConfigError::UnknownDependency {
                    stage: stage.id.clone(),
                    dependency: dep.to_string(),
                })?;
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: Vec<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut batches = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let mut next = Vec::new();
            for &i in &ready {
                for &child in &dependents[i] {
                    in_degree[child] -= 1;
                    if in_degree[child] == 0 {
                        next.push(child);
                    }
                }
            }
            next.sort_unstable();
            placed += ready.len();
            batches.push(ready.iter().map(|&i| stages[i].clone()).collect());
            ready = next;
        }

        if placed < stages.len() {
            let remaining: Vec<&StageDefinition> = stages
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s)
                .collect();
            return Err(ConfigError::Cycle {
                path: find_cycle(&remaining),
            });
        }

        let mut queues = BTreeMap::new();
        for stage in stages {
            let name = stage.queue_name(&definition.settings).to_string();
            let concurrency = definition.settings.concurrency(&name);
            queues.insert(name, concurrency);
        }

        Ok(Self { batches, queues })
    }

    /// Returns the batches in execution order.
    #[must_use]
    pub fn batches(&self) -> &[Vec<StageDefinition>] {
        &self.batches
    }

    /// Returns the number of batches.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Returns the total number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Returns the batch index holding a stage.
    #[must_use]
    pub fn batch_of(&self, stage_id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|s| s.id == stage_id))
    }

    /// Queues the plan dispatches to, with their concurrency.
    #[must_use]
    pub fn queues(&self) -> &BTreeMap<String, usize> {
        &self.queues
    }

    /// Renders a human-readable listing of the plan.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, batch) in self.batches.iter().enumerate() {
            let _ = writeln!(out, "Batch {}:", i + 1);
            for stage in batch {
                let _ = write!(out, "  - {} ({})", stage.id, stage.agent);
                let mut flags = Vec::new();
                if !stage.required {
                    flags.push("optional".to_string());
                }
                if stage.cache {
                    flags.push("cached".to_string());
                }
                if stage.manual {
                    flags.push("manual".to_string());
                }
                if let Some(ref selector) = stage.foreach {
                    flags.push(format!("foreach {selector}"));
                }
                if let Some(ref condition) = stage.condition {
                    flags.push(format!("if {condition}"));
                }
                if !flags.is_empty() {
                    let _ = write!(out, " [{}]", flags.join(", "));
                }
                if !stage.depends_on.is_empty() {
                    let _ = write!(out, " <- {}", stage.depends_on.join(", "));
                }
                out.push('\n');
            }
        }
        out
    }
}

fn find_cycle(remaining: &[&StageDefinition]) -> Vec<String> {
    let graph: HashMap<&str, &StageDefinition> =
        remaining.iter().map(|s| (s.id.as_str(), *s)).collect();
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for &stage in remaining {
        if !visited.contains(stage.id.as_str()) {
            if let Some(cycle) = dfs_cycle(&stage.id, &graph, &mut visited, &mut on_stack, &mut path) {
                return cycle;
            }
        }
    }

    remaining.iter().map(|s| s.id.clone()).collect()
}

fn dfs_cycle<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a StageDefinition>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    if let Some(&stage) = graph.get(node) {
        for dep in &stage.depends_on {
            let dep = dep.as_str();
            if !graph.contains_key(dep) {
                continue;
            }
            if on_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, graph, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    on_stack.remove(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
        plan.batches()
            .iter()
            .map(|b| b.iter().map(|s| s.id.as_str()).collect())
            .collect()
    }

    #[test]
    fn test_linear_chain() {
        let def = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("a", "x"))
            .with_stage(StageDefinition::new("b", "x").depends_on("a"))
            .with_stage(StageDefinition::new("c", "x").depends_on("b"));

        let plan = ExecutionPlan::compile(&def).unwrap();
        assert_eq!(ids(&plan), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond_levels() {
        let def = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("plan", "x"))
            .with_stage(StageDefinition::new("write", "x").depends_on("research"))
            .with_stage(StageDefinition::new("research", "x").depends_on("plan"))
            .with_stage(StageDefinition::new("illustrate", "x").depends_on("plan"))
            .with_stage(
                StageDefinition::new("format", "x")
                    .depends_on("write")
                    .depends_on("illustrate"),
            );

        let plan = ExecutionPlan::compile(&def).unwrap();
        assert_eq!(
            ids(&plan),
            vec![
                vec!["plan"],
                vec!["research", "illustrate"],
                vec!["write"],
                vec!["format"]
            ]
        );
        assert_eq!(plan.stage_count(), 5);
        assert_eq!(plan.batch_of("write"), Some(2));
    }

    #[test]
    fn test_independent_stages_share_batch() {
        let def = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("c", "x"))
            .with_stage(StageDefinition::new("a", "x"))
            .with_stage(StageDefinition::new("b", "x"));

        let plan = ExecutionPlan::compile(&def).unwrap();
        assert_eq!(ids(&plan), vec![vec!["c", "a", "b"]]);
    }

    #[test]
    fn test_every_dependency_in_earlier_batch() {
        let def = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("a", "x"))
            .with_stage(StageDefinition::new("b", "x").depends_on("a"))
            .with_stage(StageDefinition::new("c", "x").depends_on("a"))
            .with_stage(StageDefinition::new("d", "x").depends_on("b").depends_on("c"))
            .with_stage(StageDefinition::new("e", "x").depends_on("a").depends_on("d"));

        let plan = ExecutionPlan::compile(&def).unwrap();
        for (i, batch) in plan.batches().iter().enumerate() {
            for stage in batch {
                for dep in &stage.depends_on {
                    assert!(plan.batch_of(dep).unwrap() < i);
                }
            }
        }
    }

    #[test]
    fn test_cycle_reported_with_path() {
        let def = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("root", "x"))
            .with_stage(StageDefinition::new("a", "x").depends_on("root").depends_on("c"))
            .with_stage(StageDefinition::new("b", "x").depends_on("a"))
            .with_stage(StageDefinition::new("c", "x").depends_on("b"));

        let err = ExecutionPlan::compile(&def).unwrap_err();
        match err {
            ConfigError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                for id in ["a", "b", "c"] {
                    assert!(path.iter().any(|p| p == id));
                }
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_queue_concurrency_collected() {
        let mut def = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("a", "writer"))
            .with_stage(StageDefinition::new("b", "planner"));
        def.settings.parallel.insert("writer".into(), 4);

        let plan = ExecutionPlan::compile(&def).unwrap();
        assert_eq!(plan.queues().get("writer"), Some(&4));
        assert_eq!(plan.queues().get("default"), Some(&1));
    }

    #[test]
    fn test_describe_lists_batches() {
        let def = PipelineDefinition::new("p")
            .with_stage(StageDefinition::new("a", "x"))
            .with_stage(StageDefinition::new("b", "y").depends_on("a").optional().cached());

        let text = ExecutionPlan::compile(&def).unwrap().describe();
        assert!(text.contains("Batch 1:\n  - a (x)"));
        assert!(text.contains("Batch 2:\n  - b (y) [optional, cached] <- a"));
    }
}
