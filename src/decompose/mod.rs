//! Problem decomposition: splitting a task into a dependency-aware graph of
//! subproblems using a pluggable strategy.

pub mod strategies;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::core::errors::{Result, SwarmError};

pub use strategies::{DataFlowStrategy, FunctionalStrategy, HierarchicalStrategy};

/// Tolerance used when checking complexity conservation.
const COMPLEXITY_EPSILON: f64 = 1e-6;

/// The root unit of work submitted by a caller. Immutable for the duration
/// of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// The stated scope of the task. Every subproblem description must
    /// carry it, so no part of the scope can be silently truncated.
    pub description: String,
    /// Opaque payload handed through to workers.
    pub payload: Value,
    /// Optional constraints. The `required_capabilities` key (comma
    /// separated) seeds the capability tags of generated subproblems.
    pub constraints: HashMap<String, String>,
    /// Human-readable description of the success criteria predicate.
    pub success_criteria: Option<String>,
    /// Overall complexity estimate, 0..=1.
    pub complexity: f64,
}

impl Task {
    pub fn new(description: impl Into<String>, payload: Value) -> Self {
        Self {
            id: cuid2::create_id(),
            description: description.into(),
            payload,
            constraints: HashMap::new(),
            success_criteria: None,
            complexity: 1.0,
        }
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity.clamp(0.0, 1.0);
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }

    /// Capability tags requested through the `required_capabilities`
    /// constraint, if any.
    pub fn required_capabilities(&self) -> Vec<String> {
        self.constraints
            .get("required_capabilities")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Lifecycle of a subproblem. Only the scheduler transitions status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubproblemStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SubproblemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubproblemStatus::Succeeded | SubproblemStatus::Failed)
    }
}

/// A node in the decomposition DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subproblem {
    pub id: String,
    pub task_id: String,
    pub description: String,
    /// Capability tags a worker must overlap with to be dispatched this
    /// subproblem.
    pub required_capabilities: Vec<String>,
    /// Complexity score, 0..=1.
    pub complexity: f64,
    /// Ordinal priority; lower values dispatch first among ready peers.
    pub priority: u32,
    /// Subproblem ids that must succeed before this one becomes ready.
    pub dependencies: Vec<String>,
    pub status: SubproblemStatus,
}

/// A strategy for splitting a task into subproblems.
///
/// Implementations only produce the raw subproblem list; structural
/// validation (acyclicity, complexity conservation, scope coverage) is the
/// decomposer's job.
pub trait DecompositionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn decompose(&self, task: &Task) -> Result<Vec<Subproblem>>;
}

/// A validated decomposition: the subproblems plus their dependency graph.
#[derive(Debug)]
pub struct SubproblemDag {
    pub task_id: String,
    subproblems: HashMap<String, Subproblem>,
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl SubproblemDag {
    pub fn len(&self) -> usize {
        self.subproblems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subproblems.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Subproblem> {
        self.subproblems.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Subproblem> {
        self.subproblems.get_mut(id)
    }

    pub fn subproblems(&self) -> impl Iterator<Item = &Subproblem> {
        self.subproblems.values()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subproblems.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Subproblems with no dependencies.
    pub fn roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .subproblems
            .values()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.id.clone())
            .collect();
        roots.sort();
        roots
    }

    /// Direct dependents of the given subproblem.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let Some(&idx) = self.indices.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        deps.sort();
        deps
    }

    /// A topological order over all subproblems.
    pub fn topo_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.subproblems.len());
        let mut topo = Topo::new(&self.graph);
        while let Some(idx) = topo.next(&self.graph) {
            order.push(self.graph[idx].clone());
        }
        order
    }
}

/// Builds and validates decomposition DAGs.
#[derive(Debug, Default)]
pub struct Decomposer;

impl Decomposer {
    pub fn new() -> Self {
        Self
    }

    /// Decomposes a task with the given strategy and validates the result.
    ///
    /// Fails fast with `SwarmError::Decomposition` on an empty or malformed
    /// task, producing zero subproblems; the caller must not schedule in
    /// that case.
    pub fn decompose(
        &self,
        task: &Task,
        strategy: &dyn DecompositionStrategy,
    ) -> Result<SubproblemDag> {
        if task.description.trim().is_empty() {
            return Err(SwarmError::Decomposition(
                "task description is empty".into(),
            ));
        }
        if task.payload.is_null() {
            return Err(SwarmError::Decomposition("task payload is empty".into()));
        }
        if !(0.0..=1.0).contains(&task.complexity) {
            return Err(SwarmError::Decomposition(format!(
                "task complexity {} out of range",
                task.complexity
            )));
        }

        let subproblems = strategy.decompose(task)?;
        if subproblems.is_empty() {
            return Err(SwarmError::EmptyDag);
        }

        debug!(
            strategy = strategy.name(),
            task_id = %task.id,
            count = subproblems.len(),
            "Strategy produced subproblems"
        );

        Self::validate(task, &subproblems)?;
        let dag = Self::build_graph(task, subproblems)?;

        info!(
            task_id = %task.id,
            strategy = strategy.name(),
            subproblems = dag.len(),
            roots = dag.roots().len(),
            "Decomposition complete"
        );
        Ok(dag)
    }

    fn validate(task: &Task, subproblems: &[Subproblem]) -> Result<()> {
        let mut seen = HashSet::new();
        for sub in subproblems {
            if !seen.insert(sub.id.clone()) {
                return Err(SwarmError::Decomposition(format!(
                    "duplicate subproblem id: {}",
                    sub.id
                )));
            }
            if sub.task_id != task.id {
                return Err(SwarmError::Decomposition(format!(
                    "subproblem {} does not belong to task {}",
                    sub.id, task.id
                )));
            }
            // Scope coverage: every description carries the task scope, so
            // the union of descriptions cannot silently truncate it.
            if !sub.description.contains(task.description.trim()) {
                return Err(SwarmError::Decomposition(format!(
                    "subproblem {} drops the task scope from its description",
                    sub.id
                )));
            }
            if !(0.0..=1.0).contains(&sub.complexity) {
                return Err(SwarmError::Decomposition(format!(
                    "subproblem {} complexity {} out of range",
                    sub.id, sub.complexity
                )));
            }
        }
        for sub in subproblems {
            for dep in &sub.dependencies {
                if !seen.contains(dep) {
                    return Err(SwarmError::Decomposition(format!(
                        "subproblem {} depends on unknown subproblem {}",
                        sub.id, dep
                    )));
                }
            }
        }

        let total: f64 = subproblems.iter().map(|s| s.complexity).sum();
        if total > task.complexity + COMPLEXITY_EPSILON {
            return Err(SwarmError::Decomposition(format!(
                "subproblem complexity sum {:.6} exceeds task complexity {:.6}",
                total, task.complexity
            )));
        }
        Ok(())
    }

    fn build_graph(task: &Task, subproblems: Vec<Subproblem>) -> Result<SubproblemDag> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for sub in &subproblems {
            let idx = graph.add_node(sub.id.clone());
            indices.insert(sub.id.clone(), idx);
        }
        for sub in &subproblems {
            for dep in &sub.dependencies {
                // Edge direction: dependency -> dependent.
                graph.add_edge(indices[dep], indices[&sub.id], ());
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(SwarmError::CycleDetected);
        }
        Ok(SubproblemDag {
            task_id: task.id.clone(),
            subproblems: subproblems.into_iter().map(|s| (s.id.clone(), s)).collect(),
            graph,
            indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new("analyze session recordings", json!({"videos": 3}))
            .with_complexity(0.9)
            .with_constraint("required_capabilities", "vision, audio")
    }

    #[test]
    fn empty_payload_fails_fast() {
        let strategy = FunctionalStrategy::standard_pipeline();
        let bad = Task::new("scope", Value::Null);
        let err = Decomposer::new().decompose(&bad, &strategy).unwrap_err();
        assert!(matches!(err, SwarmError::Decomposition(_)));
    }

    #[test]
    fn empty_description_fails_fast() {
        let strategy = FunctionalStrategy::standard_pipeline();
        let bad = Task::new("   ", json!({}));
        assert!(Decomposer::new().decompose(&bad, &strategy).is_err());
    }

    #[test]
    fn cycle_is_rejected() {
        struct Cyclic;
        impl DecompositionStrategy for Cyclic {
            fn name(&self) -> &str {
                "cyclic"
            }
            fn decompose(&self, task: &Task) -> Result<Vec<Subproblem>> {
                let mk = |id: &str, dep: &str| Subproblem {
                    id: id.into(),
                    task_id: task.id.clone(),
                    description: task.description.clone(),
                    required_capabilities: vec![],
                    complexity: 0.1,
                    priority: 0,
                    dependencies: vec![dep.into()],
                    status: SubproblemStatus::Pending,
                };
                Ok(vec![mk("a", "b"), mk("b", "a")])
            }
        }
        let err = Decomposer::new().decompose(&task(), &Cyclic).unwrap_err();
        assert!(matches!(err, SwarmError::CycleDetected));
    }

    #[test]
    fn complexity_overflow_is_rejected() {
        struct TooHeavy;
        impl DecompositionStrategy for TooHeavy {
            fn name(&self) -> &str {
                "too_heavy"
            }
            fn decompose(&self, task: &Task) -> Result<Vec<Subproblem>> {
                Ok(vec![Subproblem {
                    id: "only".into(),
                    task_id: task.id.clone(),
                    description: task.description.clone(),
                    required_capabilities: vec![],
                    complexity: 1.0,
                    priority: 0,
                    dependencies: vec![],
                    status: SubproblemStatus::Pending,
                }])
            }
        }
        let heavy = task().with_complexity(0.5);
        assert!(Decomposer::new().decompose(&heavy, &TooHeavy).is_err());
    }

    #[test]
    fn dependents_and_roots_are_consistent() {
        let strategy = FunctionalStrategy::new(vec![
            "ingestion".into(),
            "extraction".into(),
            "analysis".into(),
        ]);
        let dag = Decomposer::new().decompose(&task(), &strategy).unwrap();
        assert_eq!(dag.len(), 3);
        let roots = dag.roots();
        assert_eq!(roots.len(), 1);
        let dependents = dag.dependents_of(&roots[0]);
        assert_eq!(dependents.len(), 1);
        assert_eq!(dag.topo_order().len(), 3);
    }
}
