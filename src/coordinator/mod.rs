//! The coordinator: owns a run end to end. Decomposes the task, executes
//! the DAG, merges knowledge contributions, resolves decision points by
//! consensus, detects emergent patterns, and applies expertise feedback.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::consensus::{ConsensusEngine, ConsensusResult, DecisionPoint, Proposal};
use crate::core::config::SwarmConfig;
use crate::core::errors::Result;
use crate::decompose::{Decomposer, DecompositionStrategy, SubproblemStatus, Task};
use crate::emergence::{EmergenceDetector, Pattern, WorkerOutputs};
use crate::knowledge::{Conflict, KnowledgeStore, KnowledgeUpdate};
use crate::registry::WorkerRegistry;
use crate::scheduler::{cancel_channel, CancelToken, Scheduler, SubproblemOutcome};

/// Expertise delta applied per required tag after a run.
const EXPERTISE_FEEDBACK: f64 = 0.02;

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub task_id: String,
    /// Subproblem ids that succeeded / failed, sorted.
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Per-subproblem terminal outcomes, keyed by subproblem id.
    pub outcomes: HashMap<String, SubproblemOutcome>,
    /// One resolution per decision point that received proposals.
    pub consensus: Vec<ConsensusResult>,
    /// Emergent cross-worker patterns, strongest first.
    pub patterns: Vec<Pattern>,
    /// Knowledge conflicts resolved while merging worker contributions.
    pub conflicts: Vec<Conflict>,
    pub elapsed_ms: u64,
}

/// Orchestrates swarm runs over a shared registry and knowledge store.
///
/// The knowledge store outlives individual runs: contributions accumulate
/// across tasks unless the caller swaps in a fresh store.
pub struct Coordinator {
    registry: Arc<WorkerRegistry>,
    knowledge: Arc<KnowledgeStore>,
    config: SwarmConfig,
    decomposer: Decomposer,
    scheduler: Scheduler,
}

impl Coordinator {
    pub fn new(config: SwarmConfig, registry: Arc<WorkerRegistry>) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(config.clone());
        Ok(Self {
            registry,
            knowledge: Arc::new(KnowledgeStore::new()),
            config,
            decomposer: Decomposer::new(),
            scheduler,
        })
    }

    /// Replaces the knowledge store, e.g. to share one across coordinators
    /// or to start from accumulated context.
    pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeStore>) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn knowledge(&self) -> Arc<KnowledgeStore> {
        self.knowledge.clone()
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.registry.clone()
    }

    /// Runs a task to completion with no external cancellation.
    pub async fn run(
        &self,
        task: &Task,
        strategy: &dyn DecompositionStrategy,
    ) -> Result<RunResult> {
        let (_handle, token) = cancel_channel();
        self.run_with_cancel(task, strategy, token).await
    }

    /// Runs a task to completion. Tripping the cancel token fails queued
    /// subproblems immediately; in-flight work drains within its timeout,
    /// and the run returns `SwarmError::RunCancelled`.
    pub async fn run_with_cancel(
        &self,
        task: &Task,
        strategy: &dyn DecompositionStrategy,
        cancel: CancelToken,
    ) -> Result<RunResult> {
        let started = Instant::now();
        let run_id = cuid2::create_id();
        info!(run_id = %run_id, task_id = %task.id, "Run started");

        let mut dag = self.decomposer.decompose(task, strategy)?;
        let (outcomes, interruption) = self
            .scheduler
            .execute(&mut dag, &self.registry, cancel)
            .await;

        // Merge knowledge from whatever completed, interrupted or not, so
        // partial progress survives in the shared store.
        let conflicts = self.merge_knowledge(&outcomes);
        self.apply_expertise_feedback(&dag, &outcomes);

        if let Some(interruption) = interruption {
            warn!(run_id = %run_id, reason = ?interruption, "Run interrupted");
            return Err(interruption.into());
        }

        let consensus = self.resolve_decision_points(&outcomes).await?;
        let patterns = self.detect_patterns(&outcomes);

        let mut succeeded: Vec<String> = outcomes
            .values()
            .filter(|o| o.status == SubproblemStatus::Succeeded)
            .map(|o| o.subproblem_id.clone())
            .collect();
        succeeded.sort();
        let mut failed: Vec<String> = outcomes
            .values()
            .filter(|o| o.status == SubproblemStatus::Failed)
            .map(|o| o.subproblem_id.clone())
            .collect();
        failed.sort();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            succeeded = succeeded.len(),
            failed = failed.len(),
            decision_points = consensus.len(),
            patterns = patterns.len(),
            elapsed_ms,
            "Run complete"
        );
        Ok(RunResult {
            run_id,
            task_id: task.id.clone(),
            succeeded,
            failed,
            outcomes,
            consensus,
            patterns,
            conflicts,
            elapsed_ms,
        })
    }

    fn merge_knowledge(&self, outcomes: &HashMap<String, SubproblemOutcome>) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        // Sorted iteration keeps conflict resolution reproducible when two
        // outputs assert the same node id.
        let mut ids: Vec<&String> = outcomes.keys().collect();
        ids.sort();
        for id in ids {
            let outcome = &outcomes[id];
            let (Some(worker_id), Some(output)) = (&outcome.worker_id, &outcome.output) else {
                continue;
            };
            if output.knowledge_nodes.is_empty() && output.knowledge_edges.is_empty() {
                continue;
            }
            let mut update = KnowledgeUpdate::new(worker_id.clone());
            update.nodes = output.knowledge_nodes.clone();
            update.edges = output.knowledge_edges.clone();
            let report = self.knowledge.merge(update);
            for (edge_id, reason) in &report.rejected_edges {
                warn!(edge_id = %edge_id, reason = %reason, "Knowledge edge rejected");
            }
            conflicts.extend(report.conflicts);
        }
        conflicts
    }

    async fn resolve_decision_points(
        &self,
        outcomes: &HashMap<String, SubproblemOutcome>,
    ) -> Result<Vec<ConsensusResult>> {
        // Group proposals by decision point, stamping worker provenance.
        let mut grouped: HashMap<String, (String, Vec<Proposal>)> = HashMap::new();
        for outcome in outcomes.values() {
            let (Some(worker_id), Some(output)) = (&outcome.worker_id, &outcome.output) else {
                continue;
            };
            let Some(draft) = &output.proposal else {
                continue;
            };
            let entry = grouped
                .entry(draft.decision_point.clone())
                .or_insert_with(|| (draft.capability.clone(), Vec::new()));
            entry
                .1
                .push(Proposal::from_draft(draft.clone(), worker_id.clone()));
        }

        let engine = ConsensusEngine::from_config(&self.config);
        let mut decision_ids: Vec<String> = grouped.keys().cloned().collect();
        decision_ids.sort();

        let mut results = Vec::with_capacity(decision_ids.len());
        for decision_id in decision_ids {
            let (capability, proposals) = grouped.remove(&decision_id).unwrap();
            let decision = DecisionPoint {
                id: decision_id,
                capability: capability.clone(),
            };
            let voters = self.registry.workers_with_capability(&capability);
            results.push(
                engine
                    .resolve(&decision, proposals, &self.registry, &voters)
                    .await?,
            );
        }
        Ok(results)
    }

    fn detect_patterns(&self, outcomes: &HashMap<String, SubproblemOutcome>) -> Vec<Pattern> {
        let mut worker_outputs = WorkerOutputs::new();
        for outcome in outcomes.values() {
            let (Some(worker_id), Some(output)) = (&outcome.worker_id, &outcome.output) else {
                continue;
            };
            worker_outputs
                .entry(worker_id.clone())
                .or_default()
                .extend(output.elements.iter().cloned());
        }
        EmergenceDetector::from_config(&self.config).detect(&self.knowledge, &worker_outputs)
    }

    /// Nudges expertise after the run: up for each required tag of a
    /// succeeded subproblem, down for a failed one that was dispatched.
    fn apply_expertise_feedback(
        &self,
        dag: &crate::decompose::SubproblemDag,
        outcomes: &HashMap<String, SubproblemOutcome>,
    ) {
        for outcome in outcomes.values() {
            let Some(worker_id) = &outcome.worker_id else {
                continue;
            };
            let Some(subproblem) = dag.get(&outcome.subproblem_id) else {
                continue;
            };
            let delta = match outcome.status {
                SubproblemStatus::Succeeded => EXPERTISE_FEEDBACK,
                SubproblemStatus::Failed => -EXPERTISE_FEEDBACK,
                _ => continue,
            };
            for tag in &subproblem.required_capabilities {
                if let Err(e) = self.registry.adjust_expertise(worker_id, tag, delta) {
                    warn!(worker_id = %worker_id, tag = %tag, error = %e, "Expertise feedback skipped");
                }
            }
        }
    }
}
