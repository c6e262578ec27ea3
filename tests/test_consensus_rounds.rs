use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use swarmflow::consensus::VoteContext;
use swarmflow::{
    ConsensusEngine, DecisionPoint, Proposal, ProposalDraft, Subproblem, TaskOutput, Vote,
    Worker, WorkerRegistry,
};

/// Scores each proposal by name from a per-round table. Rounds past the end
/// of a table repeat its last entry.
struct ScriptedVoter {
    id: String,
    scores: HashMap<String, Vec<f64>>,
}

#[async_trait]
impl Worker for ScriptedVoter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn capabilities(&self) -> HashSet<String> {
        HashSet::from(["judgment".to_string()])
    }

    async fn execute_task(
        &self,
        _subproblem: &Subproblem,
        _deadline: Duration,
    ) -> anyhow::Result<TaskOutput> {
        Ok(TaskOutput::ok(json!({})))
    }

    async fn submit_vote(
        &self,
        proposal: &Proposal,
        context: &VoteContext,
    ) -> anyhow::Result<Vote> {
        let name = proposal
            .content
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let score = self
            .scores
            .get(name)
            .map(|rounds| {
                let idx = (context.round as usize - 1).min(rounds.len() - 1);
                rounds[idx]
            })
            .unwrap_or(0.0);
        Ok(Vote {
            voter_id: self.id.clone(),
            proposal_id: proposal.id.clone(),
            score,
            reasoning: format!("round {}", context.round),
        })
    }
}

fn registry_with_voters(tables: &[(&str, &[(&str, &[f64])])]) -> Arc<WorkerRegistry> {
    let registry = Arc::new(WorkerRegistry::new());
    for (id, table) in tables {
        let scores = table
            .iter()
            .map(|(name, rounds)| (name.to_string(), rounds.to_vec()))
            .collect();
        registry
            .register(
                Arc::new(ScriptedVoter {
                    id: id.to_string(),
                    scores,
                }),
                HashMap::from([("judgment".to_string(), 1.0)]),
            )
            .unwrap();
    }
    registry
}

fn proposal(name: &str, worker: &str) -> Proposal {
    Proposal::from_draft(
        ProposalDraft {
            decision_point: "d1".into(),
            capability: "judgment".into(),
            content: json!({"name": name}),
            confidence: 0.8,
        },
        worker,
    )
}

fn decision() -> DecisionPoint {
    DecisionPoint {
        id: "d1".into(),
        capability: "judgment".into(),
    }
}

#[tokio::test]
async fn clear_leader_converges_in_one_round() {
    // Aggregates come out 0.85 / 0.40 / 0.30: above threshold, wide margin.
    let table: &[(&str, &[f64])] = &[("p1", &[0.85]), ("p2", &[0.40]), ("p3", &[0.30])];
    let registry = registry_with_voters(&[("v1", table), ("v2", table)]);
    let proposals = vec![
        proposal("p1", "v1"),
        proposal("p2", "v2"),
        proposal("p3", "v2"),
    ];

    let engine = ConsensusEngine::new(0.7, 0.05, 5);
    let result = engine
        .resolve(&decision(), proposals, &registry, &registry.ids())
        .await
        .unwrap();

    assert!(result.converged);
    assert_eq!(result.rounds, 1);
    assert_eq!(result.winning_content, json!({"name": "p1"}));
    assert!((result.aggregate_score - 0.85).abs() < 1e-9);
    assert_eq!(result.participants, 2);
}

#[tokio::test]
async fn narrow_margin_forces_another_round() {
    // Round 1: 0.72 vs 0.70. The leader clears the threshold but the 0.02
    // margin is below the 0.05 minimum, so voting continues.
    let table: &[(&str, &[f64])] = &[("p1", &[0.72, 0.90]), ("p2", &[0.70, 0.30])];
    let registry = registry_with_voters(&[("v1", table), ("v2", table)]);
    let proposals = vec![proposal("p1", "v1"), proposal("p2", "v2")];

    let engine = ConsensusEngine::new(0.7, 0.05, 5);
    let result = engine
        .resolve(&decision(), proposals, &registry, &registry.ids())
        .await
        .unwrap();

    assert!(result.converged);
    assert_eq!(result.rounds, 2);
    assert_eq!(result.winning_content, json!({"name": "p1"}));
}

#[tokio::test]
async fn iteration_limit_returns_best_effort_leader() {
    // A statistical dead heat never converges; after the limit the current
    // leader comes back flagged unconverged.
    let table: &[(&str, &[f64])] = &[("p1", &[0.55]), ("p2", &[0.54])];
    let registry = registry_with_voters(&[("v1", table), ("v2", table)]);
    let proposals = vec![proposal("p1", "v1"), proposal("p2", "v2")];

    let engine = ConsensusEngine::new(0.7, 0.05, 3);
    let result = engine
        .resolve(&decision(), proposals, &registry, &registry.ids())
        .await
        .unwrap();

    assert!(!result.converged);
    assert_eq!(result.rounds, 3);
    assert_eq!(result.winning_content, json!({"name": "p1"}));
}

#[tokio::test]
async fn expertise_weights_decide_between_disagreeing_voters() {
    let expert_table: &[(&str, &[f64])] = &[("p1", &[0.9]), ("p2", &[0.2])];
    let novice_table: &[(&str, &[f64])] = &[("p1", &[0.1]), ("p2", &[0.95])];

    let registry = Arc::new(WorkerRegistry::new());
    registry
        .register(
            Arc::new(ScriptedVoter {
                id: "expert".into(),
                scores: expert_table
                    .iter()
                    .map(|(n, r)| (n.to_string(), r.to_vec()))
                    .collect(),
            }),
            HashMap::from([("judgment".to_string(), 0.9)]),
        )
        .unwrap();
    registry
        .register(
            Arc::new(ScriptedVoter {
                id: "novice".into(),
                scores: novice_table
                    .iter()
                    .map(|(n, r)| (n.to_string(), r.to_vec()))
                    .collect(),
            }),
            HashMap::from([("judgment".to_string(), 0.1)]),
        )
        .unwrap();

    let proposals = vec![proposal("p1", "expert"), proposal("p2", "novice")];
    let engine = ConsensusEngine::new(0.7, 0.05, 5);
    let result = engine
        .resolve(&decision(), proposals, &registry, &registry.ids())
        .await
        .unwrap();

    // Weighted means: p1 = 0.82, p2 = 0.275. The expert's view prevails.
    assert!(result.converged);
    assert_eq!(result.winning_content, json!({"name": "p1"}));
    assert!((result.aggregate_score - 0.82).abs() < 1e-9);
}

#[tokio::test]
async fn no_proposals_is_an_error() {
    let registry = registry_with_voters(&[]);
    let engine = ConsensusEngine::new(0.7, 0.05, 5);
    let err = engine
        .resolve(&decision(), vec![], &registry, &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        swarmflow::SwarmError::NoProposals(ref d) if d == "d1"
    ));
}
