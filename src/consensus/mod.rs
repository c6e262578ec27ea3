//! Iterative, expertise-weighted consensus voting over competing proposals.
//!
//! Each round every eligible voter scores every live proposal; scores are
//! weighted by the voter's expertise for the decision's capability tag and
//! aggregated as a weighted mean. Convergence requires both a threshold and
//! a minimum margin over the runner-up, guarding against declaring victory
//! on a statistical tie.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::core::config::SwarmConfig;
use crate::core::errors::{Result, SwarmError};
use crate::registry::WorkerRegistry;

/// A point in processing where competing proposals require consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub id: String,
    /// Capability tag used to weight votes and select eligible voters.
    pub capability: String,
}

/// A proposal as produced inside a worker's task output, before the engine
/// stamps identity and provenance onto it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub decision_point: String,
    pub capability: String,
    pub content: Value,
    pub confidence: f64,
}

/// A candidate answer to a decision point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub decision_point: String,
    pub content: Value,
    /// The worker that produced it.
    pub worker_id: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    pub fn from_draft(draft: ProposalDraft, worker_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            decision_point: draft.decision_point,
            content: draft.content,
            worker_id: worker_id.into(),
            confidence: draft.confidence.clamp(0.0, 1.0),
            created_at: Utc::now(),
        }
    }
}

/// One worker's assessment of one proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub proposal_id: String,
    /// 0..=1.
    pub score: f64,
    pub reasoning: String,
}

/// Context handed to a voter alongside the proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteContext {
    pub decision_point: String,
    pub capability: String,
    pub round: u32,
    pub live_proposals: usize,
}

/// Feedback handed to the originating worker of a losing proposal between
/// rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementFeedback {
    pub decision_point: String,
    pub round: u32,
    /// The proposal currently leading, so refinement targets the actual
    /// selection rather than an arbitrary baseline.
    pub leader_id: String,
    pub leader_score: f64,
    /// The losing proposal's own aggregate this round.
    pub proposal_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub decision_point: String,
    pub winner: String,
    pub winning_content: Value,
    pub aggregate_score: f64,
    pub rounds: u32,
    pub participants: usize,
    pub converged: bool,
}

/// Weighted-mean aggregate per proposal, sorted best first.
///
/// Aggregation is commutative: vote order never affects the result. Ties on
/// aggregate break to the lowest proposal id, deterministically.
pub fn aggregate_scores(
    proposal_ids: &[String],
    votes: &[Vote],
    weights: &HashMap<String, f64>,
) -> Vec<(String, f64)> {
    let mut totals: HashMap<&str, (f64, f64)> = proposal_ids
        .iter()
        .map(|id| (id.as_str(), (0.0, 0.0)))
        .collect();
    for vote in votes {
        let Some((sum, weight_sum)) = totals.get_mut(vote.proposal_id.as_str()) else {
            continue;
        };
        let weight = weights.get(&vote.voter_id).copied().unwrap_or(0.0);
        *sum += vote.score.clamp(0.0, 1.0) * weight;
        *weight_sum += weight;
    }
    let mut out: Vec<(String, f64)> = proposal_ids
        .iter()
        .map(|id| {
            let (sum, weight_sum) = totals[id.as_str()];
            let aggregate = if weight_sum > 0.0 { sum / weight_sum } else { 0.0 };
            (id.clone(), aggregate)
        })
        .collect();
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    out
}

/// Runs expertise-weighted voting rounds until convergence or the iteration
/// limit.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    pub consensus_threshold: f64,
    pub min_margin: f64,
    pub iteration_limit: u32,
}

impl ConsensusEngine {
    pub fn new(consensus_threshold: f64, min_margin: f64, iteration_limit: u32) -> Self {
        Self {
            consensus_threshold,
            min_margin,
            iteration_limit,
        }
    }

    pub fn from_config(config: &SwarmConfig) -> Self {
        Self::new(
            config.consensus_threshold,
            config.min_margin,
            config.iteration_limit,
        )
    }

    /// Resolves a decision point.
    ///
    /// Non-convergence is not an error: after `iteration_limit` rounds the
    /// current leader is returned with `converged = false` and the caller
    /// decides whether a low-confidence result is acceptable.
    pub async fn resolve(
        &self,
        decision: &DecisionPoint,
        proposals: Vec<Proposal>,
        registry: &WorkerRegistry,
        voter_ids: &[String],
    ) -> Result<ConsensusResult> {
        let mut live: Vec<Proposal> = proposals
            .into_iter()
            .filter(|p| {
                let ours = p.decision_point == decision.id;
                if !ours {
                    warn!(
                        proposal_id = %p.id,
                        decision_point = %p.decision_point,
                        "Proposal for foreign decision point ignored"
                    );
                }
                ours
            })
            .collect();
        if live.is_empty() {
            return Err(SwarmError::NoProposals(decision.id.clone()));
        }

        // Voters must be capable of judging this decision type: positive
        // expertise for the decision's capability tag.
        let mut voters: Vec<(String, f64)> = voter_ids
            .iter()
            .filter_map(|id| {
                let weight = registry.expertise(id, &decision.capability);
                (weight > 0.0).then(|| (id.clone(), weight))
            })
            .collect();
        voters.sort_by(|a, b| a.0.cmp(&b.0));
        if voters.is_empty() {
            warn!(decision_point = %decision.id, "No eligible voters; returning best-effort leader");
        }
        let weights: HashMap<String, f64> = voters.iter().cloned().collect();

        let mut previous_leader_score = 0.0;
        let mut rounds = 0;
        loop {
            rounds += 1;
            let context = VoteContext {
                decision_point: decision.id.clone(),
                capability: decision.capability.clone(),
                round: rounds,
                live_proposals: live.len(),
            };

            // Every voter scores every live proposal. Collection order is
            // irrelevant: aggregation is commutative.
            let mut vote_futures = Vec::with_capacity(voters.len() * live.len());
            for (voter_id, _) in &voters {
                if let Some(worker) = registry.get(voter_id) {
                    for proposal in &live {
                        let worker = worker.clone();
                        let proposal = proposal.clone();
                        let context = context.clone();
                        vote_futures.push(async move {
                            worker.submit_vote(&proposal, &context).await
                        });
                    }
                }
            }
            let mut votes = Vec::with_capacity(vote_futures.len());
            for result in join_all(vote_futures).await {
                match result {
                    Ok(vote) => votes.push(vote),
                    Err(e) => warn!(error = %e, "Voter failed to submit a vote"),
                }
            }

            let proposal_ids: Vec<String> = live.iter().map(|p| p.id.clone()).collect();
            let ranked = aggregate_scores(&proposal_ids, &votes, &weights);
            let (leader_id, leader_score) = ranked[0].clone();
            let runner_up_score = ranked.get(1).map(|r| r.1).unwrap_or(0.0);
            let margin = leader_score - runner_up_score;

            debug!(
                decision_point = %decision.id,
                round = rounds,
                leader = %leader_id,
                leader_score,
                margin,
                improvement = leader_score - previous_leader_score,
                "Voting round complete"
            );

            let converged =
                leader_score > self.consensus_threshold && margin > self.min_margin;
            if converged || rounds >= self.iteration_limit {
                let winner = live
                    .iter()
                    .find(|p| p.id == leader_id)
                    .expect("leader is always a live proposal");
                info!(
                    decision_point = %decision.id,
                    winner = %winner.id,
                    aggregate = leader_score,
                    rounds,
                    converged,
                    "Consensus resolved"
                );
                return Ok(ConsensusResult {
                    decision_point: decision.id.clone(),
                    winner: winner.id.clone(),
                    winning_content: winner.content.clone(),
                    aggregate_score: leader_score,
                    rounds,
                    participants: voters.len(),
                    converged,
                });
            }

            // Proposal refinement: losing proposals go back to their
            // originating workers, who may submit revisions for the next
            // round. The leader rides unchanged.
            let score_by_id: HashMap<&str, f64> =
                ranked.iter().map(|(id, s)| (id.as_str(), *s)).collect();
            let mut next_round = Vec::with_capacity(live.len());
            for proposal in live {
                if proposal.id == leader_id {
                    next_round.push(proposal);
                    continue;
                }
                let feedback = RefinementFeedback {
                    decision_point: decision.id.clone(),
                    round: rounds,
                    leader_id: leader_id.clone(),
                    leader_score,
                    proposal_score: score_by_id.get(proposal.id.as_str()).copied().unwrap_or(0.0),
                };
                let refined = match registry.get(&proposal.worker_id) {
                    Some(worker) => worker
                        .refine_proposal(&proposal, &feedback)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(
                                worker_id = %proposal.worker_id,
                                error = %e,
                                "Refinement failed; keeping original proposal"
                            );
                            None
                        }),
                    None => None,
                };
                match refined {
                    Some(mut revised) => {
                        revised.decision_point = decision.id.clone();
                        debug!(
                            worker_id = %revised.worker_id,
                            old = %proposal.id,
                            new = %revised.id,
                            "Proposal refined for next round"
                        );
                        next_round.push(revised);
                    }
                    None => next_round.push(proposal),
                }
            }
            live = next_round;
            previous_leader_score = leader_score;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vote(voter: &str, proposal: &str, score: f64) -> Vote {
        Vote {
            voter_id: voter.into(),
            proposal_id: proposal.into(),
            score,
            reasoning: String::new(),
        }
    }

    #[test]
    fn aggregate_is_a_weighted_mean() {
        let ids = vec!["p1".to_string(), "p2".to_string()];
        let votes = vec![
            vote("expert", "p1", 1.0),
            vote("novice", "p1", 0.0),
            vote("expert", "p2", 0.5),
            vote("novice", "p2", 0.5),
        ];
        let weights = HashMap::from([("expert".to_string(), 0.9), ("novice".to_string(), 0.1)]);
        let ranked = aggregate_scores(&ids, &votes, &weights);
        assert_eq!(ranked[0].0, "p1");
        assert!((ranked[0].1 - 0.9).abs() < 1e-9);
        assert!((ranked[1].1 - 0.5).abs() < 1e-9);
    }

    #[test]
    fn aggregate_is_commutative() {
        let ids = vec!["p1".to_string(), "p2".to_string()];
        let weights = HashMap::from([("a".to_string(), 0.6), ("b".to_string(), 0.4)]);
        let forward = vec![
            vote("a", "p1", 0.8),
            vote("b", "p1", 0.2),
            vote("a", "p2", 0.4),
            vote("b", "p2", 0.9),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(
            aggregate_scores(&ids, &forward, &weights),
            aggregate_scores(&ids, &reversed, &weights)
        );
    }

    #[test]
    fn exact_tie_breaks_to_lowest_proposal_id() {
        let ids = vec!["p2".to_string(), "p1".to_string()];
        let votes = vec![vote("a", "p1", 0.6), vote("a", "p2", 0.6)];
        let weights = HashMap::from([("a".to_string(), 1.0)]);
        let ranked = aggregate_scores(&ids, &votes, &weights);
        assert_eq!(ranked[0].0, "p1");
    }

    #[test]
    fn votes_for_unknown_proposals_are_ignored() {
        let ids = vec!["p1".to_string()];
        let votes = vec![vote("a", "p1", 0.5), vote("a", "ghost", 1.0)];
        let weights = HashMap::from([("a".to_string(), 1.0)]);
        let ranked = aggregate_scores(&ids, &votes, &weights);
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].1 - 0.5).abs() < 1e-9);
    }

    #[test]
    fn draft_promotion_clamps_confidence() {
        let proposal = Proposal::from_draft(
            ProposalDraft {
                decision_point: "d1".into(),
                capability: "vision".into(),
                content: json!({"answer": 42}),
                confidence: 1.7,
            },
            "w1",
        );
        assert_eq!(proposal.confidence, 1.0);
        assert_eq!(proposal.worker_id, "w1");
        assert_eq!(proposal.decision_point, "d1");
    }
}
