//! Worker registry: capability-tagged workers, their expertise weights, and
//! their in-flight load counters.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::consensus::{Proposal, ProposalDraft, RefinementFeedback, Vote, VoteContext};
use crate::core::errors::{Result, SwarmError};
use crate::decompose::Subproblem;
use crate::knowledge::{EdgeAssertion, NodeAssertion};

/// Expertise assumed for a declared capability with no explicit weight.
const DEFAULT_EXPERTISE: f64 = 0.5;

/// What a worker hands back from `execute_task`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskOutput {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Normalized elements this worker discovered, fed to the emergence
    /// detector.
    pub elements: Vec<String>,
    /// An optional candidate answer for a decision point.
    pub proposal: Option<ProposalDraft>,
    /// Knowledge assertions to merge into the shared store.
    pub knowledge_nodes: Vec<NodeAssertion>,
    pub knowledge_edges: Vec<EdgeAssertion>,
}

impl TaskOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_elements<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.elements = elements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_proposal(mut self, draft: ProposalDraft) -> Self {
        self.proposal = Some(draft);
        self
    }

    pub fn with_knowledge_node(
        mut self,
        id: impl Into<String>,
        content: Value,
        confidence: f64,
    ) -> Self {
        self.knowledge_nodes.push(NodeAssertion {
            id: id.into(),
            content,
            confidence: confidence.clamp(0.0, 1.0),
        });
        self
    }
}

/// The interface every external agent implementation must satisfy. This
/// crate is agnostic to how `execute_task` computes its result.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> String;

    /// Capability tags this worker claims.
    fn capabilities(&self) -> HashSet<String>;

    /// Executes one subproblem. The deadline is advisory; the scheduler
    /// enforces it regardless.
    async fn execute_task(
        &self,
        subproblem: &Subproblem,
        deadline: Duration,
    ) -> anyhow::Result<TaskOutput>;

    /// Casts a vote on one proposal during a consensus round.
    async fn submit_vote(&self, proposal: &Proposal, context: &VoteContext)
        -> anyhow::Result<Vote>;

    /// Offered a losing proposal of its own plus feedback, the worker may
    /// submit a revised proposal for the next round. The default declines.
    async fn refine_proposal(
        &self,
        _proposal: &Proposal,
        _feedback: &RefinementFeedback,
    ) -> anyhow::Result<Option<Proposal>> {
        Ok(None)
    }
}

/// Registry-held view of a worker: declared tags, per-tag expertise, and
/// the in-flight load counter the matcher uses as a tie-breaker.
#[derive(Debug)]
pub struct WorkerProfile {
    pub id: String,
    pub capabilities: HashSet<String>,
    expertise: DashMap<String, f64>,
    load: AtomicUsize,
}

impl WorkerProfile {
    /// Expertise weight for a tag. Declared capabilities with no explicit
    /// weight default to 0.5; undeclared tags score zero.
    pub fn expertise(&self, tag: &str) -> f64 {
        if let Some(weight) = self.expertise.get(tag) {
            return *weight;
        }
        if self.capabilities.contains(tag) {
            DEFAULT_EXPERTISE
        } else {
            0.0
        }
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }
}

/// Tracks available workers. Registration happens before a run; expertise
/// weights are only adjusted by the coordinator's post-run feedback, never
/// by a worker itself.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<dyn Worker>>,
    profiles: DashMap<String, Arc<WorkerProfile>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker with explicit expertise weights (clamped to
    /// [0, 1]). Capability tags are taken from the worker itself.
    pub fn register(
        &self,
        worker: Arc<dyn Worker>,
        expertise: HashMap<String, f64>,
    ) -> Result<()> {
        let id = worker.id();
        if self.workers.contains_key(&id) {
            return Err(SwarmError::WorkerAlreadyRegistered(id));
        }
        let capabilities = worker.capabilities();
        let weights = DashMap::new();
        for (tag, weight) in expertise {
            weights.insert(tag, weight.clamp(0.0, 1.0));
        }
        debug!(worker_id = %id, capabilities = capabilities.len(), "Worker registered");
        self.profiles.insert(
            id.clone(),
            Arc::new(WorkerProfile {
                id: id.clone(),
                capabilities,
                expertise: weights,
                load: AtomicUsize::new(0),
            }),
        );
        self.workers.insert(id, worker);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(id).map(|w| w.clone())
    }

    pub fn profile(&self, id: &str) -> Option<Arc<WorkerProfile>> {
        self.profiles.get(id).map(|p| p.clone())
    }

    /// Expertise weight of a worker for a tag; zero for unknown workers.
    pub fn expertise(&self, id: &str, tag: &str) -> f64 {
        self.profile(id).map(|p| p.expertise(tag)).unwrap_or(0.0)
    }

    /// Incremented atomically around dispatch so the matcher's load
    /// tie-break stays accurate under concurrency.
    pub fn begin_dispatch(&self, id: &str) {
        if let Some(profile) = self.profiles.get(id) {
            profile.load.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn end_dispatch(&self, id: &str) {
        if let Some(profile) = self.profiles.get(id) {
            profile.load.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Post-run expertise feedback. Applied by the coordinator only;
    /// clamped to [0, 1].
    pub fn adjust_expertise(&self, id: &str, tag: &str, delta: f64) -> Result<()> {
        let profile = self
            .profiles
            .get(id)
            .ok_or_else(|| SwarmError::WorkerNotFound(id.to_string()))?;
        let mut entry = profile
            .expertise
            .entry(tag.to_string())
            .or_insert(DEFAULT_EXPERTISE);
        *entry = (*entry + delta).clamp(0.0, 1.0);
        Ok(())
    }

    /// Workers declaring the given capability, sorted by id.
    pub fn workers_with_capability(&self, tag: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .profiles
            .iter()
            .filter(|p| p.capabilities.contains(tag))
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.iter().map(|p| p.id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubWorker {
        id: String,
        tags: Vec<String>,
    }

    #[async_trait]
    impl Worker for StubWorker {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn capabilities(&self) -> HashSet<String> {
            self.tags.iter().cloned().collect()
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
            _context: &VoteContext,
        ) -> anyhow::Result<Vote> {
            Ok(Vote {
                voter_id: self.id.clone(),
                proposal_id: proposal.id.clone(),
                score: 0.5,
                reasoning: String::new(),
            })
        }
    }

    fn registry_with(ids: &[&str]) -> WorkerRegistry {
        let registry = WorkerRegistry::new();
        for id in ids {
            registry
                .register(
                    Arc::new(StubWorker {
                        id: id.to_string(),
                        tags: vec!["vision".into()],
                    }),
                    HashMap::from([("vision".to_string(), 0.8)]),
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = registry_with(&["w1"]);
        let err = registry
            .register(
                Arc::new(StubWorker {
                    id: "w1".into(),
                    tags: vec![],
                }),
                HashMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SwarmError::WorkerAlreadyRegistered(_)));
    }

    #[test]
    fn expertise_defaults_and_lookups() {
        let registry = registry_with(&["w1"]);
        assert_eq!(registry.expertise("w1", "vision"), 0.8);
        // Declared tag without explicit weight defaults to 0.5.
        let registry2 = WorkerRegistry::new();
        registry2
            .register(
                Arc::new(StubWorker {
                    id: "w2".into(),
                    tags: vec!["audio".into()],
                }),
                HashMap::new(),
            )
            .unwrap();
        assert_eq!(registry2.expertise("w2", "audio"), DEFAULT_EXPERTISE);
        assert_eq!(registry2.expertise("w2", "vision"), 0.0);
        assert_eq!(registry2.expertise("ghost", "audio"), 0.0);
    }

    #[test]
    fn load_counters_track_dispatch() {
        let registry = registry_with(&["w1"]);
        let profile = registry.profile("w1").unwrap();
        assert_eq!(profile.load(), 0);
        registry.begin_dispatch("w1");
        registry.begin_dispatch("w1");
        assert_eq!(profile.load(), 2);
        registry.end_dispatch("w1");
        assert_eq!(profile.load(), 1);
    }

    #[test]
    fn expertise_feedback_is_clamped() {
        let registry = registry_with(&["w1"]);
        registry.adjust_expertise("w1", "vision", 0.5).unwrap();
        assert_eq!(registry.expertise("w1", "vision"), 1.0);
        registry.adjust_expertise("w1", "vision", -2.0).unwrap();
        assert_eq!(registry.expertise("w1", "vision"), 0.0);
        assert!(registry.adjust_expertise("ghost", "vision", 0.1).is_err());
    }

    #[test]
    fn capability_listing_is_sorted() {
        let registry = registry_with(&["w3", "w1", "w2"]);
        assert_eq!(
            registry.workers_with_capability("vision"),
            vec!["w1", "w2", "w3"]
        );
        assert!(registry.workers_with_capability("audio").is_empty());
    }
}
