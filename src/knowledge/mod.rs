//! Shared knowledge store: an append-and-merge graph contributed to by all
//! workers in a run, with provenance tracking and deterministic conflict
//! resolution.
//!
//! All writes go through the single `merge` entry point. Per-node entry
//! locking means concurrent merges touching different nodes proceed in
//! parallel while merges to the same node serialize. The store is
//! long-lived: nothing in the engine clears it between runs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// A node in the knowledge graph, with provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeNode {
    pub id: String,
    pub content: Value,
    /// Contributing worker.
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
}

/// An edge between two existing nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub label: String,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A batch of assertions from one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeUpdate {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub nodes: Vec<NodeAssertion>,
    pub edges: Vec<EdgeAssertion>,
}

impl KnowledgeUpdate {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_node(
        mut self,
        id: impl Into<String>,
        content: Value,
        confidence: f64,
    ) -> Self {
        self.nodes.push(NodeAssertion {
            id: id.into(),
            content,
            confidence: confidence.clamp(0.0, 1.0),
        });
        self
    }

    pub fn with_edge(
        mut self,
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        self.edges.push(EdgeAssertion {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            label: label.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAssertion {
    pub id: String,
    pub content: Value,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeAssertion {
    pub id: String,
    pub from: String,
    pub to: String,
    pub label: String,
}

/// A losing assertion retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupersededRecord {
    pub node: KnowledgeNode,
    pub superseded_at: DateTime<Utc>,
    pub reason: String,
}

/// One resolved same-node conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub node_id: String,
    pub winner_worker: String,
    pub loser_worker: String,
    pub reason: String,
}

/// Outcome of a merge. Conflicts are never fatal; they are resolved
/// deterministically and reported here for audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictReport {
    pub accepted_nodes: usize,
    pub accepted_edges: usize,
    pub conflicts: Vec<Conflict>,
    /// Edges dropped because an endpoint does not exist, with the reason.
    pub rejected_edges: Vec<(String, String)>,
}

/// Query over the default (non-superseded) view of the store.
#[derive(Debug, Clone, Default)]
pub struct NodeQuery {
    /// Match nodes contributed by this worker.
    pub worker_id: Option<String>,
    /// Match nodes whose id starts with this prefix.
    pub id_prefix: Option<String>,
    /// Match nodes whose content object contains this top-level key.
    pub content_key: Option<String>,
    /// Match nodes at or above this confidence.
    pub min_confidence: Option<f64>,
}

impl NodeQuery {
    fn matches(&self, node: &KnowledgeNode) -> bool {
        if let Some(worker) = &self.worker_id {
            if &node.worker_id != worker {
                return false;
            }
        }
        if let Some(prefix) = &self.id_prefix {
            if !node.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(key) = &self.content_key {
            if node.content.get(key).is_none() {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if node.confidence < min {
                return false;
            }
        }
        true
    }
}

/// The shared, provenance-tracked knowledge graph.
#[derive(Debug, Default)]
pub struct KnowledgeStore {
    nodes: DashMap<String, KnowledgeNode>,
    edges: DashMap<String, KnowledgeEdge>,
    superseded: DashMap<String, Vec<SupersededRecord>>,
}

impl KnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges an update into the store.
    ///
    /// Additive by default. A conflict arises only when an update asserts
    /// different content for an existing node id; the higher confidence
    /// wins, and on an exact tie the earlier timestamp wins. The losing
    /// assertion is retained as a superseded record. Matching content from
    /// any worker is an idempotent accept, not a conflict; the stored
    /// confidence only ever rises.
    pub fn merge(&self, update: KnowledgeUpdate) -> ConflictReport {
        let mut report = ConflictReport::default();

        for assertion in update.nodes {
            let incoming = KnowledgeNode {
                id: assertion.id,
                content: assertion.content,
                worker_id: update.worker_id.clone(),
                timestamp: update.timestamp,
                confidence: assertion.confidence,
            };

            // The entry guard serializes concurrent merges to this node id.
            let mut entry = self.nodes.entry(incoming.id.clone()).or_insert_with(|| {
                incoming.clone()
            });
            if entry.value().content == incoming.content {
                // Fresh insert, a repeat, or another worker agreeing on the
                // same content. Agreement is never a conflict; the stored
                // confidence rises to the strongest assertion, and the
                // first writer keeps provenance.
                if incoming.confidence > entry.value().confidence {
                    entry.value_mut().confidence = incoming.confidence;
                }
                report.accepted_nodes += 1;
                continue;
            }

            let existing = entry.value();
            let incoming_wins = incoming.confidence > existing.confidence
                || (incoming.confidence == existing.confidence
                    && incoming.timestamp < existing.timestamp);
            let reason = if incoming.confidence != existing.confidence {
                "higher confidence".to_string()
            } else {
                "earlier timestamp".to_string()
            };

            if incoming_wins {
                let loser = entry.value().clone();
                debug!(
                    node_id = %incoming.id,
                    winner = %incoming.worker_id,
                    loser = %loser.worker_id,
                    %reason,
                    "Knowledge conflict resolved"
                );
                report.conflicts.push(Conflict {
                    node_id: incoming.id.clone(),
                    winner_worker: incoming.worker_id.clone(),
                    loser_worker: loser.worker_id.clone(),
                    reason: reason.clone(),
                });
                self.record_superseded(loser, &reason);
                *entry.value_mut() = incoming;
                report.accepted_nodes += 1;
            } else {
                debug!(
                    node_id = %incoming.id,
                    winner = %existing.worker_id,
                    loser = %incoming.worker_id,
                    %reason,
                    "Knowledge conflict resolved"
                );
                report.conflicts.push(Conflict {
                    node_id: incoming.id.clone(),
                    winner_worker: existing.worker_id.clone(),
                    loser_worker: incoming.worker_id.clone(),
                    reason: reason.clone(),
                });
                self.record_superseded(incoming, &reason);
            }
        }

        for assertion in update.edges {
            if !self.nodes.contains_key(&assertion.from) {
                report.rejected_edges.push((
                    assertion.id,
                    format!("source node {} does not exist", assertion.from),
                ));
                continue;
            }
            if !self.nodes.contains_key(&assertion.to) {
                report.rejected_edges.push((
                    assertion.id,
                    format!("target node {} does not exist", assertion.to),
                ));
                continue;
            }
            let incoming = KnowledgeEdge {
                id: assertion.id,
                from: assertion.from,
                to: assertion.to,
                label: assertion.label,
                worker_id: update.worker_id.clone(),
                timestamp: update.timestamp,
            };
            match self.edges.entry(incoming.id.clone()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(incoming);
                    report.accepted_edges += 1;
                }
                dashmap::mapref::entry::Entry::Occupied(slot) => {
                    let existing = slot.get();
                    if existing.from == incoming.from
                        && existing.to == incoming.to
                        && existing.label == incoming.label
                    {
                        // Idempotent repeat.
                    } else {
                        report.rejected_edges.push((
                            incoming.id.clone(),
                            "edge id already exists with different endpoints".to_string(),
                        ));
                    }
                }
            }
        }

        report
    }

    fn record_superseded(&self, node: KnowledgeNode, reason: &str) {
        let mut records = self.superseded.entry(node.id.clone()).or_default();
        // Idempotence guard: the same losing assertion is kept once.
        let duplicate = records.iter().any(|r| {
            r.node.content == node.content
                && r.node.worker_id == node.worker_id
                && r.node.confidence == node.confidence
        });
        if !duplicate {
            records.push(SupersededRecord {
                node,
                superseded_at: Utc::now(),
                reason: reason.to_string(),
            });
        }
    }

    /// Read-only query over current (winning) nodes, sorted by id for
    /// deterministic output. Superseded records are excluded.
    pub fn query(&self, query: &NodeQuery) -> Vec<KnowledgeNode> {
        let mut out: Vec<KnowledgeNode> = self
            .nodes
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Audit view: superseded records for a node id, in the order they
    /// lost.
    pub fn audit(&self, node_id: &str) -> Vec<SupersededRecord> {
        self.superseded
            .get(node_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn node(&self, id: &str) -> Option<KnowledgeNode> {
        self.nodes.get(id).map(|n| n.clone())
    }

    pub fn edges_of(&self, node_id: &str) -> Vec<KnowledgeEdge> {
        let mut out: Vec<KnowledgeEdge> = self
            .edges
            .iter()
            .filter(|e| e.from == node_id || e.to == node_id)
            .map(|e| e.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Workers that contributed at least one current node.
    pub fn contributors(&self) -> HashSet<String> {
        self.nodes
            .iter()
            .map(|n| n.worker_id.clone())
            .collect()
    }

    /// Snapshot of all current nodes, for detectors that need a full pass.
    pub fn nodes_snapshot(&self) -> Vec<KnowledgeNode> {
        self.query(&NodeQuery::default())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
