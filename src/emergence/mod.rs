//! Emergence detection: statistically significant cross-worker correlation
//! between independently produced outputs.
//!
//! Detection is a pure function of the run's accumulated outputs and the
//! knowledge store; it never mutates the store, keeping discovery separate
//! from persistence.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::core::config::SwarmConfig;
use crate::knowledge::KnowledgeStore;
use crate::matcher::jaccard;

/// A correlated pattern across two or more workers' outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Participating workers, sorted.
    pub workers: Vec<String>,
    /// The correlated elements both workers produced, sorted.
    pub subjects: Vec<String>,
    /// Overlap ratio of the element sets, 0..=1.
    pub strength: f64,
    /// Whether strength reached the configured threshold. Always true for
    /// emitted patterns; carried so downstream consumers can requalify
    /// records against their own thresholds.
    pub significant: bool,
}

/// Normalized per-worker output element sets for one run.
pub type WorkerOutputs = HashMap<String, HashSet<String>>;

/// Scans worker outputs and the knowledge store for correlated pairs.
#[derive(Debug, Clone)]
pub struct EmergenceDetector {
    pub threshold: f64,
}

impl EmergenceDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &SwarmConfig) -> Self {
        Self::new(config.emergence_threshold)
    }

    /// Detects patterns across every pair of contributing workers.
    ///
    /// Correlation strength is the overlap ratio of the two workers'
    /// normalized element sets (intersection over union). A pattern is
    /// emitted only when strength reaches the threshold; pairs involve two
    /// workers by construction, so no emitted pattern ever has fewer than
    /// two contributors.
    pub fn detect(&self, store: &KnowledgeStore, outputs: &WorkerOutputs) -> Vec<Pattern> {
        let mut elements: HashMap<String, HashSet<String>> = outputs
            .iter()
            .map(|(worker, set)| (worker.clone(), set.clone()))
            .collect();

        // Store contributions count toward a worker's element set too:
        // content keys of a contributed node are comparable across workers
        // even when task outputs were disjoint.
        for node in store.nodes_snapshot() {
            if let Some(object) = node.content.as_object() {
                let entry = elements.entry(node.worker_id.clone()).or_default();
                for key in object.keys() {
                    entry.insert(format!("kb:{key}"));
                }
            }
        }

        let mut workers: Vec<&String> = elements
            .keys()
            .filter(|w| !elements[*w].is_empty())
            .collect();
        workers.sort();

        let mut patterns = Vec::new();
        for i in 0..workers.len() {
            for j in (i + 1)..workers.len() {
                let (a, b) = (workers[i], workers[j]);
                let strength = jaccard(&elements[a], &elements[b]);
                if strength < self.threshold {
                    debug!(
                        worker_a = %a,
                        worker_b = %b,
                        strength,
                        "Correlation below emergence threshold"
                    );
                    continue;
                }
                let mut subjects: Vec<String> = elements[a]
                    .intersection(&elements[b])
                    .cloned()
                    .collect();
                subjects.sort();
                info!(
                    worker_a = %a,
                    worker_b = %b,
                    strength,
                    subjects = subjects.len(),
                    "Emergent pattern detected"
                );
                patterns.push(Pattern {
                    workers: vec![a.clone(), b.clone()],
                    subjects,
                    strength,
                    significant: strength >= self.threshold,
                });
            }
        }

        patterns.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.workers.cmp(&b.workers))
        });
        patterns
    }
}
