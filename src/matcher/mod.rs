//! Capability matching: deterministic, expertise-weighted selection of the
//! best-fit worker for a subproblem.

use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

use crate::core::errors::{Result, SwarmError};
use crate::decompose::Subproblem;
use crate::registry::WorkerRegistry;

/// Jaccard similarity between two tag sets. Two empty sets are vacuously
/// identical; an empty requirement set matches any worker.
pub fn jaccard(required: &HashSet<String>, declared: &HashSet<String>) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let intersection = required.intersection(declared).count();
    let union = required.union(declared).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    worker_id: String,
    score: f64,
    load: usize,
}

/// Scores workers against a subproblem's required tags.
///
/// Combined score = tag overlap (Jaccard) scaled by mean expertise over the
/// overlapping tags. Load is strictly a tie-breaker: it can reorder workers
/// with an identical combined score but never override a capability
/// difference. Final ties break to the lowest worker id, so matching is
/// reproducible.
#[derive(Debug, Clone)]
pub struct CapabilityMatcher {
    min_overlap: f64,
}

impl Default for CapabilityMatcher {
    fn default() -> Self {
        Self { min_overlap: 0.0 }
    }
}

impl CapabilityMatcher {
    pub fn new(min_overlap: f64) -> Self {
        Self {
            min_overlap: min_overlap.clamp(0.0, 1.0),
        }
    }

    /// Selects the best-fit worker, or `SwarmError::NoCapableWorker` when
    /// no worker reaches a positive overlap at or above the configured
    /// minimum.
    pub fn best_match(
        &self,
        subproblem: &Subproblem,
        registry: &WorkerRegistry,
    ) -> Result<String> {
        let required: HashSet<String> =
            subproblem.required_capabilities.iter().cloned().collect();
        let mut candidates = Vec::new();

        for worker_id in registry.ids() {
            let Some(profile) = registry.profile(&worker_id) else {
                continue;
            };
            let overlap = jaccard(&required, &profile.capabilities);
            if overlap <= 0.0 || overlap < self.min_overlap {
                continue;
            }
            let shared: Vec<&String> = required
                .intersection(&profile.capabilities)
                .collect();
            let expertise = if shared.is_empty() {
                // Empty requirement set: average over everything declared.
                let declared: Vec<f64> = profile
                    .capabilities
                    .iter()
                    .map(|tag| profile.expertise(tag))
                    .collect();
                if declared.is_empty() {
                    0.0
                } else {
                    declared.iter().sum::<f64>() / declared.len() as f64
                }
            } else {
                shared.iter().map(|tag| profile.expertise(tag)).sum::<f64>()
                    / shared.len() as f64
            };
            candidates.push(Candidate {
                worker_id,
                score: overlap * (0.5 + 0.5 * expertise),
                load: profile.load(),
            });
        }

        if candidates.is_empty() {
            return Err(SwarmError::NoCapableWorker(subproblem.id.clone()));
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.load.cmp(&b.load))
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        let best = &candidates[0];
        debug!(
            subproblem_id = %subproblem.id,
            worker_id = %best.worker_id,
            score = best.score,
            load = best.load,
            "Matched worker"
        );
        Ok(best.worker_id.clone())
    }
}
