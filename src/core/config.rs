use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::{Result, SwarmError};

/// Configuration for retry behavior between dispatch attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before the given retry, counted from zero.
    pub fn delay_for(&self, attempt: u8) -> Duration {
        match self {
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay =
                    (*initial_delay_ms as f64 * multiplier.powf(attempt as f64)).round() as u64;
                Duration::from_millis(delay.min(*max_delay_ms))
            }
            RetryStrategy::Linear { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Immediate => Duration::ZERO,
        }
    }
}

/// Configuration for a swarm run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwarmConfig {
    /// Maximum number of subproblems dispatched concurrently
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Aggregate score the leading proposal must exceed to converge
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Minimum spread between the top two proposals to converge
    #[serde(default = "default_min_margin")]
    pub min_margin: f64,
    /// Correlation strength at which a cross-worker pattern is significant
    #[serde(default = "default_emergence_threshold")]
    pub emergence_threshold: f64,
    /// Maximum number of voting rounds before returning a best-effort leader
    #[serde(default = "default_iteration_limit")]
    pub iteration_limit: u32,
    /// Per-dispatch deadline in milliseconds
    #[serde(default = "default_subproblem_timeout_ms")]
    pub subproblem_timeout_ms: u64,
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    /// Wall-clock budget for a whole run in milliseconds
    #[serde(default = "default_run_budget_ms")]
    pub run_budget_ms: u64,
    /// Minimum capability overlap (Jaccard) a worker must reach to match
    #[serde(default)]
    pub min_capability_overlap: f64,
    /// Retry strategy configuration
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_consensus_threshold() -> f64 {
    0.7
}

fn default_min_margin() -> f64 {
    0.05
}

fn default_emergence_threshold() -> f64 {
    0.8
}

fn default_iteration_limit() -> u32 {
    5
}

fn default_subproblem_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u8 {
    1
}

fn default_run_budget_ms() -> u64 {
    300_000
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            consensus_threshold: default_consensus_threshold(),
            min_margin: default_min_margin(),
            emergence_threshold: default_emergence_threshold(),
            iteration_limit: default_iteration_limit(),
            subproblem_timeout_ms: default_subproblem_timeout_ms(),
            max_retries: default_max_retries(),
            run_budget_ms: default_run_budget_ms(),
            min_capability_overlap: 0.0,
            retry_strategy: RetryStrategy::default(),
        }
    }
}

/// Partial configuration for overriding a base config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmConfigPatch {
    pub max_concurrent_tasks: Option<usize>,
    pub consensus_threshold: Option<f64>,
    pub min_margin: Option<f64>,
    pub emergence_threshold: Option<f64>,
    pub iteration_limit: Option<u32>,
    pub subproblem_timeout_ms: Option<u64>,
    pub max_retries: Option<u8>,
    pub run_budget_ms: Option<u64>,
    pub min_capability_overlap: Option<f64>,
    pub retry_strategy: Option<RetryStrategy>,
}

impl SwarmConfig {
    /// Validates configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(SwarmError::InvalidConfig(
                "max_concurrent_tasks must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consensus_threshold) {
            return Err(SwarmError::InvalidConfig(
                "consensus_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_margin) {
            return Err(SwarmError::InvalidConfig(
                "min_margin must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.emergence_threshold) {
            return Err(SwarmError::InvalidConfig(
                "emergence_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_capability_overlap) {
            return Err(SwarmError::InvalidConfig(
                "min_capability_overlap must be within [0, 1]".into(),
            ));
        }
        if self.iteration_limit == 0 {
            return Err(SwarmError::InvalidConfig(
                "iteration_limit must be greater than 0".into(),
            ));
        }
        if self.iteration_limit > 100 {
            return Err(SwarmError::InvalidConfig(
                "iteration_limit cannot exceed 100".into(),
            ));
        }
        if self.subproblem_timeout_ms == 0 {
            return Err(SwarmError::InvalidConfig(
                "subproblem_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.run_budget_ms == 0 {
            return Err(SwarmError::InvalidConfig(
                "run_budget_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Merges a patch over a base configuration, with the patch taking
    /// precedence. The merged result is validated before being returned.
    pub fn merge(base: &Self, patch: &SwarmConfigPatch) -> Result<Self> {
        let merged = Self {
            max_concurrent_tasks: patch
                .max_concurrent_tasks
                .unwrap_or(base.max_concurrent_tasks),
            consensus_threshold: patch.consensus_threshold.unwrap_or(base.consensus_threshold),
            min_margin: patch.min_margin.unwrap_or(base.min_margin),
            emergence_threshold: patch.emergence_threshold.unwrap_or(base.emergence_threshold),
            iteration_limit: patch.iteration_limit.unwrap_or(base.iteration_limit),
            subproblem_timeout_ms: patch
                .subproblem_timeout_ms
                .unwrap_or(base.subproblem_timeout_ms),
            max_retries: patch.max_retries.unwrap_or(base.max_retries),
            run_budget_ms: patch.run_budget_ms.unwrap_or(base.run_budget_ms),
            min_capability_overlap: patch
                .min_capability_overlap
                .unwrap_or(base.min_capability_overlap),
            retry_strategy: patch
                .retry_strategy
                .clone()
                .unwrap_or_else(|| base.retry_strategy.clone()),
        };
        merged.validate()?;
        Ok(merged)
    }

    pub fn subproblem_timeout(&self) -> Duration {
        Duration::from_millis(self.subproblem_timeout_ms)
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_millis(self.run_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.consensus_threshold, 0.7);
        assert_eq!(config.min_margin, 0.05);
        assert_eq!(config.emergence_threshold, 0.8);
        assert_eq!(config.iteration_limit, 5);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = SwarmConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let config = SwarmConfig {
            consensus_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SwarmConfig {
            emergence_threshold: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn merge_applies_patch_over_base() {
        let base = SwarmConfig::default();
        let patch = SwarmConfigPatch {
            max_concurrent_tasks: Some(2),
            consensus_threshold: Some(0.9),
            ..Default::default()
        };
        let merged = SwarmConfig::merge(&base, &patch).unwrap();
        assert_eq!(merged.max_concurrent_tasks, 2);
        assert_eq!(merged.consensus_threshold, 0.9);
        assert_eq!(merged.iteration_limit, base.iteration_limit);
    }

    #[test]
    fn merge_rejects_invalid_patch() {
        let base = SwarmConfig::default();
        let patch = SwarmConfigPatch {
            iteration_limit: Some(0),
            ..Default::default()
        };
        assert!(SwarmConfig::merge(&base, &patch).is_err());
    }

    #[test]
    fn exponential_backoff_caps_at_max() {
        let strategy = RetryStrategy::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 500,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay_for(0), Duration::from_millis(100));
        assert_eq!(strategy.delay_for(1), Duration::from_millis(200));
        assert_eq!(strategy.delay_for(10), Duration::from_millis(500));
        assert_eq!(RetryStrategy::Immediate.delay_for(3), Duration::ZERO);
    }
}
