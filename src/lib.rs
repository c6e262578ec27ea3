// Core infrastructure modules
pub mod core;

// Pipeline stages, in the order a run flows through them
pub mod decompose;
pub mod matcher;
pub mod registry;
pub mod scheduler;

// Collective-intelligence layers
pub mod consensus;
pub mod emergence;
pub mod knowledge;

// The run orchestrator
pub mod coordinator;

// Re-exports for convenience
pub use consensus::{ConsensusEngine, ConsensusResult, DecisionPoint, Proposal, ProposalDraft, Vote};
pub use coordinator::{Coordinator, RunResult};
pub use crate::core::config::{RetryStrategy, SwarmConfig, SwarmConfigPatch};
pub use crate::core::errors::{Result, SwarmError};
pub use decompose::{
    DataFlowStrategy, Decomposer, DecompositionStrategy, FunctionalStrategy,
    HierarchicalStrategy, Subproblem, SubproblemDag, SubproblemStatus, Task,
};
pub use emergence::{EmergenceDetector, Pattern};
pub use knowledge::{KnowledgeStore, KnowledgeUpdate, NodeQuery};
pub use matcher::CapabilityMatcher;
pub use registry::{TaskOutput, Worker, WorkerRegistry};
pub use scheduler::{cancel_channel, CancelHandle, CancelToken, Scheduler, SubproblemOutcome};
