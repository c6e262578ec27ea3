use thiserror::Error;

pub type Result<T> = std::result::Result<T, SwarmError>;

#[derive(Error, Debug)]
pub enum SwarmError {
    // Run-level errors. These abort the whole run before or during scheduling.
    #[error("Decomposition failed: {0}")]
    Decomposition(String),
    #[error("Decomposition produced an empty subproblem graph")]
    EmptyDag,
    #[error("Dependency cycle detected in subproblem graph")]
    CycleDetected,
    #[error("Run cancelled")]
    RunCancelled,
    #[error("Run budget exceeded")]
    RunBudgetExceeded,

    // Subproblem-level errors. Recovered locally by the scheduler and
    // cascaded to dependents; they never abort sibling branches.
    #[error("No capable worker for subproblem: {0}")]
    NoCapableWorker(String),
    #[error("Subproblem timed out: {0}")]
    Timeout(String),

    // Registry errors
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),
    #[error("Worker already registered: {0}")]
    WorkerAlreadyRegistered(String),

    // Consensus errors
    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),
    #[error("No proposals submitted for decision point: {0}")]
    NoProposals(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to serialize/deserialize: {0}")]
    Serde(#[from] serde_json::Error),

    // Wrapped anyhow::Error for opaque worker-side failures
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SwarmError {
    /// Whether this error aborts the whole run, as opposed to being
    /// recovered locally at the subproblem level.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            SwarmError::Decomposition(_)
                | SwarmError::EmptyDag
                | SwarmError::CycleDetected
                | SwarmError::RunCancelled
                | SwarmError::RunBudgetExceeded
        )
    }
}
