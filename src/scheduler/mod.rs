//! Scheduler/executor: walks the decomposition DAG in dependency order,
//! dispatching ready subproblems to matched workers under a concurrency
//! bound, with per-dispatch deadlines, retries with backoff, cascading
//! failure, a wall-clock run budget, and cancellation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::core::config::SwarmConfig;
use crate::core::errors::SwarmError;
use crate::decompose::{Subproblem, SubproblemDag, SubproblemStatus};
use crate::matcher::CapabilityMatcher;
use crate::registry::{TaskOutput, WorkerRegistry};

/// Run-wide cancellation signal. One per run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        self.tx.subscribe()
    }
}

pub type CancelToken = watch::Receiver<bool>;

pub fn cancel_channel() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, rx)
}

/// Why a run was cut short before every subproblem ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunInterruption {
    Cancelled,
    BudgetExceeded,
}

impl From<RunInterruption> for SwarmError {
    fn from(value: RunInterruption) -> Self {
        match value {
            RunInterruption::Cancelled => SwarmError::RunCancelled,
            RunInterruption::BudgetExceeded => SwarmError::RunBudgetExceeded,
        }
    }
}

/// Terminal outcome of one subproblem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubproblemOutcome {
    pub subproblem_id: String,
    pub status: SubproblemStatus,
    /// The worker that ran it, if it was ever dispatched.
    pub worker_id: Option<String>,
    pub output: Option<TaskOutput>,
    /// Each attempt's error message (if any).
    pub retry_messages: Vec<String>,
    /// The final error recorded when the subproblem ultimately fails.
    pub final_error: Option<String>,
}

impl SubproblemOutcome {
    fn failed(subproblem_id: String, reason: String) -> Self {
        Self {
            subproblem_id,
            status: SubproblemStatus::Failed,
            worker_id: None,
            output: None,
            retry_messages: Vec::new(),
            final_error: Some(reason),
        }
    }
}

/// Executes a decomposition DAG against the worker pool.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SwarmConfig,
    matcher: CapabilityMatcher,
}

impl Scheduler {
    pub fn new(config: SwarmConfig) -> Self {
        let matcher = CapabilityMatcher::new(config.min_capability_overlap);
        Self { config, matcher }
    }

    /// Runs every reachable subproblem to a terminal state and returns the
    /// outcome map. Never blocks indefinitely: the run budget bounds total
    /// execution, and each dispatch attempt is bounded by the subproblem
    /// timeout.
    ///
    /// The returned interruption, if any, reports that the run was
    /// cancelled or ran out of budget; subproblem statuses in the map are
    /// authoritative either way.
    pub async fn execute(
        &self,
        dag: &mut SubproblemDag,
        registry: &Arc<WorkerRegistry>,
        cancel: CancelToken,
    ) -> (HashMap<String, SubproblemOutcome>, Option<RunInterruption>) {
        let mut outcomes: HashMap<String, SubproblemOutcome> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));
        let (tx, mut rx) = mpsc::unbounded_channel::<SubproblemOutcome>();
        let deadline = Instant::now() + self.config.run_budget();
        let mut active = 0usize;
        let mut interruption: Option<RunInterruption> = None;
        let mut cancel_watch = cancel.clone();

        info!(
            task_id = %dag.task_id,
            subproblems = dag.len(),
            max_concurrent = self.config.max_concurrent_tasks,
            "Starting DAG execution"
        );

        loop {
            if interruption.is_none() {
                if *cancel_watch.borrow() {
                    interruption = Some(RunInterruption::Cancelled);
                    self.fail_all_pending(dag, &mut outcomes, "run cancelled");
                    warn!(task_id = %dag.task_id, "Run cancelled; failing queued subproblems");
                } else if Instant::now() >= deadline {
                    interruption = Some(RunInterruption::BudgetExceeded);
                    self.fail_all_pending(dag, &mut outcomes, "run budget exceeded");
                    warn!(task_id = %dag.task_id, "Run budget exceeded; failing queued subproblems");
                }
            }

            if interruption.is_none() {
                self.cascade_failures(dag, &mut outcomes);

                for id in self.ready_ids(dag) {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let worker_id = match self.matcher.best_match(dag.get(&id).unwrap(), registry)
                    {
                        Ok(worker_id) => worker_id,
                        Err(e) => {
                            // Per-subproblem failure, not a run abort.
                            warn!(subproblem_id = %id, error = %e, "No capable worker");
                            dag.get_mut(&id).unwrap().status = SubproblemStatus::Failed;
                            outcomes.insert(
                                id.clone(),
                                SubproblemOutcome::failed(id, e.to_string()),
                            );
                            drop(permit);
                            continue;
                        }
                    };
                    let Some(worker) = registry.get(&worker_id) else {
                        dag.get_mut(&id).unwrap().status = SubproblemStatus::Failed;
                        outcomes.insert(
                            id.clone(),
                            SubproblemOutcome::failed(
                                id.clone(),
                                SwarmError::WorkerNotFound(worker_id).to_string(),
                            ),
                        );
                        drop(permit);
                        continue;
                    };

                    dag.get_mut(&id).unwrap().status = SubproblemStatus::Running;
                    registry.begin_dispatch(&worker_id);
                    active += 1;
                    debug!(
                        subproblem_id = %id,
                        worker_id = %worker_id,
                        active,
                        "Dispatching subproblem"
                    );

                    let subproblem = dag.get(&id).unwrap().clone();
                    let config = self.config.clone();
                    let tx = tx.clone();
                    let attempt_cancel = cancel.clone();
                    tokio::spawn(async move {
                        let outcome = run_attempts(
                            subproblem,
                            worker,
                            worker_id,
                            config,
                            attempt_cancel,
                            deadline,
                        )
                        .await;
                        drop(permit);
                        let _ = tx.send(outcome);
                    });
                }
            }

            if active == 0 {
                if interruption.is_some() || self.all_terminal(dag) {
                    break;
                }
                // Nothing in flight, nothing ready, non-terminal work left.
                // With a validated DAG this cannot happen; fail loudly
                // rather than spin.
                if self.ready_ids(dag).is_empty() && !self.cascade_failures(dag, &mut outcomes) {
                    error!(task_id = %dag.task_id, "Unschedulable subproblems remain; failing them");
                    self.fail_all_pending(dag, &mut outcomes, "unschedulable");
                    break;
                }
                continue;
            }

            tokio::select! {
                received = rx.recv() => {
                    let Some(outcome) = received else { break };
                    active -= 1;
                    if let Some(worker_id) = &outcome.worker_id {
                        registry.end_dispatch(worker_id);
                    }
                    debug!(
                        subproblem_id = %outcome.subproblem_id,
                        status = ?outcome.status,
                        active,
                        "Subproblem completed"
                    );
                    if let Some(sub) = dag.get_mut(&outcome.subproblem_id) {
                        sub.status = outcome.status;
                    }
                    outcomes.insert(outcome.subproblem_id.clone(), outcome);
                }
                _ = cancel_watch.changed() => {}
                _ = tokio::time::sleep_until(deadline), if interruption.is_none() => {}
            }
        }

        let failed = outcomes
            .values()
            .filter(|o| o.status == SubproblemStatus::Failed)
            .count();
        info!(
            task_id = %dag.task_id,
            total = outcomes.len(),
            failed,
            interruption = ?interruption,
            "DAG execution finished"
        );
        (outcomes, interruption)
    }

    /// Pending subproblems whose dependencies have all succeeded, ordered
    /// by priority then id.
    fn ready_ids(&self, dag: &SubproblemDag) -> Vec<String> {
        let mut ready: Vec<&Subproblem> = dag
            .subproblems()
            .filter(|s| {
                s.status == SubproblemStatus::Pending
                    && s.dependencies
                        .iter()
                        .all(|dep| dag.get(dep).map(|d| d.status) == Some(SubproblemStatus::Succeeded))
            })
            .collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        ready.into_iter().map(|s| s.id.clone()).collect()
    }

    /// Marks every pending subproblem with a failed dependency as failed,
    /// transitively, without dispatching it. Returns whether anything
    /// changed.
    fn cascade_failures(
        &self,
        dag: &mut SubproblemDag,
        outcomes: &mut HashMap<String, SubproblemOutcome>,
    ) -> bool {
        let mut changed_any = false;
        loop {
            let cascaded: Vec<(String, String)> = dag
                .subproblems()
                .filter(|s| s.status == SubproblemStatus::Pending)
                .filter_map(|s| {
                    s.dependencies
                        .iter()
                        .find(|dep| {
                            dag.get(dep).map(|d| d.status) == Some(SubproblemStatus::Failed)
                        })
                        .map(|dep| (s.id.clone(), dep.clone()))
                })
                .collect();
            if cascaded.is_empty() {
                return changed_any;
            }
            changed_any = true;
            for (id, dep) in cascaded {
                debug!(subproblem_id = %id, failed_dependency = %dep, "Cascading failure");
                dag.get_mut(&id).unwrap().status = SubproblemStatus::Failed;
                outcomes.insert(
                    id.clone(),
                    SubproblemOutcome::failed(id, format!("dependency {dep} failed")),
                );
            }
        }
    }

    fn fail_all_pending(
        &self,
        dag: &mut SubproblemDag,
        outcomes: &mut HashMap<String, SubproblemOutcome>,
        reason: &str,
    ) {
        let pending: Vec<String> = dag
            .subproblems()
            .filter(|s| s.status == SubproblemStatus::Pending)
            .map(|s| s.id.clone())
            .collect();
        for id in pending {
            dag.get_mut(&id).unwrap().status = SubproblemStatus::Failed;
            outcomes.insert(
                id.clone(),
                SubproblemOutcome::failed(id, reason.to_string()),
            );
        }
    }

    fn all_terminal(&self, dag: &SubproblemDag) -> bool {
        dag.subproblems().all(|s| s.status.is_terminal())
    }
}

/// Runs one subproblem against its matched worker with deadline and retry
/// semantics. Once cancellation is observed or the run budget passes, the
/// current attempt keeps its remaining timeout as grace, but no further
/// retries start.
async fn run_attempts(
    subproblem: Subproblem,
    worker: Arc<dyn crate::registry::Worker>,
    worker_id: String,
    config: SwarmConfig,
    cancel: CancelToken,
    budget_deadline: Instant,
) -> SubproblemOutcome {
    let total_attempts = config.max_retries as u32 + 1;
    let per_attempt = config.subproblem_timeout();
    let mut outcome = SubproblemOutcome {
        subproblem_id: subproblem.id.clone(),
        status: SubproblemStatus::Failed,
        worker_id: Some(worker_id.clone()),
        output: None,
        retry_messages: Vec::new(),
        final_error: None,
    };

    for attempt in 1..=total_attempts {
        match timeout(per_attempt, worker.execute_task(&subproblem, per_attempt)).await {
            Ok(Ok(output)) if output.success => {
                info!(
                    subproblem_id = %subproblem.id,
                    worker_id = %worker_id,
                    attempt,
                    "Subproblem succeeded"
                );
                outcome.status = SubproblemStatus::Succeeded;
                outcome.output = Some(output);
                return outcome;
            }
            Ok(Ok(output)) => {
                let message = output
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker reported failure".to_string());
                outcome
                    .retry_messages
                    .push(format!("Attempt {attempt} failed: {message}"));
            }
            Ok(Err(e)) => {
                outcome
                    .retry_messages
                    .push(format!("Attempt {attempt} failed: {e}"));
            }
            Err(_) => {
                let message = SwarmError::Timeout(subproblem.id.clone()).to_string();
                warn!(
                    subproblem_id = %subproblem.id,
                    worker_id = %worker_id,
                    attempt,
                    max_attempts = total_attempts,
                    "Dispatch timed out"
                );
                outcome
                    .retry_messages
                    .push(format!("Attempt {attempt} failed: {message}"));
            }
        }

        if *cancel.borrow() {
            outcome.final_error = Some("run cancelled during retry window".to_string());
            return outcome;
        }
        if Instant::now() >= budget_deadline {
            outcome.final_error = Some("run budget exhausted during retry window".to_string());
            return outcome;
        }
        if attempt < total_attempts {
            let delay = config.retry_strategy.delay_for((attempt - 1) as u8);
            if !delay.is_zero() {
                debug!(
                    subproblem_id = %subproblem.id,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                sleep(delay).await;
            }
            if Instant::now() >= budget_deadline {
                outcome.final_error =
                    Some("run budget exhausted during retry window".to_string());
                return outcome;
            }
        }
    }

    outcome.final_error = Some(format!(
        "failed after {} attempts: {}",
        total_attempts,
        outcome
            .retry_messages
            .last()
            .cloned()
            .unwrap_or_default()
    ));
    outcome
}
