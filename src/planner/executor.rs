//! Plan executor.
//!
//! Dispatches plan operations against a provider with bounded concurrency.
//! An operation starts only once every dependency has succeeded; if one
//! fails or is skipped, its dependents are skipped without a provider call.
//! Every successful mutation is persisted before dependents are released.
//! References are resolved to provider ids from the persisted state at
//! dispatch time, and the state lock is renewed while the run lasts.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{KestrelError, ProviderError, StateError};
use crate::provider::{Provider, ResolvedRef};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::state::{renew_interval, AppliedState, AppliedStateSet, StateTransaction};

use super::plan::{Action, Plan, PlanOperation};

/// Final status of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Completed, and the state reflects it.
    Success,
    /// The provider call or the state save failed.
    Failed,
    /// Never attempted.
    Skipped,
}

/// Result of a single operation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Resource name.
    pub name: String,
    /// Planned action.
    pub action: Action,
    /// What happened.
    pub outcome: Outcome,
    /// Failure or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider calls made, including retries.
    pub attempts: u32,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Per-operation results in plan order.
    pub results: Vec<ExecutionResult>,
    /// Why the run stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<String>,
}

/// Message a worker sends back when its operation ends.
struct TaskOutcome {
    index: usize,
    /// Provider id on success; `None` for deletes.
    result: Result<Option<String>, ProviderError>,
    attempts: u32,
    /// The operation never reached the provider.
    cancelled: bool,
}

/// Executor for plans.
pub struct Executor {
    provider: Arc<dyn Provider>,
    concurrency: usize,
    retry: RetryConfig,
    operation_timeout: Duration,
    apply_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Executor {
    /// Creates an executor with the given settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, config: &ExecutorConfig) -> Self {
        Self {
            provider,
            concurrency: config.concurrency.max(1),
            retry: RetryConfig::from_executor(config),
            operation_timeout: Duration::from_secs(config.operation_timeout_secs.max(1)),
            apply_timeout: config.apply_timeout_secs.map(Duration::from_secs),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to stop dispatching new operations when cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Executes `plan`, persisting each successful mutation through `tx`.
    ///
    /// Operation failures never abort the run; they are reported per
    /// operation. Cancellation or the apply timeout stops dispatching, lets
    /// in-flight calls finish and reports the rest as skipped.
    pub async fn execute(&self, plan: &Plan, tx: &mut StateTransaction<'_>) -> ExecutionReport {
        info!(
            "Executing plan with {} operations (concurrency {})",
            plan.operations.len(),
            self.concurrency
        );

        let ops = &plan.operations;
        let position: HashMap<&str, usize> =
            ops.iter().enumerate().map(|(i, op)| (op.name.as_str(), i)).collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let run_token = self.cancel.child_token();
        let mut running: JoinSet<TaskOutcome> = JoinSet::new();
        let mut in_flight: HashSet<usize> = HashSet::new();
        let mut results: Vec<Option<ExecutionResult>> = vec![None; ops.len()];
        let mut pending: Vec<usize> = (0..ops.len()).collect();
        let mut interrupted: Option<String> = None;

        let deadline = self.apply_timeout;
        let timer = sleep_or_forever(deadline);
        tokio::pin!(timer);

        let mut heartbeat = tokio::time::interval_at(Instant::now() + renew_interval(), renew_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if interrupted.is_none() && run_token.is_cancelled() {
                interrupted = Some(String::from("cancelled"));
            }

            if let Some(reason) = &interrupted {
                for index in pending.drain(..) {
                    results[index] = Some(skipped(&ops[index], reason));
                }
            } else {
                self.dispatch_ready(
                    ops,
                    tx.state(),
                    &position,
                    &mut pending,
                    &mut results,
                    &mut running,
                    &mut in_flight,
                    &semaphore,
                    &run_token,
                );
            }

            if running.is_empty() {
                // Workers that vanished without reporting back.
                let lost: Vec<usize> = in_flight.drain().collect();
                for index in &lost {
                    let reason = Some(String::from("operation task aborted"));
                    results[*index] = Some(finished(&ops[*index], Outcome::Failed, reason, 0));
                }
                if !lost.is_empty() {
                    continue;
                }
                for index in pending.drain(..) {
                    results[index] = Some(skipped(&ops[index], "unresolved dependency"));
                }
                break;
            }

            tokio::select! {
                joined = running.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => {
                            let index = outcome.index;
                            in_flight.remove(&index);
                            let result = self.settle(&ops[index], outcome, interrupted.as_deref(), tx).await;
                            results[index] = Some(result);
                        }
                        Some(Err(e)) => error!("Operation task failed: {e}"),
                        None => {}
                    }
                }
                () = run_token.cancelled(), if interrupted.is_none() => {
                    warn!("Cancellation requested; waiting for in-flight operations");
                    interrupted = Some(String::from("cancelled"));
                }
                () = &mut timer, if interrupted.is_none() => {
                    warn!("Apply timeout reached; waiting for in-flight operations");
                    run_token.cancel();
                    interrupted = Some(String::from("apply timeout exceeded"));
                }
                _ = heartbeat.tick() => {
                    match tx.renew_lock().await {
                        Ok(()) => debug!("Renewed state lock {}", tx.lock().lock_id),
                        Err(KestrelError::State(StateError::LockLost { .. })) => {
                            error!("State lock was taken over; stopping dispatch");
                            if interrupted.is_none() {
                                run_token.cancel();
                                interrupted = Some(String::from("state lock lost"));
                            }
                        }
                        Err(e) => warn!("Could not renew the state lock, retrying next tick: {e}"),
                    }
                }
            }
        }

        let results: Vec<ExecutionResult> = results
            .into_iter()
            .zip(ops)
            .map(|(r, op)| r.unwrap_or_else(|| skipped(op, "not executed")))
            .collect();

        let execution = ExecutionReport { results, interrupted };
        info!("{execution}");
        execution
    }

    /// Resolves every pending operation whose dependencies are terminal:
    /// skips it if one did not succeed, otherwise starts it.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_ready(
        &self,
        ops: &[PlanOperation],
        state: &AppliedStateSet,
        position: &HashMap<&str, usize>,
        pending: &mut Vec<usize>,
        results: &mut [Option<ExecutionResult>],
        running: &mut JoinSet<TaskOutcome>,
        in_flight: &mut HashSet<usize>,
        semaphore: &Arc<Semaphore>,
        token: &CancellationToken,
    ) {
        // Repeat until stable: a skip or an instant NoOp can release others.
        loop {
            let mut progressed = false;
            let mut still_pending = Vec::with_capacity(pending.len());

            for &index in pending.iter() {
                let op = &ops[index];
                let mut blocked = false;
                let mut broken: Option<String> = None;

                for dep in &op.dependencies {
                    let Some(&dep_index) = position.get(dep.as_str()) else {
                        continue;
                    };
                    match results[dep_index].as_ref().map(|r| r.outcome) {
                        Some(Outcome::Success) => {}
                        Some(Outcome::Failed) => {
                            broken = Some(format!("dependency '{dep}' failed"));
                            break;
                        }
                        Some(Outcome::Skipped) => {
                            broken = Some(format!("dependency '{dep}' was skipped"));
                            break;
                        }
                        None => blocked = true,
                    }
                }

                if let Some(reason) = broken {
                    warn!("Skipping {}: {reason}", op.name);
                    results[index] = Some(skipped(op, &reason));
                    progressed = true;
                } else if blocked {
                    still_pending.push(index);
                } else if op.action == Action::NoOp {
                    debug!("No change for {}", op.name);
                    results[index] = Some(finished(op, Outcome::Success, None, 0));
                    progressed = true;
                } else {
                    let references = match resolve_references(op, state) {
                        Ok(references) => references,
                        Err(reason) => {
                            error!("Cannot {} {}: {reason}", op.action, op.name);
                            results[index] = Some(finished(op, Outcome::Failed, Some(reason), 0));
                            progressed = true;
                            continue;
                        }
                    };
                    in_flight.insert(index);
                    running.spawn(run_operation(
                        index,
                        op.clone(),
                        references,
                        Arc::clone(&self.provider),
                        self.retry.clone(),
                        self.operation_timeout,
                        Arc::clone(semaphore),
                        token.clone(),
                    ));
                }
            }

            *pending = still_pending;
            if !progressed {
                break;
            }
        }
    }

    /// Turns a worker's outcome into a result, persisting successful
    /// mutations. A failed save marks the operation failed.
    async fn settle(
        &self,
        op: &PlanOperation,
        outcome: TaskOutcome,
        interrupted: Option<&str>,
        tx: &mut StateTransaction<'_>,
    ) -> ExecutionResult {
        if outcome.cancelled {
            return skipped(op, interrupted.unwrap_or("cancelled"));
        }

        let provider_id = match outcome.result {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to {} {}: {e}", op.action, op.name);
                return finished(op, Outcome::Failed, Some(e.to_string()), outcome.attempts);
            }
        };

        let saved = match (op.action, &op.descriptor, provider_id) {
            (Action::Create | Action::Update, Some(descriptor), Some(id)) => {
                let record = AppliedState::from_descriptor(descriptor, &id);
                tx.record(|state| state.upsert(record)).await
            }
            (Action::Delete, _, _) => {
                let name = op.name.clone();
                tx.record(|state| {
                    state.remove(&name);
                })
                .await
            }
            _ => Ok(()),
        };

        match saved {
            Ok(()) => {
                info!("{} {} succeeded", op.action, op.name);
                finished(op, Outcome::Success, None, outcome.attempts)
            }
            Err(e) => {
                error!("Failed to persist state after {} {}: {e}", op.action, op.name);
                finished(
                    op,
                    Outcome::Failed,
                    Some(format!("state save failed: {e}")),
                    outcome.attempts,
                )
            }
        }
    }
}

/// Runs one operation: waits for a slot, then calls the provider with
/// retries and a per-call timeout.
async fn run_operation(
    index: usize,
    op: PlanOperation,
    references: Vec<ResolvedRef>,
    provider: Arc<dyn Provider>,
    retry: RetryConfig,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
) -> TaskOutcome {
    let cancelled = TaskOutcome {
        index,
        result: Ok(None),
        attempts: 0,
        cancelled: true,
    };

    let permit = tokio::select! {
        biased;
        () = token.cancelled() => return cancelled,
        permit = semaphore.acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        return cancelled;
    };
    if token.is_cancelled() {
        return cancelled;
    }

    info!("{}", op.description());
    let label = format!("{} {}", op.action, op.name);

    let (result, attempts) = match op.action {
        Action::Create => match &op.descriptor {
            Some(descriptor) => map_ok(
                retry_with_backoff(&retry, &label, || {
                    with_timeout(timeout, provider.create(descriptor, &references))
                })
                .await,
                Some,
            ),
            None => (Err(missing("descriptor")), 0),
        },
        Action::Update => match (&op.descriptor, &op.prior) {
            (Some(descriptor), Some(prior)) => {
                let id = prior.provider_id.clone();
                let attempt = retry_with_backoff(&retry, &label, || {
                    with_timeout(timeout, provider.update(&id, descriptor, &references))
                })
                .await;
                map_ok(attempt, |()| Some(id.clone()))
            }
            _ => (Err(missing("descriptor or applied record")), 0),
        },
        Action::Delete => match &op.prior {
            Some(prior) => {
                let (result, attempts) = retry_with_backoff(&retry, &label, || {
                    with_timeout(timeout, provider.delete(op.kind, &prior.provider_id))
                })
                .await;
                let result = match result {
                    Err(ProviderError::NotFound { .. }) => {
                        debug!("{} was already gone", op.name);
                        Ok(None)
                    }
                    other => other.map(|()| None),
                };
                (result, attempts)
            }
            None => (Err(missing("applied record")), 0),
        },
        Action::NoOp => (Ok(None), 0),
    };

    TaskOutcome {
        index,
        result,
        attempts,
        cancelled: false,
    }
}

/// Resolves the references of a create or update to the provider ids
/// recorded for their targets. Deletes carry none.
fn resolve_references(op: &PlanOperation, state: &AppliedStateSet) -> Result<Vec<ResolvedRef>, String> {
    let Some(descriptor) = &op.descriptor else {
        return Ok(Vec::new());
    };

    descriptor
        .references
        .iter()
        .map(|reference| {
            state
                .get(&reference.name)
                .map(|record| ResolvedRef {
                    kind: reference.kind,
                    name: reference.name.clone(),
                    provider_id: record.provider_id.clone(),
                })
                .ok_or_else(|| format!("reference '{}' has no applied record", reference.name))
        })
        .collect()
}

/// Maps the success value of a `(result, attempts)` pair.
fn map_ok<T, U>(
    (result, attempts): (Result<T, ProviderError>, u32),
    f: impl FnOnce(T) -> U,
) -> (Result<U, ProviderError>, u32) {
    (result.map(f), attempts)
}

async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(ProviderError::Timeout {
            secs: timeout.as_secs(),
        }))
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

fn missing(what: &str) -> ProviderError {
    ProviderError::InvalidResponse {
        message: format!("plan operation has no {what}"),
    }
}

fn finished(op: &PlanOperation, outcome: Outcome, error: Option<String>, attempts: u32) -> ExecutionResult {
    ExecutionResult {
        name: op.name.clone(),
        action: op.action,
        outcome,
        error,
        attempts,
    }
}

fn skipped(op: &PlanOperation, reason: &str) -> ExecutionResult {
    finished(op, Outcome::Skipped, Some(reason.to_string()), 0)
}

impl ExecutionReport {
    /// Results with the given outcome.
    pub fn with_outcome(&self, outcome: Outcome) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(move |r| r.outcome == outcome)
    }

    /// Successful operations of the given action.
    #[must_use]
    pub fn succeeded(&self, action: Action) -> usize {
        self.with_outcome(Outcome::Success)
            .filter(|r| r.action == action)
            .count()
    }

    /// Number of failed operations.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.with_outcome(Outcome::Failed).count()
    }

    /// Number of skipped operations.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.with_outcome(Outcome::Skipped).count()
    }

    /// Returns true if every operation succeeded.
    #[must_use]
    pub fn all_successful(&self) -> bool {
        self.results.iter().all(|r| r.outcome == Outcome::Success)
    }

    /// Finds the result for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} operations: {} successful, {} failed, {} skipped",
            self.results.len(),
            self.with_outcome(Outcome::Success).count(),
            self.failed(),
            self.skipped()
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}
