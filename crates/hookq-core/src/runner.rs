//! Executes claimed actions.
//!
//! Actions run one at a time in claim order. Each outcome is persisted with
//! `record_run` before the next action starts, so a crash loses at most the
//! action that was executing (which lease expiry then recovers).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::action::{Action, ActionError, RunTransition};
use crate::claim::Claim;
use crate::clock::Clock;
use crate::error::HookqError;
use crate::handler::{CancelFlag, Handler, HandlerContext, HandlerRegistry};
use crate::retry::RetryPolicy;
use crate::store::{check_held, ActionStore};
use crate::types::{ActionStatus, FailureKind};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Rescheduled { next_due: DateTime<Utc> },
    Retrying { attempt: u32, next_due: DateTime<Utc> },
    Failed { error: String },
    Canceled,
    /// Not executed, or the outcome could not be recorded.
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub action_id: Uuid,
    pub hook: String,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

/// Actions whose handler task is still running, including ones that
/// outlived their budget. Clones share one set, so every scheduler in a
/// process can exclude what any of them is still executing.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<Mutex<HashSet<Uuid>>>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashSet<Uuid> {
        self.lock().clone()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.lock().contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, id: Uuid) -> InFlightGuard {
        self.lock().insert(id);
        InFlightGuard {
            set: self.clone(),
            id,
        }
    }
}

/// Removes its id from the in-flight set when the handler task ends,
/// including by panic.
struct InFlightGuard {
    set: InFlight,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct Runner {
    store: Arc<dyn ActionStore>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    default_budget: Duration,
    in_flight: InFlight,
}

impl Runner {
    pub fn new(
        store: Arc<dyn ActionStore>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        default_budget: Duration,
    ) -> Self {
        Self {
            store,
            handlers,
            clock,
            retry,
            default_budget,
            in_flight: InFlight::new(),
        }
    }

    /// Track running handlers in `in_flight` instead of a private set.
    pub fn with_in_flight(mut self, in_flight: InFlight) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// Actions whose handler is still running. A worker must not claim these
    /// again.
    pub fn in_flight(&self) -> HashSet<Uuid> {
        self.in_flight.snapshot()
    }

    pub async fn run(&self, claim: &Claim) -> Vec<ActionResult> {
        let lease = claim.expires_at - claim.created_at;
        let mut results = Vec::with_capacity(claim.len());
        for (i, id) in claim.action_ids.iter().enumerate() {
            if i > 0 {
                self.renew(claim.id, lease);
            }
            results.push(self.run_one(claim.id, *id).await);
        }
        results
    }

    /// Give the next action a full lease; the batch runs sequentially, so the
    /// original expiry only covers the first one.
    fn renew(&self, claim_id: Uuid, lease: chrono::Duration) {
        let Some(until) = self.clock.now().checked_add_signed(lease) else {
            return;
        };
        match self.store.renew_claim(claim_id, until) {
            Ok(_) => {}
            Err(HookqError::ClaimNotFound(_)) => {
                tracing::warn!(%claim_id, "claim was reclaimed mid-batch; remaining actions will be skipped");
            }
            Err(e) => {
                tracing::warn!(%claim_id, error = %e, "failed to renew claim");
            }
        }
    }

    async fn run_one(&self, claim_id: Uuid, id: Uuid) -> ActionResult {
        let started = Instant::now();
        let action = match self.store.get(id) {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(action_id = %id, error = %e, "claimed action could not be loaded");
                return finish(id, String::new(), RunOutcome::Skipped { reason: e.to_string() }, started);
            }
        };
        if check_held(&action, claim_id).is_err() {
            tracing::debug!(action_id = %id, %claim_id, "action no longer held by this claim");
            return finish(
                id,
                action.hook,
                RunOutcome::Skipped {
                    reason: "no longer held by this claim".into(),
                },
                started,
            );
        }

        let transition = if action.cancel_requested {
            RunTransition::Canceled
        } else {
            match self.handlers.get(&action.hook) {
                Some(handler) => self.execute(&action, handler).await,
                None => {
                    tracing::error!(action_id = %id, hook = %action.hook, "no handler registered");
                    RunTransition::Failed {
                        error: ActionError::new(
                            FailureKind::UnknownHandler,
                            format!("no handler registered for hook '{}'", action.hook),
                            self.clock.now(),
                        ),
                    }
                }
            }
        };

        let outcome = self.record(&action, claim_id, transition);
        finish(id, action.hook, outcome, started)
    }

    /// Run the handler under its budget and decide the transition.
    async fn execute(&self, action: &Action, handler: Arc<dyn Handler>) -> RunTransition {
        let attempt = action.attempts + 1;
        let budget = self
            .handlers
            .budget(&action.hook)
            .unwrap_or(self.default_budget);
        let ctx = HandlerContext {
            action_id: action.id,
            hook: action.hook.clone(),
            args: action.args.clone(),
            attempt,
            group: action.group.clone(),
            cancel: CancelFlag::new(),
        };
        tracing::debug!(action_id = %action.id, hook = %action.hook, attempt, "executing");

        let result = self.invoke(handler, ctx, budget).await;
        let now = self.clock.now();
        match result {
            Ok(_) => {
                let next_due = if action.schedule.is_recurring() {
                    action.schedule.next_after(now.max(action.next_due_at))
                } else {
                    None
                };
                RunTransition::Succeeded { next_due }
            }
            Err((kind, message)) => {
                let error = ActionError::new(kind, message, now);
                let retry_at = self
                    .retry
                    .should_retry(attempt, action.max_attempts)
                    .then(|| now.checked_add_signed(self.retry.delay(attempt)))
                    .flatten();
                match retry_at {
                    Some(next_due) => RunTransition::Retry { next_due, error },
                    None => RunTransition::Failed { error },
                }
            }
        }
    }

    /// Spawn the handler and wait at most `budget`. On timeout the cancel
    /// flag is raised but the task keeps running; its id stays in the
    /// in-flight set until it really ends.
    async fn invoke(
        &self,
        handler: Arc<dyn Handler>,
        ctx: HandlerContext,
        budget: Duration,
    ) -> std::result::Result<Value, (FailureKind, String)> {
        let id = ctx.action_id;
        let cancel = ctx.cancel.clone();
        let guard = self.in_flight.enter(id);
        let task = tokio::spawn(async move {
            let _guard = guard;
            handler.call(ctx).await
        });

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err((FailureKind::HandlerFailure, e.message)),
            Ok(Err(join)) => {
                let message = if join.is_panic() {
                    format!("handler panicked: {}", panic_message(join.into_panic()))
                } else {
                    "handler task was cancelled".to_string()
                };
                Err((FailureKind::HandlerFailure, message))
            }
            Err(_) => {
                cancel.raise();
                tracing::warn!(action_id = %id, budget_secs = budget.as_secs_f64(), "handler exceeded its execution budget");
                Err((
                    FailureKind::HandlerTimeout,
                    format!("exceeded execution budget of {:.1}s", budget.as_secs_f64()),
                ))
            }
        }
    }

    fn record(&self, action: &Action, claim_id: Uuid, transition: RunTransition) -> RunOutcome {
        let now = self.clock.now();
        match self.store.record_run(action.id, claim_id, transition, now) {
            Ok(updated) => {
                let outcome = outcome_of(&updated);
                log_outcome(&updated, &outcome);
                outcome
            }
            Err(HookqError::StaleClaim { .. }) => {
                tracing::warn!(
                    action_id = %action.id,
                    %claim_id,
                    "claim expired before the outcome was recorded; discarding it"
                );
                RunOutcome::Skipped {
                    reason: "claim expired before the outcome was recorded".into(),
                }
            }
            Err(e) => {
                tracing::error!(action_id = %action.id, error = %e, "failed to record run");
                RunOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }
}

fn finish(action_id: Uuid, hook: String, outcome: RunOutcome, started: Instant) -> ActionResult {
    ActionResult {
        action_id,
        hook,
        outcome,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// A successful run resets `attempts`, a retry leaves it above zero.
fn outcome_of(action: &Action) -> RunOutcome {
    match action.status {
        ActionStatus::Complete => RunOutcome::Completed,
        ActionStatus::Canceled => RunOutcome::Canceled,
        ActionStatus::Failed => RunOutcome::Failed {
            error: action
                .last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default(),
        },
        ActionStatus::Pending if action.attempts > 0 => RunOutcome::Retrying {
            attempt: action.attempts,
            next_due: action.next_due_at,
        },
        ActionStatus::Pending => RunOutcome::Rescheduled {
            next_due: action.next_due_at,
        },
        ActionStatus::InProgress => RunOutcome::Skipped {
            reason: "still in progress after recording".into(),
        },
    }
}

fn log_outcome(action: &Action, outcome: &RunOutcome) {
    let id = action.id;
    let hook = action.hook.as_str();
    match outcome {
        RunOutcome::Completed => tracing::info!(action_id = %id, hook, "action complete"),
        RunOutcome::Rescheduled { next_due } => {
            tracing::info!(action_id = %id, hook, next_due = %next_due, "recurring action rescheduled")
        }
        RunOutcome::Retrying { attempt, next_due } => {
            tracing::warn!(action_id = %id, hook, attempt, next_due = %next_due, "action failed; retry scheduled")
        }
        RunOutcome::Failed { error } => {
            tracing::warn!(action_id = %id, hook, attempts = action.attempts, error = %error, "action failed")
        }
        RunOutcome::Canceled => tracing::info!(action_id = %id, hook, "action canceled"),
        RunOutcome::Skipped { reason } => tracing::debug!(action_id = %id, hook, reason = %reason, "action skipped"),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
