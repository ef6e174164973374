//! Action data model.
//!
//! An `Action` is one unit of deferred work: a hook name (which handler runs
//! it), its arguments, a schedule and a lifecycle status. Every state change
//! goes through the `mark_*` / `apply_run` methods here so all store backends
//! share one state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HookqError, Result};
use crate::schedule::Schedule;
use crate::types::{ActionStatus, FailureKind};

/// Most recent history entries kept per action.
pub const MAX_EVENTS: usize = 32;

/// Longest accepted hook or group name.
pub const MAX_NAME_LEN: usize = 191;

// ---------------------------------------------------------------------------
// ActionError / ActionEvent
// ---------------------------------------------------------------------------

/// Diagnostic payload recorded when an execution does not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ActionError {
    pub fn new(kind: FailureKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// NewAction
// ---------------------------------------------------------------------------

/// Everything a caller supplies to enqueue an action. The store assigns the
/// id and derives the first due time from the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    pub hook: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub schedule: Schedule,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Overrides the configured retry policy's `max_attempts`.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Return the existing pending/in-progress action with the same hook,
    /// args and group instead of inserting a duplicate.
    #[serde(default)]
    pub unique: bool,
}

impl NewAction {
    pub fn new(hook: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            hook: hook.into(),
            args: Vec::new(),
            schedule,
            group: None,
            priority: 0,
            max_attempts: None,
            unique: false,
        }
    }

    pub fn single(hook: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(hook, Schedule::single(at))
    }

    pub fn interval(hook: impl Into<String>, start: DateTime<Utc>, every_secs: u64) -> Self {
        Self::new(hook, Schedule::interval(start, every_secs))
    }

    pub fn cron(hook: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(hook, Schedule::cron(expression))
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: serde_json::Value) -> Self {
        self.args.push(arg);
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_hook_name(&self.hook)?;
        if let Some(group) = &self.group {
            validate_group_name(group)?;
        }
        self.schedule.validate()
    }

    /// Whether `action` is a live duplicate for unique enqueues.
    pub fn duplicates(&self, action: &Action) -> bool {
        matches!(
            action.status,
            ActionStatus::Pending | ActionStatus::InProgress
        ) && action.hook == self.hook
            && action.args == self.args
            && action.group == self.group
    }

    /// Materialize the action with a store-assigned id.
    pub fn into_action(self, id: Uuid, now: DateTime<Utc>) -> Result<Action> {
        self.validate()?;
        let next_due_at = self.schedule.first_due(now)?;
        let mut action = Action {
            id,
            hook: self.hook,
            args: self.args,
            schedule: self.schedule,
            group: self.group,
            status: ActionStatus::Pending,
            priority: self.priority,
            claim_id: None,
            attempts: 0,
            max_attempts: self.max_attempts,
            runs: 0,
            cancel_requested: false,
            last_error: None,
            created_at: now,
            next_due_at,
            started_at: None,
            completed_at: None,
            updated_at: now,
            events: Vec::new(),
        };
        action.record_event(now, format!("created, due {}", next_due_at.to_rfc3339()));
        Ok(action)
    }
}

/// Hook names must be non-empty, at most 191 chars, without whitespace or
/// control characters.
pub fn validate_hook_name(hook: &str) -> Result<()> {
    let ok = !hook.is_empty()
        && hook.len() <= MAX_NAME_LEN
        && !hook.chars().any(|c| c.is_whitespace() || c.is_control());
    if ok {
        Ok(())
    } else {
        Err(HookqError::InvalidHook(hook.to_string()))
    }
}

fn validate_group_name(group: &str) -> Result<()> {
    if group.is_empty() || group.len() > MAX_NAME_LEN || group.chars().any(|c| c.is_control()) {
        return Err(HookqError::InvalidQuery(format!(
            "invalid group name '{group}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RunTransition / CancelOutcome
// ---------------------------------------------------------------------------

/// The outcome the runner records for one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum RunTransition {
    /// The handler succeeded. `next_due` is the next occurrence for
    /// recurring schedules, `None` when the action is finished.
    Succeeded { next_due: Option<DateTime<Utc>> },
    /// The handler failed and the retry policy allows another attempt.
    Retry {
        next_due: DateTime<Utc>,
        error: ActionError,
    },
    /// The handler failed with no attempts left, or failed fatally.
    Failed { error: ActionError },
    /// Cancellation was requested before the handler started.
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// A pending action was canceled immediately.
    Canceled,
    /// The action is executing; it will not be rescheduled afterwards.
    Requested,
    /// The action was already terminal. Nothing changed.
    Unchanged,
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub hook: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub schedule: Schedule,
    #[serde(default)]
    pub group: Option<String>,
    pub status: ActionStatus,
    #[serde(default)]
    pub priority: i32,
    /// The claim currently holding this action. Written by the claim
    /// protocol, cleared when the run outcome is recorded.
    #[serde(default)]
    pub claim_id: Option<Uuid>,
    /// Consecutive failed attempts. Reset by a successful run.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Successful executions.
    #[serde(default)]
    pub runs: u32,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub last_error: Option<ActionError>,
    pub created_at: DateTime<Utc>,
    pub next_due_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<ActionEvent>,
}

impl Action {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Pending && self.next_due_at <= now
    }

    pub fn record_event(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.events.push(ActionEvent {
            at,
            message: message.into(),
        });
        if self.events.len() > MAX_EVENTS {
            let excess = self.events.len() - MAX_EVENTS;
            self.events.drain(..excess);
        }
    }

    /// Case-insensitive substring match over hook, group, args and last error.
    /// `needle` must already be lowercase.
    pub fn matches_search(&self, needle: &str) -> bool {
        if self.hook.to_lowercase().contains(needle) {
            return true;
        }
        if let Some(group) = &self.group {
            if group.to_lowercase().contains(needle) {
                return true;
            }
        }
        if let Some(err) = &self.last_error {
            if err.message.to_lowercase().contains(needle) {
                return true;
            }
        }
        serde_json::to_string(&self.args)
            .map(|s| s.to_lowercase().contains(needle))
            .unwrap_or(false)
    }

    pub(crate) fn mark_claimed(&mut self, claim_id: Uuid, now: DateTime<Utc>) {
        self.status = ActionStatus::InProgress;
        self.claim_id = Some(claim_id);
        self.started_at = Some(now);
        self.updated_at = now;
        self.record_event(now, format!("claimed by {claim_id}"));
    }

    /// Return an unexecuted in-progress action to the queue.
    pub(crate) fn mark_released(&mut self, now: DateTime<Utc>) {
        self.claim_id = None;
        self.updated_at = now;
        if self.cancel_requested {
            self.status = ActionStatus::Canceled;
            self.completed_at = Some(now);
            self.record_event(now, "canceled on release");
        } else {
            self.status = ActionStatus::Pending;
            self.record_event(now, "released back to pending");
        }
    }

    /// The holding claim expired without an outcome being recorded.
    pub(crate) fn mark_abandoned(&mut self, claim_id: Uuid, now: DateTime<Utc>) {
        self.last_error = Some(ActionError::new(
            FailureKind::Abandoned,
            format!("claim {claim_id} expired before the run was recorded"),
            now,
        ));
        self.claim_id = None;
        self.updated_at = now;
        if self.cancel_requested {
            self.status = ActionStatus::Canceled;
            self.completed_at = Some(now);
            self.record_event(now, format!("claim {claim_id} expired; canceled"));
        } else {
            self.status = ActionStatus::Pending;
            self.record_event(now, format!("claim {claim_id} expired; reclaimed"));
        }
    }

    pub(crate) fn request_cancel(&mut self, now: DateTime<Utc>) -> CancelOutcome {
        match self.status {
            ActionStatus::Pending => {
                self.status = ActionStatus::Canceled;
                self.cancel_requested = true;
                self.completed_at = Some(now);
                self.updated_at = now;
                self.record_event(now, "canceled");
                CancelOutcome::Canceled
            }
            ActionStatus::InProgress => {
                if !self.cancel_requested {
                    self.cancel_requested = true;
                    self.updated_at = now;
                    self.record_event(now, "cancel requested while in progress");
                }
                CancelOutcome::Requested
            }
            ActionStatus::Complete | ActionStatus::Failed | ActionStatus::Canceled => {
                CancelOutcome::Unchanged
            }
        }
    }

    pub(crate) fn apply_run(&mut self, transition: RunTransition, now: DateTime<Utc>) {
        self.claim_id = None;
        self.updated_at = now;
        match transition {
            RunTransition::Succeeded { next_due } => {
                self.runs += 1;
                self.attempts = 0;
                match next_due {
                    Some(_) if self.cancel_requested => {
                        self.status = ActionStatus::Canceled;
                        self.completed_at = Some(now);
                        self.record_event(now, "completed; canceled instead of rescheduling");
                    }
                    Some(due) => {
                        self.status = ActionStatus::Pending;
                        self.next_due_at = due;
                        self.record_event(now, format!("completed; next run {}", due.to_rfc3339()));
                    }
                    None => {
                        self.status = ActionStatus::Complete;
                        self.completed_at = Some(now);
                        self.record_event(now, "completed");
                    }
                }
            }
            RunTransition::Retry { next_due, error } => {
                self.attempts += 1;
                if self.cancel_requested {
                    self.status = ActionStatus::Canceled;
                    self.completed_at = Some(now);
                    self.record_event(now, format!("{}; canceled instead of retrying", error.kind));
                } else {
                    self.status = ActionStatus::Pending;
                    self.next_due_at = next_due;
                    self.record_event(
                        now,
                        format!(
                            "attempt {} failed ({}); retry at {}",
                            self.attempts,
                            error.kind,
                            next_due.to_rfc3339()
                        ),
                    );
                }
                self.last_error = Some(error);
            }
            RunTransition::Failed { error } => {
                self.attempts += 1;
                self.status = ActionStatus::Failed;
                self.completed_at = Some(now);
                self.record_event(
                    now,
                    format!("attempt {} failed ({}); giving up", self.attempts, error.kind),
                );
                self.last_error = Some(error);
            }
            RunTransition::Canceled => {
                self.status = ActionStatus::Canceled;
                self.completed_at = Some(now);
                self.record_event(now, "canceled before execution");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn pending(new_action: NewAction) -> Action {
        new_action.into_action(Uuid::new_v4(), t0()).unwrap()
    }

    #[test]
    fn new_action_is_pending_at_first_due() {
        let a = pending(NewAction::single("send-mail", t0() + Duration::minutes(5)));
        assert_eq!(a.status, ActionStatus::Pending);
        assert_eq!(a.next_due_at, t0() + Duration::minutes(5));
        assert!(!a.is_due(t0()));
        assert!(a.is_due(t0() + Duration::minutes(5)));
        assert_eq!(a.events.len(), 1);
    }

    #[test]
    fn hook_names_are_validated() {
        assert!(validate_hook_name("woocommerce_cleanup_sessions").is_ok());
        assert!(validate_hook_name("").is_err());
        assert!(validate_hook_name("has space").is_err());
        assert!(validate_hook_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        let err = NewAction::single("bad hook", t0())
            .into_action(Uuid::new_v4(), t0())
            .unwrap_err();
        assert!(matches!(err, HookqError::InvalidHook(_)));
    }

    #[test]
    fn cancel_pending_then_again_is_unchanged() {
        let mut a = pending(NewAction::single("h", t0()));
        assert_eq!(a.request_cancel(t0()), CancelOutcome::Canceled);
        assert_eq!(a.status, ActionStatus::Canceled);
        let before = a.clone();
        assert_eq!(a.request_cancel(t0() + Duration::seconds(5)), CancelOutcome::Unchanged);
        assert_eq!(a, before);
    }

    #[test]
    fn cancel_in_progress_prevents_reschedule() {
        let mut a = pending(NewAction::interval("h", t0(), 60));
        a.mark_claimed(Uuid::new_v4(), t0());
        assert_eq!(a.request_cancel(t0()), CancelOutcome::Requested);
        assert_eq!(a.status, ActionStatus::InProgress);
        a.apply_run(
            RunTransition::Succeeded {
                next_due: Some(t0() + Duration::seconds(60)),
            },
            t0(),
        );
        assert_eq!(a.status, ActionStatus::Canceled);
        assert_eq!(a.runs, 1);
        assert!(a.claim_id.is_none());
    }

    #[test]
    fn retry_then_fail_counts_attempts() {
        let mut a = pending(NewAction::single("h", t0()));
        let err = ActionError::new(FailureKind::HandlerFailure, "boom", t0());
        a.mark_claimed(Uuid::new_v4(), t0());
        a.apply_run(
            RunTransition::Retry {
                next_due: t0() + Duration::seconds(30),
                error: err.clone(),
            },
            t0(),
        );
        assert_eq!(a.status, ActionStatus::Pending);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.next_due_at, t0() + Duration::seconds(30));

        a.mark_claimed(Uuid::new_v4(), t0());
        a.apply_run(RunTransition::Failed { error: err }, t0());
        assert_eq!(a.status, ActionStatus::Failed);
        assert_eq!(a.attempts, 2);
        assert_eq!(a.last_error.as_ref().unwrap().message, "boom");
        assert!(a.completed_at.is_some());
    }

    #[test]
    fn success_resets_attempts() {
        let mut a = pending(NewAction::interval("h", t0(), 60));
        a.attempts = 2;
        a.mark_claimed(Uuid::new_v4(), t0());
        a.apply_run(
            RunTransition::Succeeded {
                next_due: Some(t0() + Duration::seconds(60)),
            },
            t0(),
        );
        assert_eq!(a.attempts, 0);
        assert_eq!(a.status, ActionStatus::Pending);
    }

    #[test]
    fn abandoned_records_error_without_attempt() {
        let mut a = pending(NewAction::single("h", t0()));
        let claim = Uuid::new_v4();
        a.mark_claimed(claim, t0());
        a.mark_abandoned(claim, t0() + Duration::minutes(10));
        assert_eq!(a.status, ActionStatus::Pending);
        assert_eq!(a.attempts, 0);
        assert_eq!(a.last_error.as_ref().unwrap().kind, FailureKind::Abandoned);
    }

    #[test]
    fn event_history_is_bounded() {
        let mut a = pending(NewAction::single("h", t0()));
        for i in 0..100 {
            a.record_event(t0(), format!("event {i}"));
        }
        assert_eq!(a.events.len(), MAX_EVENTS);
        assert_eq!(a.events.last().unwrap().message, "event 99");
    }

    #[test]
    fn search_covers_args_and_group() {
        let a = pending(
            NewAction::single("Send-Invoice", t0())
                .with_arg(json!({"order": 4417}))
                .in_group("billing"),
        );
        assert!(a.matches_search("send-inv"));
        assert!(a.matches_search("4417"));
        assert!(a.matches_search("bill"));
        assert!(!a.matches_search("shipping"));
    }

    #[test]
    fn duplicates_requires_live_status() {
        let new_action = NewAction::single("h", t0()).with_arg(json!(1));
        let mut a = pending(new_action.clone());
        assert!(new_action.duplicates(&a));
        a.request_cancel(t0());
        assert!(!new_action.duplicates(&a));
    }
}
