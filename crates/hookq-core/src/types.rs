use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an action.
///
/// Transitions: `Pending → InProgress → Complete | Failed | Canceled`, with
/// `InProgress → Pending` for recurring actions, retries, released claims and
/// reclaimed (abandoned) claims. `Pending → Canceled` on explicit cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Canceled,
}

impl ActionStatus {
    pub fn all() -> &'static [ActionStatus] {
        &[
            ActionStatus::Pending,
            ActionStatus::InProgress,
            ActionStatus::Complete,
            ActionStatus::Failed,
            ActionStatus::Canceled,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InProgress => "in-progress",
            ActionStatus::Complete => "complete",
            ActionStatus::Failed => "failed",
            ActionStatus::Canceled => "canceled",
        }
    }

    /// Single-byte tag used as the leading byte of the due index key.
    pub fn tag(self) -> u8 {
        match self {
            ActionStatus::Pending => 0,
            ActionStatus::InProgress => 1,
            ActionStatus::Complete => 2,
            ActionStatus::Failed => 3,
            ActionStatus::Canceled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Complete | ActionStatus::Failed | ActionStatus::Canceled
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = crate::error::HookqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "in-progress" | "in_progress" | "running" => Ok(ActionStatus::InProgress),
            "complete" | "completed" => Ok(ActionStatus::Complete),
            "failed" => Ok(ActionStatus::Failed),
            "canceled" | "cancelled" => Ok(ActionStatus::Canceled),
            _ => Err(crate::error::HookqError::InvalidQuery(format!(
                "unknown status '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Why an execution did not succeed. Recorded on the action, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No handler is registered for the hook. Terminal, never retried.
    UnknownHandler,
    /// The handler returned an error or panicked.
    HandlerFailure,
    /// The handler exceeded its execution budget.
    HandlerTimeout,
    /// The claim holding the action expired before an outcome was recorded.
    Abandoned,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::UnknownHandler => "unknown_handler",
            FailureKind::HandlerFailure => "handler_failure",
            FailureKind::HandlerTimeout => "handler_timeout",
            FailureKind::Abandoned => "abandoned",
        }
    }

    /// Whether the retry policy applies to this kind of failure.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::HandlerFailure | FailureKind::HandlerTimeout
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        for status in ActionStatus::all() {
            let parsed: ActionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, *status);
        }
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&ActionStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn unknown_status_is_invalid_query() {
        let err = "sleeping".parse::<ActionStatus>().unwrap_err();
        assert!(matches!(err, crate::error::HookqError::InvalidQuery(_)));
    }

    #[test]
    fn tags_are_distinct() {
        let mut tags: Vec<u8> = ActionStatus::all().iter().map(|s| s.tag()).collect();
        tags.dedup();
        assert_eq!(tags.len(), ActionStatus::all().len());
    }

    #[test]
    fn only_handler_failures_are_retryable() {
        assert!(FailureKind::HandlerFailure.is_retryable());
        assert!(FailureKind::HandlerTimeout.is_retryable());
        assert!(!FailureKind::UnknownHandler.is_retryable());
        assert!(!FailureKind::Abandoned.is_retryable());
    }
}
