use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HookqError {
    #[error("not initialized: run 'hookq init'")]
    NotInitialized,

    #[error("action not found: {0}")]
    ActionNotFound(Uuid),

    #[error("claim not found: {0}")]
    ClaimNotFound(Uuid),

    #[error("action {action} is no longer held by claim {claim}")]
    StaleClaim { action: Uuid, claim: Uuid },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid hook name '{0}'")]
    InvalidHook(String),

    #[error("no handler registered for hook '{0}'")]
    UnknownHandler(String),

    #[error("handler already registered for hook '{0}'")]
    HandlerExists(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HookqError {
    /// Transient failures a caller may retry. Everything else is a caller or
    /// deployment bug.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HookqError::Storage(_))
    }
}

/// Wrap any backend error as a retryable [`HookqError::Storage`].
pub(crate) fn storage(e: impl std::fmt::Display) -> HookqError {
    HookqError::Storage(e.to_string())
}

pub type Result<T> = std::result::Result<T, HookqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_is_retryable() {
        assert!(HookqError::Storage("locked".into()).is_retryable());
        assert!(!HookqError::InvalidQuery("bad".into()).is_retryable());
        assert!(!HookqError::ActionNotFound(Uuid::nil()).is_retryable());
        assert!(!HookqError::UnknownHandler("x".into()).is_retryable());
    }

    #[test]
    fn messages_name_the_subject() {
        let id = Uuid::nil();
        let msg = HookqError::ActionNotFound(id).to_string();
        assert!(msg.contains(&id.to_string()));
        assert_eq!(
            HookqError::UnknownHandler("send-mail".into()).to_string(),
            "no handler registered for hook 'send-mail'"
        );
    }
}
