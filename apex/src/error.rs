//! The error taxonomy surfaced at every component boundary.

use thiserror::Error;

/// A user-visible failure: kind, message, and an optional hint/remediation
/// sentence, per the error handling design.
#[derive(Debug, Error)]
pub enum ApexError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("resource unavailable: {message}")]
    ResourceUnavailable { message: String },

    #[error("external provider failed: {message}")]
    ExternalProvider { message: String },

    #[error("budget exceeded: {message}")]
    BudgetExceeded { message: String },

    #[error("session limit reached: {message}")]
    SessionLimitReached { message: String },

    #[error("illegal state: {message}")]
    IllegalState { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("duplicate: {message}")]
    Duplicate { message: String },

    #[error("internal invariant violated: {message}")]
    InternalInvariant { message: String },
}

impl ApexError {
    /// A human-readable remediation sentence, where one applies. Not every
    /// kind has a generic remediation; callers building max-resume-attempts
    /// or similar messages attach their own detail to `message` instead.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ApexError::Configuration { .. } => Some("check config.yaml for missing or malformed fields"),
            ApexError::ResourceUnavailable { .. } => Some("check disk space and permissions on .apex/"),
            ApexError::ExternalProvider { .. } => Some("the task will be retried up to its retry limit"),
            ApexError::SessionLimitReached { .. } => Some("the task has been checkpointed and paused for resume"),
            ApexError::InternalInvariant { .. } => Some("this is a bug; please report it with the task id"),
            _ => None,
        }
    }

    /// Whether this error kind should fail the task outright rather than be
    /// recovered via retry/resume/pause.
    pub fn is_fatal_to_task(&self) -> bool {
        matches!(
            self,
            ApexError::BudgetExceeded { .. } | ApexError::IllegalState { .. } | ApexError::InternalInvariant { .. }
        )
    }
}

impl From<crate::store::StoreError> for ApexError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError as SE;
        match err {
            SE::NotFound(msg) => ApexError::NotFound { message: msg },
            SE::Duplicate(msg) => ApexError::Duplicate { message: msg },
            SE::IllegalState(msg) => ApexError::IllegalState { message: msg },
            SE::Backend(msg) => ApexError::ResourceUnavailable { message: msg },
            SE::Channel(msg) => ApexError::InternalInvariant { message: msg },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_and_illegal_state_are_fatal_to_task() {
        assert!(ApexError::BudgetExceeded { message: "x".into() }.is_fatal_to_task());
        assert!(ApexError::IllegalState { message: "x".into() }.is_fatal_to_task());
        assert!(!ApexError::ExternalProvider { message: "x".into() }.is_fatal_to_task());
    }

    #[test]
    fn configuration_errors_have_a_hint() {
        assert!(ApexError::Configuration { message: "x".into() }.hint().is_some());
        assert!(ApexError::NotFound { message: "x".into() }.hint().is_none());
    }
}
