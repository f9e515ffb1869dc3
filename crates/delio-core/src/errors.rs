use std::time::Duration;

use crate::ids::UserId;
use crate::state::{Action, State};

/// Violations detected by the state guard.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    // Handler defects, escalated to the operator channel
    #[error("illegal transition for user {user_id}: {from} -> {to}")]
    IllegalTransition { user_id: UserId, from: State, to: State },
    #[error("permission denied for user {user_id}: {action} not allowed in {state}")]
    PermissionDenied { user_id: UserId, action: Action, state: State },

    // Operational
    #[error("transition lock for user {user_id} not acquired within {waited:?}")]
    LockTimeout { user_id: UserId, waited: Duration },
    #[error("tracked user limit of {limit} reached and no idle entry is evictable")]
    CapacityExceeded { limit: usize },
}

impl GuardError {
    /// Defects in handler code rather than transient conditions.
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::IllegalTransition { .. } | Self::PermissionDenied { .. })
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
        }
    }
}

/// Failures reported by external collaborators (memory, model, tools, delivery).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    Invalid(String),
}

impl CollaboratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Rejected(_) => "rejected",
            Self::Invalid(_) => "invalid",
        }
    }
}

/// Error raised out of a state handler. The controller converts every
/// variant into a context error and routes the cycle to `Error`.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Guard(e) => e.error_kind(),
            Self::Collaborator(_) => "collaborator",
            Self::Internal(_) => "handler_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_violation_classification() {
        let illegal = GuardError::IllegalTransition {
            user_id: UserId::new(1),
            from: State::Plan,
            to: State::Act,
        };
        assert!(illegal.is_violation());
        assert_eq!(illegal.error_kind(), "illegal_transition");

        let timeout = GuardError::LockTimeout {
            user_id: UserId::new(1),
            waited: Duration::from_millis(5),
        };
        assert!(!timeout.is_violation());
    }

    #[test]
    fn guard_error_display() {
        let denied = GuardError::PermissionDenied {
            user_id: UserId::new(4),
            action: Action::Network,
            state: State::Plan,
        };
        assert_eq!(
            denied.to_string(),
            "permission denied for user 4: NETWORK not allowed in PLAN"
        );
    }

    #[test]
    fn collaborator_retryable() {
        assert!(CollaboratorError::Unavailable("down".into()).is_retryable());
        assert!(CollaboratorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CollaboratorError::Rejected("no".into()).is_retryable());
        assert!(!CollaboratorError::Invalid("bad json".into()).is_retryable());
    }

    #[test]
    fn handler_error_from_guard_keeps_kind() {
        let err: HandlerError = GuardError::CapacityExceeded { limit: 3 }.into();
        assert_eq!(err.error_kind(), "capacity_exceeded");
        let err: HandlerError = CollaboratorError::Rejected("x".into()).into();
        assert_eq!(err.error_kind(), "collaborator");
        assert_eq!(err.to_string(), "request rejected: x");
    }
}
