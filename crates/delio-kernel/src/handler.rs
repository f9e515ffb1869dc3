use std::sync::Arc;

use async_trait::async_trait;
use delio_core::{ErrorKind, ExecutionContext, GuardError, HandlerError, State};

/// One stage of the cognitive cycle: given the context, produce the next
/// state. Side effects must be preceded by `StateGuard::assert_allowed`.
#[async_trait]
pub trait StateHandler: Send + Sync {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError>;
}

/// Adapts a plain function into a handler. Mostly useful for tests and
/// small routing stages.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> StateHandler for FnHandler<F>
where
    F: Fn(&mut ExecutionContext) -> Result<State, HandlerError> + Send + Sync,
{
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        (self.0)(ctx)
    }
}

/// Handler that always returns the same state.
pub fn fixed(next: State) -> Arc<dyn StateHandler> {
    Arc::new(FnHandler(move |_: &mut ExecutionContext| -> Result<State, HandlerError> { Ok(next) }))
}

/// Context error classification for a handler failure.
pub(crate) fn error_kind_of(err: &HandlerError) -> ErrorKind {
    match err {
        HandlerError::Guard(GuardError::IllegalTransition { .. }) => ErrorKind::IllegalTransition,
        HandlerError::Guard(GuardError::PermissionDenied { .. }) => ErrorKind::PermissionDenied,
        HandlerError::Guard(GuardError::LockTimeout { .. }) => ErrorKind::LockTimeout,
        HandlerError::Guard(GuardError::CapacityExceeded { .. }) => ErrorKind::CapacityExceeded,
        HandlerError::Collaborator(_) => ErrorKind::Collaborator,
        HandlerError::Internal(_) => ErrorKind::HandlerFailure,
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
