use async_trait::async_trait;
use delio_core::{Action, ErrorKind, ExecutionContext, HandlerError, State};
use tracing::{error, warn};

use super::HandlerDeps;
use crate::handler::StateHandler;

pub const GENERIC_NOTICE: &str =
    "Sorry, something went wrong while handling your message. Please try again.";
pub const TIMEOUT_NOTICE: &str = "Sorry, that took too long and I had to stop. Please try again.";
pub const CRITIC_NOTICE: &str = "I drafted an answer but my review flagged it as unreliable, \
     so I held it back. Could you rephrase?";

/// Recovery stage: logs what went wrong, tells the user when someone is
/// waiting on an answer, and always returns to IDLE.
pub struct ErrorHandler {
    deps: HandlerDeps,
}

impl ErrorHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

fn notice_for(ctx: &ExecutionContext) -> &'static str {
    if ctx.timed_out || ctx.has_error(ErrorKind::CycleTimeout) {
        TIMEOUT_NOTICE
    } else if ctx.has_error(ErrorKind::CriticRejected) {
        CRITIC_NOTICE
    } else {
        GENERIC_NOTICE
    }
}

#[async_trait]
impl StateHandler for ErrorHandler {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        for err in ctx.errors() {
            error!(
                user_id = %ctx.user_id,
                trace_id = %ctx.trace_id,
                kind = err.kind.as_str(),
                state = ?err.state,
                "{}",
                err.message
            );
        }
        if ctx.sent_response || ctx.event_type.is_background() {
            return Ok(State::Idle);
        }

        self.deps.allow(ctx, Action::Network)?;
        match self.deps.collaborators.delivery.send(ctx.user_id, notice_for(ctx)).await {
            Ok(()) => ctx.sent_response = true,
            Err(e) => warn!(user_id = %ctx.user_id, error = %e, "could not deliver error notice"),
        }
        Ok(State::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::test_support::{deps_in, message};
    use delio_core::mock::MockSet;
    use delio_core::{KernelEvent, UserId};

    async fn run(mut ctx: ExecutionContext) -> (MockSet, ExecutionContext) {
        let mocks = MockSet::default();
        let handler = ErrorHandler::new(deps_in(&mocks, State::Error, &ctx).await);
        assert_eq!(handler.execute(&mut ctx).await.unwrap(), State::Idle);
        (mocks, ctx)
    }

    #[tokio::test]
    async fn generic_notice() {
        let mut ctx = message("hi");
        ctx.record_error(ErrorKind::HandlerFailure, Some(State::Plan), "boom");
        let (mocks, ctx) = run(ctx).await;
        assert_eq!(mocks.delivery.sent_to(UserId::new(1)), vec![GENERIC_NOTICE.to_string()]);
        assert!(ctx.sent_response);
    }

    #[tokio::test]
    async fn timeout_notice() {
        let mut ctx = message("hi");
        ctx.timed_out = true;
        let (mocks, _) = run(ctx).await;
        assert_eq!(mocks.delivery.sent_to(UserId::new(1)), vec![TIMEOUT_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn critic_notice() {
        let mut ctx = message("hi");
        ctx.record_error(ErrorKind::CriticRejected, Some(State::Plan), "Critic rejected: vague");
        let (mocks, _) = run(ctx).await;
        assert_eq!(mocks.delivery.sent_to(UserId::new(1)), vec![CRITIC_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn silent_for_heartbeats_and_answered_turns() {
        let (mocks, _) = run(ExecutionContext::from_event(&KernelEvent::heartbeat(1))).await;
        assert!(mocks.delivery.sent().is_empty());

        let mut answered = message("hi");
        answered.sent_response = true;
        let (mocks, _) = run(answered).await;
        assert!(mocks.delivery.sent().is_empty());
    }
}
