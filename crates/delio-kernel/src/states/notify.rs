use async_trait::async_trait;
use delio_core::{Action, ErrorKind, ExecutionContext, HandlerError, State};
use tracing::{info, warn};

use super::HandlerDeps;
use crate::handler::StateHandler;

/// Pushes a reminder to the user outside the conversational cycle.
pub struct NotifyHandler {
    deps: HandlerDeps,
}

impl NotifyHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StateHandler for NotifyHandler {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        self.deps.allow(ctx, Action::SystemNotification)?;
        self.deps.allow(ctx, Action::Network)?;

        if ctx.raw_input.trim().is_empty() {
            ctx.record_error(ErrorKind::EmptyInput, Some(State::Notify), "empty reminder");
            return Ok(State::Error);
        }
        match self.deps.collaborators.delivery.send(ctx.user_id, &ctx.raw_input).await {
            Ok(()) => {
                info!(user_id = %ctx.user_id, "reminder delivered");
                ctx.sent_response = true;
                Ok(State::Idle)
            }
            Err(e) => {
                warn!(user_id = %ctx.user_id, error = %e, "reminder delivery failed");
                ctx.record_error(
                    ErrorKind::Collaborator,
                    Some(State::Notify),
                    format!("failed to deliver reminder: {e}"),
                );
                Ok(State::Error)
            }
        }
    }
}
