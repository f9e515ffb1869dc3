use async_trait::async_trait;
use delio_core::collaborators::Interaction;
use delio_core::{Action, ErrorKind, ExecutionContext, HandlerError, State};
use tracing::warn;

use super::HandlerDeps;
use crate::handler::StateHandler;

/// Persists the finished turn and any lessons from reflection.
pub struct MemoryWriteHandler {
    deps: HandlerDeps,
}

impl MemoryWriteHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StateHandler for MemoryWriteHandler {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        self.deps.allow(ctx, Action::MemoryWrite)?;
        let memory = &self.deps.collaborators.memory;

        let interaction = Interaction {
            trace_id: ctx.trace_id.clone(),
            event_type: ctx.event_type,
            user_input: ctx.raw_input.clone(),
            response: ctx.response.clone(),
        };
        if let Err(e) = memory.append_interaction(ctx.user_id, interaction).await {
            warn!(user_id = %ctx.user_id, error = %e, "failed to store interaction");
            ctx.record_error(
                ErrorKind::Collaborator,
                Some(State::MemoryWrite),
                format!("failed to store interaction: {e}"),
            );
        }

        for lesson in ctx.lessons.clone() {
            if let Err(e) = memory.record_lesson(ctx.user_id, &lesson).await {
                warn!(user_id = %ctx.user_id, error = %e, "failed to store lesson");
                ctx.record_error(
                    ErrorKind::Collaborator,
                    Some(State::MemoryWrite),
                    format!("failed to store lesson: {e}"),
                );
            }
        }
        Ok(State::Idle)
    }
}
