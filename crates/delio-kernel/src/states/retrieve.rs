use async_trait::async_trait;
use delio_core::{Action, ErrorKind, ExecutionContext, HandlerError, Intent, State};
use tracing::{debug, warn};

use super::HandlerDeps;
use crate::handler::StateHandler;

/// Loads the memory snapshot for the turn. A failing store degrades the
/// turn but does not end it.
pub struct RetrieveHandler {
    deps: HandlerDeps,
}

impl RetrieveHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StateHandler for RetrieveHandler {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        self.deps.allow(ctx, Action::MemoryRead)?;
        match self
            .deps
            .collaborators
            .memory
            .aggregate_context(ctx.user_id, &ctx.raw_input)
            .await
        {
            Ok(snapshot) => {
                debug!(
                    recent = snapshot.recent.len(),
                    long_term = snapshot.long_term.len(),
                    "memory loaded"
                );
                ctx.memory = Some(snapshot);
            }
            Err(e) => {
                warn!(
                    user_id = %ctx.user_id,
                    error = %e,
                    "memory retrieval failed, continuing without it"
                );
                ctx.record_error(
                    ErrorKind::Collaborator,
                    Some(State::Retrieve),
                    format!("memory retrieval failed: {e}"),
                );
            }
        }

        if ctx.intent == Intent::DeepThink || ctx.metadata_flag("deep_think") {
            Ok(State::DeepThink)
        } else {
            Ok(State::Plan)
        }
    }
}
