use async_trait::async_trait;
use delio_core::{Action, ErrorKind, ExecutionContext, HandlerError, State};
use tracing::{debug, warn};

use super::HandlerDeps;
use crate::handler::StateHandler;

/// Delivers the response, split to fit the channel's message limit.
pub struct RespondHandler {
    deps: HandlerDeps,
}

impl RespondHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

/// Split `text` into pieces of at most `max_chars` characters, breaking at
/// the last newline inside a window when there is one.
pub(crate) fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(idx, _)| idx);
        if window_end == rest.len() {
            chunks.push(rest.to_string());
            break;
        }
        let split = match rest[..window_end].rfind('\n') {
            Some(nl) if nl > 0 => nl + 1,
            _ => window_end,
        };
        chunks.push(rest[..split].to_string());
        rest = &rest[split..];
    }
    chunks
}

#[async_trait]
impl StateHandler for RespondHandler {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        if ctx.response.trim().is_empty() {
            debug!(user_id = %ctx.user_id, "nothing to send");
            return Ok(State::Reflect);
        }
        self.deps.allow(ctx, Action::Network)?;

        let delivery = &self.deps.collaborators.delivery;
        for chunk in chunk_message(&ctx.response, self.deps.config.max_message_chars) {
            if let Err(e) = delivery.send(ctx.user_id, &chunk).await {
                warn!(user_id = %ctx.user_id, error = %e, "response delivery failed");
                ctx.record_error(
                    ErrorKind::Collaborator,
                    Some(State::Respond),
                    format!("failed to send response: {e}"),
                );
                return Ok(State::Reflect);
            }
            ctx.sent_response = true;
        }
        Ok(State::Reflect)
    }
}
