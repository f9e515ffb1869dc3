use async_trait::async_trait;
use delio_core::{Action, ErrorKind, ExecutionContext, HandlerError, State};
use serde_json::json;
use tracing::{debug, instrument};

use super::parsing::{parse_reply, strip_thoughts};
use super::plan::model_request;
use super::HandlerDeps;
use crate::handler::StateHandler;

/// Extended reasoning pass for turns flagged as hard. Its private
/// `<thought>` blocks are never shown to the user.
pub struct DeepThinkHandler {
    deps: HandlerDeps,
}

impl DeepThinkHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StateHandler for DeepThinkHandler {
    #[instrument(skip_all, fields(user_id = %ctx.user_id))]
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        self.deps.allow(ctx, Action::ModelCall)?;

        let request = model_request(ctx);
        ctx.mark_outputs_integrated();
        ctx.tool_calls.clear();

        let reply = self.deps.collaborators.model.call_deep_think(&request).await?;
        ctx.metadata.insert("model_used".into(), json!(reply.label));

        let parsed = parse_reply(&strip_thoughts(&reply.text));
        ctx.plan = Some(reply.text);
        ctx.tool_calls = parsed.tool_calls;
        ctx.response = parsed.response;

        if ctx.tool_calls.is_empty() && ctx.response.is_empty() {
            ctx.record_error(
                ErrorKind::EmptyPlan,
                Some(State::DeepThink),
                "deep reasoning produced no answer",
            );
            return Ok(State::Error);
        }
        debug!(tool_calls = ctx.tool_calls.len(), "deep reasoning done");
        Ok(State::Decide)
    }
}
