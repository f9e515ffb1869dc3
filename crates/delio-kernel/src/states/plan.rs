use async_trait::async_trait;
use delio_core::collaborators::ModelRequest;
use delio_core::{Action, ErrorKind, ExecutionContext, HandlerError, State};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::parsing::parse_reply;
use super::HandlerDeps;
use crate::handler::StateHandler;

/// Model request for the current turn, folding in tool results the model
/// has not seen yet.
pub(crate) fn model_request(ctx: &ExecutionContext) -> ModelRequest {
    ModelRequest {
        user_input: ctx.raw_input.clone(),
        memory: ctx.memory.clone(),
        tool_outputs: ctx.pending_tool_outputs().to_vec(),
        heartbeat: ctx.is_heartbeat(),
    }
}

/// Actor call with optional critic review.
pub struct PlanHandler {
    deps: HandlerDeps,
}

impl PlanHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StateHandler for PlanHandler {
    #[instrument(skip_all, fields(user_id = %ctx.user_id))]
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        self.deps.allow(ctx, Action::ModelCall)?;
        let model = &self.deps.collaborators.model;

        let request = model_request(ctx);
        ctx.mark_outputs_integrated();
        ctx.tool_calls.clear();

        let reply = model.call_actor(&request).await?;
        ctx.metadata.insert("model_used".into(), json!(reply.label));

        if self.deps.config.critic_enabled {
            let verdict = model.call_critic(&ctx.raw_input, &reply.text).await?;
            if !verdict.approved {
                let feedback = verdict.feedback.unwrap_or_else(|| "no feedback".to_string());
                info!(feedback = %feedback, "critic rejected the plan");
                ctx.record_error(
                    ErrorKind::CriticRejected,
                    Some(State::Plan),
                    format!("Critic rejected: {feedback}"),
                );
                return Ok(State::Error);
            }
        }

        let parsed = parse_reply(&reply.text);
        ctx.plan = Some(reply.text);
        ctx.tool_calls = parsed.tool_calls;
        ctx.response = parsed.response;

        if ctx.tool_calls.is_empty() && ctx.response.chars().count() < 2 {
            ctx.record_error(
                ErrorKind::EmptyPlan,
                Some(State::Plan),
                "model returned an empty plan",
            );
            return Ok(State::Error);
        }

        debug!(tool_calls = ctx.tool_calls.len(), "plan ready");
        Ok(State::Decide)
    }
}
