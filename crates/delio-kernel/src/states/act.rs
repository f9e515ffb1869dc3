use async_trait::async_trait;
use delio_core::{ExecutionContext, HandlerError, State, ToolCall, ToolOutput};
use serde_json::json;
use tracing::{info, instrument, warn};

use super::HandlerDeps;
use crate::handler::StateHandler;

/// Executes the planned tool calls in order. Tool failures become error
/// outputs for the next plan rather than ending the turn.
pub struct ActHandler {
    deps: HandlerDeps,
}

impl ActHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    async fn run_tool(&self, ctx: &ExecutionContext, mut call: ToolCall) -> ToolOutput {
        let tools = &self.deps.collaborators.tools;
        let Some(actions) = tools.actions_for(&call.name) else {
            warn!(tool = %call.name, "unknown tool requested");
            return failure(&call.name, format!("unknown tool: {}", call.name));
        };
        for action in actions {
            if let Err(e) = self.deps.guard.assert_allowed(ctx.user_id, action) {
                return failure(&call.name, e.to_string());
            }
        }

        call.arguments.insert("user_id".into(), json!(ctx.user_id.get()));
        match tools.execute(ctx.user_id, &call).await {
            Ok(output) => {
                info!(tool = %call.name, "tool executed");
                ToolOutput {
                    name: call.name,
                    output,
                    is_error: false,
                }
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool failed");
                failure(&call.name, e.to_string())
            }
        }
    }
}

fn failure(name: &str, message: String) -> ToolOutput {
    ToolOutput {
        name: name.to_string(),
        output: message,
        is_error: true,
    }
}

#[async_trait]
impl StateHandler for ActHandler {
    #[instrument(skip_all, fields(user_id = %ctx.user_id, calls = ctx.tool_calls.len()))]
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        let calls = std::mem::take(&mut ctx.tool_calls);
        for call in calls {
            let output = self.run_tool(ctx, call).await;
            ctx.tool_outputs.push(output);
        }
        Ok(State::Reflect)
    }
}
