use async_trait::async_trait;
use delio_core::{Action, ErrorKind, ExecutionContext, HandlerError, Intent, State};
use serde_json::json;
use tracing::{debug, warn};

use super::HandlerDeps;
use crate::handler::StateHandler;

/// Metadata key naming a file attached to the message.
pub const ATTACHMENT_PATH: &str = "attachment_path";

/// Validates the inbound event and routes by intent.
pub struct ObserveHandler {
    deps: HandlerDeps,
}

impl ObserveHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    async fn inspect_attachment(
        &self,
        ctx: &mut ExecutionContext,
        path: String,
    ) -> Result<(), HandlerError> {
        self.deps.allow(ctx, Action::ReadFile)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                ctx.metadata.insert("attachment_bytes".into(), json!(meta.len()));
            }
            Ok(_) => {
                warn!(path = %path, "attachment is not a regular file");
                ctx.metadata.remove(ATTACHMENT_PATH);
            }
            Err(e) => {
                warn!(path = %path, error = %e, "attachment unreadable");
                ctx.metadata.remove(ATTACHMENT_PATH);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateHandler for ObserveHandler {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        if ctx.raw_input.trim().is_empty() && !ctx.event_type.is_background() {
            ctx.record_error(ErrorKind::EmptyInput, Some(State::Observe), "empty input");
            return Ok(State::Error);
        }

        let attachment = ctx
            .metadata
            .get(ATTACHMENT_PATH)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(path) = attachment {
            self.inspect_attachment(ctx, path).await?;
        }

        debug!(
            user_id = %ctx.user_id,
            event_type = ctx.event_type.as_str(),
            intent = ?ctx.intent,
            "observed event"
        );
        Ok(match ctx.intent {
            Intent::Simple => State::Plan,
            Intent::Complex | Intent::DeepThink => State::Retrieve,
        })
    }
}
