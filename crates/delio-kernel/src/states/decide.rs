use async_trait::async_trait;
use delio_core::{ExecutionContext, HandlerError, State};
use tracing::debug;

use crate::handler::StateHandler;

/// Pure routing: act on tool calls, stay quiet on a skipped heartbeat,
/// otherwise answer.
pub struct DecideHandler;

fn is_skip(response: &str) -> bool {
    response
        .trim_start()
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("skip"))
}

#[async_trait]
impl StateHandler for DecideHandler {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        if !ctx.tool_calls.is_empty() {
            return Ok(State::Act);
        }
        if ctx.is_heartbeat() && is_skip(&ctx.response) {
            debug!(user_id = %ctx.user_id, "heartbeat skipped");
            return Ok(State::Idle);
        }
        Ok(State::Respond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delio_core::{KernelEvent, ToolCall};

    fn ctx(event: KernelEvent, response: &str) -> ExecutionContext {
        let mut ctx = ExecutionContext::from_event(&event);
        ctx.response = response.into();
        ctx
    }

    #[tokio::test]
    async fn tool_calls_mean_act() {
        let mut c = ctx(KernelEvent::message(1, "hi"), "");
        c.tool_calls.push(ToolCall::new("search"));
        assert_eq!(DecideHandler.execute(&mut c).await.unwrap(), State::Act);
    }

    #[tokio::test]
    async fn heartbeat_skip_goes_idle() {
        let mut c = ctx(KernelEvent::heartbeat(1), "  skip: nothing new");
        assert_eq!(DecideHandler.execute(&mut c).await.unwrap(), State::Idle);
    }

    #[tokio::test]
    async fn skip_from_a_user_message_is_answered() {
        let mut c = ctx(KernelEvent::message(1, "what should I do?"), "Skip the meeting.");
        assert_eq!(DecideHandler.execute(&mut c).await.unwrap(), State::Respond);
    }

    #[tokio::test]
    async fn heartbeat_with_news_responds() {
        let mut c = ctx(KernelEvent::heartbeat(1), "Your flight leaves in an hour.");
        assert_eq!(DecideHandler.execute(&mut c).await.unwrap(), State::Respond);
    }

    #[test]
    fn skip_detection_handles_short_and_multibyte_text() {
        assert!(!is_skip("sk"));
        assert!(!is_skip("é"));
        assert!(is_skip("SKIP"));
    }
}
