use async_trait::async_trait;
use delio_core::{Action, ExecutionContext, HandlerError, State};
use tracing::{debug, warn};

use super::HandlerDeps;
use crate::handler::StateHandler;

/// Responses this short are not worth grading.
const MIN_GRADED_CHARS: usize = 10;

/// Loops back to PLAN while tool results are unread, otherwise grades the
/// answer and keeps a lesson when it scored poorly.
pub struct ReflectHandler {
    deps: HandlerDeps,
}

impl ReflectHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StateHandler for ReflectHandler {
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<State, HandlerError> {
        if !ctx.pending_tool_outputs().is_empty() {
            debug!(pending = ctx.pending_tool_outputs().len(), "tool results pending, replanning");
            return Ok(State::Plan);
        }
        if !self.deps.config.reflection_enabled
            || ctx.response.chars().count() <= MIN_GRADED_CHARS
        {
            return Ok(State::MemoryWrite);
        }

        self.deps.allow(ctx, Action::ModelCall)?;
        match self
            .deps
            .collaborators
            .model
            .evaluate(&ctx.raw_input, &ctx.response)
            .await
        {
            Ok(eval) => {
                debug!(score = eval.score, "self-evaluation");
                if eval.score < self.deps.config.lesson_score_threshold {
                    if let Some(lesson) = eval.lesson {
                        ctx.lessons.push(lesson);
                    }
                }
            }
            Err(e) => warn!(user_id = %ctx.user_id, error = %e, "self-evaluation failed"),
        }
        Ok(State::MemoryWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::test_support::{deps_in, message};
    use delio_core::mock::MockSet;
    use delio_core::ToolOutput;

    fn answered(text: &str) -> ExecutionContext {
        let mut ctx = message("question");
        ctx.response = text.into();
        ctx
    }

    #[tokio::test]
    async fn pending_outputs_loop_back_to_plan() {
        let mocks = MockSet::default();
        let mut ctx = answered("");
        ctx.tool_outputs.push(ToolOutput {
            name: "search".into(),
            output: "found".into(),
            is_error: false,
        });
        let handler = ReflectHandler::new(deps_in(&mocks, State::Reflect, &ctx).await);
        assert_eq!(handler.execute(&mut ctx).await.unwrap(), State::Plan);
        assert_eq!(mocks.model.evaluate_calls(), 0);
    }

    #[tokio::test]
    async fn low_score_keeps_lesson() {
        let mocks = MockSet::default();
        mocks.model.set_score(4);
        let mut ctx = answered("A rather long and meandering answer.");
        let handler = ReflectHandler::new(deps_in(&mocks, State::Reflect, &ctx).await);
        assert_eq!(handler.execute(&mut ctx).await.unwrap(), State::MemoryWrite);
        assert_eq!(ctx.lessons, vec!["answer more directly".to_string()]);
    }

    #[tokio::test]
    async fn good_score_keeps_nothing() {
        let mocks = MockSet::default();
        let mut ctx = answered("A crisp and correct answer.");
        let handler = ReflectHandler::new(deps_in(&mocks, State::Reflect, &ctx).await);
        handler.execute(&mut ctx).await.unwrap();
        assert_eq!(mocks.model.evaluate_calls(), 1);
        assert!(ctx.lessons.is_empty());
    }

    #[tokio::test]
    async fn short_answers_are_not_graded() {
        let mocks = MockSet::default();
        let mut ctx = answered("Sure.");
        let handler = ReflectHandler::new(deps_in(&mocks, State::Reflect, &ctx).await);
        assert_eq!(handler.execute(&mut ctx).await.unwrap(), State::MemoryWrite);
        assert_eq!(mocks.model.evaluate_calls(), 0);
    }
}
