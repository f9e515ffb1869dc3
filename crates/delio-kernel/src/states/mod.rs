//! Default handlers for the cognitive cycle, one per non-IDLE state.
//!
//! Every handler asks the guard for permission before it touches a
//! collaborator. Collaborators are injected through [`HandlerDeps`], so the
//! same handlers drive production adapters and the scripted mocks.

mod act;
mod decide;
mod deep_think;
mod error;
mod memory_write;
mod notify;
mod observe;
mod parsing;
mod plan;
mod reflect;
mod respond;
mod retrieve;

use std::sync::Arc;

use delio_core::{Action, Collaborators, ExecutionContext, HandlerError, State};
use delio_settings::DelioSettings;

use crate::controller::FsmController;
use crate::guard::StateGuard;
use crate::handler::StateHandler;

pub use act::ActHandler;
pub use decide::DecideHandler;
pub use deep_think::DeepThinkHandler;
pub use error::{ErrorHandler, CRITIC_NOTICE, GENERIC_NOTICE, TIMEOUT_NOTICE};
pub use memory_write::MemoryWriteHandler;
pub use notify::NotifyHandler;
pub use observe::ObserveHandler;
pub use plan::PlanHandler;
pub use reflect::ReflectHandler;
pub use respond::RespondHandler;
pub use retrieve::RetrieveHandler;

/// Knobs the default handlers read.
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    pub critic_enabled: bool,
    pub reflection_enabled: bool,
    pub lesson_score_threshold: u8,
    pub max_message_chars: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::from(&DelioSettings::default())
    }
}

impl From<&DelioSettings> for HandlerConfig {
    fn from(settings: &DelioSettings) -> Self {
        Self {
            critic_enabled: settings.planning.critic_enabled,
            reflection_enabled: settings.planning.reflection_enabled,
            lesson_score_threshold: settings.planning.lesson_score_threshold,
            max_message_chars: settings.delivery.max_message_chars,
        }
    }
}

/// Shared dependencies of the default handlers.
#[derive(Clone)]
pub struct HandlerDeps {
    pub guard: Arc<StateGuard>,
    pub collaborators: Collaborators,
    pub config: HandlerConfig,
}

impl HandlerDeps {
    pub fn new(
        guard: Arc<StateGuard>,
        collaborators: Collaborators,
        config: HandlerConfig,
    ) -> Self {
        Self {
            guard,
            collaborators,
            config,
        }
    }

    pub(crate) fn allow(&self, ctx: &ExecutionContext, action: Action) -> Result<(), HandlerError> {
        self.guard.assert_allowed(ctx.user_id, action)?;
        Ok(())
    }
}

/// The full default handler set, keyed by the state each one serves.
pub fn default_handlers(deps: &HandlerDeps) -> Vec<(State, Arc<dyn StateHandler>)> {
    vec![
        (State::Observe, Arc::new(ObserveHandler::new(deps.clone())) as Arc<dyn StateHandler>),
        (State::Retrieve, Arc::new(RetrieveHandler::new(deps.clone()))),
        (State::Plan, Arc::new(PlanHandler::new(deps.clone()))),
        (State::DeepThink, Arc::new(DeepThinkHandler::new(deps.clone()))),
        (State::Decide, Arc::new(DecideHandler)),
        (State::Act, Arc::new(ActHandler::new(deps.clone()))),
        (State::Respond, Arc::new(RespondHandler::new(deps.clone()))),
        (State::Reflect, Arc::new(ReflectHandler::new(deps.clone()))),
        (State::MemoryWrite, Arc::new(MemoryWriteHandler::new(deps.clone()))),
        (State::Notify, Arc::new(NotifyHandler::new(deps.clone()))),
        (State::Error, Arc::new(ErrorHandler::new(deps.clone()))),
    ]
}

/// Bind every default handler on `controller`.
pub fn register_defaults(controller: &mut FsmController, deps: &HandlerDeps) {
    for (state, handler) in default_handlers(deps) {
        controller.register_handler(state, handler);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use delio_core::mock::MockSet;
    use delio_core::{ExecutionContext, KernelEvent, State};

    use super::{HandlerConfig, HandlerDeps};
    use crate::alerts::AlertEmitter;
    use crate::guard::{GuardConfig, StateGuard};

    /// Deps over mocks with the guard parked in `state` for the context's user.
    pub(crate) async fn deps_in(
        mocks: &MockSet,
        state: State,
        ctx: &ExecutionContext,
    ) -> HandlerDeps {
        let alerts = Arc::new(AlertEmitter::new());
        let guard = Arc::new(StateGuard::new(GuardConfig::default(), alerts));
        place(&guard, ctx, state).await;
        HandlerDeps::new(guard, mocks.collaborators(), HandlerConfig::default())
    }

    /// Move the user to `state` along legal edges.
    pub(crate) async fn place(guard: &StateGuard, ctx: &ExecutionContext, state: State) {
        let path: &[State] = match state {
            State::Idle => &[],
            State::Observe => &[State::Observe],
            State::Retrieve => &[State::Observe, State::Retrieve],
            State::Plan => &[State::Observe, State::Plan],
            State::DeepThink => &[State::Observe, State::Retrieve, State::DeepThink],
            State::Decide => &[State::Observe, State::Plan, State::Decide],
            State::Act => &[State::Observe, State::Plan, State::Decide, State::Act],
            State::Respond => &[State::Observe, State::Plan, State::Decide, State::Respond],
            State::Reflect => &[
                State::Observe,
                State::Plan,
                State::Decide,
                State::Respond,
                State::Reflect,
            ],
            State::MemoryWrite => &[
                State::Observe,
                State::Plan,
                State::Decide,
                State::Respond,
                State::Reflect,
                State::MemoryWrite,
            ],
            State::Notify => &[State::Notify],
            State::Error => &[State::Error],
        };
        for next in path {
            guard.enter(ctx.user_id, *next).await.unwrap();
        }
    }

    pub(crate) fn message(text: &str) -> ExecutionContext {
        ExecutionContext::from_event(&KernelEvent::message(1, text))
    }
}
