//! Shared vocabulary for the delio kernel: states, actions, the transition
//! and side-effect tables, per-cycle context, and the collaborator seams.

pub mod collaborators;
pub mod context;
pub mod errors;
pub mod event;
pub mod ids;
pub mod mock;
pub mod state;

pub use context::{
    CycleError, ErrorKind, ExecutionContext, MemorySnapshot, ToolCall, ToolOutput, TRACE_START,
};
pub use collaborators::{Collaborators, Delivery, MemoryStore, ModelClient, ToolExecutor};
pub use errors::{CollaboratorError, GuardError, HandlerError};
pub use event::{EventType, Intent, KernelEvent};
pub use ids::{TraceId, UserId};
pub use state::{Action, SideEffectMatrix, State, TransitionTable};
