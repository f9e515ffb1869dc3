//! Interfaces to the systems the kernel drives but does not own.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{MemorySnapshot, ToolCall, ToolOutput};
use crate::errors::CollaboratorError;
use crate::event::EventType;
use crate::ids::{TraceId, UserId};
use crate::state::Action;

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// A completed turn handed to long-term storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub trace_id: TraceId,
    pub event_type: EventType,
    pub user_input: String,
    pub response: String,
}

/// Multi-store memory aggregation.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn aggregate_context(
        &self,
        user_id: UserId,
        raw_input: &str,
    ) -> CollaboratorResult<MemorySnapshot>;
    async fn append_interaction(
        &self,
        user_id: UserId,
        interaction: Interaction,
    ) -> CollaboratorResult<()>;
    async fn record_lesson(&self, user_id: UserId, lesson: &str) -> CollaboratorResult<()>;
}

/// Input to an actor or deep-reasoning model call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub user_input: String,
    pub memory: Option<MemorySnapshot>,
    /// Tool results the model has not seen yet.
    pub tool_outputs: Vec<ToolOutput>,
    pub heartbeat: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: String,
    /// Which model produced the text.
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CriticVerdict {
    pub approved: bool,
    pub feedback: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Self-assessed quality from 0 to 10.
    pub score: u8,
    pub lesson: Option<String>,
}

/// Language-model call layer.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call_actor(&self, request: &ModelRequest) -> CollaboratorResult<ModelReply>;
    async fn call_critic(&self, user_input: &str, draft: &str) -> CollaboratorResult<CriticVerdict>;
    async fn call_deep_think(&self, request: &ModelRequest) -> CollaboratorResult<ModelReply>;
    async fn evaluate(&self, user_input: &str, response: &str) -> CollaboratorResult<Evaluation>;
}

/// Tool-execution sandbox.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Side effects a tool needs, or `None` when the tool is unknown.
    fn actions_for(&self, name: &str) -> Option<Vec<Action>>;
    async fn execute(&self, user_id: UserId, call: &ToolCall) -> CollaboratorResult<String>;
}

/// User-facing message delivery.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, user_id: UserId, text: &str) -> CollaboratorResult<()>;
}

/// The full set of collaborators handed to the default handlers.
#[derive(Clone)]
pub struct Collaborators {
    pub memory: Arc<dyn MemoryStore>,
    pub model: Arc<dyn ModelClient>,
    pub tools: Arc<dyn ToolExecutor>,
    pub delivery: Arc<dyn Delivery>,
}
