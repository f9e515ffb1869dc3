use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EventType, Intent, KernelEvent};
use crate::ids::{TraceId, UserId};
use crate::state::State;

/// Trace entry recorded before the first state is entered.
pub const TRACE_START: &str = "START";

/// What the memory collaborator returns for one turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Recent conversation lines, oldest first.
    #[serde(default)]
    pub recent: Vec<String>,
    /// Semantically related long-term memories.
    #[serde(default)]
    pub long_term: Vec<String>,
    /// Structured profile facts.
    #[serde(default)]
    pub facts: serde_json::Map<String, serde_json::Value>,
}

impl MemorySnapshot {
    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.long_term.is_empty() && self.facts.is_empty()
    }
}

/// A tool invocation requested by the planner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: serde_json::Map::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub name: String,
    pub output: String,
    pub is_error: bool,
}

/// Classification of a failure recorded on a cycle.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IllegalTransition,
    PermissionDenied,
    HandlerFailure,
    MissingHandler,
    LoopLimitExceeded,
    CycleTimeout,
    LockTimeout,
    CapacityExceeded,
    Collaborator,
    CriticRejected,
    EmptyInput,
    EmptyPlan,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IllegalTransition => "illegal_transition",
            Self::PermissionDenied => "permission_denied",
            Self::HandlerFailure => "handler_failure",
            Self::MissingHandler => "missing_handler",
            Self::LoopLimitExceeded => "loop_limit_exceeded",
            Self::CycleTimeout => "cycle_timeout",
            Self::LockTimeout => "lock_timeout",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::Collaborator => "collaborator",
            Self::CriticRejected => "critic_rejected",
            Self::EmptyInput => "empty_input",
            Self::EmptyPlan => "empty_plan",
        }
    }
}

/// A human-readable failure accumulated on the context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleError {
    pub kind: ErrorKind,
    /// State active when the failure was recorded, if any.
    pub state: Option<State>,
    pub message: String,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Everything one cycle produces. Created from the inbound event, owned by
/// the controller, and lent mutably to one handler at a time.
///
/// `trace` and `errors` are append-only; they are exposed read-only and grow
/// through [`add_trace`](Self::add_trace) and [`record_error`](Self::record_error).
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub user_id: UserId,
    pub event_type: EventType,
    pub raw_input: String,
    pub intent: Intent,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub memory: Option<MemorySnapshot>,
    pub plan: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_outputs: Vec<ToolOutput>,
    /// Number of `tool_outputs` already folded into a plan.
    pub integrated_outputs: usize,
    pub response: String,
    pub sent_response: bool,
    /// Self-evaluation lessons to persist with the interaction.
    pub lessons: Vec<String>,
    pub timed_out: bool,
    pub trace_id: TraceId,
    pub start_time: DateTime<Utc>,
    started: Instant,
    errors: Vec<CycleError>,
    trace: Vec<String>,
}

impl ExecutionContext {
    pub fn from_event(event: &KernelEvent) -> Self {
        Self {
            user_id: event.user_id,
            event_type: event.event_type,
            raw_input: event.raw_input.clone(),
            intent: event.intent.unwrap_or_default(),
            metadata: event.metadata.clone(),
            memory: None,
            plan: None,
            tool_calls: Vec::new(),
            tool_outputs: Vec::new(),
            integrated_outputs: 0,
            response: String::new(),
            sent_response: false,
            lessons: Vec::new(),
            timed_out: false,
            trace_id: TraceId::new(),
            start_time: Utc::now(),
            started: Instant::now(),
            errors: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub fn add_trace(&mut self, entry: impl Into<String>) {
        self.trace.push(entry.into());
    }

    pub fn record_error(
        &mut self,
        kind: ErrorKind,
        state: Option<State>,
        message: impl Into<String>,
    ) {
        self.errors.push(CycleError {
            kind,
            state,
            message: message.into(),
        });
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn errors(&self) -> &[CycleError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_error(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event_type == EventType::Heartbeat
    }

    /// Truthy metadata flag (`true`, or the string `"true"`).
    pub fn metadata_flag(&self, key: &str) -> bool {
        match self.metadata.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Tool outputs produced since the last plan.
    pub fn pending_tool_outputs(&self) -> &[ToolOutput] {
        let from = self.integrated_outputs.min(self.tool_outputs.len());
        &self.tool_outputs[from..]
    }

    pub fn mark_outputs_integrated(&mut self) {
        self.integrated_outputs = self.tool_outputs.len();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
