//! Collaborators for running the kernel from a terminal: replies are echoed
//! by a stand-in model and delivered to stdout.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use delio_core::collaborators::{
    CollaboratorResult, CriticVerdict, Evaluation, Interaction, MemoryStore, ModelClient,
    ModelReply, ModelRequest, ToolExecutor,
};
use delio_core::{
    Action, CollaboratorError, Collaborators, Delivery, MemorySnapshot, ToolCall, UserId,
};
use parking_lot::Mutex;

/// Conversation lines kept per user.
const RECENT_LINES: usize = 20;

#[derive(Default)]
struct ConsoleHistory {
    recent: VecDeque<String>,
    lessons: Vec<String>,
}

/// Process-lifetime memory: recent exchanges and recorded lessons per user.
#[derive(Default)]
pub struct ConsoleMemory {
    users: Mutex<HashMap<UserId, ConsoleHistory>>,
}

impl ConsoleMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for ConsoleMemory {
    async fn aggregate_context(
        &self,
        user_id: UserId,
        _raw_input: &str,
    ) -> CollaboratorResult<MemorySnapshot> {
        let users = self.users.lock();
        let Some(history) = users.get(&user_id) else {
            return Ok(MemorySnapshot::default());
        };
        Ok(MemorySnapshot {
            recent: history.recent.iter().cloned().collect(),
            long_term: history.lessons.clone(),
            ..MemorySnapshot::default()
        })
    }

    async fn append_interaction(
        &self,
        user_id: UserId,
        interaction: Interaction,
    ) -> CollaboratorResult<()> {
        let mut users = self.users.lock();
        let history = users.entry(user_id).or_default();
        if !interaction.user_input.is_empty() {
            history.recent.push_back(format!("user: {}", interaction.user_input));
        }
        history.recent.push_back(format!("assistant: {}", interaction.response));
        while history.recent.len() > RECENT_LINES {
            history.recent.pop_front();
        }
        Ok(())
    }

    async fn record_lesson(&self, user_id: UserId, lesson: &str) -> CollaboratorResult<()> {
        self.users
            .lock()
            .entry(user_id)
            .or_default()
            .lessons
            .push(lesson.to_string());
        Ok(())
    }
}

/// The console has no tool sandbox; every tool is unknown.
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn actions_for(&self, _name: &str) -> Option<Vec<Action>> {
        None
    }

    async fn execute(&self, _user_id: UserId, call: &ToolCall) -> CollaboratorResult<String> {
        Err(CollaboratorError::Invalid(format!("unknown tool {}", call.name)))
    }
}

/// Prints every outbound message.
pub struct ConsoleDelivery;

#[async_trait]
impl Delivery for ConsoleDelivery {
    async fn send(&self, user_id: UserId, text: &str) -> CollaboratorResult<()> {
        println!("[to {user_id}] {text}");
        Ok(())
    }
}

/// Stand-in model that echoes the user and stays quiet on heartbeats.
pub struct EchoModel;

#[async_trait]
impl ModelClient for EchoModel {
    async fn call_actor(&self, request: &ModelRequest) -> CollaboratorResult<ModelReply> {
        let text = if request.heartbeat {
            "SKIP".to_string()
        } else {
            format!("You said: {}", request.user_input.trim())
        };
        Ok(ModelReply {
            text,
            label: "echo".into(),
        })
    }

    async fn call_critic(
        &self,
        _user_input: &str,
        _draft: &str,
    ) -> CollaboratorResult<CriticVerdict> {
        Ok(CriticVerdict {
            approved: true,
            feedback: None,
        })
    }

    async fn call_deep_think(&self, request: &ModelRequest) -> CollaboratorResult<ModelReply> {
        self.call_actor(request).await
    }

    async fn evaluate(&self, _user_input: &str, _response: &str) -> CollaboratorResult<Evaluation> {
        Ok(Evaluation {
            score: 10,
            lesson: None,
        })
    }
}

pub fn collaborators() -> Collaborators {
    Collaborators {
        memory: Arc::new(ConsoleMemory::new()),
        model: Arc::new(EchoModel),
        tools: Arc::new(NoTools),
        delivery: Arc::new(ConsoleDelivery),
    }
}
