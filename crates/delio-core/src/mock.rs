//! Scripted collaborators for deterministic tests and the operator console.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::collaborators::{
    CollaboratorResult, Collaborators, CriticVerdict, Delivery, Evaluation, Interaction,
    MemoryStore, ModelClient, ModelReply, ModelRequest, ToolExecutor,
};
use crate::context::{MemorySnapshot, ToolCall};
use crate::errors::CollaboratorError;
use crate::ids::UserId;
use crate::state::Action;

/// In-memory memory store recording every write.
#[derive(Default)]
pub struct MockMemory {
    snapshot: Mutex<MemorySnapshot>,
    fail_reads: Mutex<Option<CollaboratorError>>,
    interactions: Mutex<Vec<(UserId, Interaction)>>,
    lessons: Mutex<Vec<(UserId, String)>>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: MemorySnapshot) -> Self {
        let memory = Self::default();
        *memory.snapshot.lock() = snapshot;
        memory
    }

    pub fn fail_reads_with(&self, error: CollaboratorError) {
        *self.fail_reads.lock() = Some(error);
    }

    pub fn interactions(&self) -> Vec<(UserId, Interaction)> {
        self.interactions.lock().clone()
    }

    pub fn lessons(&self) -> Vec<(UserId, String)> {
        self.lessons.lock().clone()
    }
}

#[async_trait]
impl MemoryStore for MockMemory {
    async fn aggregate_context(
        &self,
        _user_id: UserId,
        _raw_input: &str,
    ) -> CollaboratorResult<MemorySnapshot> {
        if let Some(error) = self.fail_reads.lock().clone() {
            return Err(error);
        }
        Ok(self.snapshot.lock().clone())
    }

    async fn append_interaction(
        &self,
        user_id: UserId,
        interaction: Interaction,
    ) -> CollaboratorResult<()> {
        self.interactions.lock().push((user_id, interaction));
        Ok(())
    }

    async fn record_lesson(&self, user_id: UserId, lesson: &str) -> CollaboratorResult<()> {
        self.lessons.lock().push((user_id, lesson.to_string()));
        Ok(())
    }
}

/// Pre-programmed model replies.
pub enum MockReply {
    Text(String),
    Error(CollaboratorError),
    /// Wait, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Model client returning actor replies in sequence. Once the script is
/// exhausted every call yields the fallback text.
pub struct MockModel {
    actor: Mutex<VecDeque<MockReply>>,
    deep_think: Mutex<VecDeque<MockReply>>,
    fallback: String,
    verdict: Mutex<CriticVerdict>,
    score: Mutex<u8>,
    actor_calls: AtomicUsize,
    critic_calls: AtomicUsize,
    evaluate_calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockModel {
    pub fn new(actor: Vec<MockReply>) -> Self {
        Self {
            actor: Mutex::new(actor.into()),
            deep_think: Mutex::new(VecDeque::new()),
            fallback: "ok".to_string(),
            verdict: Mutex::new(CriticVerdict {
                approved: true,
                feedback: None,
            }),
            score: Mutex::new(9),
            actor_calls: AtomicUsize::new(0),
            critic_calls: AtomicUsize::new(0),
            evaluate_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `text`.
    pub fn replying(text: &str) -> Self {
        let mut model = Self::new(Vec::new());
        model.fallback = text.to_string();
        model
    }

    pub fn with_deep_think(self, replies: Vec<MockReply>) -> Self {
        *self.deep_think.lock() = replies.into();
        self
    }

    pub fn reject_with(&self, feedback: &str) {
        *self.verdict.lock() = CriticVerdict {
            approved: false,
            feedback: Some(feedback.to_string()),
        };
    }

    pub fn set_score(&self, score: u8) {
        *self.score.lock() = score;
    }

    pub fn actor_calls(&self) -> usize {
        self.actor_calls.load(Ordering::Relaxed)
    }

    pub fn critic_calls(&self) -> usize {
        self.critic_calls.load(Ordering::Relaxed)
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    async fn resolve(&self, reply: Option<MockReply>) -> CollaboratorResult<ModelReply> {
        let mut next = reply;
        loop {
            match next {
                None => {
                    return Ok(ModelReply {
                        text: self.fallback.clone(),
                        label: "mock".into(),
                    })
                }
                Some(MockReply::Text(text)) => {
                    return Ok(ModelReply {
                        text,
                        label: "mock".into(),
                    })
                }
                Some(MockReply::Error(error)) => return Err(error),
                Some(MockReply::Delay(delay, inner)) => {
                    tokio::time::sleep(delay).await;
                    next = Some(*inner);
                }
            }
        }
    }
}

#[async_trait]
impl ModelClient for MockModel {
    async fn call_actor(&self, request: &ModelRequest) -> CollaboratorResult<ModelReply> {
        self.actor_calls.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());
        let reply = self.actor.lock().pop_front();
        self.resolve(reply).await
    }

    async fn call_critic(
        &self,
        _user_input: &str,
        _draft: &str,
    ) -> CollaboratorResult<CriticVerdict> {
        self.critic_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.verdict.lock().clone())
    }

    async fn call_deep_think(&self, request: &ModelRequest) -> CollaboratorResult<ModelReply> {
        self.requests.lock().push(request.clone());
        let reply = self.deep_think.lock().pop_front();
        self.resolve(reply).await
    }

    async fn evaluate(&self, _user_input: &str, _response: &str) -> CollaboratorResult<Evaluation> {
        self.evaluate_calls.fetch_add(1, Ordering::Relaxed);
        let score = *self.score.lock();
        Ok(Evaluation {
            score,
            lesson: (score < 7).then(|| "answer more directly".to_string()),
        })
    }
}

struct MockTool {
    actions: Vec<Action>,
    output: CollaboratorResult<String>,
}

/// Tool sandbox with fixed per-tool outputs.
#[derive(Default)]
pub struct MockTools {
    tools: HashMap<String, MockTool>,
    executed: Mutex<Vec<(UserId, ToolCall)>>,
}

impl MockTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: &str, actions: &[Action], output: &str) -> Self {
        self.tools.insert(
            name.to_string(),
            MockTool {
                actions: actions.to_vec(),
                output: Ok(output.to_string()),
            },
        );
        self
    }

    pub fn with_failing_tool(
        mut self,
        name: &str,
        actions: &[Action],
        error: CollaboratorError,
    ) -> Self {
        self.tools.insert(
            name.to_string(),
            MockTool {
                actions: actions.to_vec(),
                output: Err(error),
            },
        );
        self
    }

    pub fn executed(&self) -> Vec<(UserId, ToolCall)> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl ToolExecutor for MockTools {
    fn actions_for(&self, name: &str) -> Option<Vec<Action>> {
        self.tools.get(name).map(|tool| tool.actions.clone())
    }

    async fn execute(&self, user_id: UserId, call: &ToolCall) -> CollaboratorResult<String> {
        self.executed.lock().push((user_id, call.clone()));
        match self.tools.get(&call.name) {
            Some(tool) => tool.output.clone(),
            None => Err(CollaboratorError::Invalid(format!("unknown tool: {}", call.name))),
        }
    }
}

/// Delivery adapter recording every message.
#[derive(Default)]
pub struct MockDelivery {
    sent: Mutex<Vec<(UserId, String)>>,
    fail_with: Mutex<Option<CollaboratorError>>,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: CollaboratorError) {
        *self.fail_with.lock() = Some(error);
    }

    pub fn sent(&self) -> Vec<(UserId, String)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, user_id: UserId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    async fn send(&self, user_id: UserId, text: &str) -> CollaboratorResult<()> {
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }
        self.sent.lock().push((user_id, text.to_string()));
        Ok(())
    }
}

/// Typed handles to a full mock collaborator set.
#[derive(Clone)]
pub struct MockSet {
    pub memory: Arc<MockMemory>,
    pub model: Arc<MockModel>,
    pub tools: Arc<MockTools>,
    pub delivery: Arc<MockDelivery>,
}

impl MockSet {
    pub fn new(model: MockModel, tools: MockTools) -> Self {
        Self {
            memory: Arc::new(MockMemory::new()),
            model: Arc::new(model),
            tools: Arc::new(tools),
            delivery: Arc::new(MockDelivery::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            memory: self.memory.clone(),
            model: self.model.clone(),
            tools: self.tools.clone(),
            delivery: self.delivery.clone(),
        }
    }
}

impl Default for MockSet {
    fn default() -> Self {
        Self::new(MockModel::replying("ok"), MockTools::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn model_replays_script_then_fallback() {
        let model = MockModel::new(vec![MockReply::text("first"), MockReply::text("second")]);
        let request = ModelRequest::default();
        assert_eq!(model.call_actor(&request).await.unwrap().text, "first");
        assert_eq!(model.call_actor(&request).await.unwrap().text, "second");
        assert_eq!(model.call_actor(&request).await.unwrap().text, "ok");
        assert_eq!(model.actor_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_waits() {
        let model = MockModel::new(vec![MockReply::delayed(
            Duration::from_secs(2),
            MockReply::text("late"),
        )]);
        let start = tokio::time::Instant::now();
        let reply = model.call_actor(&ModelRequest::default()).await.unwrap();
        assert_eq!(reply.text, "late");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn critic_rejection_is_scripted() {
        let model = MockModel::replying("x");
        model.reject_with("unsafe");
        let verdict = model.call_critic("q", "draft").await.unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.feedback.as_deref(), Some("unsafe"));
    }

    #[tokio::test]
    async fn low_score_produces_lesson() {
        let model = MockModel::replying("x");
        model.set_score(3);
        let eval = model.evaluate("q", "a").await.unwrap();
        assert_eq!(eval.score, 3);
        assert!(eval.lesson.is_some());
    }

    #[tokio::test]
    async fn tools_report_actions_and_record_calls() {
        let tools = MockTools::new().with_tool("search", &[Action::Network], "found");
        assert_eq!(tools.actions_for("search"), Some(vec![Action::Network]));
        assert_eq!(tools.actions_for("nope"), None);
        let out = tools.execute(UserId::new(1), &ToolCall::new("search")).await.unwrap();
        assert_eq!(out, "found");
        assert_eq!(tools.executed().len(), 1);
    }

    #[tokio::test]
    async fn delivery_records_and_fails_on_demand() {
        let delivery = MockDelivery::new();
        delivery.send(UserId::new(2), "hello").await.unwrap();
        assert_eq!(delivery.sent_to(UserId::new(2)), vec!["hello".to_string()]);
        delivery.fail_with(CollaboratorError::Unavailable("offline".into()));
        assert!(delivery.send(UserId::new(2), "again").await.is_err());
        assert_eq!(delivery.sent().len(), 1);
    }

    #[tokio::test]
    async fn memory_read_failure_is_scripted() {
        let memory = MockMemory::new();
        memory.fail_reads_with(CollaboratorError::Timeout(Duration::from_secs(1)));
        assert!(memory.aggregate_context(UserId::new(1), "hi").await.is_err());
    }
}
