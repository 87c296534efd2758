use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::Value;

use crate::domain::models::AgentServer;
use crate::domain::models::Confirmer;
use crate::domain::models::CreateSessionRequest;
use crate::domain::models::EventConnection;
use crate::domain::models::EventSource;
use crate::domain::models::Message;
use crate::domain::models::PromptRequest;
use crate::domain::models::ProviderModels;
use crate::domain::models::ServerStatus;
use crate::domain::models::Session;
use crate::domain::models::SessionInfo;
use crate::domain::models::StateStore;

#[derive(Default)]
pub struct FakeState {
    pub sessions: Vec<SessionInfo>,
    pub messages: HashMap<String, Vec<Message>>,
    pub reverted: HashMap<String, Vec<Message>>,
    pub echo_unrevert: bool,
    pub calls: Vec<String>,
    pub prompts: Vec<(String, PromptRequest)>,
    pub failing: HashSet<String>,
    pub create_delay: Option<Duration>,
    pub messages_delay: Option<Duration>,
    pub next_id: u64,
    pub connections: VecDeque<Result<Vec<Value>>>,
    pub hold_open: bool,
    /// Held-open connections report themselves closed after this long
    /// without ever ending their stream.
    pub close_after: Option<Duration>,
    pub connect_attempts: u32,
}

/// In-memory agent server. Reverted messages are hidden until an
/// unrevert, which only gives them back when `echo_unrevert` is set.
#[derive(Clone, Default)]
pub struct FakeServer {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    pub fn new() -> FakeServer {
        return FakeServer::default();
    }

    pub fn with_session(self, id: &str, title: &str, updated_at: i64) -> FakeServer {
        self.state().sessions.push(SessionInfo {
            id: id.to_string(),
            title: title.to_string(),
            agent: None,
            directory: "/work/project".to_string(),
            project_id: None,
            parent_id: None,
            created_at: updated_at,
            updated_at,
        });
        return self;
    }

    pub fn with_messages(self, session_id: &str, messages: Vec<Message>) -> FakeServer {
        self.state()
            .messages
            .insert(session_id.to_string(), messages);
        return self;
    }

    pub fn fail(&self, operation: &str) {
        self.state().failing.insert(operation.to_string());
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        return self.state.lock().unwrap();
    }

    pub fn calls(&self) -> Vec<String> {
        return self.state().calls.clone();
    }

    fn record(&self, call: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(call.to_string());
        let operation = call.split(' ').next().unwrap_or_default();
        if state.failing.contains(operation) {
            bail!("{operation} failed");
        }

        return Ok(());
    }

    fn find(&self, id: &str) -> Result<SessionInfo> {
        return self
            .state()
            .sessions
            .iter()
            .find(|e| return e.id == id)
            .cloned()
            .ok_or_else(|| return anyhow!("Session {id} not found"));
    }
}

#[async_trait]
impl AgentServer for FakeServer {
    async fn health(&self) -> Result<ServerStatus> {
        self.record("health")?;
        return Ok(ServerStatus {
            version: "0.0.1".to_string(),
            agents: vec!["build".to_string(), "plan".to_string()],
            providers: vec!["anthropic".to_string()],
            models: vec![],
        });
    }

    async fn providers(&self, _directory: &str) -> Result<Vec<ProviderModels>> {
        self.record("providers")?;
        return Ok(vec![ProviderModels {
            provider_id: "anthropic".to_string(),
            models: vec!["claude-sonnet".to_string()],
        }]);
    }

    async fn create_session(&self, req: CreateSessionRequest) -> Result<SessionInfo> {
        self.record("create")?;
        let delay = self.state().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.next_id += 1;
        let info = SessionInfo {
            id: format!("ses_{}", state.next_id),
            title: req.title.unwrap_or_else(|| return "Untitled".to_string()),
            agent: None,
            directory: req.directory.unwrap_or_default(),
            project_id: None,
            parent_id: req.parent_id,
            created_at: 1000 + state.next_id as i64,
            updated_at: 1000 + state.next_id as i64,
        };
        state.sessions.push(info.clone());

        return Ok(info);
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.record("list")?;
        return Ok(self.state().sessions.clone());
    }

    async fn get_session(&self, id: &str) -> Result<SessionInfo> {
        self.record(&format!("get {id}"))?;
        return self.find(id);
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        self.record(&format!("delete {id}"))?;
        let mut state = self.state();
        state.sessions.retain(|e| return e.id != id);
        state.messages.remove(id);
        return Ok(());
    }

    async fn fork_session(&self, id: &str, message_id: Option<&str>) -> Result<SessionInfo> {
        self.record(&format!("fork {id}"))?;
        let source = self.find(id)?;

        let mut state = self.state();
        state.next_id += 1;
        let fork_id = format!("ses_{}", state.next_id);
        let mut messages = state.messages.get(id).cloned().unwrap_or_default();
        if let Some(message_id) = message_id {
            if let Some(idx) = messages.iter().position(|e| return e.id == message_id) {
                messages.truncate(idx);
            }
        }
        state.messages.insert(fork_id.to_string(), messages);

        let info = SessionInfo {
            id: fork_id,
            title: format!("{} (fork)", source.title),
            parent_id: Some(id.to_string()),
            updated_at: source.updated_at + 1,
            ..source
        };
        state.sessions.push(info.clone());

        return Ok(info);
    }

    async fn prompt(&self, session_id: &str, req: PromptRequest) -> Result<()> {
        self.record(&format!("prompt {session_id}"))?;
        self.state().prompts.push((session_id.to_string(), req));
        return Ok(());
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.record(&format!("messages {session_id}"))?;
        let delay = self.state().messages_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        return Ok(self
            .state()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default());
    }

    async fn revert(
        &self,
        session_id: &str,
        message_id: &str,
        _part_id: Option<&str>,
    ) -> Result<()> {
        self.record(&format!("revert {session_id} {message_id}"))?;
        let mut state = self.state();
        let messages = state
            .messages
            .get_mut(session_id)
            .ok_or_else(|| return anyhow!("Session {session_id} has no messages"))?;
        let idx = messages
            .iter()
            .position(|e| return e.id == message_id)
            .ok_or_else(|| return anyhow!("Message {message_id} not found"))?;
        let removed = messages.split_off(idx);
        state.reverted.insert(session_id.to_string(), removed);

        return Ok(());
    }

    async fn unrevert(&self, session_id: &str) -> Result<()> {
        self.record(&format!("unrevert {session_id}"))?;
        let mut state = self.state();
        let removed = state.reverted.remove(session_id).unwrap_or_default();
        if state.echo_unrevert {
            state
                .messages
                .entry(session_id.to_string())
                .or_default()
                .extend(removed);
        }

        return Ok(());
    }
}

#[async_trait]
impl EventSource for FakeServer {
    async fn connect(&self) -> Result<EventConnection> {
        let (next, hold_open, close_after) = {
            let mut state = self.state();
            state.connect_attempts += 1;
            (state.connections.pop_front(), state.hold_open, state.close_after)
        };

        let events = match next {
            Some(Ok(events)) => events,
            Some(Err(err)) => return Err(err),
            None => bail!("connection refused"),
        };

        let items = stream::iter(events.into_iter().map(Ok));
        let open = Arc::new(AtomicBool::new(true));
        if let Some(delay) = close_after {
            let open = open.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                open.store(false, Ordering::SeqCst);
            });
        }
        if hold_open || close_after.is_some() {
            return Ok(EventConnection::new(
                items.chain(stream::pending()).boxed(),
                open,
            ));
        }

        return Ok(EventConnection::new(items.boxed(), open));
    }
}

#[derive(Clone, Default)]
pub struct MemoryStateStore {
    pub values: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStateStore {
    pub fn value(&self, key: &str) -> Option<Value> {
        return self.values.lock().unwrap().get(key).cloned();
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        return Ok(self.value(key));
    }

    async fn set(&self, key: &str, value: Option<Value>) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        match value {
            Some(value) => values.insert(key.to_string(), value),
            None => values.remove(key),
        };

        return Ok(());
    }
}

/// Answers every delete confirmation the same way and remembers what it
/// was asked about.
#[derive(Default)]
pub struct FixedConfirmer {
    pub answer: bool,
    pub asked: Mutex<Vec<String>>,
}

impl FixedConfirmer {
    pub fn new(answer: bool) -> FixedConfirmer {
        return FixedConfirmer {
            answer,
            asked: Mutex::new(vec![]),
        };
    }
}

#[async_trait]
impl Confirmer for FixedConfirmer {
    async fn confirm_delete(&self, session: &Session) -> bool {
        self.asked.lock().unwrap().push(session.id.to_string());
        return self.answer;
    }
}
