use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use serde_json::Value;

use super::Message;
use super::ModelRef;
use super::SessionInfo;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderModels {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    pub models: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub version: String,
    pub agents: Vec<String>,
    pub providers: Vec<String>,
    pub models: Vec<ProviderModels>,
}

impl ServerStatus {
    pub fn unknown() -> ServerStatus {
        return ServerStatus {
            version: "unknown".to_string(),
            ..ServerStatus::default()
        };
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub title: Option<String>,
    pub directory: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PromptRequest {
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
    pub parts: Vec<Value>,
}

/// The agent server, consumed as an opaque RPC client. Implementations are
/// expected to unwrap whatever response wrappers the server uses.
#[async_trait]
pub trait AgentServer: Send + Sync {
    /// Version plus the agent and model catalog. Unreachable servers report
    /// an `unknown` status rather than failing.
    async fn health(&self) -> Result<ServerStatus>;

    /// Providers that expose at least one model for the given directory.
    async fn providers(&self, directory: &str) -> Result<Vec<ProviderModels>>;

    async fn create_session(&self, req: CreateSessionRequest) -> Result<SessionInfo>;

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>>;

    async fn get_session(&self, id: &str) -> Result<SessionInfo>;

    async fn delete_session(&self, id: &str) -> Result<()>;

    async fn fork_session(&self, id: &str, message_id: Option<&str>) -> Result<SessionInfo>;

    async fn prompt(&self, session_id: &str, req: PromptRequest) -> Result<()>;

    /// Full history of a session, flattened from `{info, parts}` envelopes.
    async fn messages(&self, session_id: &str) -> Result<Vec<Message>>;

    async fn revert(&self, session_id: &str, message_id: &str, part_id: Option<&str>)
        -> Result<()>;

    async fn unrevert(&self, session_id: &str) -> Result<()>;
}

pub type AgentServerBox = Arc<dyn AgentServer>;

/// A live feed of raw server events. `open` is flipped by the transport when
/// it notices the connection is gone, which lets a heartbeat catch closures
/// that never surface as a stream error.
pub struct EventConnection {
    pub events: BoxStream<'static, Result<Value>>,
    open: Arc<AtomicBool>,
}

impl EventConnection {
    pub fn new(events: BoxStream<'static, Result<Value>>, open: Arc<AtomicBool>) -> EventConnection {
        return EventConnection { events, open };
    }

    pub fn is_open(&self) -> bool {
        return self.open.load(Ordering::SeqCst);
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<EventConnection>;
}

pub type EventSourceBox = Arc<dyn EventSource>;
