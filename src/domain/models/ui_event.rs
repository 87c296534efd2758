use async_trait::async_trait;

use super::Message;
use super::MessagePart;
use super::ProviderModels;
use super::Session;

/// Output of the reconciliation layer, rendered incrementally by the
/// presentation boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    Init {
        session_id: Option<String>,
        title: String,
        agent: String,
        messages: Vec<Message>,
    },
    MessageAdded {
        session_id: String,
        message: Message,
    },
    PartUpdated {
        session_id: String,
        message_id: String,
        part: MessagePart,
    },
    ToolUpdated {
        session_id: String,
        message_id: String,
        part: MessagePart,
    },
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    ReasoningCollapsed {
        session_id: String,
    },
    SessionIdle {
        session_id: String,
    },
    Waiting(bool),
    RevertApplied {
        session_id: String,
        removed: Vec<Message>,
        remaining: Vec<Message>,
        restore_text: String,
    },
    UnrevertApplied {
        session_id: String,
        restored: Vec<Message>,
        all: Vec<Message>,
    },
    SessionsChanged(Vec<Session>),
    ServerStatus {
        version: String,
        agents: Vec<String>,
        models: Vec<ProviderModels>,
    },
    Notice(String),
    Error(String),
}

/// Questions the core has to put to the user before destructive actions.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm_delete(&self, session: &Session) -> bool;
}
