use super::FileRef;
use super::ModelRef;

/// Session-scoped state handed to every command handler, so handlers never
/// reach for ambient "current session" fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatContext {
    pub session_id: Option<String>,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub directory: String,
    pub last_user_text: String,
    pub attachments: Vec<FileRef>,
}

impl ChatContext {
    pub fn new(agent: &str, model: Option<ModelRef>, directory: &str) -> ChatContext {
        return ChatContext {
            agent: agent.to_string(),
            model,
            directory: directory.to_string(),
            ..ChatContext::default()
        };
    }
}
