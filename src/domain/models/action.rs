use super::ModelRef;

/// User intents arriving from the presentation boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    AttachFile(String),
    ChangeAgent(String),
    ChangeModel(ModelRef),
    DeleteSession(Option<String>),
    ForkSession(Option<String>),
    ListModels(),
    ListSessions(),
    NewSession(),
    RefreshSessions(),
    Revert(Option<String>),
    SendMessage(String),
    ServerStatus(),
    SwitchSession(String),
    Unrevert(),
}
