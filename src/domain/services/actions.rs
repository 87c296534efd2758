#[cfg(test)]
#[path = "actions_test.rs"]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::mentions;
use super::Debouncer;
use super::HistoryEditor;
use super::Reconciler;
use super::SessionStore;
use super::TranscriptPhase;
use crate::domain::models::Action;
use crate::domain::models::AgentServerBox;
use crate::domain::models::ChatContext;
use crate::domain::models::Confirmer;
use crate::domain::models::ModelRef;
use crate::domain::models::PromptRequest;
use crate::domain::models::ServerEvent;
use crate::domain::models::Session;
use crate::domain::models::SessionEvent;
use crate::domain::models::SessionEventKind;
use crate::domain::models::SessionOptions;
use crate::domain::models::StateStoreBox;
use crate::domain::models::UiEvent;

pub fn help_text() -> String {
    let text = r#"
COMMANDS:
- /new (/n) - Starts a new session. It is created on the server when you send the first message.
- /sessions (/s) - Lists known sessions, most recently updated first.
- /switch (/sw) [SESSION_ID] - Switches to another session and loads its history.
- /delete (/d) [SESSION_ID?] - Deletes a session after confirmation. Defaults to the current session.
- /fork (/f) [MESSAGE_ID?] - Forks the current session, optionally at a message.
- /undo (/u) [MESSAGE_ID?] - Reverts the last turn, or everything from a message onwards. Your text is put back for editing.
- /redo (/r) - Restores what the last /undo removed.
- /agent (/ag) [AGENT_NAME] - Sets the agent used for the next messages.
- /model (/m) [PROVIDER/MODEL] - Sets the model used for the next messages.
- /models (/ml) - Lists the models available from the server.
- /attach (/at) [PATH] - Attaches a file to the next message.
- /status (/st) - Shows the server version, agents and models.
- /quit /exit (/q) - Exit Parley.
- /help (/h) - Provides this help menu.

MENTIONS:
Files mentioned as @path, @path#L10 or @path#L10-20 in a message are sent along with it.
        "#;

    return text.trim().to_string();
}

/// A yes/no question put to the console. The answer goes back through
/// `reply`.
#[derive(Debug)]
pub struct ConfirmRequest {
    pub prompt: String,
    pub reply: oneshot::Sender<bool>,
}

/// Asks the console to confirm deletes over a channel, so the console keeps
/// sole ownership of stdin.
pub struct ChannelConfirmer {
    tx: mpsc::UnboundedSender<ConfirmRequest>,
}

impl ChannelConfirmer {
    pub fn new(tx: mpsc::UnboundedSender<ConfirmRequest>) -> ChannelConfirmer {
        return ChannelConfirmer { tx };
    }
}

#[async_trait]
impl Confirmer for ChannelConfirmer {
    #[allow(clippy::implicit_return)]
    async fn confirm_delete(&self, session: &Session) -> bool {
        let (reply, answer) = oneshot::channel();
        let req = ConfirmRequest {
            prompt: format!("Delete session \"{}\" ({})?", session.title, session.id),
            reply,
        };
        if self.tx.send(req).is_err() {
            return false;
        }

        return answer.await.unwrap_or(false);
    }
}

/// Timing knobs for the services the actions loop owns.
#[derive(Clone, Debug)]
pub struct ActionsConfig {
    pub create_timeout: Duration,
    pub refresh_debounce: Duration,
}

/// The application root: owns the session-scoped context and routes user
/// intents and server events into the session store, the reconciler and
/// the history editor.
pub struct ActionsService {
    server: AgentServerBox,
    store: SessionStore,
    reconciler: Reconciler,
    history: HistoryEditor,
    confirmer: Arc<dyn Confirmer>,
    tx: mpsc::UnboundedSender<UiEvent>,
    context: ChatContext,
    refresh: Debouncer,
    refresh_rx: Option<mpsc::UnboundedReceiver<()>>,
    worker: JoinHandle<()>,
}

impl ActionsService {
    pub fn new(
        server: AgentServerBox,
        state: StateStoreBox,
        confirmer: Arc<dyn Confirmer>,
        tx: mpsc::UnboundedSender<UiEvent>,
        context: ChatContext,
        config: ActionsConfig,
    ) -> ActionsService {
        let (refresh, refresh_rx) = Debouncer::new(config.refresh_debounce);

        return ActionsService {
            store: SessionStore::new(server.clone(), state, config.create_timeout),
            reconciler: Reconciler::new(server.clone(), tx.clone()),
            history: HistoryEditor::new(server.clone()),
            server,
            confirmer,
            tx,
            context,
            refresh,
            refresh_rx: Some(refresh_rx),
            // Lazy default.
            worker: tokio::spawn(async {}),
        };
    }

    fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Presentation receiver dropped");
        }
    }

    fn notice(&self, text: &str) {
        self.emit(UiEvent::Notice(text.to_string()));
    }

    fn report(&self, err: anyhow::Error) {
        tracing::error!(error = ?err, "Action failed");
        self.emit(UiEvent::Error(format!("{err:#}")));
    }

    fn session_options(&self) -> SessionOptions {
        return SessionOptions {
            agent: Some(self.context.agent.to_string()),
            model: self.context.model.clone(),
            directory: Some(self.context.directory.to_string()),
            ..SessionOptions::default()
        };
    }

    fn current_session(&self) -> Result<String> {
        match &self.context.session_id {
            Some(id) => return Ok(self.store.resolve(id)),
            None => bail!("There is no active session"),
        }
    }

    /// Loads known sessions and opens the requested, the previously active
    /// or a fresh session.
    pub async fn init(&mut self) -> Result<()> {
        if let Err(err) = self.store.load().await {
            self.report(err.context("Failed to load sessions"));
        }

        if let Some(session_id) = self.context.session_id.clone() {
            if let Err(err) = self.store.set_active(&session_id).await {
                self.report(err);
            }
        }

        match self.store.active() {
            Some(session) => return self.open(&session).await,
            None => return self.new_session().await,
        }
    }

    async fn open(&mut self, session: &Session) -> Result<()> {
        self.context.session_id = Some(session.id.to_string());
        if !session.agent.is_empty() {
            self.context.agent = session.agent.to_string();
        }
        if session.model.is_some() {
            self.context.model = session.model.clone();
        }

        return self.reconciler.switch_to(session).await;
    }

    async fn new_session(&mut self) -> Result<()> {
        let session = self.store.create_placeholder(self.session_options()).await;
        self.context.attachments.clear();

        return self.open(&session).await;
    }

    async fn switch_session(&mut self, session_id: &str) -> Result<()> {
        self.store.set_active(session_id).await?;
        match self.store.active() {
            Some(session) => return self.open(&session).await,
            None => bail!("No session found for id {session_id}"),
        }
    }

    async fn send_message(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        if self.context.session_id.is_none() {
            self.new_session().await?;
        }
        let session_id = self.current_session()?;

        let mut files = mentions::resolve(text, &self.context.directory).await;
        let attachments = std::mem::take(&mut self.context.attachments);
        files.extend(attachments.iter().cloned());

        let message = self.reconciler.begin_user_message(&session_id, text, &files);

        let real_id = match self
            .store
            .confirm_placeholder(&session_id, self.session_options())
            .await
        {
            Ok(real_id) => real_id,
            Err(err) => {
                self.reconciler.abandon_user_message(&session_id, &message.id);
                self.context.attachments = attachments;
                return Err(err);
            }
        };
        if real_id != session_id {
            self.reconciler.rekey(&session_id, &real_id);
            self.context.session_id = Some(real_id.to_string());
        }

        if self.history.has_pending(&real_id) {
            self.history.discard_pending(&real_id);
            self.notice("The last undo can no longer be redone.");
        }
        self.context.last_user_text = text.to_string();
        if let Err(err) = self.store.record_message(&real_id, 1).await {
            tracing::warn!(error = ?err, "Failed to record message");
        }

        let req = PromptRequest {
            agent: Some(self.context.agent.to_string()),
            model: self.context.model.clone(),
            parts: message
                .parts
                .iter()
                .filter_map(|e| return e.to_prompt_value())
                .collect(),
        };

        let server = self.server.clone();
        let reconciler = self.reconciler.clone();
        let tx = self.tx.clone();
        self.worker = tokio::spawn(async move {
            if let Err(err) = server.prompt(&real_id, req).await {
                tracing::error!(error = ?err, session_id = %real_id, "Failed to send message");
                reconciler.fail_send();
                let _ = tx.send(UiEvent::Error(format!("Failed to send message: {err:#}")));
            }
        });

        return Ok(());
    }

    async fn delete_session(&mut self, session_id: Option<String>) -> Result<()> {
        let target = match session_id {
            Some(id) => self.store.resolve(&id),
            None => self.current_session()?,
        };
        let was_current = self.reconciler.active_id().as_deref() == Some(target.as_str());

        if !self.store.delete(&target, self.confirmer.as_ref()).await? {
            self.notice("Delete cancelled.");
            return Ok(());
        }

        self.reconciler.forget(&target);
        self.history.discard_pending(&target);
        self.notice(&format!("Deleted session {target}."));
        if was_current {
            self.context.session_id = None;
            self.new_session().await?;
        }

        return Ok(());
    }

    async fn fork_session(&mut self, message_id: Option<String>) -> Result<()> {
        let session_id = self.current_session()?;
        let fork = self.store.fork(&session_id, message_id.as_deref()).await?;
        self.notice(&format!("Forked into \"{}\" ({}).", fork.title, fork.id));

        return self.open(&fork).await;
    }

    async fn revert(&mut self, target: Option<String>) -> Result<()> {
        let session_id = self.current_session()?;
        let outcome = self.history.revert(&session_id, target.as_deref()).await?;
        self.reconciler
            .replace_transcript(&session_id, outcome.remaining.clone());

        self.emit(UiEvent::RevertApplied {
            session_id,
            removed: outcome.removed,
            remaining: outcome.remaining,
            restore_text: outcome.restore_text,
        });

        return Ok(());
    }

    async fn unrevert(&mut self) -> Result<()> {
        let session_id = self.current_session()?;
        let outcome = self.history.unrevert(&session_id).await?;
        self.reconciler
            .replace_transcript(&session_id, outcome.all.clone());

        self.emit(UiEvent::UnrevertApplied {
            session_id,
            restored: outcome.restored,
            all: outcome.all,
        });

        return Ok(());
    }

    async fn attach_file(&mut self, path: &str) -> Result<()> {
        let file = mentions::attach(path, &self.context.directory).await?;
        let name = file.filename.clone().unwrap_or_else(|| return path.to_string());
        self.context.attachments.push(file);
        self.notice(&format!("Attached {name} to the next message."));

        return Ok(());
    }

    fn change_model(&mut self, model: ModelRef) {
        self.notice(&format!("{model} has entered the chat."));
        self.context.model = Some(model);
    }

    async fn list_models(&self) -> Result<()> {
        let providers = self.server.providers(&self.context.directory).await?;
        let lines = providers
            .iter()
            .flat_map(|provider| {
                return provider
                    .models
                    .iter()
                    .map(|model| return format!("- {}/{model}", provider.provider_id));
            })
            .collect::<Vec<String>>();

        if lines.is_empty() {
            self.notice("The server has no models available.");
        } else {
            self.notice(&lines.join("\n"));
        }

        return Ok(());
    }

    async fn server_status(&self) -> Result<()> {
        let status = self.server.health().await?;
        let models = self
            .server
            .providers(&self.context.directory)
            .await
            .unwrap_or_default();

        self.emit(UiEvent::ServerStatus {
            version: status.version,
            agents: status.agents,
            models,
        });

        return Ok(());
    }

    pub async fn handle(&mut self, action: Action) -> Result<()> {
        tracing::debug!(action = ?action, "Handling action");
        match action {
            Action::AttachFile(path) => return self.attach_file(&path).await,
            Action::ChangeAgent(agent) => {
                self.notice(&format!("Agent set to {agent}."));
                self.context.agent = agent;
            }
            Action::ChangeModel(model) => self.change_model(model),
            Action::DeleteSession(session_id) => return self.delete_session(session_id).await,
            Action::ForkSession(message_id) => return self.fork_session(message_id).await,
            Action::ListModels() => return self.list_models().await,
            Action::ListSessions() => self.emit(UiEvent::SessionsChanged(self.store.list())),
            Action::NewSession() => return self.new_session().await,
            Action::RefreshSessions() => {
                let sessions = self.store.refresh().await?;
                self.emit(UiEvent::SessionsChanged(sessions));
            }
            Action::Revert(target) => return self.revert(target).await,
            Action::SendMessage(text) => return self.send_message(&text).await,
            Action::ServerStatus() => return self.server_status().await,
            Action::SwitchSession(session_id) => return self.switch_session(&session_id).await,
            Action::Unrevert() => return self.unrevert().await,
        }

        return Ok(());
    }

    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        if event == ServerEvent::Reconnected {
            self.resync().await;
            return;
        }

        self.store.apply_server_event(&event).await;

        let outcome = self.reconciler.apply(&event);
        if let Some((placeholder_id, real_id)) = outcome.repointed {
            tracing::debug!(placeholder_id = %placeholder_id, real_id = %real_id, "Active session repointed");
            if self.context.session_id.as_deref() == Some(placeholder_id.as_str()) {
                self.context.session_id = Some(real_id);
            }
        }
        if outcome.refresh_sessions {
            self.refresh.trigger();
        }
    }

    /// Catches up on whatever the server sent while the event stream was
    /// down: the session list, then the open transcript.
    async fn resync(&mut self) {
        tracing::info!("Resyncing after event stream reconnect");
        if let Err(err) = self.store.refresh().await {
            tracing::warn!(error = ?err, "Failed to refresh sessions after reconnect");
        }

        let session = match self.reconciler.active_id().and_then(|id| return self.store.get(&id)) {
            Some(session) if !session.is_placeholder() => session,
            _ => return,
        };
        // A load already in flight will see the current history.
        if self.reconciler.phase() == TranscriptPhase::Loading {
            return;
        }

        if let Err(err) = self.reconciler.switch_to(&session).await {
            self.report(err);
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        if event.kind != SessionEventKind::Deleted {
            return;
        }

        if self.reconciler.active_id().as_deref() != Some(event.session_id.as_str()) {
            self.reconciler.forget(&event.session_id);
            return;
        }

        self.reconciler.forget(&event.session_id);
        self.notice(&format!("Session {} was deleted.", event.session_id));
        self.context.session_id = None;
        if let Err(err) = self.new_session().await {
            self.report(err);
        }
    }

    #[cfg(test)]
    async fn finish_worker(&mut self) {
        let _ = (&mut self.worker).await;
    }

    pub async fn start(
        mut self,
        action_rx: &mut mpsc::UnboundedReceiver<Action>,
        server_rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Result<()> {
        let mut refresh_rx = match self.refresh_rx.take() {
            Some(refresh_rx) => refresh_rx,
            None => bail!("The actions service can only be started once"),
        };
        let mut session_rx = self.store.subscribe();
        if let Err(err) = self.init().await {
            self.report(err);
        }

        loop {
            tokio::select! {
                action = action_rx.recv() => {
                    let action = match action {
                        Some(action) => action,
                        None => break,
                    };
                    if let Err(err) = self.handle(action).await {
                        self.report(err);
                    }
                }
                Some(event) = server_rx.recv() => {
                    self.handle_server_event(event).await;
                }
                Some(_) = refresh_rx.recv() => {
                    if let Err(err) = self.store.refresh().await {
                        tracing::warn!(error = ?err, "Failed to refresh sessions");
                    }
                }
                res = session_rx.recv() => match res {
                    Ok(event) => self.handle_session_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        self.worker.abort();
        self.refresh.cancel();

        return Ok(());
    }
}
