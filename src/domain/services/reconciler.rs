#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::Context;
use anyhow::Result;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::now_millis;
use crate::domain::models::is_placeholder_id;
use crate::domain::models::AgentServerBox;
use crate::domain::models::FileRef;
use crate::domain::models::Message;
use crate::domain::models::MessageHeader;
use crate::domain::models::MessagePart;
use crate::domain::models::PartKind;
use crate::domain::models::Role;
use crate::domain::models::ServerEvent;
use crate::domain::models::Session;
use crate::domain::models::ToolState;
use crate::domain::models::ToolStatus;
use crate::domain::models::ToolStream;
use crate::domain::models::UiEvent;

/// Ids of user messages rendered locally before the server has echoed
/// them back.
pub const LOCAL_MESSAGE_PREFIX: &str = "local_";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TranscriptPhase {
    Empty,
    Loading,
    Ready,
}

/// What applying an event did beyond the transcript itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub changed: bool,
    pub refresh_sessions: bool,
    /// `(placeholder, real)` when the event revealed the real id of the
    /// active placeholder.
    pub repointed: Option<(String, String)>,
}

struct ToolChunk<'a> {
    stream: ToolStream,
    status: Option<&'a String>,
    output: Option<&'a String>,
    error: Option<&'a String>,
    title: Option<&'a String>,
}

struct ReconcilerState {
    active_id: Option<String>,
    phase: TranscriptPhase,
    generation: u64,
    transcripts: HashMap<String, Vec<Message>>,
    waiting: bool,
    last_user_text: Option<String>,
}

impl ReconcilerState {
    fn transcript_mut(&mut self, session_id: &str) -> &mut Vec<Message> {
        return self.transcripts.entry(session_id.to_string()).or_default();
    }

    /// Session an event should be applied to, or None when it belongs to
    /// some other session.
    fn accept(&mut self, event_session: Option<&str>, outcome: &mut ApplyOutcome) -> Option<String> {
        let active = self.active_id.clone()?;
        let event_session = match event_session {
            Some(id) => id,
            None => return Some(active),
        };
        if event_session == active {
            return Some(active);
        }

        // Only a placeholder the user already sent from can be waiting on
        // its real id.
        let sent_from = self
            .transcripts
            .get(&active)
            .map(|e| return !e.is_empty())
            .unwrap_or(false);
        if is_placeholder_id(&active) && !is_placeholder_id(event_session) && sent_from {
            tracing::info!(
                placeholder_id = %active,
                real_id = event_session,
                "Repointing placeholder to server session"
            );
            self.rekey(&active, event_session);
            outcome.repointed = Some((active, event_session.to_string()));
            return Some(event_session.to_string());
        }

        tracing::debug!(session_id = event_session, "Ignoring event for inactive session");
        return None;
    }

    fn rekey(&mut self, old_id: &str, new_id: &str) -> bool {
        let mut changed = false;
        if let Some(mut moved) = self.transcripts.remove(old_id) {
            for message in moved.iter_mut() {
                message.session_id = new_id.to_string();
            }
            let existing = self.transcripts.remove(new_id).unwrap_or_default();
            for message in existing {
                if !moved.iter().any(|e| return e.id == message.id) {
                    moved.push(message);
                }
            }
            self.transcripts.insert(new_id.to_string(), moved);
            changed = true;
        }

        if self.active_id.as_deref() == Some(old_id) {
            self.active_id = Some(new_id.to_string());
            changed = true;
        }

        return changed;
    }

    /// Collapses every open reasoning part of a session.
    fn collapse_reasoning(&mut self, session_id: &str) -> bool {
        let mut changed = false;
        for message in self.transcript_mut(session_id).iter_mut() {
            changed |= message.collapse_reasoning();
        }

        return changed;
    }

    fn clear_waiting(&mut self, events: &mut Vec<UiEvent>) {
        if self.waiting {
            self.waiting = false;
            events.push(UiEvent::Waiting(false));
        }
    }

    /// Index of a message, creating an assistant message when the server
    /// streams parts for one it never announced.
    fn message_index(
        &mut self,
        session_id: &str,
        message_id: &str,
        events: &mut Vec<UiEvent>,
    ) -> usize {
        let transcript = self.transcript_mut(session_id);
        if let Some(idx) = transcript.iter().position(|e| return e.id == message_id) {
            return idx;
        }

        let message = Message::new(message_id, Role::Assistant, session_id, now_millis());
        transcript.push(message.clone());
        events.push(UiEvent::MessageAdded {
            session_id: session_id.to_string(),
            message,
        });

        return transcript.len() - 1;
    }
}

fn part_event(session_id: &str, message_id: &str, part: MessagePart) -> UiEvent {
    if part.kind == PartKind::Tool {
        return UiEvent::ToolUpdated {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            part,
        };
    }

    return UiEvent::PartUpdated {
        session_id: session_id.to_string(),
        message_id: message_id.to_string(),
        part,
    };
}

fn append_text(current: &mut Option<String>, chunk: &str) {
    match current {
        Some(text) => text.push_str(chunk),
        None => *current = Some(chunk.to_string()),
    }
}

/// Keeps per-session transcripts consistent with the event feed and tells
/// the presentation boundary what changed. The only writer of rendered
/// message state.
#[derive(Clone)]
pub struct Reconciler {
    server: AgentServerBox,
    state: Arc<Mutex<ReconcilerState>>,
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl Reconciler {
    pub fn new(server: AgentServerBox, tx: mpsc::UnboundedSender<UiEvent>) -> Reconciler {
        return Reconciler {
            server,
            state: Arc::new(Mutex::new(ReconcilerState {
                active_id: None,
                phase: TranscriptPhase::Empty,
                generation: 0,
                transcripts: HashMap::new(),
                waiting: false,
                last_user_text: None,
            })),
            tx,
        };
    }

    fn lock(&self) -> MutexGuard<'_, ReconcilerState> {
        return self.state.lock().unwrap_or_else(PoisonError::into_inner);
    }

    fn send(&self, events: Vec<UiEvent>) {
        for event in events {
            if self.tx.send(event).is_err() {
                tracing::debug!("Presentation receiver dropped");
                return;
            }
        }
    }

    pub fn active_id(&self) -> Option<String> {
        return self.lock().active_id.clone();
    }

    pub fn phase(&self) -> TranscriptPhase {
        return self.lock().phase;
    }

    #[cfg(test)]
    pub fn waiting(&self) -> bool {
        return self.lock().waiting;
    }

    pub fn transcript(&self, session_id: &str) -> Vec<Message> {
        return self
            .lock()
            .transcripts
            .get(session_id)
            .cloned()
            .unwrap_or_default();
    }

    /// Makes a session the one being displayed. Placeholders start empty
    /// without a round trip; real sessions load their history, which is
    /// discarded if the user moved on before it arrived.
    pub async fn switch_to(&self, session: &Session) -> Result<()> {
        let session_id = session.id.to_string();
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.active_id = Some(session_id.to_string());
            state.waiting = false;

            if session.is_placeholder() {
                state.phase = TranscriptPhase::Ready;
                let messages = state.transcript_mut(&session_id).clone();
                drop(state);

                self.send(vec![UiEvent::Init {
                    session_id: Some(session_id),
                    title: session.title.to_string(),
                    agent: session.agent.to_string(),
                    messages,
                }]);
                return Ok(());
            }

            state.phase = TranscriptPhase::Loading;
            state.generation
        };

        let res = self.server.messages(&session_id).await;

        let messages = {
            let mut state = self.lock();
            if state.generation != generation || state.active_id.as_deref() != Some(&session_id) {
                tracing::debug!(session_id = %session_id, "Discarding late history");
                return Ok(());
            }

            let messages = match res {
                Ok(messages) => messages,
                Err(err) => {
                    state.phase = TranscriptPhase::Empty;
                    return Err(err).context(format!("Failed to load messages for {session_id}"));
                }
            };

            state
                .transcripts
                .insert(session_id.to_string(), messages.clone());
            state.phase = TranscriptPhase::Ready;
            messages
        };

        tracing::debug!(session_id = %session_id, count = messages.len(), "Loaded transcript");
        self.send(vec![UiEvent::Init {
            session_id: Some(session_id),
            title: session.title.to_string(),
            agent: session.agent.to_string(),
            messages,
        }]);

        return Ok(());
    }

    /// Renders the user's own message immediately. The server echo later
    /// re-keys it to the real message id.
    pub fn begin_user_message(&self, session_id: &str, text: &str, files: &[FileRef]) -> Message {
        let id = format!("{LOCAL_MESSAGE_PREFIX}{}", Uuid::new_v4().simple());
        let mut message = Message::new(&id, Role::User, session_id, now_millis());
        message.parts.push(MessagePart::text(&format!("{id}:0"), text));
        for (idx, file) in files.iter().enumerate() {
            message
                .parts
                .push(MessagePart::file(&format!("{id}:{}", idx + 1), file.clone()));
        }

        {
            let mut state = self.lock();
            state.transcript_mut(session_id).push(message.clone());
            state.waiting = true;
            state.last_user_text = Some(text.to_string());
        }

        self.send(vec![
            UiEvent::MessageAdded {
                session_id: session_id.to_string(),
                message: message.clone(),
            },
            UiEvent::Waiting(true),
        ]);

        return message;
    }

    /// Drops the waiting indicator after a send failed.
    pub fn fail_send(&self) {
        let mut events = vec![];
        self.lock().clear_waiting(&mut events);
        self.send(events);
    }

    /// Takes back a locally rendered user message whose session could not
    /// be created.
    pub fn abandon_user_message(&self, session_id: &str, message_id: &str) {
        let mut events = vec![];
        {
            let mut state = self.lock();
            let transcript = state.transcript_mut(session_id);
            let before = transcript.len();
            transcript.retain(|e| return e.id != message_id);
            if transcript.len() != before {
                events.push(UiEvent::MessageRemoved {
                    session_id: session_id.to_string(),
                    message_id: message_id.to_string(),
                });
            }
            state.last_user_text = None;
            state.clear_waiting(&mut events);
        }

        self.send(events);
    }

    /// Moves everything keyed by a placeholder id to its confirmed id.
    pub fn rekey(&self, old_id: &str, new_id: &str) -> bool {
        return self.lock().rekey(old_id, new_id);
    }

    pub fn replace_transcript(&self, session_id: &str, messages: Vec<Message>) {
        self.lock()
            .transcripts
            .insert(session_id.to_string(), messages);
    }

    pub fn forget(&self, session_id: &str) {
        let mut state = self.lock();
        state.transcripts.remove(session_id);
        if state.active_id.as_deref() == Some(session_id) {
            state.active_id = None;
            state.phase = TranscriptPhase::Empty;
            state.generation += 1;
        }
    }

    pub fn apply(&self, event: &ServerEvent) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut events = vec![];

        {
            let mut state = self.lock();
            match event {
                ServerEvent::MessageCreated { message } => {
                    apply_message_created(&mut state, message, &mut outcome, &mut events);
                }
                ServerEvent::PartUpdated {
                    session_id,
                    message_id,
                    role,
                    part,
                } => {
                    apply_part_updated(
                        &mut state,
                        session_id.as_deref(),
                        message_id.as_deref(),
                        *role,
                        part,
                        &mut outcome,
                        &mut events,
                    );
                }
                ServerEvent::ToolOutput {
                    session_id,
                    message_id,
                    tool_id,
                    stream,
                    status,
                    output,
                    error,
                    title,
                } => {
                    let (message_id, tool_id) = match (message_id, tool_id) {
                        (Some(message_id), Some(tool_id)) => (message_id, tool_id),
                        _ => {
                            tracing::debug!("Dropping tool output without message or tool id");
                            return outcome;
                        }
                    };
                    let chunk = ToolChunk {
                        stream: *stream,
                        status: status.as_ref(),
                        output: output.as_ref(),
                        error: error.as_ref(),
                        title: title.as_ref(),
                    };
                    apply_tool_output(
                        &mut state,
                        session_id.as_deref(),
                        message_id,
                        tool_id,
                        chunk,
                        &mut outcome,
                        &mut events,
                    );
                }
                ServerEvent::SessionIdle { session_id } => {
                    apply_idle(&mut state, session_id.as_deref(), &mut outcome, &mut events);
                }
                ServerEvent::MessageRemoved {
                    session_id,
                    message_id,
                } => {
                    if let Some(session_id) = state.accept(session_id.as_deref(), &mut outcome) {
                        let transcript = state.transcript_mut(&session_id);
                        let before = transcript.len();
                        transcript.retain(|e| return &e.id != message_id);
                        if transcript.len() != before {
                            outcome.changed = true;
                            events.push(UiEvent::MessageRemoved {
                                session_id,
                                message_id: message_id.to_string(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        self.send(events);
        return outcome;
    }
}

fn apply_message_created(
    state: &mut ReconcilerState,
    header: &MessageHeader,
    outcome: &mut ApplyOutcome,
    events: &mut Vec<UiEvent>,
) {
    let session_id = match state.accept(header.session_id.as_deref(), outcome) {
        Some(session_id) => session_id,
        None => return,
    };
    let transcript = state.transcript_mut(&session_id);

    if let Some(existing) = transcript.iter_mut().find(|e| return e.id == header.id) {
        for part in header.parts.iter() {
            existing.upsert_part(part.clone());
            outcome.changed = true;
            // The user's own parts are already on screen.
            if existing.role == Role::User || part.kind.is_step_marker() {
                continue;
            }
            if let Some(merged) = existing.part(&part.id).cloned() {
                events.push(part_event(&session_id, &header.id, merged));
            }
        }
        return;
    }

    if header.role == Role::User {
        let local = transcript.iter_mut().rev().find(|e| {
            return e.role == Role::User && e.id.starts_with(LOCAL_MESSAGE_PREFIX);
        });
        if let Some(local) = local {
            tracing::debug!(local_id = %local.id, message_id = %header.id, "Re-keying local message");
            local.id = header.id.to_string();
            local.time = header.time;
            outcome.changed = true;
            return;
        }
    }

    let message = Message {
        id: header.id.to_string(),
        role: header.role,
        session_id: session_id.to_string(),
        parts: header.parts.clone(),
        time: header.time,
    };
    transcript.push(message.clone());
    outcome.changed = true;
    events.push(UiEvent::MessageAdded {
        session_id,
        message,
    });
}

fn apply_part_updated(
    state: &mut ReconcilerState,
    session_id: Option<&str>,
    message_id: Option<&str>,
    role: Option<Role>,
    part: &MessagePart,
    outcome: &mut ApplyOutcome,
    events: &mut Vec<UiEvent>,
) {
    let message_id = match message_id {
        Some(message_id) => message_id,
        None => {
            tracing::debug!(part_id = %part.id, "Dropping part without message id");
            return;
        }
    };
    let session_id = match state.accept(session_id, outcome) {
        Some(session_id) => session_id,
        None => return,
    };

    let known_role = state
        .transcripts
        .get(&session_id)
        .and_then(|e| return e.iter().find(|message| return message.id == message_id))
        .map(|e| return e.role);
    if role.or(known_role).unwrap_or(Role::Assistant) == Role::User {
        return;
    }

    if part.kind == PartKind::Text && part.text.is_some() && part.text == state.last_user_text {
        tracing::debug!(part_id = %part.id, "Suppressing echo of the user's text");
        return;
    }

    if part.kind.is_step_marker() {
        state.clear_waiting(events);
    }

    let idx = state.message_index(&session_id, message_id, events);
    let is_new = state.transcript_mut(&session_id)[idx]
        .part(&part.id)
        .is_none();
    if is_new && state.collapse_reasoning(&session_id) {
        events.push(UiEvent::ReasoningCollapsed {
            session_id: session_id.to_string(),
        });
    }

    let message = &mut state.transcript_mut(&session_id)[idx];
    message.upsert_part(part.clone());
    outcome.changed = true;

    if part.kind.is_step_marker() {
        return;
    }

    if let Some(merged) = message.part(&part.id).cloned() {
        events.push(part_event(&session_id, message_id, merged));
    }
}

fn apply_tool_output(
    state: &mut ReconcilerState,
    session_id: Option<&str>,
    message_id: &str,
    tool_id: &str,
    chunk: ToolChunk<'_>,
    outcome: &mut ApplyOutcome,
    events: &mut Vec<UiEvent>,
) {
    let session_id = match state.accept(session_id, outcome) {
        Some(session_id) => session_id,
        None => return,
    };

    let idx = state.message_index(&session_id, message_id, events);
    let message = &mut state.transcript_mut(&session_id)[idx];
    let existing = message.parts.iter().position(|e| return e.id == tool_id);
    let part = match existing {
        Some(part_idx) => &mut message.parts[part_idx],
        None => {
            message
                .parts
                .push(MessagePart::tool(tool_id, ToolState::default()));
            let last = message.parts.len() - 1;
            &mut message.parts[last]
        }
    };

    let tool = part.tool.get_or_insert_with(ToolState::default);
    if let Some(status) = chunk.status.and_then(|e| return ToolStatus::parse(e)) {
        tool.status = Some(status);
    }
    if let Some(title) = chunk.title {
        tool.title = Some(title.to_string());
    }
    match chunk.stream {
        ToolStream::Stdout => {
            if let Some(output) = chunk.output {
                append_text(&mut tool.output, output);
            }
            if let Some(error) = chunk.error {
                tool.error = Some(error.to_string());
            }
        }
        ToolStream::Stderr => {
            if let Some(output) = chunk.output.or(chunk.error) {
                append_text(&mut tool.error, output);
            }
        }
    }

    outcome.changed = true;
    events.push(part_event(&session_id, message_id, part.clone()));
}

fn apply_idle(
    state: &mut ReconcilerState,
    session_id: Option<&str>,
    outcome: &mut ApplyOutcome,
    events: &mut Vec<UiEvent>,
) {
    let concerned = session_id
        .map(|e| return e.to_string())
        .or_else(|| return state.active_id.clone());
    outcome.refresh_sessions = concerned
        .as_deref()
        .map(|e| return !is_placeholder_id(e))
        .unwrap_or(false);

    let session_id = match state.accept(session_id, outcome) {
        Some(session_id) => session_id,
        None => return,
    };

    if state.collapse_reasoning(&session_id) {
        events.push(UiEvent::ReasoningCollapsed {
            session_id: session_id.to_string(),
        });
    }
    state.clear_waiting(events);
    outcome.changed = true;
    events.push(UiEvent::SessionIdle { session_id });
}
