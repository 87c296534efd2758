#[cfg(test)]
#[path = "history_test.rs"]
mod tests;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::domain::models::is_placeholder_id;
use crate::domain::models::AgentServerBox;
use crate::domain::models::Message;
use crate::domain::models::Role;

/// Revert and unrevert failures that leave the transcript untouched.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("There are no messages to undo")]
    NoMessages,
    #[error("Message {0} is not part of this session")]
    NoAnchor(String),
    #[error("Nothing to undo until the session has been created")]
    PlaceholderSession,
    #[error("Nothing to redo")]
    NothingToRestore,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RevertOutcome {
    pub anchor_id: String,
    pub removed: Vec<Message>,
    pub remaining: Vec<Message>,
    /// Text of the anchor message, to put back into the compose box.
    pub restore_text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnrevertOutcome {
    pub restored: Vec<Message>,
    pub all: Vec<Message>,
}

#[derive(Clone, Debug)]
struct PendingRevert {
    removed: Vec<Message>,
    remaining: Vec<Message>,
}

/// Index of the message a revert truncates at. Assistant targets walk back
/// to the user message that prompted them; with no user message at all
/// only the last message goes.
fn resolve_anchor(messages: &[Message], target: Option<&str>) -> Result<usize> {
    if messages.is_empty() {
        bail!(HistoryError::NoMessages);
    }

    let start = match target {
        Some(target) => match messages.iter().position(|e| return e.id == target) {
            Some(idx) => idx,
            None => bail!(HistoryError::NoAnchor(target.to_string())),
        },
        None => messages.len() - 1,
    };

    let anchor = messages[..=start]
        .iter()
        .rposition(|e| return e.role == Role::User)
        .unwrap_or(messages.len() - 1);

    return Ok(anchor);
}

/// Undo and redo of conversation turns, one pending revert per session.
#[derive(Clone)]
pub struct HistoryEditor {
    server: AgentServerBox,
    pending: Arc<Mutex<HashMap<String, PendingRevert>>>,
}

impl HistoryEditor {
    pub fn new(server: AgentServerBox) -> HistoryEditor {
        return HistoryEditor {
            server,
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRevert>> {
        return self.pending.lock().unwrap_or_else(PoisonError::into_inner);
    }

    pub fn has_pending(&self, session_id: &str) -> bool {
        return self.lock().contains_key(session_id);
    }

    /// Drops the redo record, e.g. once the user sends a new message.
    pub fn discard_pending(&self, session_id: &str) {
        if self.lock().remove(session_id).is_some() {
            tracing::debug!(session_id, "Discarded pending revert");
        }
    }

    pub async fn revert(&self, session_id: &str, target: Option<&str>) -> Result<RevertOutcome> {
        if is_placeholder_id(session_id) {
            bail!(HistoryError::PlaceholderSession);
        }

        let mut messages = self
            .server
            .messages(session_id)
            .await
            .context("Failed to load messages")?;
        let idx = resolve_anchor(&messages, target)?;
        let anchor_id = messages[idx].id.to_string();

        self.server
            .revert(session_id, &anchor_id, None)
            .await
            .with_context(|| return format!("Failed to revert to message {anchor_id}"))?;

        let removed = messages.split_off(idx);
        let restore_text = removed[0].text();
        self.lock().insert(
            session_id.to_string(),
            PendingRevert {
                removed: removed.clone(),
                remaining: messages.clone(),
            },
        );

        tracing::info!(
            session_id,
            anchor_id = %anchor_id,
            removed = removed.len(),
            "Reverted session"
        );

        return Ok(RevertOutcome {
            anchor_id,
            removed,
            remaining: messages,
            restore_text,
        });
    }

    /// Restores what the last revert removed. Prefers what the server gives
    /// back; when it gives back nothing new, replays the removed messages.
    pub async fn unrevert(&self, session_id: &str) -> Result<UnrevertOutcome> {
        let pending = match self.lock().get(session_id).cloned() {
            Some(pending) => pending,
            None => bail!(HistoryError::NothingToRestore),
        };

        self.server
            .unrevert(session_id)
            .await
            .context("Failed to restore reverted messages")?;
        let current = self
            .server
            .messages(session_id)
            .await
            .context("Failed to load messages")?;

        let known = pending
            .remaining
            .iter()
            .map(|e| return e.id.as_str())
            .collect::<HashSet<&str>>();
        let echoed = current
            .iter()
            .filter(|e| return !known.contains(e.id.as_str()))
            .cloned()
            .collect::<Vec<Message>>();

        let outcome = if echoed.is_empty() {
            tracing::debug!(session_id, "Server returned nothing new, replaying removed messages");
            let mut all = current;
            all.extend(pending.removed.iter().cloned());
            UnrevertOutcome {
                restored: pending.removed,
                all,
            }
        } else {
            UnrevertOutcome {
                restored: echoed,
                all: current,
            }
        };

        self.lock().remove(session_id);
        tracing::info!(session_id, restored = outcome.restored.len(), "Unreverted session");

        return Ok(outcome);
    }
}
