#[cfg(test)]
#[path = "console_test.rs"]
mod tests;

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use yansi::Paint;

use crate::domain::models::Action;
use crate::domain::models::Message;
use crate::domain::models::MessagePart;
use crate::domain::models::PartKind;
use crate::domain::models::Role;
use crate::domain::models::Session;
use crate::domain::models::SessionStatus;
use crate::domain::models::SlashCommand;
use crate::domain::models::ToolStatus;
use crate::domain::models::UiEvent;
use crate::domain::services::actions::help_text;
use crate::domain::services::actions::ConfirmRequest;

fn tool_line(part: &MessagePart) -> Option<String> {
    let tool = part.tool.as_ref()?;
    let name = tool.name.clone().unwrap_or_else(|| return "tool".to_string());
    let status = tool.status.map(|e| return e.to_string()).unwrap_or_else(|| return "pending".to_string());

    let mut line = format!("  > {name} [{status}]");
    if let Some(title) = &tool.title {
        if title != &name {
            line = format!("{line} {title}");
        }
    }

    match tool.status {
        Some(ToolStatus::Error) => {
            let error = tool.error.clone().unwrap_or_default();
            return Some(Paint::red(format!("{line}\n    {}", error.trim())).to_string());
        }
        Some(ToolStatus::Completed) => return Some(Paint::green(line).to_string()),
        _ => return Some(Paint::yellow(line).to_string()),
    }
}

fn author(role: Role) -> String {
    if role == Role::User {
        return Paint::cyan("You:").bold().to_string();
    }
    return Paint::magenta("Agent:").bold().to_string();
}

fn format_session(session: &Session, active_id: Option<&str>) -> String {
    let marker = if active_id == Some(session.id.as_str()) {
        "*"
    } else {
        "-"
    };
    let status = if session.is_placeholder() {
        "unsent".to_string()
    } else {
        session.status.to_string()
    };

    return format!(
        "{marker} {} (ID: {}) {status}, {} messages",
        session.title, session.id, session.message_count
    );
}

/// Turns reconciler output into terminal text. Streamed text parts only
/// print what was not shown before, and tool parts only print when their
/// status changes.
#[derive(Default)]
pub struct ConsoleView {
    shown_text: HashMap<String, String>,
    shown_tools: HashMap<String, Option<ToolStatus>>,
    current_part: Option<String>,
    mid_line: bool,
    active_id: Option<String>,
}

impl ConsoleView {
    fn end_line(&mut self) -> String {
        self.current_part = None;
        if self.mid_line {
            self.mid_line = false;
            return "\n".to_string();
        }
        return "".to_string();
    }

    fn line(&mut self, text: &str) -> String {
        return format!("{}{text}\n", self.end_line());
    }

    fn reset(&mut self) {
        self.shown_text.clear();
        self.shown_tools.clear();
        self.current_part = None;
    }

    fn render_message(&mut self, message: &Message) -> String {
        let mut out = self.line(&author(message.role));
        for part in message.parts.iter() {
            out = format!("{out}{}", self.render_part(part));
        }
        return format!("{out}{}", self.end_line());
    }

    fn render_part(&mut self, part: &MessagePart) -> String {
        match part.kind {
            PartKind::Text | PartKind::Reasoning => return self.render_text(part),
            PartKind::Tool => {
                let status = part.tool.as_ref().and_then(|e| return e.status);
                if self.shown_tools.get(&part.id) == Some(&status) {
                    return "".to_string();
                }
                self.shown_tools.insert(part.id.to_string(), status);
                return match tool_line(part) {
                    Some(text) => self.line(&text),
                    None => "".to_string(),
                };
            }
            PartKind::File => {
                let name = part
                    .file
                    .as_ref()
                    .and_then(|e| return e.filename.clone())
                    .unwrap_or_else(|| return "file".to_string());
                return self.line(&Paint::blue(format!("  @ {name}")).to_string());
            }
            _ => return "".to_string(),
        }
    }

    fn render_text(&mut self, part: &MessagePart) -> String {
        let text = part.text.clone().unwrap_or_default();
        if part.collapsed || text.is_empty() {
            return "".to_string();
        }

        let shown = self.shown_text.get(&part.id).cloned().unwrap_or_default();
        let fresh = match text.strip_prefix(shown.as_str()) {
            Some(rest) => rest.to_string(),
            None => format!("\n{text}"),
        };
        self.shown_text.insert(part.id.to_string(), text);
        if fresh.is_empty() {
            return "".to_string();
        }

        let mut out = "".to_string();
        if self.current_part.as_deref() != Some(part.id.as_str()) {
            out = self.end_line();
            if part.kind == PartKind::Reasoning {
                out = format!("{out}{}", Paint::new("thinking: ").dimmed());
            }
            self.current_part = Some(part.id.to_string());
        }

        self.mid_line = !fresh.ends_with('\n');
        if part.kind == PartKind::Reasoning {
            return format!("{out}{}", Paint::new(fresh).dimmed());
        }
        return format!("{out}{fresh}");
    }

    pub fn render(&mut self, event: &UiEvent) -> String {
        match event {
            UiEvent::Init {
                session_id,
                title,
                agent,
                messages,
            } => {
                self.reset();
                self.active_id = session_id.clone();
                let id = session_id.clone().unwrap_or_default();
                let mut out = self.line(
                    &Paint::new(format!("== {title} ({id}), agent {agent} =="))
                        .bold()
                        .to_string(),
                );
                for message in messages.iter() {
                    out = format!("{out}{}", self.render_message(message));
                }
                return out;
            }
            UiEvent::MessageAdded { message, .. } => return self.render_message(message),
            UiEvent::PartUpdated { part, .. } | UiEvent::ToolUpdated { part, .. } => {
                return self.render_part(part);
            }
            UiEvent::MessageRemoved { message_id, .. } => {
                return self.line(&Paint::new(format!("(message {message_id} removed)")).dimmed().to_string());
            }
            UiEvent::ReasoningCollapsed { .. } => return "".to_string(),
            UiEvent::SessionIdle { .. } => return self.end_line(),
            UiEvent::Waiting(true) => {
                return self.line(&Paint::new("...").dimmed().to_string());
            }
            UiEvent::Waiting(false) => return "".to_string(),
            UiEvent::RevertApplied {
                removed,
                restore_text,
                ..
            } => {
                let mut out = self.line(&format!("Undid {} messages.", removed.len()));
                if !restore_text.is_empty() {
                    out = format!(
                        "{out}{}",
                        self.line(&format!("Your message, ready to edit and resend:\n{restore_text}"))
                    );
                }
                return out;
            }
            UiEvent::UnrevertApplied { restored, .. } => {
                let mut out = self.line(&format!("Restored {} messages.", restored.len()));
                for message in restored.iter() {
                    out = format!("{out}{}", self.render_message(message));
                }
                return out;
            }
            UiEvent::SessionsChanged(sessions) => {
                if sessions.is_empty() {
                    return self.line("There are no sessions yet. Send a message to start one!");
                }
                let active_id = self.active_id.clone();
                let lines = sessions
                    .iter()
                    .map(|e| return format_session(e, active_id.as_deref()))
                    .collect::<Vec<String>>()
                    .join("\n");
                return self.line(&lines);
            }
            UiEvent::ServerStatus {
                version,
                agents,
                models,
            } => {
                let mut lines = vec![format!("Server version: {version}")];
                lines.push(format!("Agents: {}", agents.join(", ")));
                for provider in models.iter() {
                    lines.push(format!("- {}: {}", provider.provider_id, provider.models.join(", ")));
                }
                return self.line(&lines.join("\n"));
            }
            UiEvent::Notice(text) => return self.line(text),
            UiEvent::Error(text) => {
                return self.line(&Paint::red(format!("Error: {text}")).to_string());
            }
        }
    }
}

/// What a line typed at the prompt means.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Action(Action),
    Help,
    Quit,
    Invalid(String),
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }

    if let Some(command) = SlashCommand::parse(line) {
        if command.is_quit() {
            return Input::Quit;
        }
        if command.is_help() {
            return Input::Help;
        }
        return match command.to_action() {
            Some(action) => Input::Action(action),
            None => Input::Invalid(format!("{line} is missing an argument. Type /help for usage.")),
        };
    }

    return Input::Action(Action::SendMessage(line.to_string()));
}

fn is_yes(line: &str) -> bool {
    return ["y", "yes"].contains(&line.trim().to_lowercase().as_str());
}

fn write_out(text: &str) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }

    let mut stdout = std::io::stdout();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;

    return Ok(());
}

/// Runs the console until `/quit` or end of input. Delete confirmations
/// take over the next typed line.
pub async fn start(
    tx: mpsc::UnboundedSender<Action>,
    mut rx: mpsc::UnboundedReceiver<UiEvent>,
    mut confirm_rx: mpsc::UnboundedReceiver<ConfirmRequest>,
) -> Result<()> {
    let mut view = ConsoleView::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_confirm: Option<ConfirmRequest> = None;

    write_out(&view.line(&Paint::new("Type a message, or /help for commands.").dimmed().to_string()))?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };

                if let Some(req) = pending_confirm.take() {
                    if req.reply.send(is_yes(&line)).is_err() {
                        tracing::warn!("Confirmation was no longer awaited");
                    }
                    continue;
                }

                match parse_input(&line) {
                    Input::Action(action) => tx.send(action)?,
                    Input::Help => write_out(&view.line(&help_text()))?,
                    Input::Quit => break,
                    Input::Invalid(text) => write_out(&view.line(&Paint::red(text).to_string()))?,
                    Input::Empty => {}
                }
            }
            event = rx.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => break,
                };
                write_out(&view.render(&event))?;
            }
            Some(req) = confirm_rx.recv() => {
                write_out(&view.line(&format!("{} [y/N]", Paint::yellow(&req.prompt))))?;
                pending_confirm = Some(req);
            }
        }
    }

    write_out(&view.end_line())?;
    return Ok(());
}

/// Marks sessions the way the console lists them, for callers outside the
/// chat loop.
pub fn session_line(session: &Session) -> String {
    let active_id = if session.status == SessionStatus::Active {
        Some(session.id.as_str())
    } else {
        None
    };
    return format_session(session, active_id);
}
