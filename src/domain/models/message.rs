#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

use serde_derive::Deserialize;
use serde_derive::Serialize;
use serde_json::Value;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn parse(text: &str) -> Option<Role> {
        match text {
            "user" => return Some(Role::User),
            "assistant" => return Some(Role::Assistant),
            "system" => return Some(Role::System),
            _ => return None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartKind {
    Text,
    Tool,
    Reasoning,
    File,
    Compaction,
    StepStart,
    StepFinish,
    Other(String),
}

impl PartKind {
    pub fn parse(text: &str) -> PartKind {
        match text {
            "text" => return PartKind::Text,
            "tool" => return PartKind::Tool,
            "reasoning" => return PartKind::Reasoning,
            "file" => return PartKind::File,
            "compaction" => return PartKind::Compaction,
            "step-start" => return PartKind::StepStart,
            "step-finish" => return PartKind::StepFinish,
            other => return PartKind::Other(other.to_string()),
        }
    }

    /// Step markers bracket an assistant turn rather than carry content.
    pub fn is_step_marker(&self) -> bool {
        return matches!(self, PartKind::StepStart | PartKind::StepFinish);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn parse(text: &str) -> Option<ToolStatus> {
        match text {
            "pending" => return Some(ToolStatus::Pending),
            "running" => return Some(ToolStatus::Running),
            "completed" => return Some(ToolStatus::Completed),
            "error" => return Some(ToolStatus::Error),
            _ => return None,
        }
    }
}

/// Every field is optional so an update only overwrites what it carries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub name: Option<String>,
    pub status: Option<ToolStatus>,
    pub input: Option<Value>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub title: Option<String>,
}

impl ToolState {
    pub fn merge(&mut self, update: ToolState) {
        if update.name.is_some() {
            self.name = update.name;
        }
        if update.status.is_some() {
            self.status = update.status;
        }
        if update.input.is_some() {
            self.input = update.input;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if update.title.is_some() {
            self.title = update.title;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub url: String,
    pub filename: Option<String>,
    pub mime: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    pub id: String,
    pub kind: PartKind,
    pub text: Option<String>,
    pub tool: Option<ToolState>,
    pub file: Option<FileRef>,
    #[serde(default)]
    pub collapsed: bool,
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => return None,
        Value::String(text) => return Some(text.to_string()),
        other => return Some(other.to_string()),
    }
}

impl MessagePart {
    pub fn text(id: &str, text: &str) -> MessagePart {
        return MessagePart {
            id: id.to_string(),
            kind: PartKind::Text,
            text: Some(text.to_string()),
            tool: None,
            file: None,
            collapsed: false,
        };
    }

    pub fn file(id: &str, file: FileRef) -> MessagePart {
        return MessagePart {
            id: id.to_string(),
            kind: PartKind::File,
            text: None,
            tool: None,
            file: Some(file),
            collapsed: false,
        };
    }

    pub fn tool(id: &str, tool: ToolState) -> MessagePart {
        return MessagePart {
            id: id.to_string(),
            kind: PartKind::Tool,
            text: None,
            tool: Some(tool),
            file: None,
            collapsed: false,
        };
    }

    /// Parses a part from the server. Tool calls fall back to their call id
    /// when the part id is missing; anything else without an id is dropped.
    pub fn from_value(value: &Value) -> Option<MessagePart> {
        let kind = PartKind::parse(value.get("type")?.as_str()?);
        let id = value
            .get("id")
            .or_else(|| return value.get("callID"))
            .and_then(|e| return e.as_str())
            .filter(|e| return !e.is_empty())?;

        let text = value
            .get("text")
            .or_else(|| return value.get("content"))
            .and_then(value_to_text);

        let mut tool = None;
        if kind == PartKind::Tool {
            tool = Some(tool_state_from_value(value));
        }

        let mut file = None;
        if kind == PartKind::File {
            if let Some(url) = value.get("url").and_then(|e| return e.as_str()) {
                file = Some(FileRef {
                    url: url.to_string(),
                    filename: value
                        .get("filename")
                        .and_then(|e| return e.as_str())
                        .map(|e| return e.to_string()),
                    mime: value
                        .get("mime")
                        .and_then(|e| return e.as_str())
                        .map(|e| return e.to_string()),
                });
            }
        }

        return Some(MessagePart {
            id: id.to_string(),
            kind,
            text,
            tool,
            file,
            collapsed: false,
        });
    }

    /// Shallow merge: fields present on the update overwrite the current
    /// ones, absent fields are left alone. Text carries the full current
    /// content on every update, so it is replaced and never appended.
    pub fn merge(&mut self, update: MessagePart) {
        self.kind = update.kind;
        if update.text.is_some() {
            self.text = update.text;
        }
        match (self.tool.as_mut(), update.tool) {
            (Some(current), Some(incoming)) => current.merge(incoming),
            (None, Some(incoming)) => self.tool = Some(incoming),
            _ => {}
        }
        if update.file.is_some() {
            self.file = update.file;
        }
    }

    /// Payload shape the server expects for outgoing prompt parts.
    pub fn to_prompt_value(&self) -> Option<Value> {
        match self.kind {
            PartKind::Text => {
                return Some(serde_json::json!({
                    "type": "text",
                    "text": self.text.clone().unwrap_or_default(),
                }));
            }
            PartKind::File => {
                let file = self.file.as_ref()?;
                return Some(serde_json::json!({
                    "type": "file",
                    "url": file.url,
                    "filename": file.filename,
                    "mime": file.mime.clone().unwrap_or_else(|| return "text/plain".to_string()),
                }));
            }
            _ => return None,
        }
    }
}

fn tool_state_from_value(value: &Value) -> ToolState {
    let mut tool = ToolState {
        name: value
            .get("tool")
            .or_else(|| return value.get("name"))
            .and_then(|e| return e.as_str())
            .map(|e| return e.to_string()),
        ..ToolState::default()
    };

    match value.get("state") {
        Some(Value::String(status)) => {
            tool.status = ToolStatus::parse(status);
        }
        Some(state) => {
            tool.status = state
                .get("status")
                .and_then(|e| return e.as_str())
                .and_then(ToolStatus::parse);
            tool.input = state.get("input").filter(|e| return !e.is_null()).cloned();
            tool.output = state.get("output").and_then(value_to_text);
            tool.error = state.get("error").and_then(value_to_text);
            tool.title = state
                .get("title")
                .and_then(|e| return e.as_str())
                .map(|e| return e.to_string());
        }
        None => {}
    }

    if tool.output.is_none() {
        tool.output = value.get("output").and_then(value_to_text);
    }

    return tool;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub session_id: String,
    pub parts: Vec<MessagePart>,
    pub time: i64,
}

impl Message {
    pub fn new(id: &str, role: Role, session_id: &str, time: i64) -> Message {
        return Message {
            id: id.to_string(),
            role,
            session_id: session_id.to_string(),
            parts: vec![],
            time,
        };
    }

    /// Flattens the server's `{info, parts}` envelope into a message. Bare
    /// message objects are accepted too. Parts without ids get positional
    /// ids so history never loses content.
    pub fn from_envelope(value: &Value) -> Option<Message> {
        let info = value.get("info").unwrap_or(value);
        let id = info.get("id")?.as_str()?;
        let role = info
            .get("role")
            .and_then(|e| return e.as_str())
            .and_then(Role::parse)
            .unwrap_or(Role::Assistant);
        let session_id = info
            .get("sessionID")
            .and_then(|e| return e.as_str())
            .unwrap_or_default();
        let time = info
            .get("time")
            .and_then(|time| return time.get("created").or(Some(time)))
            .and_then(|e| return e.as_i64())
            .unwrap_or_default();

        let raw_parts = value
            .get("parts")
            .or_else(|| return info.get("parts"))
            .and_then(|e| return e.as_array())
            .cloned()
            .unwrap_or_default();

        let parts = raw_parts
            .iter()
            .enumerate()
            .filter_map(|(idx, raw)| {
                if let Some(part) = MessagePart::from_value(raw) {
                    return Some(part);
                }
                let mut with_id = raw.clone();
                if let Some(obj) = with_id.as_object_mut() {
                    obj.insert("id".to_string(), Value::String(format!("{id}:{idx}")));
                }
                return MessagePart::from_value(&with_id);
            })
            .collect::<Vec<MessagePart>>();

        return Some(Message {
            id: id.to_string(),
            role,
            session_id: session_id.to_string(),
            parts,
            time,
        });
    }

    pub fn part(&self, part_id: &str) -> Option<&MessagePart> {
        return self.parts.iter().find(|e| return e.id == part_id);
    }

    /// Upserts by part id. Unknown ids append, known ids merge in place.
    /// Returns whether a new part was appended.
    pub fn upsert_part(&mut self, part: MessagePart) -> bool {
        if let Some(existing) = self.parts.iter_mut().find(|e| return e.id == part.id) {
            existing.merge(part);
            return false;
        }

        self.parts.push(part);
        return true;
    }

    /// Collapses every open reasoning part, returning whether any changed.
    pub fn collapse_reasoning(&mut self) -> bool {
        let mut changed = false;
        for part in self.parts.iter_mut() {
            if part.kind == PartKind::Reasoning && !part.collapsed {
                part.collapsed = true;
                changed = true;
            }
        }

        return changed;
    }

    /// Visible text of the message, ignoring tool, file and marker parts.
    pub fn text(&self) -> String {
        return self
            .parts
            .iter()
            .filter(|e| return e.kind == PartKind::Text)
            .filter_map(|e| return e.text.clone())
            .collect::<Vec<String>>()
            .join("\n");
    }
}
