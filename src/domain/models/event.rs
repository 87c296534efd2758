#[cfg(test)]
#[path = "event_test.rs"]
mod tests;

use serde_json::Value;

use super::MessagePart;
use super::Role;
use super::SessionInfo;

/// Canonical `{type, properties}` pair extracted from whatever wrapper the
/// transport delivered.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub properties: Value,
}

fn type_of(value: &Value) -> Option<&str> {
    return value
        .get("type")
        .and_then(|e| return e.as_str())
        .filter(|e| return !e.is_empty());
}

impl Envelope {
    /// Accepts `{type, properties}`, `{type, data}`, `{data: {type,
    /// properties}}` and `{payload: {type, properties}}`. Anything else
    /// becomes an `unknown` envelope carrying the raw value.
    pub fn normalize(raw: &Value) -> Envelope {
        if let Some(payload) = raw.get("payload").filter(|e| return type_of(e).is_some()) {
            return Envelope::normalize(payload);
        }

        if let Some(data) = raw.get("data").filter(|e| return type_of(e).is_some()) {
            return Envelope {
                kind: type_of(data).unwrap_or("unknown").to_string(),
                properties: data
                    .get("properties")
                    .cloned()
                    .unwrap_or_else(|| return data.clone()),
            };
        }

        if let Some(kind) = type_of(raw) {
            let properties = raw
                .get("properties")
                .or_else(|| return raw.get("data"))
                .cloned()
                .unwrap_or_else(|| return raw.clone());

            return Envelope {
                kind: kind.to_string(),
                properties,
            };
        }

        return Envelope {
            kind: "unknown".to_string(),
            properties: raw.clone(),
        };
    }

    fn str_prop(&self, key: &str) -> Option<String> {
        return self
            .properties
            .get(key)
            .and_then(|e| return e.as_str())
            .filter(|e| return !e.is_empty())
            .map(|e| return e.to_string());
    }

    /// The most specific id the event refers to: its part, then its message,
    /// then the session. Used to key duplicate suppression.
    pub fn identity(&self) -> Option<String> {
        let props = &self.properties;
        let nested = |outer: &str, inner: &str| {
            return props
                .get(outer)
                .and_then(|e| return e.get(inner))
                .and_then(|e| return e.as_str())
                .map(|e| return e.to_string());
        };

        return nested("part", "id")
            .or_else(|| return self.str_prop("messageID"))
            .or_else(|| return nested("info", "id"))
            .or_else(|| return self.str_prop("toolID"))
            .or_else(|| return self.str_prop("id"))
            .or_else(|| return self.str_prop("sessionID"));
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionChange {
    Created,
    Updated,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ToolStream {
    Stdout,
    Stderr,
}

/// Message metadata announced by the server ahead of, or alongside, its
/// parts.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageHeader {
    pub id: String,
    pub role: Role,
    pub session_id: Option<String>,
    pub time: i64,
    pub parts: Vec<MessagePart>,
}

/// Inbound server events after normalization. Unknown shapes are kept as
/// `Unknown` instead of passed along loosely typed.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    Connected,
    Heartbeat,
    /// Raised locally once the event stream is back after a dropped
    /// connection. Anything sent while it was down was missed.
    Reconnected,
    Session {
        change: SessionChange,
        info: SessionInfo,
    },
    SessionDeleted {
        session_id: String,
    },
    SessionIdle {
        session_id: Option<String>,
    },
    MessageCreated {
        message: MessageHeader,
    },
    MessageRemoved {
        session_id: Option<String>,
        message_id: String,
    },
    PartUpdated {
        session_id: Option<String>,
        message_id: Option<String>,
        role: Option<Role>,
        part: MessagePart,
    },
    ToolOutput {
        session_id: Option<String>,
        message_id: Option<String>,
        tool_id: Option<String>,
        stream: ToolStream,
        status: Option<String>,
        output: Option<String>,
        error: Option<String>,
        title: Option<String>,
    },
    Unknown {
        kind: String,
        properties: Value,
    },
}

impl ServerEvent {
    pub fn from_envelope(envelope: &Envelope, now: i64) -> ServerEvent {
        let props = &envelope.properties;
        let unknown = || {
            return ServerEvent::Unknown {
                kind: envelope.kind.to_string(),
                properties: props.clone(),
            };
        };

        match envelope.kind.as_str() {
            "server.connected" => return ServerEvent::Connected,
            "server.heartbeat" => return ServerEvent::Heartbeat,
            "session.created" | "session.updated" => {
                let change = if envelope.kind == "session.created" {
                    SessionChange::Created
                } else {
                    SessionChange::Updated
                };
                let info = props.get("info").unwrap_or(props);
                match SessionInfo::from_value(info, now) {
                    Some(info) => return ServerEvent::Session { change, info },
                    None => return unknown(),
                }
            }
            "session.deleted" => {
                let session_id = props
                    .get("info")
                    .and_then(|e| return e.get("id"))
                    .and_then(|e| return e.as_str())
                    .map(|e| return e.to_string())
                    .or_else(|| return envelope.str_prop("sessionID"))
                    .or_else(|| return envelope.str_prop("id"));
                match session_id {
                    Some(session_id) => return ServerEvent::SessionDeleted { session_id },
                    None => return unknown(),
                }
            }
            "session.idle" => {
                return ServerEvent::SessionIdle {
                    session_id: envelope.str_prop("sessionID"),
                };
            }
            "session.status" => {
                let status = props
                    .get("status")
                    .and_then(|e| return e.get("type").or(Some(e)))
                    .and_then(|e| return e.as_str());
                if status == Some("idle") {
                    return ServerEvent::SessionIdle {
                        session_id: envelope.str_prop("sessionID"),
                    };
                }
                return unknown();
            }
            "message.created" | "message.updated" => {
                let info = props
                    .get("info")
                    .or_else(|| return props.get("message"))
                    .unwrap_or(props);
                let id = match info.get("id").and_then(|e| return e.as_str()) {
                    Some(id) => id,
                    None => return unknown(),
                };
                let role = info
                    .get("role")
                    .or_else(|| return info.get("sender"))
                    .or_else(|| return props.get("sender"))
                    .and_then(|e| return e.as_str())
                    .and_then(Role::parse)
                    .unwrap_or(Role::Assistant);
                let session_id = info
                    .get("sessionID")
                    .and_then(|e| return e.as_str())
                    .map(|e| return e.to_string())
                    .or_else(|| return envelope.str_prop("sessionID"));
                let time = info
                    .get("time")
                    .and_then(|time| return time.get("created").or(Some(time)))
                    .and_then(|e| return e.as_i64())
                    .unwrap_or(now);
                let parts = info
                    .get("parts")
                    .or_else(|| return props.get("parts"))
                    .and_then(|e| return e.as_array())
                    .map(|parts| {
                        return parts
                            .iter()
                            .filter_map(MessagePart::from_value)
                            .collect::<Vec<MessagePart>>();
                    })
                    .unwrap_or_default();

                return ServerEvent::MessageCreated {
                    message: MessageHeader {
                        id: id.to_string(),
                        role,
                        session_id,
                        time,
                        parts,
                    },
                };
            }
            "message.removed" => match envelope.str_prop("messageID") {
                Some(message_id) => {
                    return ServerEvent::MessageRemoved {
                        session_id: envelope.str_prop("sessionID"),
                        message_id,
                    };
                }
                None => return unknown(),
            },
            "message.part.updated" => {
                let raw_part = props.get("part").unwrap_or(props);
                let part = match MessagePart::from_value(raw_part) {
                    Some(part) => part,
                    None => return unknown(),
                };
                let from_part = |key: &str| {
                    return raw_part
                        .get(key)
                        .and_then(|e| return e.as_str())
                        .filter(|e| return !e.is_empty())
                        .map(|e| return e.to_string());
                };

                return ServerEvent::PartUpdated {
                    session_id: envelope
                        .str_prop("sessionID")
                        .or_else(|| return from_part("sessionID")),
                    message_id: envelope
                        .str_prop("messageID")
                        .or_else(|| return from_part("messageID")),
                    role: envelope
                        .str_prop("sender")
                        .or_else(|| return from_part("sender"))
                        .and_then(|e| return Role::parse(&e)),
                    part,
                };
            }
            "tool.stdout" | "tool.stderr" => {
                let stream = if envelope.kind == "tool.stderr" {
                    ToolStream::Stderr
                } else {
                    ToolStream::Stdout
                };
                let output = props.get("output").and_then(|e| match e {
                    Value::Null => return None,
                    Value::String(text) => return Some(text.to_string()),
                    other => return Some(other.to_string()),
                });

                return ServerEvent::ToolOutput {
                    session_id: envelope.str_prop("sessionID"),
                    message_id: envelope.str_prop("messageID"),
                    tool_id: envelope.str_prop("toolID"),
                    stream,
                    status: envelope.str_prop("state"),
                    output,
                    error: envelope.str_prop("error"),
                    title: envelope.str_prop("title"),
                };
            }
            _ => return unknown(),
        }
    }

    /// Session the event is scoped to, when it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Session { info, .. } => return Some(&info.id),
            ServerEvent::SessionDeleted { session_id } => return Some(session_id),
            ServerEvent::SessionIdle { session_id }
            | ServerEvent::MessageRemoved { session_id, .. }
            | ServerEvent::PartUpdated { session_id, .. }
            | ServerEvent::ToolOutput { session_id, .. } => return session_id.as_deref(),
            ServerEvent::MessageCreated { message } => return message.session_id.as_deref(),
            _ => return None,
        }
    }
}
