#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

use std::fmt;

use serde_derive::Deserialize;
use serde_derive::Serialize;
use serde_json::Value;

/// Ids carrying this prefix belong to sessions that only exist locally
/// until the first message confirms them with the server.
pub const PLACEHOLDER_PREFIX: &str = "temp_";

pub const DEFAULT_TITLE: &str = "Untitled";
pub const DEFAULT_AGENT: &str = "build";

pub fn is_placeholder_id(id: &str) -> bool {
    return id.starts_with(PLACEHOLDER_PREFIX);
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Archived,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Pending,
    Confirmed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    /// Parses `provider/model`. Model ids may themselves contain slashes, so
    /// only the first one separates the provider.
    pub fn parse(text: &str) -> Option<ModelRef> {
        let (provider_id, model_id) = text.trim().split_once('/')?;
        if provider_id.is_empty() || model_id.is_empty() {
            return None;
        }

        return Some(ModelRef {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        });
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{}/{}", self.provider_id, self.model_id);
    }
}

/// A session as the agent server reports it, after normalization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
    /// Only present when the payload names one. OpenCode session payloads
    /// usually don't.
    pub agent: Option<String>,
    pub directory: String,
    pub project_id: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SessionInfo {
    /// Builds a session from any of the server's session shapes. Missing
    /// titles and timestamps fall back to defaults, a missing id makes the
    /// payload unusable.
    pub fn from_value(value: &Value, now: i64) -> Option<SessionInfo> {
        let id = value.get("id")?.as_str()?;
        if id.is_empty() {
            return None;
        }

        let str_field = |key: &str| {
            return value
                .get(key)
                .and_then(|e| return e.as_str())
                .filter(|e| return !e.is_empty())
                .map(|e| return e.to_string());
        };
        let time_field = |key: &str| {
            return value
                .get("time")
                .and_then(|time| return time.get(key))
                .and_then(|e| return e.as_i64())
                .filter(|e| return *e > 0)
                .unwrap_or(now);
        };

        return Some(SessionInfo {
            id: id.to_string(),
            title: str_field("title").unwrap_or_else(|| return DEFAULT_TITLE.to_string()),
            agent: str_field("agent"),
            directory: str_field("directory").unwrap_or_default(),
            project_id: str_field("projectID"),
            parent_id: str_field("parentID"),
            created_at: time_field("created"),
            updated_at: time_field("updated"),
        });
    }
}

/// Options for creating a session, either on the server or as a local
/// placeholder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub title: Option<String>,
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
    pub directory: Option<String>,
    pub parent_id: Option<String>,
}

/// Bookkeeping persisted per session so a restart can resume without
/// recounting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCache {
    pub status: SessionStatus,
    pub message_count: u64,
    pub last_activity: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub agent: String,
    pub directory: String,
    pub project_id: Option<String>,
    pub parent_id: Option<String>,
    pub model: Option<ModelRef>,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: SessionStatus,
    pub message_count: u64,
    pub last_activity: i64,
    pub lifecycle: Lifecycle,
}

impl Session {
    pub fn from_info(info: SessionInfo) -> Session {
        return Session {
            last_activity: info.updated_at,
            id: info.id,
            title: info.title,
            agent: info.agent.unwrap_or_else(|| return DEFAULT_AGENT.to_string()),
            directory: info.directory,
            project_id: info.project_id,
            parent_id: info.parent_id,
            model: None,
            created_at: info.created_at,
            updated_at: info.updated_at,
            status: SessionStatus::Idle,
            message_count: 0,
            lifecycle: Lifecycle::Confirmed,
        };
    }

    pub fn placeholder(id: &str, options: &SessionOptions, now: i64) -> Session {
        return Session {
            id: id.to_string(),
            title: options
                .title
                .clone()
                .unwrap_or_else(|| return "New Session".to_string()),
            agent: options
                .agent
                .clone()
                .unwrap_or_else(|| return DEFAULT_AGENT.to_string()),
            directory: options.directory.clone().unwrap_or_default(),
            project_id: None,
            parent_id: options.parent_id.clone(),
            model: options.model.clone(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Idle,
            message_count: 0,
            last_activity: now,
            lifecycle: Lifecycle::Pending,
        };
    }

    pub fn is_placeholder(&self) -> bool {
        return self.lifecycle == Lifecycle::Pending;
    }

    /// A placeholder nobody has typed into yet. These are dropped instead of
    /// parked when the user moves elsewhere.
    pub fn is_untouched_placeholder(&self) -> bool {
        return self.is_placeholder() && self.message_count == 0;
    }

    /// Adopts the server's identity for a confirmed placeholder while keeping
    /// everything the user already sees.
    pub fn promote(&mut self, info: SessionInfo) {
        self.id = info.id;
        self.project_id = info.project_id;
        self.created_at = info.created_at;
        self.updated_at = info.updated_at;
        if self.directory.is_empty() {
            self.directory = info.directory;
        }
        self.lifecycle = Lifecycle::Confirmed;
    }

    /// Refreshes server-owned fields from a newer listing or event.
    pub fn merge_info(&mut self, info: SessionInfo) {
        self.title = info.title;
        if let Some(agent) = info.agent {
            self.agent = agent;
        }
        self.directory = info.directory;
        self.project_id = info.project_id;
        self.parent_id = info.parent_id;
        self.created_at = info.created_at;
        self.updated_at = info.updated_at;
    }

    pub fn cache(&self) -> SessionCache {
        return SessionCache {
            status: self.status,
            message_count: self.message_count,
            last_activity: self.last_activity,
        };
    }

    pub fn apply_cache(&mut self, cache: SessionCache) {
        self.status = cache.status;
        self.message_count = cache.message_count;
        self.last_activity = cache.last_activity;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionEventKind {
    Created,
    Updated,
    Deleted,
    Activated,
    Forked,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session_id: String,
    pub timestamp: i64,
}
