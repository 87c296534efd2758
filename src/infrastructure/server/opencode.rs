#[cfg(test)]
#[path = "opencode_test.rs"]
mod tests;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream;
use futures::stream::TryStreamExt;
use futures::StreamExt;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;

use super::payload;
use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::AgentServer;
use crate::domain::models::CreateSessionRequest;
use crate::domain::models::EventConnection;
use crate::domain::models::EventSource;
use crate::domain::models::Message;
use crate::domain::models::PromptRequest;
use crate::domain::models::ProviderModels;
use crate::domain::models::ServerStatus;
use crate::domain::models::SessionInfo;
use crate::domain::services::now_millis;

fn convert_err(err: reqwest::Error) -> std::io::Error {
    let err_msg = err.to_string();
    return std::io::Error::new(std::io::ErrorKind::Interrupted, err_msg);
}

/// HTTP client for an OpenCode server, plus its `/event` SSE feed.
#[derive(Clone)]
pub struct OpenCodeServer {
    url: String,
    client: reqwest::Client,
    prompt_retries: u32,
    retry_delay: Duration,
}

impl Default for OpenCodeServer {
    fn default() -> OpenCodeServer {
        return OpenCodeServer {
            url: Config::get(ConfigKey::ServerUrl)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
            prompt_retries: Config::get_number(ConfigKey::PromptRetries) as u32,
            retry_delay: Duration::from_secs(1),
        };
    }
}

impl OpenCodeServer {
    fn endpoint(&self, path: &str) -> String {
        return format!("{url}{path}", url = self.url);
    }

    async fn send(&self, req: reqwest::RequestBuilder, operation: &str) -> Result<Value> {
        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %body, operation, "OpenCode request failed");
            bail!("{operation} returned {status}");
        }

        let text = res.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        return serde_json::from_str(&text).with_context(|| return format!("{operation} returned invalid JSON"));
    }

    async fn get(&self, path: &str, operation: &str) -> Result<Value> {
        return self.send(self.client.get(self.endpoint(path)), operation).await;
    }

    async fn post(&self, path: &str, body: Value, operation: &str) -> Result<Value> {
        return self
            .send(self.client.post(self.endpoint(path)).json(&body), operation)
            .await;
    }

    fn session_info(value: Value, operation: &str) -> Result<SessionInfo> {
        return payload::single(value)
            .and_then(|e| return SessionInfo::from_value(&e, now_millis()))
            .ok_or_else(|| return anyhow!("{operation}: no session data returned"));
    }
}

#[async_trait]
impl AgentServer for OpenCodeServer {
    #[allow(clippy::implicit_return)]
    async fn health(&self) -> Result<ServerStatus> {
        let res = self.client.get(self.endpoint("/global/health")).send().await;
        let res = match res {
            Ok(res) => res,
            Err(err) if err.is_connect() => {
                tracing::warn!(error = ?err, "OpenCode server is not reachable");
                return Ok(ServerStatus::unknown());
            }
            Err(err) => return Err(anyhow!("Failed to connect to OpenCode server: {err}")),
        };

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "OpenCode health check failed");
            bail!("OpenCode health check failed");
        }

        let data = payload::unwrap(res.json::<Value>().await.unwrap_or(Value::Null));
        let models = data
            .get("models")
            .cloned()
            .and_then(|e| return serde_json::from_value::<Vec<ProviderModels>>(e).ok())
            .unwrap_or_default();

        return Ok(ServerStatus {
            version: data
                .get("version")
                .and_then(|e| return e.as_str())
                .unwrap_or("unknown")
                .to_string(),
            agents: payload::names(data.get("agents")),
            providers: payload::names(data.get("providers")),
            models,
        });
    }

    #[allow(clippy::implicit_return)]
    async fn providers(&self, directory: &str) -> Result<Vec<ProviderModels>> {
        let req = self
            .client
            .get(self.endpoint("/config/providers"))
            .query(&[("directory", directory)]);
        let value = match self.send(req, "Listing providers").await {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = ?err, "Failed to load models");
                return Ok(vec![]);
            }
        };

        let providers = payload::list(value, "providers")
            .into_iter()
            .filter_map(|provider| {
                let models = match provider.get("models") {
                    Some(Value::Object(models)) => models.keys().cloned().collect::<Vec<String>>(),
                    Some(Value::Array(_)) => payload::names(provider.get("models")),
                    _ => vec![],
                };
                if models.is_empty() {
                    return None;
                }

                let provider_id = provider
                    .get("id")
                    .or_else(|| return provider.get("name"))
                    .and_then(|e| return e.as_str())
                    .unwrap_or("unknown");

                return Some(ProviderModels {
                    provider_id: provider_id.to_string(),
                    models,
                });
            })
            .collect();

        return Ok(providers);
    }

    #[allow(clippy::implicit_return)]
    async fn create_session(&self, req: CreateSessionRequest) -> Result<SessionInfo> {
        let mut body = json!({});
        if let Some(title) = req.title {
            body["title"] = json!(title);
        }
        if let Some(parent_id) = req.parent_id {
            body["parentID"] = json!(parent_id);
        }

        let mut builder = self.client.post(self.endpoint("/session")).json(&body);
        if let Some(directory) = req.directory {
            builder = builder.query(&[("directory", directory)]);
        }

        let value = self.send(builder, "Creating session").await?;
        return OpenCodeServer::session_info(value, "Failed to create session");
    }

    #[allow(clippy::implicit_return)]
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let value = self.get("/session", "Listing sessions").await?;
        let now = now_millis();

        let sessions = payload::list(value, "sessions")
            .iter()
            .filter_map(|e| return SessionInfo::from_value(e, now))
            .collect::<Vec<SessionInfo>>();
        tracing::debug!(count = sessions.len(), "Listed sessions");

        return Ok(sessions);
    }

    #[allow(clippy::implicit_return)]
    async fn get_session(&self, id: &str) -> Result<SessionInfo> {
        let value = self.get(&format!("/session/{id}"), "Getting session").await?;
        return OpenCodeServer::session_info(value, &format!("Session {id} not found"));
    }

    #[allow(clippy::implicit_return)]
    async fn delete_session(&self, id: &str) -> Result<()> {
        let req = self.client.delete(self.endpoint(&format!("/session/{id}")));
        self.send(req, "Deleting session").await?;

        return Ok(());
    }

    #[allow(clippy::implicit_return)]
    async fn fork_session(&self, id: &str, message_id: Option<&str>) -> Result<SessionInfo> {
        let mut body = json!({});
        if let Some(message_id) = message_id {
            body["messageID"] = json!(message_id);
        }

        let value = self
            .post(&format!("/session/{id}/fork"), body, "Forking session")
            .await?;
        return OpenCodeServer::session_info(value, &format!("Failed to fork session {id}"));
    }

    #[allow(clippy::implicit_return)]
    async fn prompt(&self, session_id: &str, req: PromptRequest) -> Result<()> {
        let mut body = json!({ "parts": req.parts });
        if let Some(agent) = req.agent {
            body["agent"] = json!(agent);
        }
        if let Some(model) = req.model {
            body["model"] = serde_json::to_value(model)?;
        }

        let path = format!("/session/{session_id}/message");
        let attempts = self.prompt_retries.max(1);
        for attempt in 0..attempts {
            match self.post(&path, body.clone(), "Sending prompt").await {
                Ok(_) => return Ok(()),
                Err(err) if attempt + 1 == attempts => {
                    tracing::error!(error = ?err, session_id, "All prompt attempts failed");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.retry_delay * 2_u32.pow(attempt);
                    tracing::warn!(
                        error = ?err,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Prompt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        return Ok(());
    }

    #[allow(clippy::implicit_return)]
    async fn messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let value = self
            .get(&format!("/session/{session_id}/message"), "Loading messages")
            .await?;

        let messages = payload::list(value, "messages")
            .iter()
            .filter_map(Message::from_envelope)
            .collect::<Vec<Message>>();

        return Ok(messages);
    }

    #[allow(clippy::implicit_return)]
    async fn revert(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: Option<&str>,
    ) -> Result<()> {
        let mut body = json!({ "messageID": message_id });
        if let Some(part_id) = part_id {
            body["partID"] = json!(part_id);
        }

        self.post(&format!("/session/{session_id}/revert"), body, "Reverting session")
            .await?;
        return Ok(());
    }

    #[allow(clippy::implicit_return)]
    async fn unrevert(&self, session_id: &str) -> Result<()> {
        self.post(
            &format!("/session/{session_id}/unrevert"),
            json!({}),
            "Restoring session",
        )
        .await?;
        return Ok(());
    }
}

/// Turns one `data:` line of the feed into an event. Comments, event names
/// and keep-alives yield nothing.
fn parse_sse_line(line: &str) -> Option<Value> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(value) => return Some(value),
        Err(err) => {
            tracing::warn!(error = ?err, line = %data, "Skipping unreadable event");
            return None;
        }
    }
}

#[async_trait]
impl EventSource for OpenCodeServer {
    #[allow(clippy::implicit_return)]
    async fn connect(&self) -> Result<EventConnection> {
        let res = self
            .client
            .get(self.endpoint("/event"))
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "Failed to subscribe to events");
            bail!("Failed to subscribe to events: {}", res.status());
        }

        let open = Arc::new(AtomicBool::new(true));
        let lines = StreamReader::new(res.bytes_stream().map_err(convert_err)).lines();
        let events = stream::unfold((lines, open.clone()), |(mut lines, open)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(value) = parse_sse_line(&line) {
                            return Some((Ok(value), (lines, open)));
                        }
                    }
                    Ok(None) => {
                        open.store(false, Ordering::SeqCst);
                        return None;
                    }
                    Err(err) => {
                        open.store(false, Ordering::SeqCst);
                        return Some((Err(anyhow!(err)), (lines, open)));
                    }
                }
            }
        });

        return Ok(EventConnection::new(events.boxed(), open));
    }
}
