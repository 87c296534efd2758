use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use mockito::Matcher;
use serde_json::json;
use test_utils::history_message;
use test_utils::idle_event;
use test_utils::session_value;

use super::parse_sse_line;
use super::OpenCodeServer;
use crate::domain::models::AgentServer;
use crate::domain::models::CreateSessionRequest;
use crate::domain::models::EventSource;
use crate::domain::models::ModelRef;
use crate::domain::models::PromptRequest;
use crate::domain::models::Role;

impl OpenCodeServer {
    fn with_url(url: String) -> OpenCodeServer {
        return OpenCodeServer {
            url,
            client: reqwest::Client::new(),
            prompt_retries: 3,
            retry_delay: Duration::from_millis(1),
        };
    }
}

mod status {
    use super::*;

    #[tokio::test]
    async fn it_reads_health() -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/global/health")
            .with_status(200)
            .with_body(
                json!({
                    "data": {
                        "version": "0.9.1",
                        "agents": [{ "name": "build" }, "plan"],
                        "providers": ["anthropic"],
                        "models": [{ "providerID": "anthropic", "models": ["claude-sonnet"] }]
                    }
                })
                .to_string(),
            )
            .create();

        let status = OpenCodeServer::with_url(server.url()).health().await?;

        assert_eq!(status.version, "0.9.1");
        assert_eq!(status.agents, vec!["build".to_string(), "plan".to_string()]);
        assert_eq!(status.providers, vec!["anthropic".to_string()]);
        assert_eq!(status.models[0].models, vec!["claude-sonnet".to_string()]);
        mock.assert();

        return Ok(());
    }

    #[tokio::test]
    async fn it_reports_unknown_when_unreachable() -> Result<()> {
        let status = OpenCodeServer::with_url("http://127.0.0.1:1".to_string())
            .health()
            .await?;

        assert_eq!(status.version, "unknown");
        assert!(status.agents.is_empty());

        return Ok(());
    }

    #[tokio::test]
    async fn it_fails_on_bad_health_responses() {
        let mut server = mockito::Server::new();
        let mock = server.mock("GET", "/global/health").with_status(500).create();

        let res = OpenCodeServer::with_url(server.url()).health().await;

        assert!(res.is_err());
        mock.assert();
    }

    #[tokio::test]
    async fn it_lists_providers_with_models() -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/config/providers")
            .match_query(Matcher::UrlEncoded("directory".into(), "/work/project".into()))
            .with_status(200)
            .with_body(
                json!({
                    "providers": [
                        { "id": "anthropic", "models": { "claude-sonnet": {}, "claude-haiku": {} } },
                        { "id": "empty", "models": {} },
                        { "name": "local", "models": { "llama": {} } }
                    ]
                })
                .to_string(),
            )
            .create();

        let providers = OpenCodeServer::with_url(server.url())
            .providers("/work/project")
            .await?;

        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].provider_id, "anthropic");
        assert_eq!(providers[0].models.len(), 2);
        assert_eq!(providers[1].provider_id, "local");
        mock.assert();

        return Ok(());
    }

    #[tokio::test]
    async fn it_returns_no_providers_on_failure() -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/config/providers")
            .match_query(Matcher::Any)
            .with_status(500)
            .create();

        let providers = OpenCodeServer::with_url(server.url()).providers("/").await?;

        assert!(providers.is_empty());
        mock.assert();

        return Ok(());
    }
}

mod sessions {
    use super::*;

    #[tokio::test]
    async fn it_creates_sessions() -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/session")
            .match_query(Matcher::UrlEncoded("directory".into(), "/work/project".into()))
            .match_body(Matcher::Json(json!({ "title": "Hello" })))
            .with_status(200)
            .with_body(json!({ "data": [session_value("ses_1", "Hello")] }).to_string())
            .create();

        let info = OpenCodeServer::with_url(server.url())
            .create_session(CreateSessionRequest {
                title: Some("Hello".to_string()),
                directory: Some("/work/project".to_string()),
                parent_id: None,
            })
            .await?;

        assert_eq!(info.id, "ses_1");
        assert_eq!(info.agent, None);
        assert_eq!(info.updated_at, 1700000005000);
        mock.assert();

        return Ok(());
    }

    #[tokio::test]
    async fn it_fails_when_creation_returns_nothing() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/session")
            .with_status(200)
            .with_body("{}")
            .create();

        let err = OpenCodeServer::with_url(server.url())
            .create_session(CreateSessionRequest::default())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to create session: no session data returned");
        mock.assert();
    }

    #[tokio::test]
    async fn it_lists_sessions_in_any_wrapper() -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/session")
            .with_status(200)
            .with_body(
                json!({
                    "body": {
                        "sessions": [session_value("ses_1", "One"), { "title": "no id" }, session_value("ses_2", "")]
                    }
                })
                .to_string(),
            )
            .create();

        let sessions = OpenCodeServer::with_url(server.url()).list_sessions().await?;

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].title, "Untitled");
        mock.assert();

        return Ok(());
    }

    #[tokio::test]
    async fn it_gets_and_deletes_sessions() -> Result<()> {
        let mut server = mockito::Server::new();
        let get = server
            .mock("GET", "/session/ses_1")
            .with_status(200)
            .with_body(session_value("ses_1", "One").to_string())
            .create();
        let delete = server
            .mock("DELETE", "/session/ses_1")
            .with_status(200)
            .with_body("true")
            .create();

        let backend = OpenCodeServer::with_url(server.url());
        assert_eq!(backend.get_session("ses_1").await?.title, "One");
        backend.delete_session("ses_1").await?;

        get.assert();
        delete.assert();

        return Ok(());
    }

    #[tokio::test]
    async fn it_forks_at_a_message() -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/session/ses_1/fork")
            .match_body(Matcher::Json(json!({ "messageID": "msg_2" })))
            .with_status(200)
            .with_body(json!({ "data": session_value("ses_2", "One (fork)") }).to_string())
            .create();

        let fork = OpenCodeServer::with_url(server.url())
            .fork_session("ses_1", Some("msg_2"))
            .await?;

        assert_eq!(fork.id, "ses_2");
        mock.assert();

        return Ok(());
    }
}

mod messages {
    use super::*;

    #[tokio::test]
    async fn it_sends_prompts() -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/session/ses_1/message")
            .match_body(Matcher::Json(json!({
                "agent": "build",
                "model": { "providerID": "anthropic", "modelID": "claude-sonnet" },
                "parts": [{ "type": "text", "text": "hi" }]
            })))
            .with_status(200)
            .with_body("{}")
            .create();

        OpenCodeServer::with_url(server.url())
            .prompt(
                "ses_1",
                PromptRequest {
                    agent: Some("build".to_string()),
                    model: ModelRef::parse("anthropic/claude-sonnet"),
                    parts: vec![json!({ "type": "text", "text": "hi" })],
                },
            )
            .await?;

        mock.assert();

        return Ok(());
    }

    #[tokio::test]
    async fn it_retries_prompts_before_failing() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/session/ses_1/message")
            .with_status(503)
            .expect(3)
            .create();

        let res = OpenCodeServer::with_url(server.url())
            .prompt(
                "ses_1",
                PromptRequest {
                    agent: None,
                    model: None,
                    parts: vec![],
                },
            )
            .await;

        assert!(res.is_err());
        mock.assert();
    }

    #[tokio::test]
    async fn it_flattens_history() -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/session/ses_1/message")
            .with_status(200)
            .with_body(
                json!({
                    "data": [
                        history_message("ses_1", "msg_1", "user", "hello"),
                        history_message("ses_1", "msg_2", "assistant", "hi there")
                    ]
                })
                .to_string(),
            )
            .create();

        let messages = OpenCodeServer::with_url(server.url()).messages("ses_1").await?;

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].text(), "hi there");
        mock.assert();

        return Ok(());
    }

    #[tokio::test]
    async fn it_reverts_and_restores() -> Result<()> {
        let mut server = mockito::Server::new();
        let revert = server
            .mock("POST", "/session/ses_1/revert")
            .match_body(Matcher::Json(json!({ "messageID": "msg_3" })))
            .with_status(200)
            .with_body("{}")
            .create();
        let unrevert = server
            .mock("POST", "/session/ses_1/unrevert")
            .with_status(200)
            .with_body("{}")
            .create();

        let backend = OpenCodeServer::with_url(server.url());
        backend.revert("ses_1", "msg_3", None).await?;
        backend.unrevert("ses_1").await?;

        revert.assert();
        unrevert.assert();

        return Ok(());
    }
}

mod events {
    use super::*;

    #[test]
    fn it_parses_data_lines_only() {
        assert_eq!(parse_sse_line("data: {\"type\":\"x\"}"), Some(json!({ "type": "x" })));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("event: message"), None);
        assert_eq!(parse_sse_line("data: not json"), None);
    }

    #[tokio::test]
    async fn it_streams_events_until_closed() -> Result<()> {
        let body = format!(
            "data: {}\n\n: ping\n\ndata: {}\n\n",
            json!({ "type": "server.connected", "properties": {} }),
            idle_event("ses_1")
        );
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/event")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create();

        let mut conn = OpenCodeServer::with_url(server.url()).connect().await?;
        let mut events = vec![];
        while let Some(event) = conn.events.next().await {
            events.push(event?);
        }

        assert_eq!(events.len(), 2);
        assert_eq!(events[1], idle_event("ses_1"));
        assert!(!conn.is_open());
        mock.assert();

        return Ok(());
    }

    #[tokio::test]
    async fn it_fails_to_connect_on_errors() {
        let mut server = mockito::Server::new();
        let mock = server.mock("GET", "/event").with_status(404).create();

        let res = OpenCodeServer::with_url(server.url()).connect().await;

        assert!(res.is_err());
        mock.assert();
    }
}
