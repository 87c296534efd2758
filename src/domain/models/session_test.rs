use serde_json::json;
use test_utils::session_value;

use super::is_placeholder_id;
use super::Lifecycle;
use super::ModelRef;
use super::Session;
use super::SessionInfo;
use super::SessionOptions;
use super::SessionStatus;

#[test]
fn it_parses_session_info() {
    let info = SessionInfo::from_value(&session_value("ses_1", "Refactor"), 1).unwrap();
    assert_eq!(info.id, "ses_1");
    assert_eq!(info.title, "Refactor");
    assert_eq!(info.agent, None);
    assert_eq!(info.project_id, Some("proj_1".to_string()));
    assert_eq!(info.created_at, 1700000000000);
    assert_eq!(info.updated_at, 1700000005000);
}

#[test]
fn it_defaults_missing_session_fields() {
    let info = SessionInfo::from_value(&json!({ "id": "ses_2" }), 42).unwrap();
    assert_eq!(info.title, "Untitled");
    assert_eq!(info.agent, None);
    assert_eq!(Session::from_info(info.clone()).agent, "build");
    assert_eq!(info.created_at, 42);
    assert_eq!(info.updated_at, 42);
}

#[test]
fn it_rejects_session_without_id() {
    assert!(SessionInfo::from_value(&json!({ "title": "x" }), 1).is_none());
    assert!(SessionInfo::from_value(&json!({ "id": "" }), 1).is_none());
}

#[test]
fn it_creates_placeholders() {
    let options = SessionOptions {
        title: Some("Draft".to_string()),
        agent: Some("plan".to_string()),
        ..SessionOptions::default()
    };
    let session = Session::placeholder("temp_1_abc", &options, 10);

    assert!(session.is_placeholder());
    assert!(session.is_untouched_placeholder());
    assert_eq!(session.title, "Draft");
    assert_eq!(session.agent, "plan");
    assert_eq!(session.status, SessionStatus::Idle);
    assert!(is_placeholder_id(&session.id));
}

#[test]
fn it_promotes_placeholders_keeping_local_fields() {
    let mut session = Session::placeholder("temp_1_abc", &SessionOptions::default(), 10);
    session.title = "Draft".to_string();
    session.message_count = 2;

    let info = SessionInfo::from_value(&session_value("ses_9", "Server title"), 1).unwrap();
    session.promote(info);

    assert_eq!(session.id, "ses_9");
    assert_eq!(session.title, "Draft");
    assert_eq!(session.message_count, 2);
    assert_eq!(session.lifecycle, Lifecycle::Confirmed);
}

#[test]
fn it_merges_only_the_fields_the_server_sent() {
    let mut session = Session::placeholder("temp_1_abc", &SessionOptions::default(), 10);
    session.agent = "plan".to_string();

    session.merge_info(SessionInfo::from_value(&session_value("ses_9", "Renamed"), 1).unwrap());
    assert_eq!(session.title, "Renamed");
    assert_eq!(session.agent, "plan");

    let mut with_agent = session_value("ses_9", "Renamed");
    with_agent["agent"] = json!("review");
    session.merge_info(SessionInfo::from_value(&with_agent, 1).unwrap());
    assert_eq!(session.agent, "review");
}

#[test]
fn it_parses_model_refs() {
    let model = ModelRef::parse("openrouter/anthropic/claude").unwrap();
    assert_eq!(model.provider_id, "openrouter");
    assert_eq!(model.model_id, "anthropic/claude");
    assert_eq!(model.to_string(), "openrouter/anthropic/claude");

    assert!(ModelRef::parse("no-slash").is_none());
    assert!(ModelRef::parse("/missing").is_none());
}

#[test]
fn it_serializes_cache_in_camel_case() {
    let session = Session::placeholder("temp_1", &SessionOptions::default(), 10);
    let value = serde_json::to_value(session.cache()).unwrap();
    assert_eq!(
        value,
        json!({ "status": "idle", "messageCount": 0, "lastActivity": 10 })
    );
}
