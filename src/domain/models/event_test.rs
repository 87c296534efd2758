use serde_json::json;
use test_utils::idle_event;
use test_utils::message_created_event;
use test_utils::part_updated_event;
use test_utils::session_value;
use test_utils::text_part;
use test_utils::tool_output_event;

use super::Envelope;
use super::ServerEvent;
use super::SessionChange;
use super::ToolStream;
use crate::domain::models::Role;

#[test]
fn it_normalizes_type_and_properties() {
    let envelope = Envelope::normalize(&idle_event("ses_1"));
    assert_eq!(envelope.kind, "session.idle");
    assert_eq!(envelope.properties, json!({ "sessionID": "ses_1" }));
}

#[test]
fn it_normalizes_data_wrappers() {
    let wrapped = json!({ "data": idle_event("ses_1") });
    let envelope = Envelope::normalize(&wrapped);
    assert_eq!(envelope.kind, "session.idle");
    assert_eq!(envelope.properties, json!({ "sessionID": "ses_1" }));

    let flat = json!({ "type": "session.idle", "data": { "sessionID": "ses_2" } });
    let envelope = Envelope::normalize(&flat);
    assert_eq!(envelope.properties, json!({ "sessionID": "ses_2" }));
}

#[test]
fn it_normalizes_payload_wrappers() {
    let wrapped = json!({ "directory": "/work", "payload": idle_event("ses_1") });
    let envelope = Envelope::normalize(&wrapped);
    assert_eq!(envelope.kind, "session.idle");
}

#[test]
fn it_keeps_unrecognized_shapes_as_unknown() {
    let raw = json!({ "hello": "world" });
    let envelope = Envelope::normalize(&raw);
    assert_eq!(envelope.kind, "unknown");

    let event = ServerEvent::from_envelope(&envelope, 0);
    assert_eq!(
        event,
        ServerEvent::Unknown {
            kind: "unknown".to_string(),
            properties: raw,
        }
    );
}

#[test]
fn it_picks_the_most_specific_identity() {
    let envelope =
        Envelope::normalize(&part_updated_event("ses_1", "msg_1", text_part("prt_1", "x")));
    assert_eq!(envelope.identity(), Some("prt_1".to_string()));

    let envelope = Envelope::normalize(&message_created_event("ses_1", "msg_1", "user"));
    assert_eq!(envelope.identity(), Some("msg_1".to_string()));

    let envelope = Envelope::normalize(&idle_event("ses_1"));
    assert_eq!(envelope.identity(), Some("ses_1".to_string()));
}

#[test]
fn it_parses_part_updates() {
    let raw = part_updated_event("ses_1", "msg_1", text_part("prt_1", "Hello"));
    let event = ServerEvent::from_envelope(&Envelope::normalize(&raw), 0);

    match event {
        ServerEvent::PartUpdated {
            session_id,
            message_id,
            role,
            part,
        } => {
            assert_eq!(session_id, Some("ses_1".to_string()));
            assert_eq!(message_id, Some("msg_1".to_string()));
            assert_eq!(role, None);
            assert_eq!(part.text, Some("Hello".to_string()));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn it_reads_ids_from_the_part_itself() {
    let raw = json!({
        "type": "message.part.updated",
        "properties": {
            "part": { "id": "prt_1", "type": "text", "text": "x", "sessionID": "ses_1", "messageID": "msg_1" }
        }
    });
    let event = ServerEvent::from_envelope(&Envelope::normalize(&raw), 0);
    assert_eq!(event.session_id(), Some("ses_1"));
    match event {
        ServerEvent::PartUpdated { message_id, .. } => {
            assert_eq!(message_id, Some("msg_1".to_string()))
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn it_parses_message_created() {
    let raw = message_created_event("ses_1", "msg_1", "user");
    let event = ServerEvent::from_envelope(&Envelope::normalize(&raw), 0);

    match event {
        ServerEvent::MessageCreated { message } => {
            assert_eq!(message.id, "msg_1");
            assert_eq!(message.role, Role::User);
            assert_eq!(message.session_id, Some("ses_1".to_string()));
            assert_eq!(message.time, 1700000000000);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn it_parses_session_lifecycle_events() {
    let raw = json!({ "type": "session.updated", "properties": { "info": session_value("ses_1", "Renamed") } });
    match ServerEvent::from_envelope(&Envelope::normalize(&raw), 0) {
        ServerEvent::Session { change, info } => {
            assert_eq!(change, SessionChange::Updated);
            assert_eq!(info.title, "Renamed");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let raw = json!({ "type": "session.deleted", "properties": { "info": { "id": "ses_1" } } });
    assert_eq!(
        ServerEvent::from_envelope(&Envelope::normalize(&raw), 0),
        ServerEvent::SessionDeleted {
            session_id: "ses_1".to_string()
        }
    );
}

#[test]
fn it_maps_idle_status_to_idle() {
    let raw = json!({
        "type": "session.status",
        "properties": { "sessionID": "ses_1", "status": { "type": "idle" } }
    });
    assert_eq!(
        ServerEvent::from_envelope(&Envelope::normalize(&raw), 0),
        ServerEvent::SessionIdle {
            session_id: Some("ses_1".to_string())
        }
    );
}

#[test]
fn it_parses_tool_output_without_ids() {
    let raw = tool_output_event("ses_1", None, None, "line 1\n");
    match ServerEvent::from_envelope(&Envelope::normalize(&raw), 0) {
        ServerEvent::ToolOutput {
            session_id,
            message_id,
            tool_id,
            stream,
            output,
            status,
            ..
        } => {
            assert_eq!(session_id, Some("ses_1".to_string()));
            assert_eq!(message_id, None);
            assert_eq!(tool_id, None);
            assert_eq!(stream, ToolStream::Stdout);
            assert_eq!(output, Some("line 1\n".to_string()));
            assert_eq!(status, Some("running".to_string()));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn it_recognizes_connection_events() {
    let raw = json!({ "type": "server.connected", "properties": {} });
    assert_eq!(
        ServerEvent::from_envelope(&Envelope::normalize(&raw), 0),
        ServerEvent::Connected
    );
}
