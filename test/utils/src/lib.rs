use std::env;

use serde_json::json;
use serde_json::Value;

pub fn insta_snapshot<F: FnOnce()>(f: F) {
    let mut settings = insta::Settings::clone_current();
    let snapshot_path = env::current_dir().unwrap().join("./test/snapshots");
    settings.set_snapshot_path(snapshot_path);
    settings.bind(f);
}

pub fn session_value(id: &str, title: &str) -> Value {
    return json!({
        "id": id,
        "title": title,
        "projectID": "proj_1",
        "directory": "/work/project",
        "time": { "created": 1700000000000_i64, "updated": 1700000005000_i64 }
    });
}

pub fn text_part(id: &str, text: &str) -> Value {
    return json!({ "id": id, "type": "text", "text": text });
}

pub fn reasoning_part(id: &str, text: &str) -> Value {
    return json!({ "id": id, "type": "reasoning", "text": text });
}

pub fn step_part(id: &str, kind: &str) -> Value {
    return json!({ "id": id, "type": kind });
}

pub fn tool_part(id: &str, tool: &str, status: &str, output: Option<&str>) -> Value {
    return json!({
        "id": id,
        "type": "tool",
        "callID": format!("call_{id}"),
        "tool": tool,
        "state": { "status": status, "input": { "command": "ls" }, "output": output, "title": tool }
    });
}

pub fn history_message(session_id: &str, id: &str, role: &str, text: &str) -> Value {
    return json!({
        "info": {
            "id": id,
            "role": role,
            "sessionID": session_id,
            "time": { "created": 1700000000000_i64 }
        },
        "parts": [text_part(&format!("{id}_p1"), text)]
    });
}

pub fn message_created_event(session_id: &str, id: &str, role: &str) -> Value {
    return json!({
        "type": "message.created",
        "properties": {
            "info": {
                "id": id,
                "role": role,
                "sessionID": session_id,
                "time": { "created": 1700000000000_i64 }
            }
        }
    });
}

pub fn part_updated_event(session_id: &str, message_id: &str, part: Value) -> Value {
    return json!({
        "type": "message.part.updated",
        "properties": {
            "sessionID": session_id,
            "messageID": message_id,
            "part": part
        }
    });
}

pub fn idle_event(session_id: &str) -> Value {
    return json!({ "type": "session.idle", "properties": { "sessionID": session_id } });
}

pub fn connected_event() -> Value {
    return json!({ "type": "server.connected", "properties": {} });
}

pub fn tool_output_event(
    session_id: &str,
    message_id: Option<&str>,
    tool_id: Option<&str>,
    output: &str,
) -> Value {
    let mut properties = json!({ "sessionID": session_id, "output": output, "state": "running" });
    if let Some(message_id) = message_id {
        properties["messageID"] = json!(message_id);
    }
    if let Some(tool_id) = tool_id {
        properties["toolID"] = json!(tool_id);
    }

    return json!({ "type": "tool.stdout", "properties": properties });
}
