#[cfg(test)]
#[path = "payload_test.rs"]
mod tests;

use serde_json::Value;

/// Strips the `{data: ...}` or `{body: ...}` wrapper some server builds put
/// around responses. Bare payloads pass through.
pub fn unwrap(value: Value) -> Value {
    match value {
        Value::Object(mut obj) => {
            for key in ["data", "body"] {
                if let Some(inner) = obj.remove(key) {
                    if !inner.is_null() {
                        return inner;
                    }
                }
            }
            return Value::Object(obj);
        }
        other => return other,
    }
}

/// A single object, taking the first element when the server answers with
/// an array.
pub fn single(value: Value) -> Option<Value> {
    match unwrap(value) {
        Value::Array(items) => return items.into_iter().next(),
        Value::Null => return None,
        other => return Some(other),
    }
}

/// A list, found either bare, wrapped, or nested under `key`. A lone object
/// becomes a list of one.
pub fn list(value: Value, key: &str) -> Vec<Value> {
    match unwrap(value) {
        Value::Array(items) => return items,
        Value::Null => return vec![],
        Value::Object(mut obj) => {
            if let Some(Value::Array(items)) = obj.remove(key) {
                return items;
            }
            if obj.is_empty() {
                return vec![];
            }
            return vec![Value::Object(obj)];
        }
        other => return vec![other],
    }
}

/// Names out of a list that holds either plain strings or objects with a
/// `name` or `id`.
pub fn names(value: Option<&Value>) -> Vec<String> {
    return value
        .and_then(|e| return e.as_array())
        .map(|items| {
            return items
                .iter()
                .filter_map(|item| match item {
                    Value::String(name) => return Some(name.to_string()),
                    Value::Object(obj) => {
                        return obj
                            .get("name")
                            .or_else(|| return obj.get("id"))
                            .and_then(|e| return e.as_str())
                            .map(|e| return e.to_string());
                    }
                    _ => return None,
                })
                .collect();
        })
        .unwrap_or_default();
}
