use serde_json::{Map, Value};

use super::{check_tool_references, parse_arguments, Attachment, Role, ToolCall, UniversalMessage};
use crate::error::{KestrelError, Result};

/// Normalize loosely shaped conversation turns into [`UniversalMessage`]s.
///
/// Accepts snake_case and camelCase field names, string or part-array
/// content, and OpenAI-shaped `tool_calls` (`function.arguments` as JSON text).
/// Fails with [`KestrelError::InvalidHistory`] on unknown roles or on tool
/// messages that reference a call absent from the history.
pub fn normalize(raw: &[Value]) -> Result<Vec<UniversalMessage>> {
    let messages = raw
        .iter()
        .enumerate()
        .map(|(position, value)| normalize_one(position, value))
        .collect::<Result<Vec<_>>>()?;
    check_tool_references(&messages)?;
    Ok(messages)
}

fn normalize_one(position: usize, value: &Value) -> Result<UniversalMessage> {
    let obj = value.as_object().ok_or_else(|| invalid(position, "expected an object"))?;

    let role = match obj.get("role").and_then(Value::as_str) {
        Some("system") | Some("developer") => Role::System,
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some("tool") => Role::Tool,
        Some(other) => return Err(invalid(position, &format!("unknown role '{other}'"))),
        None => return Err(invalid(position, "missing role")),
    };

    let (content, mut attachments) = content_of(obj.get("content"));
    if let Some(extra) = obj.get("attachments") {
        let parsed: Vec<Attachment> = serde_json::from_value(extra.clone())
            .map_err(|e| invalid(position, &format!("bad attachments: {e}")))?;
        attachments.extend(parsed);
    }

    let mut message = UniversalMessage {
        role,
        content,
        tool_calls: Vec::new(),
        tool_call_id: None,
        tool_name: None,
        is_error: false,
        attachments,
    };

    match role {
        Role::Assistant => {
            if let Some(calls) = field(obj, "tool_calls", "toolCalls").and_then(Value::as_array) {
                message.tool_calls = calls
                    .iter()
                    .map(|call| tool_call_of(position, call))
                    .collect::<Result<_>>()?;
            }
        }
        Role::Tool => {
            let id = field(obj, "tool_call_id", "toolCallId")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(position, "tool message without tool_call_id"))?;
            message.tool_call_id = Some(id.to_string());
            message.tool_name = field(obj, "tool_name", "toolName")
                .or_else(|| obj.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            message.is_error = field(obj, "is_error", "isError")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
        Role::System | Role::User => {}
    }

    Ok(message)
}

fn content_of(value: Option<&Value>) -> (String, Vec<Attachment>) {
    match value {
        Some(Value::String(text)) => (text.clone(), Vec::new()),
        Some(Value::Array(parts)) => {
            let mut text = String::new();
            let mut attachments = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") | Some("input_text") | Some("output_text") => {
                        if let Some(t) = part.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    Some("image") => {
                        let media_type = field_in(part, "media_type", "mediaType");
                        let data = part.get("data").and_then(Value::as_str);
                        if let (Some(media_type), Some(data)) = (media_type, data) {
                            attachments.push(Attachment::Image {
                                media_type: media_type.to_string(),
                                data: data.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            (text, attachments)
        }
        _ => (String::new(), Vec::new()),
    }
}

fn tool_call_of(position: usize, value: &Value) -> Result<ToolCall> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(position, "tool call without id"))?;
    let function = value.get("function");
    let name = value
        .get("name")
        .or_else(|| function.and_then(|f| f.get("name")))
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(position, "tool call without name"))?;
    let arguments = value
        .get("arguments")
        .or_else(|| function.and_then(|f| f.get("arguments")));

    let (arguments, invalid_arguments) = match arguments {
        None | Some(Value::Null) => (Map::new(), None),
        Some(Value::Object(map)) => (map.clone(), None),
        Some(Value::String(raw)) => parse_arguments(raw),
        Some(other) => (Map::new(), Some(other.to_string())),
    };

    Ok(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
        invalid_arguments,
    })
}

fn field<'a>(obj: &'a Map<String, Value>, snake: &str, camel: &str) -> Option<&'a Value> {
    obj.get(snake).or_else(|| obj.get(camel))
}

fn field_in<'a>(value: &'a Value, snake: &str, camel: &str) -> Option<&'a str> {
    value
        .get(snake)
        .or_else(|| value.get(camel))
        .and_then(Value::as_str)
}

fn invalid(position: usize, reason: &str) -> KestrelError {
    KestrelError::InvalidHistory(format!("message {position}: {reason}"))
}
