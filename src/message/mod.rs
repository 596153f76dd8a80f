//! Provider-agnostic conversation model.
//!
//! Every wire format is built from, and parsed back into, [`UniversalMessage`].
//! Functions in this module are pure: they take history by reference and
//! return new vectors.

mod history;
mod normalize;

pub use history::{append_tool_result, check_tool_references, close_dangling_tool_calls, validate_history};
pub use normalize::normalize;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Conversation role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UniversalMessage {
    pub role: Role,
    /// May be empty when an assistant turn only carries tool calls.
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Tool role only: the result reports a failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl UniversalMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            attachments: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// User message carrying file or image context.
    pub fn user_with_attachments(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            attachments,
            ..Self::new(Role::User, text)
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Assistant turn that requested tool execution.
    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, text)
        }
    }

    /// Tool role message answering a call.
    pub fn tool(result: &ToolResult) -> Self {
        Self {
            tool_call_id: Some(result.tool_call_id.clone()),
            tool_name: Some(result.tool_name.clone()),
            is_error: !result.success,
            ..Self::new(Role::Tool, result.output.clone())
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Message text with file attachments inlined. Image attachments are left
    /// to the adapter.
    pub fn text_with_files(&self) -> String {
        let mut text = self.content.clone();
        for attachment in &self.attachments {
            if let Attachment::File { path, content } = attachment {
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(&format!("<file path=\"{path}\">\n{content}\n</file>"));
            }
        }
        text
    }

    /// Image attachments as `(media_type, base64 data)` pairs.
    pub fn images(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attachments.iter().filter_map(|attachment| match attachment {
            Attachment::Image { media_type, data } => Some((media_type.as_str(), data.as_str())),
            Attachment::File { .. } => None,
        })
    }
}

/// Context attached to a user message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    File { path: String, content: String },
    /// Base64 encoded image.
    Image { media_type: String, data: String },
}

impl Attachment {
    pub fn image_from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine;
        Self::Image {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Raw argument text the model produced when it was not a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_arguments: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            invalid_arguments: None,
        }
    }

    /// Build a call from streamed argument text.
    pub fn from_raw_arguments(id: impl Into<String>, name: impl Into<String>, raw: &str) -> Self {
        let (arguments, invalid_arguments) = parse_arguments(raw);
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            invalid_arguments,
        }
    }

    /// Arguments as the JSON text sent back to providers.
    pub fn arguments_json(&self) -> String {
        match &self.invalid_arguments {
            Some(raw) => raw.clone(),
            None => Value::Object(self.arguments.clone()).to_string(),
        }
    }
}

/// Outcome of one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub output: String,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: true,
            output: output.into(),
            duration_ms,
        }
    }

    pub fn failure(call: &ToolCall, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: false,
            output: output.into(),
            duration_ms,
        }
    }
}

/// Empty or whitespace-only text is an empty object; anything that is not a
/// JSON object is kept verbatim as invalid.
pub(crate) fn parse_arguments(raw: &str) -> (Map<String, Value>, Option<String>) {
    if raw.trim().is_empty() {
        return (Map::new(), None);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => (map, None),
        _ => (Map::new(), Some(raw.to_string())),
    }
}
