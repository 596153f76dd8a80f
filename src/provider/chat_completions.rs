//! Chat-completions wire format (`POST /chat/completions`), spoken by OpenAI
//! and most OpenAI-compatible servers.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::http::bearer_headers;
use super::sse::{self, json_data, ParseStep, SseEvent, StreamParser};
use super::{ByteStream, DeltaStream, ProviderAdapter, ToolDefinition, WireRequest};
use crate::error::{KestrelError, Result};
use crate::message::{Role, UniversalMessage};
use crate::models::{ModelConfig, WireFormat};
use crate::types::{FinishReason, StreamDelta, ToolCallDelta, Usage};

/// Adapter for the chat-completions wire format.
#[derive(Debug, Clone)]
pub struct ChatCompletionsAdapter {
    base_url: String,
    api_key: Option<String>,
}

impl ChatCompletionsAdapter {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }

    fn build_body(&self, history: &[UniversalMessage], tools: &[ToolDefinition], model: &ModelConfig) -> Value {
        let messages: Vec<Value> = history.iter().map(|m| message_to_wire(m, model)).collect();
        let stream = model.capabilities.supports_streaming;

        let mut obj = Map::new();
        obj.insert("model".into(), model.model_id.clone().into());
        obj.insert("messages".into(), messages.into());
        obj.insert("stream".into(), stream.into());
        if stream {
            obj.insert("stream_options".into(), json!({ "include_usage": true }));
        }

        let settings = &model.settings;
        if let Some(max) = settings.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = settings.stop_sequences {
            obj.insert("stop".into(), json!(stops));
        }
        if model.capabilities.supports_reasoning {
            if let Some(effort) = settings.reasoning_effort {
                obj.insert("reasoning_effort".into(), effort.to_string().into());
            }
        }

        if model.capabilities.supports_tools && !tools.is_empty() {
            let tool_defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        Value::Object(obj)
    }
}

impl ProviderAdapter for ChatCompletionsAdapter {
    fn wire_format(&self) -> WireFormat {
        WireFormat::ChatCompletions
    }

    fn build_request(
        &self,
        history: &[UniversalMessage],
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> Result<WireRequest> {
        Ok(WireRequest {
            url: format!("{}/chat/completions", self.base_url),
            headers: bearer_headers(self.api_key.as_deref()),
            body: self.build_body(history, tools, model),
        })
    }

    fn parse_stream(&self, chunks: ByteStream) -> DeltaStream {
        sse::drive(chunks, ChatCompletionsParser::default())
    }

    fn parse_response(&self, body: &Value) -> Result<Vec<StreamDelta>> {
        let response: CompletionResponse = serde_json::from_value(body.clone())
            .map_err(|e| KestrelError::malformed(format!("unexpected chat completion body: {e}")))?;
        let mut deltas = Vec::new();
        let choice = response.choices.into_iter().next();
        let mut finish_reason = None;
        if let Some(choice) = choice {
            if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
                deltas.push(StreamDelta::reasoning(reasoning));
            }
            if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
                deltas.push(StreamDelta::text(text));
            }
            for (index, call) in choice.message.tool_calls.into_iter().enumerate() {
                deltas.push(StreamDelta::tool_call(ToolCallDelta {
                    index,
                    id: Some(call.id),
                    name: Some(call.function.name),
                    arguments: call.function.arguments,
                }));
            }
            finish_reason = choice.finish_reason.as_deref().map(FinishReason::from_wire);
        }
        deltas.push(StreamDelta::finish(finish_reason, response.usage.map(Usage::from)));
        Ok(deltas)
    }
}

fn message_to_wire(msg: &UniversalMessage, model: &ModelConfig) -> Value {
    match msg.role {
        Role::System => json!({ "role": "system", "content": msg.content }),
        Role::User => {
            let text = msg.text_with_files();
            let images: Vec<_> = msg.images().collect();
            if images.is_empty() {
                return json!({ "role": "user", "content": text });
            }
            if !model.capabilities.supports_vision {
                warn!(model = %model, "dropping image attachments for a model without vision");
                return json!({ "role": "user", "content": text });
            }
            let mut parts = vec![json!({ "type": "text", "text": text })];
            parts.extend(images.into_iter().map(|(media_type, data)| {
                json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{media_type};base64,{data}") }
                })
            }));
            json!({ "role": "user", "content": parts })
        }
        Role::Assistant => {
            if msg.tool_calls.is_empty() {
                return json!({ "role": "assistant", "content": msg.content });
            }
            let tool_calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments_json(),
                        }
                    })
                })
                .collect();
            json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
                "tool_calls": tool_calls,
            })
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        }),
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ChoiceDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallChunk>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionChunk {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptDetails>,
    #[serde(default)]
    completion_tokens_details: Option<CompletionDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CompletionDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens.unwrap_or(u.prompt_tokens + u.completion_tokens),
            cache_read_tokens: u.prompt_tokens_details.and_then(|d| d.cached_tokens),
            reasoning_tokens: u.completion_tokens_details.and_then(|d| d.reasoning_tokens),
        }
    }
}

#[derive(Debug, Default)]
struct ChatCompletionsParser {
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
}

impl StreamParser for ChatCompletionsParser {
    fn on_event(&mut self, event: &SseEvent) -> Result<ParseStep> {
        if event.data.trim() == "[DONE]" {
            return Ok(ParseStep::done());
        }
        let chunk: StreamChunk = serde_json::from_value(json_data(event)?)
            .map_err(|e| KestrelError::malformed(format!("unexpected chunk shape: {e}")))?;
        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(KestrelError::malformed(format!("provider reported: {message}")));
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let mut deltas = Vec::new();
        for choice in chunk.choices.into_iter().take(1) {
            if let Some(reason) = choice.finish_reason.as_deref() {
                self.finish_reason = Some(FinishReason::from_wire(reason));
            }
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                deltas.push(StreamDelta::reasoning(reasoning));
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                deltas.push(StreamDelta::text(text));
            }
            for (position, call) in delta.tool_calls.into_iter().enumerate() {
                let function = call.function.unwrap_or_default();
                deltas.push(StreamDelta::tool_call(ToolCallDelta {
                    index: call.index.unwrap_or(position),
                    id: call.id,
                    name: function.name,
                    arguments: function.arguments.unwrap_or_default(),
                }));
            }
        }
        Ok(ParseStep::deltas(deltas))
    }

    fn saw_finish(&self) -> bool {
        self.finish_reason.is_some()
    }

    fn finish(&mut self) -> StreamDelta {
        StreamDelta::finish(self.finish_reason.take(), self.usage.take())
    }
}
