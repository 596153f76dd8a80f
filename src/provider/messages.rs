//! Messages wire format (`POST /messages`), spoken by Anthropic.
//!
//! System turns are hoisted into the top-level `system` field and tool results
//! travel as `tool_result` blocks inside user turns. Consecutive user turns are
//! merged so the conversation keeps strict role alternation.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::http::anthropic_headers;
use super::sse::{self, json_data, ParseStep, SseEvent, StreamParser};
use super::{ByteStream, DeltaStream, ProviderAdapter, ToolDefinition, WireRequest};
use crate::error::{KestrelError, Result};
use crate::message::{Role, UniversalMessage};
use crate::models::{ModelConfig, WireFormat};
use crate::types::{FinishReason, StreamDelta, ToolCallDelta, Usage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// Adapter for the messages wire format.
#[derive(Debug, Clone)]
pub struct MessagesAdapter {
    base_url: String,
    api_key: Option<String>,
}

impl MessagesAdapter {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }

    fn build_body(&self, history: &[UniversalMessage], tools: &[ToolDefinition], model: &ModelConfig) -> Value {
        let settings = &model.settings;
        let thinking_budget = settings
            .reasoning_effort
            .filter(|_| model.capabilities.supports_reasoning)
            .map(|effort| effort.thinking_budget());

        let mut max_tokens = settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if let Some(budget) = thinking_budget {
            max_tokens = max_tokens.max(budget + 1_024);
        }

        let mut obj = Map::new();
        obj.insert("model".into(), model.model_id.clone().into());
        obj.insert("max_tokens".into(), max_tokens.into());
        obj.insert("messages".into(), build_messages(history, model).into());
        obj.insert("stream".into(), model.capabilities.supports_streaming.into());

        let system: Vec<&str> = history
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if !system.is_empty() {
            obj.insert("system".into(), system.join("\n\n").into());
        }

        match thinking_budget {
            Some(budget) => {
                obj.insert(
                    "thinking".into(),
                    json!({ "type": "enabled", "budget_tokens": budget }),
                );
            }
            None => {
                if let Some(temp) = settings.temperature {
                    obj.insert("temperature".into(), temp.into());
                }
                if let Some(top_p) = settings.top_p {
                    obj.insert("top_p".into(), top_p.into());
                }
            }
        }
        if let Some(ref stops) = settings.stop_sequences {
            obj.insert("stop_sequences".into(), json!(stops));
        }

        if model.capabilities.supports_tools && !tools.is_empty() {
            let tool_defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        Value::Object(obj)
    }
}

impl ProviderAdapter for MessagesAdapter {
    fn wire_format(&self) -> WireFormat {
        WireFormat::Messages
    }

    fn build_request(
        &self,
        history: &[UniversalMessage],
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> Result<WireRequest> {
        Ok(WireRequest {
            url: format!("{}/messages", self.base_url),
            headers: anthropic_headers(self.api_key.as_deref(), ANTHROPIC_VERSION),
            body: self.build_body(history, tools, model),
        })
    }

    fn parse_stream(&self, chunks: ByteStream) -> DeltaStream {
        sse::drive(chunks, MessagesParser::default())
    }

    fn parse_response(&self, body: &Value) -> Result<Vec<StreamDelta>> {
        if let Some(message) = error_message(body) {
            return Err(KestrelError::malformed(message));
        }
        let blocks = body
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| KestrelError::malformed("message body has no content array"))?;

        let mut deltas = Vec::new();
        let mut tool_index = 0;
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        deltas.push(StreamDelta::text(text));
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                        deltas.push(StreamDelta::reasoning(text));
                    }
                }
                Some("tool_use") => {
                    deltas.push(StreamDelta::tool_call(ToolCallDelta {
                        index: tool_index,
                        id: block.get("id").and_then(Value::as_str).map(str::to_string),
                        name: block.get("name").and_then(Value::as_str).map(str::to_string),
                        arguments: block
                            .get("input")
                            .map(Value::to_string)
                            .unwrap_or_default(),
                    }));
                    tool_index += 1;
                }
                _ => {}
            }
        }
        let finish = body
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(FinishReason::from_wire);
        let usage = body.get("usage").and_then(|u| {
            let input = u.get("input_tokens").and_then(Value::as_u64);
            let output = u.get("output_tokens").and_then(Value::as_u64);
            usage_from(input, output, u.get("cache_read_input_tokens").and_then(Value::as_u64))
        });
        deltas.push(StreamDelta::finish(finish, usage));
        Ok(deltas)
    }
}

fn build_messages(history: &[UniversalMessage], model: &ModelConfig) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for msg in history {
        match msg.role {
            Role::System => {}
            Role::User => {
                let mut blocks = Vec::new();
                let text = msg.text_with_files();
                if model.capabilities.supports_vision {
                    blocks.extend(msg.images().map(|(media_type, data)| {
                        json!({
                            "type": "image",
                            "source": { "type": "base64", "media_type": media_type, "data": data },
                        })
                    }));
                } else if msg.images().next().is_some() {
                    warn!(model = %model, "dropping image attachments for a model without vision");
                }
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                push_blocks(&mut out, "user", blocks);
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": msg.content }));
                }
                for tc in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": Value::Object(tc.arguments.clone()),
                    }));
                }
                push_blocks(&mut out, "assistant", blocks);
            }
            Role::Tool => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id,
                    "content": msg.content,
                });
                if msg.is_error {
                    block["is_error"] = true.into();
                }
                push_blocks(&mut out, "user", vec![block]);
            }
        }
    }
    out
}

/// Append content blocks, merging into the previous message when the role repeats.
fn push_blocks(out: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = out.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(content) = last.get_mut("content").and_then(Value::as_array_mut) {
                content.extend(blocks);
                return;
            }
        }
    }
    out.push(json!({ "role": role, "content": blocks }));
}

#[derive(Debug, Default)]
struct MessagesParser {
    /// Content block index to tool call index.
    tool_blocks: HashMap<u64, usize>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_read_tokens: Option<u64>,
    stop_reason: Option<FinishReason>,
}

impl MessagesParser {
    fn record_usage(&mut self, usage: Option<&Value>) {
        let Some(usage) = usage else { return };
        if let Some(v) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.input_tokens = Some(v);
        }
        if let Some(v) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.output_tokens = Some(v);
        }
        if let Some(v) = usage.get("cache_read_input_tokens").and_then(Value::as_u64) {
            self.cache_read_tokens = Some(v);
        }
    }
}

impl StreamParser for MessagesParser {
    fn on_event(&mut self, event: &SseEvent) -> Result<ParseStep> {
        let data = json_data(event)?;
        let event_type = data
            .get("type")
            .and_then(Value::as_str)
            .or(event.event.as_deref())
            .unwrap_or_default();

        match event_type {
            "message_start" => {
                self.record_usage(data.pointer("/message/usage"));
                Ok(ParseStep::none())
            }
            "content_block_start" => {
                let block = data.get("content_block").unwrap_or(&Value::Null);
                let block_index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let index = self.tool_blocks.len();
                        self.tool_blocks.insert(block_index, index);
                        Ok(ParseStep::one(StreamDelta::tool_call(ToolCallDelta {
                            index,
                            id: block.get("id").and_then(Value::as_str).map(str::to_string),
                            name: block.get("name").and_then(Value::as_str).map(str::to_string),
                            arguments: String::new(),
                        })))
                    }
                    Some("text") => match block.get("text").and_then(Value::as_str) {
                        Some(text) if !text.is_empty() => Ok(ParseStep::one(StreamDelta::text(text))),
                        _ => Ok(ParseStep::none()),
                    },
                    _ => Ok(ParseStep::none()),
                }
            }
            "content_block_delta" => {
                let delta = data.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        Ok(ParseStep::one(StreamDelta::text(text)))
                    }
                    Some("thinking_delta") => {
                        let text = delta.get("thinking").and_then(Value::as_str).unwrap_or_default();
                        Ok(ParseStep::one(StreamDelta::reasoning(text)))
                    }
                    Some("input_json_delta") => {
                        let block_index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                        let index = *self.tool_blocks.get(&block_index).ok_or_else(|| {
                            KestrelError::malformed(format!(
                                "input_json_delta for non-tool block {block_index}"
                            ))
                        })?;
                        Ok(ParseStep::one(StreamDelta::tool_call(ToolCallDelta {
                            index,
                            arguments: delta
                                .get("partial_json")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            ..ToolCallDelta::default()
                        })))
                    }
                    _ => Ok(ParseStep::none()),
                }
            }
            "message_delta" => {
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(FinishReason::from_wire(reason));
                }
                self.record_usage(data.get("usage"));
                Ok(ParseStep::none())
            }
            "message_stop" => Ok(ParseStep::done()),
            "error" => Err(KestrelError::malformed(
                error_message(&data).unwrap_or_else(|| "stream error".to_string()),
            )),
            other => {
                debug!(event_type = other, "ignoring messages stream event");
                Ok(ParseStep::none())
            }
        }
    }

    fn saw_finish(&self) -> bool {
        self.stop_reason.is_some()
    }

    fn finish(&mut self) -> StreamDelta {
        let usage = usage_from(self.input_tokens, self.output_tokens, self.cache_read_tokens);
        StreamDelta::finish(self.stop_reason.take(), usage)
    }
}

fn usage_from(input: Option<u64>, output: Option<u64>, cache_read: Option<u64>) -> Option<Usage> {
    if input.is_none() && output.is_none() {
        return None;
    }
    let mut usage = Usage::new(input.unwrap_or(0), output.unwrap_or(0));
    usage.cache_read_tokens = cache_read;
    Some(usage)
}

fn error_message(value: &Value) -> Option<String> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    Some(
        error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}
