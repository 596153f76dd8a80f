//! Responses wire format (`POST /responses`), used by OpenAI reasoning models.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::http::bearer_headers;
use super::sse::{self, json_data, ParseStep, SseEvent, StreamParser};
use super::{ByteStream, DeltaStream, ProviderAdapter, ToolDefinition, WireRequest};
use crate::error::{KestrelError, Result};
use crate::message::{Role, UniversalMessage};
use crate::models::{ModelConfig, WireFormat};
use crate::types::{FinishReason, StreamDelta, ToolCallDelta, Usage};

/// Adapter for the responses wire format.
#[derive(Debug, Clone)]
pub struct ResponsesAdapter {
    base_url: String,
    api_key: Option<String>,
}

impl ResponsesAdapter {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }

    fn build_body(&self, history: &[UniversalMessage], tools: &[ToolDefinition], model: &ModelConfig) -> Value {
        let mut obj = Map::new();
        obj.insert("model".into(), model.model_id.clone().into());
        obj.insert("input".into(), build_input_items(history, model).into());
        obj.insert("stream".into(), model.capabilities.supports_streaming.into());
        obj.insert("store".into(), false.into());

        let instructions: Vec<&str> = history
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if !instructions.is_empty() {
            obj.insert("instructions".into(), instructions.join("\n\n").into());
        }

        let settings = &model.settings;
        if let Some(max) = settings.max_tokens {
            obj.insert("max_output_tokens".into(), max.into());
        }
        if let Some(temp) = settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if model.capabilities.supports_reasoning {
            if let Some(effort) = settings.reasoning_effort {
                obj.insert(
                    "reasoning".into(),
                    json!({ "effort": effort.to_string(), "summary": "auto" }),
                );
            }
        }

        if model.capabilities.supports_tools && !tools.is_empty() {
            let tool_defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        Value::Object(obj)
    }
}

impl ProviderAdapter for ResponsesAdapter {
    fn wire_format(&self) -> WireFormat {
        WireFormat::Responses
    }

    fn build_request(
        &self,
        history: &[UniversalMessage],
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> Result<WireRequest> {
        Ok(WireRequest {
            url: format!("{}/responses", self.base_url),
            headers: bearer_headers(self.api_key.as_deref()),
            body: self.build_body(history, tools, model),
        })
    }

    fn parse_stream(&self, chunks: ByteStream) -> DeltaStream {
        sse::drive(chunks, ResponsesParser::default())
    }

    fn parse_response(&self, body: &Value) -> Result<Vec<StreamDelta>> {
        if let Some(message) = error_message(body) {
            return Err(KestrelError::malformed(message));
        }
        let output = body
            .get("output")
            .and_then(Value::as_array)
            .ok_or_else(|| KestrelError::malformed("response body has no output array"))?;

        let mut deltas = Vec::new();
        let mut tool_index = 0;
        for item in output {
            match item.get("type").and_then(Value::as_str) {
                Some("reasoning") => {
                    let summary = summary_text(item);
                    if !summary.is_empty() {
                        deltas.push(StreamDelta::reasoning(summary));
                    }
                }
                Some("message") => {
                    let text = message_text(item);
                    if !text.is_empty() {
                        deltas.push(StreamDelta::text(text));
                    }
                }
                Some("function_call") => {
                    deltas.push(StreamDelta::tool_call(ToolCallDelta {
                        index: tool_index,
                        id: str_field(item, "call_id").map(str::to_string),
                        name: str_field(item, "name").map(str::to_string),
                        arguments: str_field(item, "arguments").unwrap_or_default().to_string(),
                    }));
                    tool_index += 1;
                }
                _ => {}
            }
        }
        let finish = if tool_index > 0 {
            Some(FinishReason::ToolCalls)
        } else {
            str_field(body, "status").map(FinishReason::from_wire)
        };
        deltas.push(StreamDelta::finish(finish, body.get("usage").and_then(parse_usage)));
        Ok(deltas)
    }
}

fn build_input_items(history: &[UniversalMessage], model: &ModelConfig) -> Vec<Value> {
    let mut input = Vec::new();
    for msg in history {
        match msg.role {
            Role::System => {}
            Role::User => {
                let mut parts = vec![json!({ "type": "input_text", "text": msg.text_with_files() })];
                if model.capabilities.supports_vision {
                    parts.extend(msg.images().map(|(media_type, data)| {
                        json!({
                            "type": "input_image",
                            "image_url": format!("data:{media_type};base64,{data}"),
                        })
                    }));
                } else if msg.images().next().is_some() {
                    warn!(model = %model, "dropping image attachments for a model without vision");
                }
                input.push(json!({ "role": "user", "content": parts }));
            }
            Role::Assistant => {
                if !msg.content.is_empty() {
                    input.push(json!({
                        "role": "assistant",
                        "content": [{ "type": "output_text", "text": msg.content }],
                    }));
                }
                for tc in &msg.tool_calls {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": tc.id,
                        "name": tc.name,
                        "arguments": tc.arguments_json(),
                    }));
                }
            }
            Role::Tool => input.push(json!({
                "type": "function_call_output",
                "call_id": msg.tool_call_id,
                "output": msg.content,
            })),
        }
    }
    input
}

#[derive(Debug, Default)]
struct ResponsesParser {
    /// Output item id to tool call index.
    calls: HashMap<String, usize>,
    /// Items whose arguments arrived through delta events.
    streamed_arguments: HashSet<String>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
}

impl ResponsesParser {
    fn call_index(&self, event: &Value) -> Result<(String, usize)> {
        let item_id = str_field(event, "item_id").unwrap_or_default();
        self.calls
            .get(item_id)
            .map(|index| (item_id.to_string(), *index))
            .ok_or_else(|| {
                KestrelError::malformed(format!("arguments for unknown output item '{item_id}'"))
            })
    }

    fn complete(&mut self, response: Option<&Value>, fallback: FinishReason) {
        let response = response.unwrap_or(&Value::Null);
        self.usage = response.get("usage").and_then(parse_usage);
        self.finish_reason = Some(if self.calls.is_empty() {
            str_field(response, "status")
                .map(FinishReason::from_wire)
                .unwrap_or(fallback)
        } else {
            FinishReason::ToolCalls
        });
    }
}

impl StreamParser for ResponsesParser {
    fn on_event(&mut self, event: &SseEvent) -> Result<ParseStep> {
        if event.data.trim() == "[DONE]" {
            return Ok(ParseStep::done());
        }
        let data = json_data(event)?;
        let event_type = str_field(&data, "type")
            .or(event.event.as_deref())
            .unwrap_or_default();

        match event_type {
            "response.output_text.delta" => {
                let delta = str_field(&data, "delta").unwrap_or_default();
                if delta.is_empty() {
                    return Ok(ParseStep::none());
                }
                Ok(ParseStep::one(StreamDelta::text(delta)))
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                let delta = str_field(&data, "delta").unwrap_or_default();
                if delta.is_empty() {
                    return Ok(ParseStep::none());
                }
                Ok(ParseStep::one(StreamDelta::reasoning(delta)))
            }
            "response.output_item.added" => {
                let item = data.get("item").unwrap_or(&Value::Null);
                if str_field(item, "type") != Some("function_call") {
                    return Ok(ParseStep::none());
                }
                let item_id = str_field(item, "id")
                    .or_else(|| str_field(item, "call_id"))
                    .unwrap_or_default()
                    .to_string();
                let index = self.calls.len();
                self.calls.insert(item_id, index);
                Ok(ParseStep::one(StreamDelta::tool_call(ToolCallDelta {
                    index,
                    id: str_field(item, "call_id").map(str::to_string),
                    name: str_field(item, "name").map(str::to_string),
                    arguments: String::new(),
                })))
            }
            "response.function_call_arguments.delta" => {
                let (item_id, index) = self.call_index(&data)?;
                self.streamed_arguments.insert(item_id);
                Ok(ParseStep::one(StreamDelta::tool_call(ToolCallDelta {
                    index,
                    arguments: str_field(&data, "delta").unwrap_or_default().to_string(),
                    ..ToolCallDelta::default()
                })))
            }
            "response.function_call_arguments.done" => {
                let (item_id, index) = self.call_index(&data)?;
                if self.streamed_arguments.contains(&item_id) {
                    return Ok(ParseStep::none());
                }
                Ok(ParseStep::one(StreamDelta::tool_call(ToolCallDelta {
                    index,
                    arguments: str_field(&data, "arguments").unwrap_or_default().to_string(),
                    ..ToolCallDelta::default()
                })))
            }
            "response.completed" => {
                self.complete(data.get("response"), FinishReason::Stop);
                Ok(ParseStep::done())
            }
            "response.incomplete" => {
                self.complete(data.get("response"), FinishReason::Length);
                Ok(ParseStep::done())
            }
            "response.failed" | "error" => {
                let message = error_message(&data)
                    .or_else(|| data.get("response").and_then(error_message))
                    .unwrap_or_else(|| "response failed".to_string());
                Err(KestrelError::malformed(message))
            }
            other => {
                debug!(event_type = other, "ignoring responses stream event");
                Ok(ParseStep::none())
            }
        }
    }

    fn saw_finish(&self) -> bool {
        self.finish_reason.is_some()
    }

    fn finish(&mut self) -> StreamDelta {
        StreamDelta::finish(self.finish_reason.take(), self.usage.take())
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn error_message(value: &Value) -> Option<String> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    Some(
        str_field(error, "message")
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}

fn message_text(item: &Value) -> String {
    item.get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| str_field(p, "type") == Some("output_text"))
                .filter_map(|p| str_field(p, "text"))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn summary_text(item: &Value) -> String {
    item.get("summary")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| str_field(p, "text"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn parse_usage(u: &Value) -> Option<Usage> {
    let input_tokens = u.get("input_tokens")?.as_u64()?;
    let output_tokens = u.get("output_tokens")?.as_u64()?;
    Some(Usage {
        input_tokens,
        output_tokens,
        total_tokens: u
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(input_tokens + output_tokens),
        cache_read_tokens: u
            .pointer("/input_tokens_details/cached_tokens")
            .and_then(Value::as_u64),
        reasoning_tokens: u
            .pointer("/output_tokens_details/reasoning_tokens")
            .and_then(Value::as_u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ToolCall, ToolResult};
    use crate::models::ReasoningEffort;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    fn model() -> ModelConfig {
        "openai:o3-mini".parse().unwrap()
    }

    fn adapter() -> ResponsesAdapter {
        ResponsesAdapter::new("https://api.openai.com/v1", Some("sk-test".into()))
    }

    fn sse(events: &[Value]) -> ByteStream {
        let body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
        futures::stream::iter(vec![Ok(body.into_bytes())]).boxed()
    }

    #[test]
    fn hoists_system_and_maps_tool_items() {
        let call = ToolCall::new("call_9", "read_file", Map::new());
        let history = vec![
            UniversalMessage::system("you are terse"),
            UniversalMessage::user("read it"),
            UniversalMessage::assistant_with_tool_calls("checking", vec![call.clone()]),
            UniversalMessage::tool(&ToolResult::failure(&call, "missing", 2)),
        ];
        let mut model = model();
        model.settings.reasoning_effort = Some(ReasoningEffort::High);

        let request = adapter().build_request(&history, &[], &model).unwrap();
        let body = &request.body;

        assert_eq!(request.url, "https://api.openai.com/v1/responses");
        assert_eq!(body["instructions"], "you are terse");
        assert_eq!(body["reasoning"]["effort"], "high");
        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 4);
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["content"][0]["text"], "checking");
        assert_eq!(input[2]["type"], "function_call");
        assert_eq!(input[2]["arguments"], "{}");
        assert_eq!(
            input[3],
            json!({"type": "function_call_output", "call_id": "call_9", "output": "missing"})
        );
    }

    #[tokio::test]
    async fn streams_function_call_and_usage() {
        let stream = adapter().parse_stream(sse(&[
            json!({"type": "response.created", "response": {}}),
            json!({"type": "response.reasoning_summary_text.delta", "delta": "thinking"}),
            json!({"type": "response.output_item.added", "output_index": 0, "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "list_directory", "arguments": ""}}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"path\":"}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "\"/tmp\"}"}),
            json!({"type": "response.function_call_arguments.done", "item_id": "fc_1", "arguments": "{\"path\":\"/tmp\"}"}),
            json!({"type": "response.completed", "response": {"status": "completed", "usage": {"input_tokens": 30, "output_tokens": 9, "total_tokens": 39, "output_tokens_details": {"reasoning_tokens": 4}}}}),
        ]));

        let deltas: Vec<StreamDelta> = stream.map(|d| d.unwrap()).collect().await;

        assert_eq!(deltas[0].reasoning_delta.as_deref(), Some("thinking"));
        let start = deltas[1].tool_call_delta.as_ref().unwrap();
        assert_eq!((start.index, start.id.as_deref()), (0, Some("call_1")));
        assert_eq!(deltas.len(), 5);
        let last = deltas.last().unwrap();
        assert_eq!(last.finish_reason, Some(FinishReason::ToolCalls));
        let usage = last.usage.as_ref().unwrap();
        assert_eq!(usage.total_tokens, 39);
        assert_eq!(usage.reasoning_tokens, Some(4));
    }

    #[tokio::test]
    async fn body_closed_before_completed_event_is_a_provider_error() {
        let stream = adapter().parse_stream(sse(&[
            json!({"type": "response.created", "response": {}}),
            json!({"type": "response.output_text.delta", "delta": "Half an ans"}),
        ]));
        let results: Vec<_> = stream.collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().text_delta.as_deref(), Some("Half an ans"));
        let err = results[1].as_ref().unwrap_err();
        assert!(matches!(err, KestrelError::Provider { status_code: None, .. }));
        assert!(err.to_string().contains("stream ended before completion"), "{err}");
    }

    #[tokio::test]
    async fn failed_response_is_an_error() {
        let stream = adapter().parse_stream(sse(&[
            json!({"type": "response.output_text.delta", "delta": "par"}),
            json!({"type": "response.failed", "response": {"error": {"message": "server overloaded"}}}),
        ]));
        let results: Vec<_> = stream.collect().await;
        assert_eq!(results.len(), 2);
        let err = results[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("server overloaded"));
    }

    #[test]
    fn parses_complete_response() {
        let body = json!({
            "status": "completed",
            "output": [
                {"type": "message", "content": [{"type": "output_text", "text": "Done."}]}
            ]
        });
        let deltas = adapter().parse_response(&body).unwrap();
        assert_eq!(deltas[0].text_delta.as_deref(), Some("Done."));
        assert_eq!(deltas[1].finish_reason, Some(FinishReason::Stop));
        assert_eq!(deltas[1].usage, None);
    }
}
