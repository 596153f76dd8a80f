//! Shared test helpers: SSE bodies and event draining.
#![allow(dead_code)]

use std::time::Duration;

use serde_json::Value;
use wiremock::ResponseTemplate;

use kestrel::agent_loop::{AgentEvent, AgentEventPayload, EventSubscription};
use kestrel::message::ToolResult;

/// `data:` lines for each JSON value, optionally ending with `[DONE]`.
pub fn sse_data(events: &[Value], done: bool) -> String {
    let mut body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

/// Named events, as the messages format sends them.
pub fn sse_named(events: &[(&str, Value)]) -> String {
    events
        .iter()
        .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
        .collect()
}

pub fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_raw(body, "text/event-stream")
}

/// Drain a subscription until the terminal event closes it.
pub async fn drain(subscription: &mut EventSubscription) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
        .await
        .expect("event stream stalled")
    {
        events.push(event);
    }
    events
}

pub fn results(events: &[AgentEvent]) -> Vec<ToolResult> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            AgentEventPayload::ToolResult { result } => Some(result.clone()),
            _ => None,
        })
        .collect()
}

pub fn text_of(events: &[AgentEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            AgentEventPayload::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
