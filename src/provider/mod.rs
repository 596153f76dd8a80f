//! Provider adapters: one per wire format, plus the HTTP plumbing they share.
//!
//! An adapter is pure translation. [`ProviderAdapter::build_request`] turns
//! history into a wire payload and [`ProviderAdapter::parse_stream`] turns raw
//! body chunks back into [`StreamDelta`]s. [`WireProvider`] pairs an adapter
//! with an [`HttpTransport`] and is what the run loop talks to.

pub mod http;
pub mod sse;

#[cfg(feature = "openai")]
pub mod chat_completions;
#[cfg(feature = "openai")]
pub mod responses;

#[cfg(feature = "anthropic")]
pub mod messages;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use http::{HttpTransport, ReqwestTransport};

use crate::config::KestrelConfig;
use crate::error::{KestrelError, Result};
use crate::message::UniversalMessage;
use crate::models::{ModelConfig, WireFormat};
use crate::types::StreamDelta;

/// Raw response body chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Normalized, forward-only provider output. Consumed once per request.
pub type DeltaStream = BoxStream<'static, Result<StreamDelta>>;

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A fully built HTTP request for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

/// Translation between the universal history and one wire format.
pub trait ProviderAdapter: Send + Sync {
    fn wire_format(&self) -> WireFormat;

    /// Build the request for `history`. Identical inputs give identical output.
    fn build_request(
        &self,
        history: &[UniversalMessage],
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> Result<WireRequest>;

    /// Parse a streamed response body.
    fn parse_stream(&self, chunks: ByteStream) -> DeltaStream;

    /// Parse a complete (non-streamed) response body into the same deltas a
    /// stream would have produced.
    fn parse_response(&self, body: &serde_json::Value) -> Result<Vec<StreamDelta>>;
}

/// Everything needed for one model call.
#[derive(Debug, Clone)]
pub struct ProviderTurn {
    /// Routing key for the streamed chunks; the run loop uses `<request_id>:<iteration>`.
    pub stream_id: String,
    pub messages: Vec<UniversalMessage>,
    pub tools: Vec<ToolDefinition>,
    pub model: ModelConfig,
}

/// What the run loop calls to get model output.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "openai", "anthropic").
    fn provider_name(&self) -> &str;

    /// Send one turn and return its delta stream.
    async fn stream_turn(&self, turn: &ProviderTurn) -> Result<DeltaStream>;
}

/// [`ModelProvider`] built from an adapter and a transport.
pub struct WireProvider {
    name: String,
    adapter: Box<dyn ProviderAdapter>,
    transport: Arc<dyn HttpTransport>,
}

impl WireProvider {
    pub fn new(
        name: impl Into<String>,
        adapter: Box<dyn ProviderAdapter>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            adapter,
            transport,
        }
    }

    pub fn adapter(&self) -> &dyn ProviderAdapter {
        self.adapter.as_ref()
    }
}

#[async_trait]
impl ModelProvider for WireProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn stream_turn(&self, turn: &ProviderTurn) -> Result<DeltaStream> {
        let request = self
            .adapter
            .build_request(&turn.messages, &turn.tools, &turn.model)?;
        debug!(
            stream_id = %turn.stream_id,
            provider = %self.name,
            wire_format = %self.adapter.wire_format(),
            messages = turn.messages.len(),
            tools = turn.tools.len(),
            "sending provider request"
        );

        if turn.model.capabilities.supports_streaming {
            let chunks = self.transport.stream(&turn.stream_id, request).await?;
            Ok(self.adapter.parse_stream(chunks))
        } else {
            let body = self.transport.send(request).await?;
            let deltas = self.adapter.parse_response(&body)?;
            Ok(futures::stream::iter(deltas.into_iter().map(Ok)).boxed())
        }
    }
}

/// Create the adapter for a model's wire format.
#[allow(unused_variables)]
pub fn create_adapter(
    model: &ModelConfig,
    config: &KestrelConfig,
) -> Result<Box<dyn ProviderAdapter>> {
    let base_url = config.base_url_for(model).ok_or_else(|| {
        KestrelError::Configuration(format!(
            "no base URL for provider '{}'; set one on the model",
            model.provider
        ))
    })?;
    let base_url = base_url.trim_end_matches('/').to_string();
    let api_key = config.api_key_for(model);
    if api_key.is_none() && requires_api_key(&model.provider) {
        return Err(KestrelError::Configuration(format!(
            "missing API key for provider '{}'",
            model.provider
        )));
    }

    match model.wire_format {
        #[cfg(feature = "openai")]
        WireFormat::ChatCompletions => Ok(Box::new(chat_completions::ChatCompletionsAdapter::new(
            base_url, api_key,
        ))),
        #[cfg(feature = "openai")]
        WireFormat::Responses => Ok(Box::new(responses::ResponsesAdapter::new(base_url, api_key))),
        #[cfg(feature = "anthropic")]
        WireFormat::Messages => Ok(Box::new(messages::MessagesAdapter::new(base_url, api_key))),
        #[allow(unreachable_patterns)]
        other => Err(KestrelError::Configuration(format!(
            "wire format '{other}' is not enabled in this build"
        ))),
    }
}

/// Create a provider for the given model over the shared reqwest client.
pub fn create_provider(model: &ModelConfig, config: &KestrelConfig) -> Result<Arc<dyn ModelProvider>> {
    let adapter = create_adapter(model, config)?;
    Ok(Arc::new(WireProvider::new(
        model.provider.clone(),
        adapter,
        Arc::new(ReqwestTransport::new()),
    )))
}

fn requires_api_key(provider: &str) -> bool {
    matches!(provider, "openai" | "anthropic" | "openrouter")
}
