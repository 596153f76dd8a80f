//! Model selection: which provider, which wire format, which capabilities.

pub mod capabilities;
pub mod settings;

pub use capabilities::ModelCapabilities;
pub use settings::{GenerationSettings, ReasoningEffort};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};

use crate::error::KestrelError;

/// JSON and streaming protocol shape spoken by a model API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WireFormat {
    /// `POST /chat/completions`
    ChatCompletions,
    /// `POST /responses`
    Responses,
    /// `POST /messages`
    Messages,
}

/// Target model plus everything needed to reach it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Provider key, e.g. `openai`, `anthropic`, `openrouter`.
    pub provider: String,
    pub model_id: String,
    pub wire_format: WireFormat,
    /// Overrides the provider's default endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Overrides the key resolved from [`crate::config::KestrelConfig`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub settings: GenerationSettings,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>, wire_format: WireFormat) -> Self {
        let provider = provider.into();
        let model_id = model_id.into();
        let capabilities = ModelCapabilities::infer(&provider, &model_id);
        Self {
            provider,
            model_id,
            wire_format,
            base_url: None,
            api_key: None,
            capabilities,
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Default endpoint for well-known providers.
    pub fn default_base_url(provider: &str) -> Option<&'static str> {
        match provider {
            "openai" => Some("https://api.openai.com/v1"),
            "anthropic" => Some("https://api.anthropic.com/v1"),
            "openrouter" => Some("https://openrouter.ai/api/v1"),
            "ollama" => Some("http://localhost:11434/v1"),
            "lmstudio" => Some("http://localhost:1234/v1"),
            _ => None,
        }
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model_id)
    }
}

impl FromStr for ModelConfig {
    type Err = KestrelError;

    /// Parse `provider:model`, inferring the wire format.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model_id) = s.split_once(':').ok_or_else(|| {
            KestrelError::InvalidArgument(format!("expected provider:model, got '{s}'"))
        })?;
        if model_id.is_empty() {
            return Err(KestrelError::InvalidArgument(format!("missing model id in '{s}'")));
        }
        let provider = match provider {
            "claude" => "anthropic",
            "chatgpt" => "openai",
            other => other,
        };
        let wire_format = match provider {
            "anthropic" => WireFormat::Messages,
            "openai" if capabilities::is_openai_reasoning_model(model_id) => WireFormat::Responses,
            _ => WireFormat::ChatCompletions,
        };
        Ok(Self::new(provider, model_id, wire_format))
    }
}
