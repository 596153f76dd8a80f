//! Model capabilities descriptor.

use serde::{Deserialize, Serialize};

/// Describes what a model can do. The run loop only consults these flags; it
/// never probes the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub supports_tools: bool,
    pub supports_reasoning: bool,
    pub supports_vision: bool,
    /// When false the provider is called in single-response mode.
    pub supports_streaming: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            supports_tools: true,
            supports_reasoning: false,
            supports_vision: false,
            supports_streaming: true,
        }
    }
}

impl ModelCapabilities {
    /// Plain text completion only.
    pub fn text_only() -> Self {
        Self {
            supports_tools: false,
            supports_reasoning: false,
            supports_vision: false,
            supports_streaming: true,
        }
    }

    /// Best-effort guess from a provider key and model id.
    pub fn infer(provider: &str, model_id: &str) -> Self {
        let id = model_id.to_ascii_lowercase();
        match provider {
            "openai" => Self {
                supports_tools: true,
                supports_reasoning: is_openai_reasoning_model(&id),
                supports_vision: id.starts_with("gpt-4o")
                    || id.starts_with("gpt-4.1")
                    || id.starts_with("gpt-5")
                    || id.starts_with("o3")
                    || id.starts_with("o4"),
                supports_streaming: true,
            },
            "anthropic" => Self {
                supports_tools: true,
                supports_reasoning: id.contains("claude-3-7") || id.contains("-4"),
                supports_vision: true,
                supports_streaming: true,
            },
            _ => Self::default(),
        }
    }
}

/// OpenAI models served through the responses wire format by default.
pub(crate) fn is_openai_reasoning_model(model_id: &str) -> bool {
    let id = model_id.to_ascii_lowercase();
    id.starts_with("o1")
        || id.starts_with("o3")
        || id.starts_with("o4")
        || id.starts_with("gpt-5")
        || id.contains("codex")
}
