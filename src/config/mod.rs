//! Configuration: provider credentials and runner defaults.
//!
//! Nothing here is global. Callers build a [`KestrelConfig`] (usually with
//! [`KestrelConfig::from_env`]) and hand it to the runner explicitly.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::agent_loop::ApprovalMode;
use crate::models::ModelConfig;

const STREAM_IDLE_TIMEOUT_ENV: &str = "KESTREL_STREAM_IDLE_TIMEOUT_MS";
const APPROVAL_MODE_ENV: &str = "KESTREL_APPROVAL_MODE";
const MAX_ITERATIONS_ENV: &str = "KESTREL_MAX_ITERATIONS";
const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_ITERATIONS: usize = 25;

/// Provider credentials and endpoint overrides.
#[derive(Clone, Default)]
pub struct KestrelConfig {
    api_keys: HashMap<String, String>,
    base_urls: HashMap<String, String>,
}

impl fmt::Debug for KestrelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<_> = self.api_keys.keys().collect();
        providers.sort();
        f.debug_struct("KestrelConfig")
            .field("api_keys", &providers)
            .field("base_urls", &self.base_urls)
            .finish()
    }
}

impl KestrelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables (OPENAI_API_KEY, ANTHROPIC_API_KEY, etc.).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = Self::new();

        let env_mappings = [
            ("OPENAI_API_KEY", "openai"),
            ("ANTHROPIC_API_KEY", "anthropic"),
            ("OPENROUTER_API_KEY", "openrouter"),
            ("OPENAI_COMPAT_API_KEY", "openai-compatible"),
        ];
        for (env_var, provider) in &env_mappings {
            if let Ok(key) = std::env::var(env_var) {
                config.set_api_key(provider, key);
            }
        }

        let url_mappings = [
            ("OPENAI_BASE_URL", "openai"),
            ("ANTHROPIC_BASE_URL", "anthropic"),
            ("OPENROUTER_BASE_URL", "openrouter"),
            ("OPENAI_COMPAT_BASE_URL", "openai-compatible"),
            ("OLLAMA_BASE_URL", "ollama"),
            ("LMSTUDIO_BASE_URL", "lmstudio"),
        ];
        for (env_var, provider) in &url_mappings {
            if let Ok(url) = std::env::var(env_var) {
                config.set_base_url(provider, url);
            }
        }

        config
    }

    pub fn set_api_key(&mut self, provider: &str, key: String) {
        self.api_keys.insert(provider.to_string(), key);
    }

    pub fn set_base_url(&mut self, provider: &str, url: String) {
        self.base_urls.insert(provider.to_string(), url);
    }

    pub fn get_api_key(&self, provider: &str) -> Option<String> {
        self.api_keys.get(provider).cloned()
    }

    pub fn get_base_url(&self, provider: &str) -> Option<String> {
        self.base_urls.get(provider).cloned()
    }

    /// Key for a model: explicit on the model first, then by provider.
    pub fn api_key_for(&self, model: &ModelConfig) -> Option<String> {
        model
            .api_key
            .clone()
            .or_else(|| self.get_api_key(&model.provider))
    }

    /// Endpoint for a model: explicit, then configured, then the provider default.
    pub fn base_url_for(&self, model: &ModelConfig) -> Option<String> {
        model
            .base_url
            .clone()
            .or_else(|| self.get_base_url(&model.provider))
            .or_else(|| ModelConfig::default_base_url(&model.provider).map(str::to_string))
    }
}

/// Fallbacks applied to runs that leave the corresponding field unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerDefaults {
    pub stream_idle_timeout: Duration,
    pub approval_mode: ApprovalMode,
    /// Used by front ends that do not ask the user; the runner itself always
    /// takes the bound from the request.
    pub max_iterations: usize,
}

impl Default for RunnerDefaults {
    fn default() -> Self {
        Self {
            stream_idle_timeout: Duration::from_millis(DEFAULT_STREAM_IDLE_TIMEOUT_MS),
            approval_mode: ApprovalMode::Ask,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl RunnerDefaults {
    /// Read `KESTREL_*` overrides; malformed values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stream_idle_timeout: parse_env::<u64>(STREAM_IDLE_TIMEOUT_ENV)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.stream_idle_timeout),
            approval_mode: parse_env::<ApprovalMode>(APPROVAL_MODE_ENV)
                .unwrap_or(defaults.approval_mode),
            max_iterations: parse_env::<usize>(MAX_ITERATIONS_ENV)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_iterations),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WireFormat;

    #[test]
    fn model_overrides_win_over_config() {
        let mut config = KestrelConfig::new();
        config.set_api_key("openai", "env-key".into());
        config.set_base_url("openai", "http://proxy.local/v1".into());

        let model = ModelConfig::new("openai", "gpt-4o", WireFormat::ChatCompletions);
        assert_eq!(config.api_key_for(&model).as_deref(), Some("env-key"));
        assert_eq!(config.base_url_for(&model).as_deref(), Some("http://proxy.local/v1"));

        let model = model.with_api_key("explicit").with_base_url("http://other/v1");
        assert_eq!(config.api_key_for(&model).as_deref(), Some("explicit"));
        assert_eq!(config.base_url_for(&model).as_deref(), Some("http://other/v1"));
    }

    #[test]
    fn falls_back_to_provider_default_url() {
        let config = KestrelConfig::new();
        let model = ModelConfig::new("anthropic", "claude-sonnet-4-5", WireFormat::Messages);
        assert_eq!(
            config.base_url_for(&model).as_deref(),
            Some("https://api.anthropic.com/v1")
        );
        assert_eq!(config.api_key_for(&model), None);
    }

    #[test]
    fn debug_output_hides_keys() {
        let mut config = KestrelConfig::new();
        config.set_api_key("openai", "sk-secret".into());
        let rendered = format!("{config:?}");
        assert!(rendered.contains("openai"));
        assert!(!rendered.contains("sk-secret"));
    }
}
