//! Provider/model resolution and the shared model-list cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ModelsConfig, ProviderConfig};
use crate::error::{GatewayError, Result};
use crate::telemetry::RetryPolicy;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Caller overrides; `None` falls back to the resolver's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// A resolved model, handed to the runner which instantiates `module.class`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub provider: String,
    pub id: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub module: String,
    pub class: String,
}

pub trait ModelResolver: Send + Sync {
    fn resolve(&self, selection: &ModelSelection) -> Result<ModelHandle>;
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolver backed by the configured provider table.
#[derive(Clone)]
pub struct ProviderTable {
    default_provider: String,
    providers: HashMap<String, ProviderConfig>,
    env: EnvLookup,
}

impl ProviderTable {
    pub fn from_config(cfg: &ModelsConfig) -> Self {
        Self {
            default_provider: cfg.default_provider.clone(),
            providers: cfg
                .providers
                .iter()
                .map(|(name, provider)| (name.to_ascii_lowercase(), provider.clone()))
                .collect(),
            env: Arc::new(|key| std::env::var(key).ok().filter(|v| !v.is_empty())),
        }
    }

    /// Replaces the environment lookup used for API keys.
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn provider(&self, name: &str) -> Result<&ProviderConfig> {
        let key = name.trim().to_ascii_lowercase();
        self.providers.get(&key).ok_or_else(|| {
            let mut available: Vec<&str> = self.providers.keys().map(String::as_str).collect();
            available.sort_unstable();
            GatewayError::configuration(
                format!("Unknown provider: {key}"),
                format!("Available: {}", available.join(", ")),
            )
        })
    }

    pub fn providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.providers.iter()
    }

    pub fn api_key(&self, provider: &ProviderConfig) -> Option<String> {
        (self.env)(&provider.api_key_env)
    }
}

impl ModelResolver for ProviderTable {
    fn resolve(&self, selection: &ModelSelection) -> Result<ModelHandle> {
        let name = selection
            .provider
            .as_deref()
            .unwrap_or(&self.default_provider)
            .trim()
            .to_ascii_lowercase();
        let provider = self.provider(&name)?;
        if provider.requires_key && self.api_key(provider).is_none() {
            return Err(GatewayError::configuration(
                format!("API key not found for {name}"),
                format!("Set {} in your environment or .env file.", provider.api_key_env),
            ));
        }
        if let Some(warning) = &provider.warning {
            tracing::warn!(provider = %name, "{warning}");
        }
        Ok(ModelHandle {
            id: selection
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| provider.default_model.clone()),
            temperature: selection.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: selection.max_tokens,
            module: provider.module.clone(),
            class: provider.class.clone(),
            provider: name,
        })
    }
}

/// Something that can enumerate the models a provider offers.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn list_models(&self, provider: &str) -> Result<Vec<String>>;
}

/// Queries OpenRouter's public model list; other providers report their default model.
pub struct RemoteModelSource {
    http: reqwest::Client,
    table: ProviderTable,
    openrouter_url: String,
    retry: RetryPolicy,
}

impl RemoteModelSource {
    pub fn new(table: ProviderTable, cfg: &ModelsConfig) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()?,
            table,
            openrouter_url: cfg.openrouter_models_url.clone(),
            retry: RetryPolicy::default_external_call(),
        })
    }

    async fn fetch_openrouter(&self, api_key: &str) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(&self.openrouter_url)
            .bearer_auth(api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Protocol(format!(
                "openrouter model list failed with {status}: {body}"
            )));
        }
        let payload: Value = resp.json().await?;
        Ok(parse_model_ids(&payload))
    }
}

pub fn parse_model_ids(payload: &Value) -> Vec<String> {
    let mut ids: Vec<String> = payload
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    ids.sort();
    ids
}

#[async_trait]
impl ModelSource for RemoteModelSource {
    async fn list_models(&self, provider: &str) -> Result<Vec<String>> {
        let config = self.table.provider(provider)?;
        if provider.trim().eq_ignore_ascii_case("openrouter") {
            let Some(key) = self.table.api_key(config) else {
                return Ok(Vec::new());
            };
            return self
                .retry
                .retry("openrouter_models", |_| self.fetch_openrouter(&key))
                .await;
        }
        Ok(vec![config.default_model.clone()])
    }
}

/// Provider → model ids. Stale reads are acceptable; writes replace the whole value.
pub struct ModelListCache {
    source: Arc<dyn ModelSource>,
    entries: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl ModelListCache {
    pub fn new(source: Arc<dyn ModelSource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached(&self, provider: &str) -> Option<Arc<Vec<String>>> {
        let key = provider.trim().to_ascii_lowercase();
        self.entries.read().ok()?.get(&key).cloned()
    }

    pub async fn models(&self, provider: &str) -> Result<Arc<Vec<String>>> {
        if let Some(hit) = self.cached(provider) {
            return Ok(hit);
        }
        let key = provider.trim().to_ascii_lowercase();
        let fetched = Arc::new(self.source.list_models(&key).await?);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, fetched.clone());
        }
        Ok(fetched)
    }

    /// Drops one provider's list, or every list when `provider` is `None`.
    pub fn invalidate(&self, provider: Option<&str>) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        match provider {
            Some(name) => {
                entries.remove(&name.trim().to_ascii_lowercase());
            }
            None => entries.clear(),
        }
        tracing::debug!(provider = provider.unwrap_or("*"), "model list cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table(keys: &'static [(&'static str, &'static str)]) -> ProviderTable {
        ProviderTable::from_config(&ModelsConfig::default()).with_env(move |name| {
            keys.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        })
    }

    #[test]
    fn resolves_defaults_and_overrides() {
        let table = table(&[("OPENAI_API_KEY", "sk-test")]);
        let handle = table
            .resolve(&ModelSelection {
                provider: Some(" OpenAI ".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(handle.provider, "openai");
        assert_eq!(handle.id, "gpt-4o");
        assert_eq!(handle.temperature, DEFAULT_TEMPERATURE);

        let handle = table
            .resolve(&ModelSelection {
                provider: Some("openai".into()),
                model: Some("gpt-4o-mini".into()),
                temperature: Some(0.1),
                max_tokens: Some(256),
            })
            .unwrap();
        assert_eq!(handle.id, "gpt-4o-mini");
        assert_eq!(handle.max_tokens, Some(256));
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let err = table(&[])
            .resolve(&ModelSelection {
                provider: Some("anthropic".into()),
                ..Default::default()
            })
            .unwrap_err();
        match err {
            GatewayError::Configuration { message, hint } => {
                assert_eq!(message, "API key not found for anthropic");
                assert!(hint.contains("ANTHROPIC_API_KEY"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn keyless_and_unknown_providers() {
        let table = table(&[]);
        let handle = table
            .resolve(&ModelSelection {
                provider: Some("ollama".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(handle.class, "Ollama");

        let err = table
            .resolve(&ModelSelection {
                provider: Some("nope".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("Available: anthropic, cerebras"));
    }

    #[test]
    fn parses_openrouter_payload() {
        let payload = serde_json::json!({"data": [{"id": "z/model"}, {"id": "a/model"}, {"name": "no-id"}]});
        assert_eq!(parse_model_ids(&payload), vec!["a/model", "z/model"]);
    }

    struct CountingSource(AtomicUsize);

    #[async_trait]
    impl ModelSource for CountingSource {
        async fn list_models(&self, provider: &str) -> Result<Vec<String>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![format!("{provider}-{n}")])
        }
    }

    #[tokio::test]
    async fn cache_serves_hits_until_invalidated() {
        let source = Arc::new(CountingSource(AtomicUsize::new(0)));
        let cache = ModelListCache::new(source.clone());
        assert_eq!(cache.models("groq").await.unwrap()[0], "groq-0");
        assert_eq!(cache.models("GROQ").await.unwrap()[0], "groq-0");
        assert_eq!(cache.models("openai").await.unwrap()[0], "openai-1");

        cache.invalidate(Some("groq"));
        assert!(cache.cached("groq").is_none());
        assert!(cache.cached("openai").is_some());
        assert_eq!(cache.models("groq").await.unwrap()[0], "groq-2");

        cache.invalidate(None);
        assert!(cache.cached("openai").is_none());
    }
}
