/*!
 * Named provider lookup.
 *
 * The registry is an ordinary value built once at process start and passed
 * to the services that need it, so tests can assemble one from mocks.
 */

use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::app_config::{TranslationConfig, TranslationProvider};
use crate::errors::ProviderError;
use crate::providers::anthropic::Anthropic;
use crate::providers::ollama::Ollama;
use crate::providers::openai::OpenAI;
use crate::providers::Provider;

/// Map from provider name to implementation
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    default_name: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `name`; the first registration becomes the default
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    /// Builder form of `register`
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(name, provider);
        self
    }

    /// Choose which registered provider `default_provider` returns
    pub fn set_default(&mut self, name: impl Into<String>) -> Result<(), ProviderError> {
        let name = name.into();
        if !self.providers.contains_key(&name) {
            return Err(ProviderError::NotConfigured(name));
        }
        self.default_name = Some(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured(name.to_string()))
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn default_provider(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured("<default>".to_string()))?;
        self.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build every configured backend; the active provider becomes the default
    pub fn from_config(config: &TranslationConfig) -> Self {
        let mut registry = Self::new();
        for kind in TranslationProvider::ALL {
            if config.get_provider_config(&kind).is_none() && kind != config.provider {
                continue;
            }
            registry.register(kind.to_string(), Self::build(kind, config));
        }
        registry.default_name = Some(config.provider.to_string());
        info!(
            "Providers available: {} (default: {})",
            registry.names().join(", "),
            config.provider
        );
        registry
    }

    fn build(kind: TranslationProvider, config: &TranslationConfig) -> Arc<dyn Provider> {
        let settings = config.resolved_provider_config(kind);
        let name = kind.to_string();
        match kind {
            TranslationProvider::OpenAI | TranslationProvider::LMStudio => Arc::new(OpenAI::new(
                name,
                settings.api_key,
                settings.endpoint,
                settings.model,
                settings.timeout_secs,
            )),
            TranslationProvider::Anthropic => Arc::new(Anthropic::new(
                name,
                settings.api_key,
                settings.endpoint,
                settings.model,
                settings.timeout_secs,
            )),
            TranslationProvider::Ollama => Arc::new(Ollama::new(
                name,
                settings.endpoint,
                settings.model,
                settings.timeout_secs,
            )),
        }
    }
}
