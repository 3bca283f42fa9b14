//! Backend catalog and wire-format translation
//!
//! The [`ServiceRegistry`] holds immutable [`ServiceDescriptor`]s describing
//! where each backend lives, how it authenticates and which wire format it
//! speaks. Lookups never fail loudly: a missing id yields `None` so callers
//! can answer with the list of valid ids.

pub mod constants;
pub mod format;
pub mod pricing;

use crate::config::ProxySettings;
use derive_more::Display;
use http::{HeaderMap, HeaderName, HeaderValue};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub use format::{FormatConverter, ModelMap};

/// Request/response shape spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum WireFormat {
    /// Messages API (`/v1/messages`)
    #[serde(rename = "anthropic")]
    #[display("anthropic")]
    Anthropic,
    /// Chat Completions API (`/chat/completions`)
    #[serde(rename = "openai")]
    #[display("openai")]
    OpenAi,
    /// generateContent API
    #[serde(rename = "gemini")]
    #[display("gemini")]
    Gemini,
}

/// Backend identifier used in `/proxy/:service/...` paths
#[nutype(
    sanitize(trim, lowercase),
    validate(
        not_empty,
        len_char_max = 64,
        predicate = |s: &str| s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    ),
    derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, AsRef, Display)
)]
pub struct ServiceId(String);

/// Header carrying the credential and how its value is formed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthScheme {
    pub header_name: String,
    /// Value template; `{key}` is replaced by the API key
    pub value_template: String,
}

impl AuthScheme {
    pub fn bearer() -> Self {
        Self {
            header_name: "authorization".to_string(),
            value_template: "Bearer {key}".to_string(),
        }
    }

    pub fn header(name: &str) -> Self {
        Self {
            header_name: name.to_string(),
            value_template: "{key}".to_string(),
        }
    }

    pub fn render(&self, api_key: &str) -> String {
        self.value_template.replace("{key}", api_key)
    }
}

/// Immutable description of a backend
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    /// Base URL; may contain `{model}` or other `{param}` placeholders
    pub base_url_template: String,
    pub wire_format: WireFormat,
    pub auth_scheme: AuthScheme,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Operation name (`chat`, `models`, ...) to path template
    pub operations: BTreeMap<String, String>,
    pub extra_headers: Vec<(String, String)>,
    pub default_model: Option<String>,
}

impl ServiceDescriptor {
    pub fn url_for(&self, operation: &str, params: &BTreeMap<&str, &str>) -> String {
        let operation = operation.trim_matches('/');
        let path = match self.operations.get(operation) {
            Some(path) => path.clone(),
            None if operation.is_empty() => String::new(),
            None => format!("/{operation}"),
        };

        let mut url = format!("{}{}", self.base_url_template.trim_end_matches('/'), path);
        for (name, value) in params {
            url = url.replace(&format!("{{{name}}}"), &urlencoding::encode(value));
        }
        url
    }

    pub fn auth_headers(&self, api_key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let auth = std::iter::once((
            self.auth_scheme.header_name.as_str(),
            self.auth_scheme.render(api_key),
        ));
        let extra = self
            .extra_headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.clone()));

        for (name, value) in auth.chain(extra) {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(service = %self.id, header = name, "Skipping invalid header"),
            }
        }
        headers
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Service entry as written in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptorConfig {
    pub id: String,
    #[serde(alias = "base_url_template")]
    pub base_url_template: String,
    #[serde(alias = "wire_format")]
    pub wire_format: WireFormat,
    #[serde(default, alias = "auth_scheme")]
    pub auth_scheme: Option<AuthScheme>,
    #[serde(default, alias = "max_retries")]
    pub max_retries: Option<u32>,
    #[serde(default, alias = "retry_base_delay_ms")]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub operations: BTreeMap<String, String>,
    #[serde(default, alias = "extra_headers")]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default, alias = "default_model")]
    pub default_model: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Invalid service id: {0}")]
    InvalidId(String),

    #[error("Service already registered: {0}")]
    Duplicate(String),
}

impl TryFrom<ServiceDescriptorConfig> for ServiceDescriptor {
    type Error = RegistryError;

    fn try_from(config: ServiceDescriptorConfig) -> Result<Self, Self::Error> {
        let id = ServiceId::try_new(config.id.clone())
            .map_err(|_| RegistryError::InvalidId(config.id.clone()))?;
        let mut operations = default_operations(config.wire_format);
        operations.extend(config.operations);

        Ok(Self {
            id,
            base_url_template: config.base_url_template,
            wire_format: config.wire_format,
            auth_scheme: config
                .auth_scheme
                .unwrap_or_else(|| default_auth_scheme(config.wire_format)),
            max_retries: config.max_retries.unwrap_or(DEFAULT_SERVICE_RETRIES),
            retry_base_delay_ms: config
                .retry_base_delay_ms
                .unwrap_or(DEFAULT_SERVICE_RETRY_DELAY_MS),
            operations,
            extra_headers: if config.extra_headers.is_empty() {
                default_extra_headers(config.wire_format)
            } else {
                config.extra_headers.into_iter().collect()
            },
            default_model: config.default_model,
        })
    }
}

const DEFAULT_SERVICE_RETRIES: u32 = 3;
const DEFAULT_SERVICE_RETRY_DELAY_MS: u64 = 1_000;

fn default_auth_scheme(format: WireFormat) -> AuthScheme {
    match format {
        WireFormat::Anthropic => AuthScheme::header("x-api-key"),
        WireFormat::OpenAi => AuthScheme::bearer(),
        WireFormat::Gemini => AuthScheme::header("x-goog-api-key"),
    }
}

fn default_operations(format: WireFormat) -> BTreeMap<String, String> {
    let pairs: &[(&str, &str)] = match format {
        WireFormat::Anthropic => &[
            ("chat", "/v1/messages"),
            ("messages", "/v1/messages"),
            ("v1/messages", "/v1/messages"),
            ("models", "/v1/models"),
        ],
        WireFormat::OpenAi => &[
            ("chat", "/chat/completions"),
            ("chat/completions", "/chat/completions"),
            ("messages", "/chat/completions"),
            ("v1/messages", "/chat/completions"),
            ("models", "/models"),
        ],
        WireFormat::Gemini => &[
            ("chat", "/models/{model}:generateContent"),
            ("messages", "/models/{model}:generateContent"),
            ("v1/messages", "/models/{model}:generateContent"),
            ("models", "/models"),
        ],
    };
    pairs
        .iter()
        .map(|(op, path)| (op.to_string(), path.to_string()))
        .collect()
}

fn default_extra_headers(format: WireFormat) -> Vec<(String, String)> {
    match format {
        WireFormat::Anthropic => vec![(
            "anthropic-version".to_string(),
            constants::defaults::ANTHROPIC_VERSION.to_string(),
        )],
        WireFormat::OpenAi | WireFormat::Gemini => Vec::new(),
    }
}

fn builtin(id: &str, base_url: &str, format: WireFormat) -> ServiceDescriptorConfig {
    ServiceDescriptorConfig {
        id: id.to_string(),
        base_url_template: base_url.to_string(),
        wire_format: format,
        auth_scheme: None,
        max_retries: None,
        retry_base_delay_ms: None,
        operations: BTreeMap::new(),
        extra_headers: BTreeMap::new(),
        default_model: None,
    }
}

/// Built-in backend catalog
pub fn builtin_services() -> Vec<ServiceDescriptorConfig> {
    vec![
        builtin("anthropic", "https://api.anthropic.com", WireFormat::Anthropic),
        builtin("openai", "https://api.openai.com/v1", WireFormat::OpenAi),
        builtin("openrouter", "https://openrouter.ai/api/v1", WireFormat::OpenAi),
        builtin("deepseek", "https://api.deepseek.com/v1", WireFormat::OpenAi),
        builtin(
            "gemini",
            "https://generativelanguage.googleapis.com/v1beta",
            WireFormat::Gemini,
        ),
        builtin("ollama", "http://localhost:11434/v1", WireFormat::OpenAi),
    ]
}

/// Lookup seam used by the proxy
pub trait ServiceCatalog: Send + Sync {
    fn resolve(&self, id: &str) -> Option<Arc<ServiceDescriptor>>;

    /// Every registered id, sorted
    fn service_ids(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceId, Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured services first, then every built-in whose id is still free
    pub fn from_settings(settings: &ProxySettings) -> Self {
        let mut registry = Self::new();
        for config in settings.services.iter().cloned().chain(builtin_services()) {
            let id = config.id.clone();
            match ServiceDescriptor::try_from(config) {
                Ok(descriptor) => {
                    if registry.get(descriptor.id.as_ref()).is_none() {
                        // Cannot be a duplicate: checked just above
                        let _ = registry.register(descriptor);
                    }
                }
                Err(e) => warn!(service = %id, error = %e, "Skipping invalid service descriptor"),
            }
        }
        registry
    }

    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<(), RegistryError> {
        if self.services.contains_key(&descriptor.id) {
            return Err(RegistryError::Duplicate(descriptor.id.to_string()));
        }
        self.services
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServiceDescriptor>> {
        let id = ServiceId::try_new(id.to_string()).ok()?;
        self.services.get(&id).cloned()
    }

    /// Full upstream URL for `operation` with `{param}` placeholders filled
    pub fn build_url(
        &self,
        id: &str,
        operation: &str,
        params: &BTreeMap<&str, &str>,
    ) -> Option<String> {
        Some(self.get(id)?.url_for(operation, params))
    }

    /// Credential and static headers for a call to `id`
    pub fn auth_headers(&self, id: &str, api_key: &str) -> Option<HeaderMap> {
        Some(self.get(id)?.auth_headers(api_key))
    }
}

impl ServiceCatalog for ServiceRegistry {
    fn resolve(&self, id: &str) -> Option<Arc<ServiceDescriptor>> {
        self.get(id)
    }

    fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.keys().map(ToString::to_string).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::from_settings(&ProxySettings::default())
    }

    #[test]
    fn test_builtin_catalog() {
        let registry = registry();
        let ids = registry.service_ids();

        assert_eq!(
            ids,
            vec!["anthropic", "deepseek", "gemini", "ollama", "openai", "openrouter"]
        );
        assert_eq!(
            registry.get("OpenAI ").unwrap().wire_format,
            WireFormat::OpenAi
        );
        assert!(registry.get("nope").is_none());
        assert!(registry.get("bad id!").is_none());
    }

    #[test]
    fn test_configured_service_overrides_builtin() {
        let settings = ProxySettings {
            services: vec![
                builtin("openai", "http://127.0.0.1:9999/v1", WireFormat::OpenAi),
                builtin("Not Valid!", "http://x", WireFormat::OpenAi),
            ],
            ..Default::default()
        };
        let registry = ServiceRegistry::from_settings(&settings);

        assert_eq!(
            registry.get("openai").unwrap().base_url_template,
            "http://127.0.0.1:9999/v1"
        );
        assert_eq!(registry.service_ids().len(), 6);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = registry();
        let descriptor = ServiceDescriptor::try_from(builtin(
            "anthropic",
            "http://elsewhere",
            WireFormat::Anthropic,
        ))
        .unwrap();

        assert_eq!(
            registry.register(descriptor),
            Err(RegistryError::Duplicate("anthropic".to_string()))
        );
    }

    #[test]
    fn test_build_url() {
        let registry = registry();
        let params = BTreeMap::from([("model", "gemini-1.5-pro")]);

        assert_eq!(
            registry.build_url("openai", "chat", &params).unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            registry.build_url("gemini", "chat", &params).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:generateContent"
        );
        assert_eq!(
            registry.build_url("openai", "/embeddings/", &params).unwrap(),
            "https://api.openai.com/v1/embeddings"
        );
        assert!(registry.build_url("missing", "chat", &params).is_none());
    }

    #[test]
    fn test_auth_headers_per_scheme() {
        let registry = registry();

        let openai = registry.auth_headers("openai", "sk-1").unwrap();
        assert_eq!(openai["authorization"], "Bearer sk-1");

        let anthropic = registry.auth_headers("anthropic", "sk-ant-1").unwrap();
        assert_eq!(anthropic["x-api-key"], "sk-ant-1");
        assert_eq!(anthropic["anthropic-version"], "2023-06-01");

        let gemini = registry.auth_headers("gemini", "g-1").unwrap();
        assert_eq!(gemini["x-goog-api-key"], "g-1");

        assert!(registry.auth_headers("missing", "k").is_none());
    }

    #[test]
    fn test_descriptor_config_from_json() {
        let config: ServiceDescriptorConfig = serde_json::from_value(serde_json::json!({
            "id": "vendorb",
            "baseUrlTemplate": "http://127.0.0.1:1234",
            "wireFormat": "openai",
            "maxRetries": 5
        }))
        .unwrap();
        let descriptor = ServiceDescriptor::try_from(config).unwrap();

        assert_eq!(descriptor.max_retries, 5);
        assert_eq!(descriptor.auth_scheme, AuthScheme::bearer());
        assert_eq!(descriptor.operations["chat"], "/chat/completions");
    }
}
