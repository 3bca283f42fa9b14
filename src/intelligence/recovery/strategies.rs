//! Built-in recovery strategies

use super::{RecoveryError, RecoveryStrategy};
use crate::config::{ProxySettings, Settings};
use crate::diagnostics::{CanonicalErrorRecord, ErrorHistory, ErrorType, Severity};
use crate::proxy::forwarder::{Forwarder, ThrottleGate, UpstreamClient};
use crate::proxy::server::ProxyServer;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Proxy settings used for the next (re)start
pub type SharedSettings = Arc<RwLock<ProxySettings>>;

/// Source of fresh proxy settings, normally the config files
pub trait SettingsLoader: Send + Sync {
    fn load(&self) -> Result<ProxySettings, String>;
}

/// Loads `Settings::new()` and keeps its proxy section
pub struct ConfigFiles;

impl SettingsLoader for ConfigFiles {
    fn load(&self) -> Result<ProxySettings, String> {
        Settings::new()
            .map(|settings| settings.proxy)
            .map_err(|e| e.to_string())
    }
}

/// Restart access to the running proxy listener
#[async_trait]
pub trait ProxyControl: Send + Sync {
    async fn is_running(&self) -> bool;

    /// Stop (if running) and start again; returns the new port
    async fn restart(&self, settings: ProxySettings) -> Result<u16, String>;
}

#[async_trait]
impl ProxyControl for ProxyServer {
    async fn is_running(&self) -> bool {
        ProxyServer::is_running(self).await
    }

    async fn restart(&self, settings: ProxySettings) -> Result<u16, String> {
        self.stop().await;
        self.start(Some(settings))
            .await
            .map(|started| started.port)
            .map_err(|e| e.to_string())
    }
}

fn throttle_key(record: &CanonicalErrorRecord) -> Result<&str, RecoveryError> {
    record
        .context
        .service()
        .ok_or_else(|| RecoveryError::NotApplicable("error is not tied to a service".to_string()))
}

fn transport_code(record: &CanonicalErrorRecord) -> Option<&str> {
    record.original_error.as_ref()?.code.as_deref()
}

/// Holds requests to a throttled service until `Retry-After` has passed
pub struct RateLimitBackoff {
    throttle: ThrottleGate,
    default_wait: Duration,
}

impl RateLimitBackoff {
    pub fn new(throttle: ThrottleGate) -> Self {
        Self {
            throttle,
            default_wait: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for RateLimitBackoff {
    fn name(&self) -> &'static str {
        "rate_limit_backoff"
    }

    fn priority(&self) -> u8 {
        100
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn applies(&self, record: &CanonicalErrorRecord) -> bool {
        record.error_type == ErrorType::Api
            && record.context.service().is_some()
            && (record.context.status() == Some(429)
                || record.searchable_text().contains("rate limit"))
    }

    async fn execute(&self, record: &CanonicalErrorRecord) -> Result<String, RecoveryError> {
        let key = throttle_key(record)?;
        let wait = record
            .context
            .retry_after_secs()
            .map(Duration::from_secs)
            .unwrap_or(self.default_wait);
        self.throttle.arm(key, wait);
        Ok(format!("Holding requests to {key} for {}s", wait.as_secs()))
    }
}

/// Spaces out requests to a failing service, doubling per repeat
pub struct ExponentialBackoff {
    throttle: ThrottleGate,
    history: Arc<ErrorHistory>,
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(throttle: ThrottleGate, history: Arc<ErrorHistory>) -> Self {
        Self {
            throttle,
            history,
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }

    pub fn delay_for(&self, repeats: usize) -> Duration {
        let exponent = u32::try_from(repeats.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }
}

#[async_trait]
impl RecoveryStrategy for ExponentialBackoff {
    fn name(&self) -> &'static str {
        "exponential_backoff"
    }

    fn priority(&self) -> u8 {
        60
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn applies(&self, record: &CanonicalErrorRecord) -> bool {
        let server_error = record.context.status().is_some_and(|s| s >= 500);
        record.context.service().is_some()
            && (record.error_type == ErrorType::Network || server_error)
    }

    async fn execute(&self, record: &CanonicalErrorRecord) -> Result<String, RecoveryError> {
        let key = throttle_key(record)?;
        let delay = self.delay_for(self.history.count_matching(&record.fingerprint));
        self.throttle.arm(key, delay);
        Ok(format!("Backing off {key} for {}ms", delay.as_millis()))
    }
}

/// Drops pooled upstream connections by rebuilding the HTTP client
pub struct ConnectionPoolReset {
    upstream: Arc<UpstreamClient>,
}

impl ConnectionPoolReset {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl RecoveryStrategy for ConnectionPoolReset {
    fn name(&self) -> &'static str {
        "connection_pool_reset"
    }

    fn priority(&self) -> u8 {
        80
    }

    fn applies(&self, record: &CanonicalErrorRecord) -> bool {
        record.error_type == ErrorType::Network
            && matches!(
                transport_code(record),
                Some("ECONNRESET" | "ETIMEDOUT" | "EUNKNOWN")
            )
    }

    async fn execute(&self, _record: &CanonicalErrorRecord) -> Result<String, RecoveryError> {
        self.upstream.rebuild()?;
        Ok(format!(
            "Rebuilt the upstream client ({} rebuilds so far)",
            self.upstream.rebuilds()
        ))
    }
}

/// Re-reads credentials from the config files and restarts the listener with them
pub struct CredentialReload {
    settings: SharedSettings,
    loader: Arc<dyn SettingsLoader>,
    proxy: Arc<dyn ProxyControl>,
}

impl CredentialReload {
    pub fn new(
        settings: SharedSettings,
        loader: Arc<dyn SettingsLoader>,
        proxy: Arc<dyn ProxyControl>,
    ) -> Self {
        Self {
            settings,
            loader,
            proxy,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for CredentialReload {
    fn name(&self) -> &'static str {
        "auth_token_refresh"
    }

    fn priority(&self) -> u8 {
        70
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn destructive(&self) -> bool {
        true
    }

    /// Only upstream rejections; a client that sent no key is not a credential problem
    fn applies(&self, record: &CanonicalErrorRecord) -> bool {
        record.error_type == ErrorType::Api
            && matches!(record.context.status(), Some(401 | 403))
            && transport_code(record).is_some_and(|code| code.starts_with("HTTP_"))
    }

    async fn execute(&self, _record: &CanonicalErrorRecord) -> Result<String, RecoveryError> {
        let fresh = self.loader.load().map_err(RecoveryError::Unavailable)?;
        let updated = {
            let mut current = self.settings.write();
            let unchanged = current.api_key == fresh.api_key
                && current.openai_api_key == fresh.openai_api_key
                && current.expected_anthropic_api_key == fresh.expected_anthropic_api_key;
            if unchanged {
                return Err(RecoveryError::Failed(
                    "credentials on disk are unchanged; update the API key".to_string(),
                ));
            }
            current.api_key = fresh.api_key;
            current.openai_api_key = fresh.openai_api_key;
            current.expected_anthropic_api_key = fresh.expected_anthropic_api_key;
            current.clone()
        };

        if !self.proxy.is_running().await {
            return Ok("Reloaded credentials for the next start".to_string());
        }
        let port = self
            .proxy
            .restart(updated)
            .await
            .map_err(RecoveryError::Failed)?;
        Ok(format!("Reloaded credentials and restarted the proxy on port {port}"))
    }
}

/// Repairs trivially broken proxy settings
pub struct ConfigAutoFix {
    settings: SharedSettings,
}

impl ConfigAutoFix {
    pub fn new(settings: SharedSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RecoveryStrategy for ConfigAutoFix {
    fn name(&self) -> &'static str {
        "config_auto_fix"
    }

    fn priority(&self) -> u8 {
        90
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn applies(&self, record: &CanonicalErrorRecord) -> bool {
        record.error_type == ErrorType::Config
    }

    async fn execute(&self, _record: &CanonicalErrorRecord) -> Result<String, RecoveryError> {
        let mut settings = self.settings.write();
        let fixes = settings.auto_fix();
        if let Err(problems) = settings.validate() {
            let problems: Vec<_> = problems.iter().map(ToString::to_string).collect();
            return Err(RecoveryError::Failed(format!(
                "configuration still invalid: {}",
                problems.join("; ")
            )));
        }
        if fixes.is_empty() {
            return Err(RecoveryError::Failed("configuration is valid; nothing to repair".to_string()));
        }
        info!(fixes = fixes.len(), "Repaired proxy configuration");
        Ok(fixes.join("; "))
    }
}

/// Releases memory held by the error history
pub struct ResourceCleanup {
    history: Arc<ErrorHistory>,
}

impl ResourceCleanup {
    pub fn new(history: Arc<ErrorHistory>) -> Self {
        Self { history }
    }
}

#[async_trait]
impl RecoveryStrategy for ResourceCleanup {
    fn name(&self) -> &'static str {
        "resource_cleanup"
    }

    fn priority(&self) -> u8 {
        40
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn applies(&self, record: &CanonicalErrorRecord) -> bool {
        record.error_type == ErrorType::System
    }

    async fn execute(&self, _record: &CanonicalErrorRecord) -> Result<String, RecoveryError> {
        let released = self.history.trim_to(self.history.capacity() / 2);
        Ok(format!("Released {released} error history entries"))
    }
}

/// Restarts the proxy listener
pub struct ProxyRestart {
    settings: SharedSettings,
    proxy: Arc<dyn ProxyControl>,
}

impl ProxyRestart {
    pub fn new(settings: SharedSettings, proxy: Arc<dyn ProxyControl>) -> Self {
        Self { settings, proxy }
    }
}

#[async_trait]
impl RecoveryStrategy for ProxyRestart {
    fn name(&self) -> &'static str {
        "proxy_restart"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn destructive(&self) -> bool {
        true
    }

    fn applies(&self, record: &CanonicalErrorRecord) -> bool {
        record.error_type == ErrorType::Process
            || (record.error_type == ErrorType::System && record.severity == Severity::Critical)
    }

    async fn execute(&self, _record: &CanonicalErrorRecord) -> Result<String, RecoveryError> {
        let settings = self.settings.read().clone();
        let port = self
            .proxy
            .restart(settings)
            .await
            .map_err(RecoveryError::Failed)?;
        Ok(format!("Restarted the proxy on port {port}"))
    }
}

/// The full built-in set, wired to the application's collaborators
pub fn default_strategies(
    forwarder: &Forwarder,
    history: Arc<ErrorHistory>,
    settings: SharedSettings,
    loader: Arc<dyn SettingsLoader>,
    proxy: Arc<dyn ProxyControl>,
) -> Vec<Arc<dyn RecoveryStrategy>> {
    vec![
        Arc::new(RateLimitBackoff::new(forwarder.throttle().clone())),
        Arc::new(ExponentialBackoff::new(
            forwarder.throttle().clone(),
            Arc::clone(&history),
        )),
        Arc::new(ConnectionPoolReset::new(Arc::clone(forwarder.upstream()))),
        Arc::new(CredentialReload::new(
            Arc::clone(&settings),
            loader,
            Arc::clone(&proxy),
        )),
        Arc::new(ConfigAutoFix::new(Arc::clone(&settings))),
        Arc::new(ResourceCleanup::new(history)),
        Arc::new(ProxyRestart::new(settings, proxy)),
    ]
}
