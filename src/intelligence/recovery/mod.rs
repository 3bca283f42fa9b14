//! Automatic remediation of classified errors
//!
//! A [`RecoveryStrategy`] declares which records it applies to and how to
//! remediate them. The [`AutoRecoveryManager`] orders the applicable
//! strategies by priority, honours cooldowns and per-error attempt caps,
//! and asks for confirmation before anything destructive.

pub mod confirmation;
pub mod manager;
pub mod strategies;

pub use confirmation::{ConfirmationProvider, DenyAll, EventConfirmation};
pub use manager::{AutoRecoveryManager, RecoveryReport, StrategyStats};
pub use strategies::{
    default_strategies, ConfigAutoFix, ConnectionPoolReset, CredentialReload, ExponentialBackoff,
    ProxyControl, ProxyRestart, RateLimitBackoff, ResourceCleanup, SettingsLoader, SharedSettings,
};

use crate::diagnostics::CanonicalErrorRecord;
use crate::proxy::types::ProxyError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Strategy does not apply: {0}")]
    NotApplicable(String),

    #[error("Recovery failed: {0}")]
    Failed(String),

    #[error("Recovery unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher runs first
    fn priority(&self) -> u8;

    /// Minimum time between two runs of this strategy
    fn cooldown(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Destructive strategies need user confirmation
    fn destructive(&self) -> bool {
        false
    }

    fn applies(&self, record: &CanonicalErrorRecord) -> bool;

    /// Remediate; the returned text describes what was done
    async fn execute(&self, record: &CanonicalErrorRecord) -> Result<String, RecoveryError>;
}
