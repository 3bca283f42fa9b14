//! Events published to the embedding application
//!
//! Collaborators (tray, windows, log views) subscribe to the bus and render
//! what they receive; nothing in the proxy waits on a subscriber.

use crate::diagnostics::record::{CanonicalErrorRecord, Severity, SuggestedAction};
use crate::intelligence::context_analyzer::RiskLevel;
use crate::intelligence::health::{ComponentReport, HealthStatus};
use crate::intelligence::predictor::Prediction;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AppEvent {
    Started {
        port: u16,
        url: String,
        dynamic: bool,
    },
    Stopped,
    Request {
        request_id: String,
        method: String,
        path: String,
        model: Option<String>,
    },
    Response {
        request_id: String,
        status: u16,
        duration_ms: u64,
    },
    Usage {
        request_id: String,
        model: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    Error {
        record: Box<CanonicalErrorRecord>,
    },
    DynamicRequest {
        request_id: String,
        service: String,
        model: String,
        source_format: String,
        target_format: String,
        path: String,
    },
    Prediction {
        prediction: Prediction,
    },
    HealthStatusChanged {
        previous: HealthStatus,
        current: HealthStatus,
    },
    HealthAlert {
        status: HealthStatus,
        components: Vec<ComponentReport>,
    },
    RecoveryCompleted {
        fingerprint: String,
        strategy: Option<String>,
        success: bool,
        attempts: u32,
        message: String,
    },
    IntelligentErrorHandled {
        error_id: String,
        fingerprint: String,
        risk_level: Option<RiskLevel>,
        insights: usize,
        recovered: Option<bool>,
    },
    ErrorNotification {
        error_id: String,
        severity: Severity,
        message: String,
        suggestion: Option<String>,
        actions: Vec<SuggestedAction>,
    },
    RecoveryConfirmationRequested {
        confirmation_id: String,
        strategy: String,
        message: String,
        timeout_secs: u64,
    },
}

impl AppEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::Started { .. } => "started",
            AppEvent::Stopped => "stopped",
            AppEvent::Request { .. } => "request",
            AppEvent::Response { .. } => "response",
            AppEvent::Usage { .. } => "usage",
            AppEvent::Error { .. } => "error",
            AppEvent::DynamicRequest { .. } => "dynamic-request",
            AppEvent::Prediction { .. } => "prediction",
            AppEvent::HealthStatusChanged { .. } => "health-status-changed",
            AppEvent::HealthAlert { .. } => "health-alert",
            AppEvent::RecoveryCompleted { .. } => "recovery-completed",
            AppEvent::IntelligentErrorHandled { .. } => "intelligent-error-handled",
            AppEvent::ErrorNotification { .. } => "error-notification",
            AppEvent::RecoveryConfirmationRequested { .. } => "recovery-confirmation-requested",
        }
    }
}

/// Fire-and-forget broadcast of [`AppEvent`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish without waiting; an event with no subscribers is dropped
    pub fn publish(&self, event: AppEvent) {
        let name = event.name();
        let receivers = self.sender.send(event).unwrap_or(0);
        trace!(event = name, receivers, "Published event");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
