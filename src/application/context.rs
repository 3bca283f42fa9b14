//! Wiring of every long-lived component

use crate::config::Settings;
use crate::diagnostics::{
    ErrorHandler, ErrorHistory, ErrorLogger, ErrorNotifier, JsonLinesErrorLogger,
    TracingErrorLogger,
};
use crate::events::EventBus;
use crate::intelligence::health::{ErrorPipelineCheck, MetricsSource};
use crate::intelligence::recovery::{
    default_strategies, strategies::ConfigFiles, AutoRecoveryManager, ConfirmationProvider,
    EventConfirmation, ProxyControl, SharedSettings,
};
use crate::intelligence::{
    ContextAnalyzer, ErrorPredictor, HealthMonitor, IntelligencePipeline, SysinfoSource,
};
use crate::proxy::forwarder::{Forwarder, ThrottleGate, UpstreamClient};
use crate::proxy::{ProxyComponents, ProxyServer, UsageTracker};
use crate::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Shared handles built once per process
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub events: EventBus,
    pub history: Arc<ErrorHistory>,
    pub errors: Arc<ErrorHandler>,
    pub usage: Arc<UsageTracker>,
    pub health: Arc<HealthMonitor>,
    pub predictor: Arc<ErrorPredictor>,
    pub analyzer: Arc<ContextAnalyzer>,
    pub recovery: Arc<AutoRecoveryManager>,
    pub pipeline: Arc<IntelligencePipeline>,
    pub proxy_settings: SharedSettings,
    pub server: Arc<ProxyServer>,
}

impl AppContext {
    #[instrument(skip_all)]
    pub fn build(settings: Settings) -> Result<Self> {
        let intelligence = &settings.intelligence;
        let events = EventBus::default();
        let history = Arc::new(ErrorHistory::new(intelligence.history_capacity));

        let notifier = ErrorNotifier::new(
            events.clone(),
            Duration::from_secs(intelligence.notification_dedup_secs),
        );
        let mut handler = ErrorHandler::new(Arc::clone(&history), notifier, events.clone())
            .with_logger(Arc::new(TracingErrorLogger));
        if let Some(path) = &intelligence.error_log_path {
            let logger: Arc<dyn ErrorLogger> = Arc::new(JsonLinesErrorLogger::open(path)?);
            info!(path = %path.display(), "Persisting error records");
            handler = handler.with_logger(logger);
        }
        let errors = Arc::new(handler);

        let client = Arc::new(UpstreamClient::new(&settings.proxy)?);
        let forwarder = Forwarder::new(client, ThrottleGate::new());
        let usage = Arc::new(UsageTracker::new());

        let metrics: Arc<dyn MetricsSource> = Arc::new(SysinfoSource::new());
        let health = Arc::new(HealthMonitor::new(
            intelligence.health.clone(),
            Arc::clone(&metrics),
            Arc::clone(&history),
            events.clone(),
        ));
        health.add_check(Arc::new(ErrorPipelineCheck::new(Arc::clone(&errors))));

        let server = Arc::new(ProxyServer::new(
            ProxyComponents {
                forwarder: forwarder.clone(),
                usage: Arc::clone(&usage),
                events: events.clone(),
                errors: Arc::clone(&errors),
                health: health.subscribe(),
            },
            settings.proxy.clone(),
        ));

        let proxy_settings: SharedSettings = Arc::new(RwLock::new(settings.proxy.clone()));
        let confirmations: Arc<dyn ConfirmationProvider> =
            Arc::new(EventConfirmation::new(events.clone()));
        let control: Arc<dyn ProxyControl> = Arc::clone(&server) as Arc<dyn ProxyControl>;
        let recovery = Arc::new(AutoRecoveryManager::new(
            intelligence.recovery.clone(),
            default_strategies(
                &forwarder,
                Arc::clone(&history),
                Arc::clone(&proxy_settings),
                Arc::new(ConfigFiles),
                control,
            ),
            confirmations,
            events.clone(),
        ));

        let predictor = Arc::new(ErrorPredictor::new(
            intelligence.predictor.clone(),
            events.clone(),
        ));
        let analyzer = Arc::new(ContextAnalyzer::new(
            intelligence.analyzer.clone(),
            metrics,
            Arc::clone(&history),
            Arc::clone(&usage),
        ));
        let pipeline = Arc::new(IntelligencePipeline::new(
            Arc::clone(&errors),
            Arc::clone(&predictor),
            Arc::clone(&analyzer),
            Arc::clone(&recovery),
            Arc::clone(&health),
            events.clone(),
            intelligence.pipeline_queue_capacity,
        )
        .with_concurrency(intelligence.pipeline_concurrency));

        Ok(Self {
            settings,
            events,
            history,
            errors,
            usage,
            health,
            predictor,
            analyzer,
            recovery,
            pipeline,
            proxy_settings,
            server,
        })
    }
}
