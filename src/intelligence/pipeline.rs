//! Background tasks feeding handled errors through the intelligence stages
//!
//! The [`ErrorHandler`] fans every record out to two bounded queues. The
//! predictor task watches for failure patterns and escalates critical
//! predictions to the [`HealthMonitor`]; the coordinator task analyzes each
//! record's context, attempts recovery and publishes the combined outcome.
//! Records are coordinated concurrently, up to a fixed number at once, so a
//! recovery waiting on confirmation never holds up unrelated errors.
//! Neither task ever feeds back into the HTTP path.

use crate::diagnostics::{ErrorHandler, SharedRecord};
use crate::events::{AppEvent, EventBus};
use crate::intelligence::context_analyzer::ContextAnalyzer;
use crate::intelligence::health::HealthMonitor;
use crate::intelligence::predictor::{ErrorPredictor, PredictionRisk};
use crate::intelligence::recovery::AutoRecoveryManager;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

pub struct IntelligencePipeline {
    errors: Arc<ErrorHandler>,
    predictor: Arc<ErrorPredictor>,
    analyzer: Arc<ContextAnalyzer>,
    recovery: Arc<AutoRecoveryManager>,
    health: Arc<HealthMonitor>,
    events: EventBus,
    queue_capacity: usize,
    concurrency: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

const DEFAULT_CONCURRENCY: usize = 8;

impl IntelligencePipeline {
    pub fn new(
        errors: Arc<ErrorHandler>,
        predictor: Arc<ErrorPredictor>,
        analyzer: Arc<ContextAnalyzer>,
        recovery: Arc<AutoRecoveryManager>,
        health: Arc<HealthMonitor>,
        events: EventBus,
        queue_capacity: usize,
    ) -> Self {
        Self {
            errors,
            predictor,
            analyzer,
            recovery,
            health,
            events,
            queue_capacity,
            concurrency: DEFAULT_CONCURRENCY,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Cap on records the coordinator handles at the same time
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Subscribe to the handler and spawn both tasks; no-op when running
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let predictions = self.errors.subscribe("predictor", self.queue_capacity);
        tasks.push(tokio::spawn(run_predictor(
            predictions,
            Arc::clone(&self.predictor),
            Arc::clone(&self.health),
        )));

        let coordinated = self.errors.subscribe("coordinator", self.queue_capacity);
        tasks.push(tokio::spawn(run_coordinator(
            coordinated,
            Arc::clone(&self.analyzer),
            Arc::clone(&self.recovery),
            self.events.clone(),
            self.concurrency,
        )));
        info!(
            queue_capacity = self.queue_capacity,
            concurrency = self.concurrency,
            "Intelligence pipeline started"
        );
    }

    pub fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        info!("Intelligence pipeline stopped");
    }
}

impl Drop for IntelligencePipeline {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn run_predictor(
    mut records: mpsc::Receiver<SharedRecord>,
    predictor: Arc<ErrorPredictor>,
    health: Arc<HealthMonitor>,
) {
    while let Some(record) = records.recv().await {
        let predictions = predictor.observe(&record);
        if predictions
            .iter()
            .any(|p| p.risk == PredictionRisk::Critical)
        {
            warn!(fingerprint = %record.fingerprint, "Critical prediction, forcing a health check");
            let snapshot = health.force_check().await;
            debug!(overall = %snapshot.overall, "Forced health check finished");
        }
    }
    debug!("Predictor queue closed");
}

/// Handle each record in its own task; aborting the coordinator aborts them all
async fn run_coordinator(
    mut records: mpsc::Receiver<SharedRecord>,
    analyzer: Arc<ContextAnalyzer>,
    recovery: Arc<AutoRecoveryManager>,
    events: EventBus,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut handling = JoinSet::new();
    loop {
        tokio::select! {
            received = records.recv() => {
                let Some(record) = received else { break };
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                handling.spawn(coordinate(
                    record,
                    Arc::clone(&analyzer),
                    Arc::clone(&recovery),
                    events.clone(),
                    permit,
                ));
            }
            Some(finished) = handling.join_next(), if !handling.is_empty() => {
                if let Err(e) = finished {
                    warn!(error = %e, "Coordinating an error record failed");
                }
            }
        }
    }
    while handling.join_next().await.is_some() {}
    debug!("Coordinator queue closed");
}

async fn coordinate(
    record: SharedRecord,
    analyzer: Arc<ContextAnalyzer>,
    recovery: Arc<AutoRecoveryManager>,
    events: EventBus,
    _permit: OwnedSemaphorePermit,
) {
    let analysis = analyzer.analyze(&record).await;
    let recovered = if record.silent {
        None
    } else {
        recovery.recover(&record).await.map(|report| report.success)
    };

    debug!(
        error_id = %record.id,
        risk = %analysis.risk_level,
        insights = analysis.insights.len(),
        ?recovered,
        "Error handled by the intelligence pipeline"
    );
    events.publish(AppEvent::IntelligentErrorHandled {
        error_id: record.id.to_string(),
        fingerprint: record.fingerprint.to_string(),
        risk_level: Some(analysis.risk_level),
        insights: analysis.insights.len(),
        recovered,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyzerSettings, HealthSettings, PredictorSettings, RecoverySettings};
    use crate::diagnostics::{ErrorHistory, ErrorInfo, ErrorNotifier, ErrorType, Severity};
    use crate::intelligence::health::{MetricsSource, ProcessSample, SystemSample};
    use crate::diagnostics::CanonicalErrorRecord;
    use crate::intelligence::recovery::{
        ConfirmationProvider, DenyAll, RecoveryError, RecoveryStrategy,
    };
    use crate::proxy::UsageTracker;
    use async_trait::async_trait;
    use std::time::{Duration, Instant};

    /// Destructive step for API errors, so it always waits on confirmation
    struct NeedsApproval;

    #[async_trait]
    impl RecoveryStrategy for NeedsApproval {
        fn name(&self) -> &'static str {
            "needs_approval"
        }

        fn priority(&self) -> u8 {
            50
        }

        fn cooldown(&self) -> Duration {
            Duration::ZERO
        }

        fn destructive(&self) -> bool {
            true
        }

        fn applies(&self, record: &CanonicalErrorRecord) -> bool {
            record.error_type == ErrorType::Api
        }

        async fn execute(&self, _record: &CanonicalErrorRecord) -> Result<String, RecoveryError> {
            Ok("approved".to_string())
        }
    }

    /// Holds every confirmation open until its timeout
    struct Unanswered;

    #[async_trait]
    impl ConfirmationProvider for Unanswered {
        async fn confirm(&self, _strategy: &str, _message: &str, timeout: Duration) -> bool {
            tokio::time::sleep(timeout).await;
            false
        }
    }

    struct Quiet;

    impl MetricsSource for Quiet {
        fn system(&self) -> SystemSample {
            SystemSample {
                cpu_percent: 5.0,
                memory_percent: 20.0,
                total_memory_bytes: 8 * 1024 * 1024 * 1024,
            }
        }

        fn process(&self) -> Option<ProcessSample> {
            None
        }
    }

    fn pipeline(events: &EventBus) -> (IntelligencePipeline, Arc<ErrorHandler>) {
        let recovery = AutoRecoveryManager::new(
            RecoverySettings::default(),
            Vec::new(),
            Arc::new(DenyAll),
            events.clone(),
        );
        pipeline_with(events, recovery)
    }

    fn pipeline_with(
        events: &EventBus,
        recovery: AutoRecoveryManager,
    ) -> (IntelligencePipeline, Arc<ErrorHandler>) {
        let history = Arc::new(ErrorHistory::new(100));
        let errors = Arc::new(ErrorHandler::new(
            Arc::clone(&history),
            ErrorNotifier::new(events.clone(), Duration::from_secs(30)),
            events.clone(),
        ));
        let source: Arc<dyn MetricsSource> = Arc::new(Quiet);
        let health = Arc::new(HealthMonitor::new(
            HealthSettings::default(),
            Arc::clone(&source),
            Arc::clone(&history),
            events.clone(),
        ));
        let analyzer = Arc::new(ContextAnalyzer::new(
            AnalyzerSettings::default(),
            source,
            history,
            Arc::new(UsageTracker::new()),
        ));
        let predictor = Arc::new(ErrorPredictor::new(PredictorSettings::default(), events.clone()));

        let pipeline = IntelligencePipeline::new(
            Arc::clone(&errors),
            predictor,
            analyzer,
            Arc::new(recovery),
            health,
            events.clone(),
            16,
        );
        (pipeline, errors)
    }

    #[tokio::test]
    async fn test_handled_error_reaches_coordinator() {
        let events = EventBus::default();
        let mut receiver = events.subscribe();
        let (pipeline, errors) = pipeline(&events);
        pipeline.start();

        let record = errors
            .handle(ErrorInfo::new(ErrorType::Network, Severity::Error, "ECONNREFUSED"))
            .unwrap();

        let handled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(AppEvent::IntelligentErrorHandled {
                    error_id,
                    recovered,
                    ..
                }) = receiver.recv().await
                {
                    return (error_id, recovered);
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(handled.0, record.id.to_string());
        assert_eq!(handled.1, None);
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_pending_confirmation_does_not_block_other_errors() {
        let events = EventBus::default();
        let mut receiver = events.subscribe();
        let recovery = AutoRecoveryManager::new(
            RecoverySettings {
                confirmation_timeout_secs: 30,
                ..Default::default()
            },
            vec![Arc::new(NeedsApproval)],
            Arc::new(Unanswered),
            events.clone(),
        );
        let (pipeline, errors) = pipeline_with(&events, recovery);
        pipeline.start();

        errors
            .handle(ErrorInfo::new(ErrorType::Api, Severity::Error, "HTTP 401 from upstream"))
            .unwrap();
        let unrelated = errors
            .handle(ErrorInfo::new(ErrorType::Validation, Severity::Warning, "Invalid request body"))
            .unwrap();

        let started = Instant::now();
        let handled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match receiver.recv().await {
                    Ok(AppEvent::IntelligentErrorHandled { error_id, .. })
                        if error_id == unrelated.id.to_string() =>
                    {
                        return error_id;
                    }
                    _ => continue,
                }
            }
        })
        .await;

        assert!(handled.is_ok(), "unrelated error waited on the pending confirmation");
        assert!(started.elapsed() < Duration::from_secs(5));
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_concurrency_is_at_least_one() {
        let events = EventBus::default();
        let (pipeline, _errors) = pipeline(&events);
        assert_eq!(pipeline.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(pipeline.with_concurrency(0).concurrency, 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let events = EventBus::default();
        let (pipeline, _errors) = pipeline(&events);

        pipeline.start();
        pipeline.start();
        assert!(pipeline.is_running());

        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
    }
}
