//! Normalizes raw failures and fans them out to sinks and the pipeline

use crate::diagnostics::history::ErrorHistory;
use crate::diagnostics::logger::ErrorLogger;
use crate::diagnostics::notifier::ErrorNotifier;
use crate::diagnostics::record::{
    CanonicalErrorRecord, ErrorInfo, ErrorType, SuggestedAction,
};
use crate::events::{AppEvent, EventBus};
use chrono::Utc;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Shared record handle passed to pipeline subscribers
pub type SharedRecord = Arc<CanonicalErrorRecord>;

struct Subscriber {
    name: &'static str,
    sender: mpsc::Sender<SharedRecord>,
}

/// Counters describing what the handler has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub handled: u64,
    pub dropped_for_subscribers: u64,
    pub handler_failures: u64,
}

pub struct ErrorHandler {
    loggers: Vec<Arc<dyn ErrorLogger>>,
    notifier: ErrorNotifier,
    history: Arc<ErrorHistory>,
    events: EventBus,
    subscribers: Mutex<Vec<Subscriber>>,
    handled: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
}

impl ErrorHandler {
    pub fn new(history: Arc<ErrorHistory>, notifier: ErrorNotifier, events: EventBus) -> Self {
        Self {
            loggers: Vec::new(),
            notifier,
            history,
            events,
            subscribers: Mutex::new(Vec::new()),
            handled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn ErrorLogger>) -> Self {
        self.loggers.push(logger);
        self
    }

    /// Register a pipeline subscriber fed through a bounded queue
    pub fn subscribe(&self, name: &'static str, capacity: usize) -> mpsc::Receiver<SharedRecord> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().push(Subscriber { name, sender });
        receiver
    }

    pub fn history(&self) -> &Arc<ErrorHistory> {
        &self.history
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            handled: self.handled.load(Ordering::Relaxed),
            dropped_for_subscribers: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Handle a failure; never panics and never returns an error.
    ///
    /// Returns the canonical record, or `None` when handling itself failed.
    pub fn handle(&self, info: ErrorInfo) -> Option<SharedRecord> {
        match catch_unwind(AssertUnwindSafe(|| self.handle_inner(info))) {
            Ok(record) => Some(record),
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!("Error handler failed while processing an error record");
                None
            }
        }
    }

    /// Handle on a blocking worker so the caller never waits on sinks
    pub fn report(self: &Arc<Self>, info: ErrorInfo) {
        let handler = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            handler.handle(info);
        });
    }

    fn handle_inner(&self, info: ErrorInfo) -> SharedRecord {
        let mut record = CanonicalErrorRecord::from_info(info, Utc::now());
        enrich(&mut record);
        let record = Arc::new(record);

        for logger in &self.loggers {
            if let Err(e) = logger.log(&record) {
                warn!(sink = logger.name(), error = %e, "Error logger failed");
            }
        }

        self.notifier.notify(&record);
        self.history.push(Arc::clone(&record));
        self.events.publish(AppEvent::Error {
            record: Box::new(record.as_ref().clone()),
        });
        self.fan_out(&record);
        self.handled.fetch_add(1, Ordering::Relaxed);

        record
    }

    fn fan_out(&self, record: &SharedRecord) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in subscribers.iter() {
            match subscriber.sender.try_send(Arc::clone(record)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = subscriber.name,
                        fingerprint = %record.fingerprint,
                        "Pipeline queue full, dropping error record"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = subscriber.name, "Pipeline subscriber closed");
                }
            }
        }
    }
}

/// Type-specific remediation text and UI actions
pub fn enrichment_for(error_type: ErrorType) -> (&'static str, Vec<SuggestedAction>) {
    match error_type {
        ErrorType::Network => (
            "Check your network connection and that the target API is reachable.",
            vec![
                SuggestedAction::new("Retry", "retry"),
                SuggestedAction::new("Network settings", "open-network-settings"),
            ],
        ),
        ErrorType::Config => (
            "Review the proxy configuration; a value is missing or malformed.",
            vec![
                SuggestedAction::new("Open settings", "open-settings"),
                SuggestedAction::new("Reset to defaults", "reset-config"),
            ],
        ),
        ErrorType::Validation => (
            "The request was rejected as invalid; check the payload and parameters.",
            vec![SuggestedAction::new("View details", "view-details")],
        ),
        ErrorType::System => (
            "System resources are constrained; close other applications or restart.",
            vec![
                SuggestedAction::new("Restart proxy", "restart-proxy"),
                SuggestedAction::new("View health", "open-health"),
            ],
        ),
        ErrorType::Permission => (
            "Permission denied; check file and network permissions.",
            vec![SuggestedAction::new("Open settings", "open-settings")],
        ),
        ErrorType::Api => (
            "The API rejected the call; verify the API key, quota and model name.",
            vec![
                SuggestedAction::new("Update API key", "update-api-key"),
                SuggestedAction::new("Retry", "retry"),
            ],
        ),
        ErrorType::File => (
            "A file could not be read or written; check the path and disk space.",
            vec![SuggestedAction::new("Open folder", "open-folder")],
        ),
        ErrorType::Process => (
            "A helper process exited unexpectedly; it may need to be restarted.",
            vec![SuggestedAction::new("Restart process", "restart-process")],
        ),
        ErrorType::Unknown => (
            "An unexpected error occurred; check the logs for details.",
            vec![SuggestedAction::new("View logs", "open-logs")],
        ),
    }
}

fn enrich(record: &mut CanonicalErrorRecord) {
    let (suggestion, actions) = enrichment_for(record.error_type);
    if record.suggestion.is_none() {
        record.suggestion = Some(suggestion.to_string());
    }
    record.actions = actions;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::logger::LoggerError;
    use crate::diagnostics::record::Severity;
    use std::time::Duration;

    struct PanickingLogger;

    impl ErrorLogger for PanickingLogger {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn log(&self, _record: &CanonicalErrorRecord) -> Result<(), LoggerError> {
            panic!("sink exploded");
        }
    }

    struct FailingLogger;

    impl ErrorLogger for FailingLogger {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn log(&self, _record: &CanonicalErrorRecord) -> Result<(), LoggerError> {
            Err(LoggerError::Io(std::io::Error::other("disk full")))
        }
    }

    fn handler_with(capacity: usize) -> (ErrorHandler, EventBus) {
        let events = EventBus::default();
        let notifier = ErrorNotifier::new(events.clone(), Duration::from_secs(30));
        let handler = ErrorHandler::new(Arc::new(ErrorHistory::new(capacity)), notifier, events.clone());
        (handler, events)
    }

    #[tokio::test]
    async fn test_handle_enriches_records_and_feeds_subscribers() {
        let (handler, events) = handler_with(10);
        let mut rx = handler.subscribe("test", 4);
        let mut event_rx = events.subscribe();

        let record = handler
            .handle(ErrorInfo::new(ErrorType::Network, Severity::Error, "connect ECONNREFUSED"))
            .unwrap();

        assert!(record.suggestion.as_deref().unwrap().contains("network"));
        assert!(!record.actions.is_empty());
        assert_eq!(handler.history().len(), 1);
        assert_eq!(rx.recv().await.unwrap().id, record.id);

        let mut names = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"error"));
        assert!(names.contains(&"error-notification"));
    }

    #[test]
    fn test_explicit_suggestion_is_kept() {
        let (handler, _) = handler_with(10);
        let record = handler
            .handle(
                ErrorInfo::new(ErrorType::Api, Severity::Warning, "rate limited")
                    .with_suggestion("Wait a minute"),
            )
            .unwrap();
        assert_eq!(record.suggestion.as_deref(), Some("Wait a minute"));
    }

    #[test]
    fn test_full_subscriber_queue_drops_without_blocking() {
        let (handler, _) = handler_with(10);
        let _rx = handler.subscribe("slow", 1);

        handler.handle(ErrorInfo::new(ErrorType::System, Severity::Error, "one"));
        handler.handle(ErrorInfo::new(ErrorType::System, Severity::Error, "two"));

        assert_eq!(handler.stats().handled, 2);
        assert_eq!(handler.stats().dropped_for_subscribers, 1);
    }

    #[test]
    fn test_failing_sinks_never_propagate() {
        let (handler, _) = handler_with(10);
        let handler = handler.with_logger(Arc::new(FailingLogger));
        assert!(handler
            .handle(ErrorInfo::new(ErrorType::File, Severity::Error, "write failed"))
            .is_some());

        let (handler, _) = handler_with(10);
        let handler = handler.with_logger(Arc::new(PanickingLogger));
        assert!(handler
            .handle(ErrorInfo::new(ErrorType::File, Severity::Error, "write failed"))
            .is_none());
        assert_eq!(handler.stats().handler_failures, 1);
    }

    #[test]
    fn test_every_type_has_enrichment() {
        for error_type in ErrorType::ALL {
            let (suggestion, actions) = enrichment_for(error_type);
            assert!(!suggestion.is_empty());
            assert!(!actions.is_empty());
        }
    }
}
