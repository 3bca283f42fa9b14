//! Surfaces error records to the UI collaborator as events

use crate::diagnostics::record::{CanonicalErrorRecord, ErrorType, Severity};
use crate::events::{AppEvent, EventBus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Publishes user-facing notifications, suppressing duplicates
pub struct ErrorNotifier {
    events: EventBus,
    dedup_window: ChronoDuration,
    last_sent: Mutex<HashMap<(ErrorType, String), DateTime<Utc>>>,
}

impl ErrorNotifier {
    pub fn new(events: EventBus, dedup_window: std::time::Duration) -> Self {
        Self {
            events,
            dedup_window: ChronoDuration::from_std(dedup_window)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether a notification was published
    pub fn notify(&self, record: &CanonicalErrorRecord) -> bool {
        if record.silent || record.severity == Severity::Info {
            return false;
        }

        let key = (record.error_type, record.message.clone());
        {
            let mut last_sent = self.last_sent.lock();
            let cutoff = record.timestamp - self.dedup_window;
            last_sent.retain(|_, sent_at| *sent_at > cutoff);
            if last_sent.contains_key(&key) {
                debug!(fingerprint = %record.fingerprint, "Suppressed duplicate notification");
                return false;
            }
            last_sent.insert(key, record.timestamp);
        }

        self.events.publish(AppEvent::ErrorNotification {
            error_id: record.id.to_string(),
            severity: record.severity,
            message: record.message.clone(),
            suggestion: record.suggestion.clone(),
            actions: record.actions.clone(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::record::ErrorInfo;
    use std::time::Duration;

    fn record(message: &str, severity: Severity, at: DateTime<Utc>) -> CanonicalErrorRecord {
        CanonicalErrorRecord::from_info(ErrorInfo::new(ErrorType::Network, severity, message), at)
    }

    #[test]
    fn test_duplicates_within_window_are_suppressed() {
        let notifier = ErrorNotifier::new(EventBus::default(), Duration::from_secs(30));
        let now = Utc::now();

        assert!(notifier.notify(&record("down", Severity::Error, now)));
        assert!(!notifier.notify(&record("down", Severity::Error, now + ChronoDuration::seconds(10))));
        assert!(notifier.notify(&record("other", Severity::Error, now)));
        assert!(notifier.notify(&record("down", Severity::Error, now + ChronoDuration::seconds(45))));
    }

    #[test]
    fn test_info_and_silent_are_not_notified() {
        let notifier = ErrorNotifier::new(EventBus::default(), Duration::from_secs(30));
        let now = Utc::now();

        assert!(!notifier.notify(&record("fyi", Severity::Info, now)));

        let mut silent = record("quiet", Severity::Critical, now);
        silent.silent = true;
        assert!(!notifier.notify(&silent));
    }

    #[tokio::test]
    async fn test_notification_event_carries_suggestion() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let notifier = ErrorNotifier::new(bus, Duration::from_secs(30));

        let mut r = record("down", Severity::Critical, Utc::now());
        r.suggestion = Some("Check your network".to_string());
        notifier.notify(&r);

        match rx.recv().await.unwrap() {
            AppEvent::ErrorNotification { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("Check your network"));
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }
}
