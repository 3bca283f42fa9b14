//! Failure-pattern prediction over sliding time windows
//!
//! Every record is matched against a table of named patterns. A pattern
//! whose occurrences reach its threshold inside its window yields a
//! [`Prediction`] when the combined confidence clears the configured bar.
//! Predictions are deduplicated per pattern. A separate trend check buckets
//! recent errors per minute and flags rising, accelerating error rates.

use crate::config::PredictorSettings;
use crate::diagnostics::{CanonicalErrorRecord, ErrorType, Severity};
use crate::events::{AppEvent, EventBus};
use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use nutype::nutype;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

const COUNT_WEIGHT: f64 = 0.4;
const DECAY_WEIGHT: f64 = 0.3;
const SEVERITY_WEIGHT: f64 = 0.3;

/// Confidence at which a prediction is escalated to critical
const CRITICAL_CONFIDENCE: f64 = 0.85;

pub const TREND_PATTERN: &str = "error_trend";

#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, AsRef)
)]
pub struct PatternName(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum PredictionRisk {
    #[display("warning")]
    Warning,
    #[display("critical")]
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub pattern: PatternName,
    pub confidence: f64,
    pub risk: PredictionRisk,
    pub forecast: String,
    pub recommended_actions: Vec<String>,
    pub occurrences: usize,
    pub window_secs: i64,
    pub predicted_at: DateTime<Utc>,
}

/// A named failure signature
#[derive(Debug, Clone)]
pub struct FailurePattern {
    pub name: PatternName,
    pub error_type: ErrorType,
    /// Lowercase substrings looked up in the record's searchable text
    pub indicators: Vec<String>,
    pub threshold: usize,
    pub window: Duration,
    pub forecast: String,
    pub recommended_actions: Vec<String>,
}

impl FailurePattern {
    fn new(
        name: &str,
        error_type: ErrorType,
        indicators: &[&str],
        threshold: usize,
        window_minutes: i64,
        forecast: &str,
        recommended_actions: &[&str],
    ) -> Option<Self> {
        Some(Self {
            name: PatternName::try_new(name.to_string()).ok()?,
            error_type,
            indicators: indicators.iter().map(|s| s.to_lowercase()).collect(),
            threshold: threshold.max(1),
            window: Duration::minutes(window_minutes),
            forecast: forecast.to_string(),
            recommended_actions: recommended_actions.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn matches(&self, record: &CanonicalErrorRecord) -> bool {
        if record.error_type != self.error_type {
            return false;
        }
        let text = record.searchable_text();
        self.indicators.iter().any(|i| text.contains(i.as_str()))
    }
}

/// The five built-in failure patterns
pub fn builtin_patterns() -> Vec<FailurePattern> {
    [
        FailurePattern::new(
            "network_instability",
            ErrorType::Network,
            &["econnrefused", "etimedout", "econnreset", "enotfound", "timeout", "connection", "network"],
            3,
            5,
            "Upstream connectivity is degrading; further requests are likely to fail.",
            &["Check the network connection", "Verify the outbound proxy settings", "Switch to a backup service"],
        ),
        FailurePattern::new(
            "api_rate_limiting",
            ErrorType::Api,
            &["429", "rate limit", "too many requests", "quota"],
            3,
            2,
            "The backend is throttling requests; a hard rate-limit block is imminent.",
            &["Reduce request frequency", "Honour Retry-After", "Upgrade the API plan"],
        ),
        FailurePattern::new(
            "config_corruption",
            ErrorType::Config,
            &["invalid", "missing", "malformed", "parse", "corrupt"],
            2,
            10,
            "The proxy configuration appears damaged and will keep failing until repaired.",
            &["Validate the configuration", "Restore default settings"],
        ),
        FailurePattern::new(
            "resource_exhaustion",
            ErrorType::System,
            &["memory", "enomem", "emfile", "disk", "overloaded", "too many requests in flight"],
            3,
            5,
            "Host resources are running out; the proxy may stop accepting requests.",
            &["Close unused applications", "Lower maxInFlight", "Restart the proxy"],
        ),
        FailurePattern::new(
            "process_instability",
            ErrorType::Process,
            &["exited", "crash", "killed", "spawn", "sigterm", "sigkill"],
            3,
            10,
            "A helper process keeps dying; a restart loop is likely.",
            &["Restart the process", "Inspect the process logs"],
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[derive(Debug, Clone, Default)]
struct PatternState {
    occurrences: VecDeque<(DateTime<Utc>, Severity)>,
    last_prediction: Option<DateTime<Utc>>,
    confidence: f64,
}

impl PatternState {
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.occurrences.front().is_some_and(|(at, _)| *at < cutoff) {
            self.occurrences.pop_front();
        }
    }

    fn deduplicated(&self, now: DateTime<Utc>, dedup: Duration) -> bool {
        self.last_prediction.is_some_and(|at| now - at < dedup)
    }
}

struct PredictorState {
    patterns: HashMap<PatternName, PatternState>,
    recent: VecDeque<DateTime<Utc>>,
    trend: PatternState,
}

pub struct ErrorPredictor {
    settings: PredictorSettings,
    patterns: Vec<FailurePattern>,
    state: Mutex<PredictorState>,
    events: EventBus,
}

impl ErrorPredictor {
    pub fn new(settings: PredictorSettings, events: EventBus) -> Self {
        Self::with_patterns(settings, events, builtin_patterns())
    }

    pub fn with_patterns(
        settings: PredictorSettings,
        events: EventBus,
        patterns: Vec<FailurePattern>,
    ) -> Self {
        Self {
            settings,
            patterns,
            state: Mutex::new(PredictorState {
                patterns: HashMap::new(),
                recent: VecDeque::new(),
                trend: PatternState::default(),
            }),
            events,
        }
    }

    pub fn patterns(&self) -> &[FailurePattern] {
        &self.patterns
    }

    /// Occurrences currently inside the pattern's window
    pub fn occurrences(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .patterns
            .iter()
            .find(|(name, _)| name.as_ref() == pattern)
            .map_or(0, |(_, s)| s.occurrences.len())
    }

    pub fn confidence(&self, pattern: &str) -> f64 {
        self.state
            .lock()
            .patterns
            .iter()
            .find(|(name, _)| name.as_ref() == pattern)
            .map_or(0.0, |(_, s)| s.confidence)
    }

    /// Record one error and return the predictions it triggered.
    ///
    /// The record's timestamp is the clock; all state for one record is
    /// updated under a single lock.
    pub fn observe(&self, record: &CanonicalErrorRecord) -> Vec<Prediction> {
        let now = record.timestamp;
        let dedup = Duration::seconds(i64::try_from(self.settings.dedup_secs).unwrap_or(i64::MAX));
        let mut predictions = Vec::new();

        {
            let mut state = self.state.lock();
            for pattern in self.patterns.iter().filter(|p| p.matches(record)) {
                let entry = state.patterns.entry(pattern.name.clone()).or_default();
                entry.occurrences.push_back((now, record.severity));
                entry.prune(now, pattern.window);

                let count = entry.occurrences.len();
                if count < pattern.threshold {
                    debug!(pattern = %pattern.name, count, "Pattern below threshold");
                    continue;
                }
                let confidence = confidence(entry, pattern, now);
                entry.confidence = confidence;
                if confidence < self.settings.min_confidence || entry.deduplicated(now, dedup) {
                    continue;
                }
                entry.last_prediction = Some(now);

                let any_critical = entry
                    .occurrences
                    .iter()
                    .any(|(_, severity)| *severity == Severity::Critical);
                predictions.push(Prediction {
                    pattern: pattern.name.clone(),
                    confidence,
                    risk: if confidence >= CRITICAL_CONFIDENCE || any_critical {
                        PredictionRisk::Critical
                    } else {
                        PredictionRisk::Warning
                    },
                    forecast: pattern.forecast.clone(),
                    recommended_actions: pattern.recommended_actions.clone(),
                    occurrences: count,
                    window_secs: pattern.window.num_seconds(),
                    predicted_at: now,
                });
            }

            if let Some(prediction) = self.trend(&mut state, now, dedup) {
                predictions.push(prediction);
            }
        }

        for prediction in &predictions {
            info!(
                pattern = %prediction.pattern,
                confidence = prediction.confidence,
                risk = %prediction.risk,
                "Failure predicted"
            );
            self.events.publish(AppEvent::Prediction {
                prediction: prediction.clone(),
            });
        }
        predictions
    }

    fn trend(
        &self,
        state: &mut PredictorState,
        now: DateTime<Utc>,
        dedup: Duration,
    ) -> Option<Prediction> {
        let minutes = self.settings.trend_window_minutes.max(2);
        let window = Duration::minutes(i64::try_from(minutes).unwrap_or(i64::MAX));

        state.recent.push_back(now);
        let cutoff = now - window;
        while state.recent.front().is_some_and(|at| *at <= cutoff) {
            state.recent.pop_front();
        }
        if state.recent.len() < self.settings.trend_min_errors {
            return None;
        }

        // oldest bucket first
        let mut buckets = vec![0usize; minutes];
        for at in &state.recent {
            let age = usize::try_from((now - *at).num_minutes()).unwrap_or(0);
            if let Some(slot) = minutes.checked_sub(age + 1) {
                buckets[slot] += 1;
            }
        }
        if !is_accelerating(&buckets) || state.trend.deduplicated(now, dedup) {
            return None;
        }
        state.trend.last_prediction = Some(now);

        let pattern = PatternName::try_new(TREND_PATTERN.to_string()).ok()?;
        Some(Prediction {
            pattern,
            confidence: self.settings.min_confidence,
            risk: PredictionRisk::Warning,
            forecast: "Error frequency is rising and accelerating.".to_string(),
            recommended_actions: vec![
                "Review recent errors".to_string(),
                "Check backend status pages".to_string(),
            ],
            occurrences: state.recent.len(),
            window_secs: window.num_seconds(),
            predicted_at: now,
        })
    }
}

/// Count ratio, time decay over half the window, and average severity
fn confidence(state: &PatternState, pattern: &FailurePattern, now: DateTime<Utc>) -> f64 {
    let count = state.occurrences.len();
    let ratio = (count as f64 / pattern.threshold as f64).min(1.0);

    let half_life = (pattern.window.num_milliseconds() as f64 / 2.0).max(1.0);
    let decay = state
        .occurrences
        .iter()
        .map(|(at, _)| {
            let age = (now - *at).num_milliseconds().max(0) as f64;
            (-std::f64::consts::LN_2 * age / half_life).exp()
        })
        .sum::<f64>()
        / count.max(1) as f64;

    let severity = state
        .occurrences
        .iter()
        .map(|(_, s)| s.weight())
        .sum::<f64>()
        / count.max(1) as f64;

    COUNT_WEIGHT * ratio + DECAY_WEIGHT * decay + SEVERITY_WEIGHT * severity
}

/// Rising overall, and rising faster in the newer half than the older one
fn is_accelerating(buckets: &[usize]) -> bool {
    if buckets.len() < 4 {
        return false;
    }
    let mid = buckets.len() / 2;
    let overall = slope(buckets);
    let older = slope(&buckets[..mid]);
    let newer = slope(&buckets[mid..]);
    overall > 0.0 && newer > 0.0 && newer > older
}

fn slope(values: &[usize]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<usize>() as f64 / n;
    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (x, y)| {
            let dx = x as f64 - mean_x;
            (num + dx * (*y as f64 - mean_y), den + dx * dx)
        });
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorInfo;
    use rstest::rstest;

    fn record(error_type: ErrorType, message: &str, at: DateTime<Utc>) -> CanonicalErrorRecord {
        CanonicalErrorRecord::from_info(ErrorInfo::new(error_type, Severity::Error, message), at)
    }

    fn predictor() -> (ErrorPredictor, tokio::sync::broadcast::Receiver<AppEvent>) {
        let events = EventBus::default();
        let receiver = events.subscribe();
        (ErrorPredictor::new(PredictorSettings::default(), events), receiver)
    }

    #[test]
    fn test_threshold_then_dedup() {
        let (predictor, mut receiver) = predictor();
        let start = Utc::now();
        let at = |secs| start + Duration::seconds(secs);

        assert!(predictor.observe(&record(ErrorType::Network, "ECONNREFUSED", at(0))).is_empty());
        assert!(predictor.observe(&record(ErrorType::Network, "ECONNREFUSED", at(10))).is_empty());

        let third = predictor.observe(&record(ErrorType::Network, "ECONNREFUSED", at(20)));
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].pattern.as_ref(), "network_instability");
        assert_eq!(third[0].occurrences, 3);
        assert!(third[0].confidence >= 0.6);

        let fourth = predictor.observe(&record(ErrorType::Network, "ECONNREFUSED", at(30)));
        assert!(fourth.is_empty());

        let published = std::iter::from_fn(|| receiver.try_recv().ok())
            .filter(|e| matches!(e, AppEvent::Prediction { .. }))
            .count();
        assert_eq!(published, 1);
    }

    #[test]
    fn test_dedup_expires_after_five_minutes() {
        let (predictor, _rx) = predictor();
        let start = Utc::now();
        for secs in [0, 10, 20] {
            predictor.observe(&record(
                ErrorType::Api,
                "HTTP 429 too many requests",
                start + Duration::seconds(secs),
            ));
        }
        // the earlier occurrences have left the two-minute window by now
        let later = start + Duration::seconds(20 + 301);
        for offset in [0, 1] {
            assert!(predictor
                .observe(&record(ErrorType::Api, "rate limit", later + Duration::seconds(offset)))
                .is_empty());
        }
        let again = predictor.observe(&record(
            ErrorType::Api,
            "rate limit",
            later + Duration::seconds(2),
        ));
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_occurrences_outside_window_are_pruned() {
        let (predictor, _rx) = predictor();
        let start = Utc::now();

        predictor.observe(&record(ErrorType::Network, "timeout", start));
        predictor.observe(&record(ErrorType::Network, "timeout", start + Duration::minutes(1)));
        let late = predictor.observe(&record(
            ErrorType::Network,
            "timeout",
            start + Duration::minutes(7),
        ));

        assert!(late.is_empty());
        assert_eq!(predictor.occurrences("network_instability"), 1);
    }

    #[rstest]
    #[case(ErrorType::Network, "ECONNRESET by peer", Some("network_instability"))]
    #[case(ErrorType::Api, "HTTP 429", Some("api_rate_limiting"))]
    #[case(ErrorType::Config, "missing required field", Some("config_corruption"))]
    #[case(ErrorType::System, "out of memory", Some("resource_exhaustion"))]
    #[case(ErrorType::Process, "helper exited with code 1", Some("process_instability"))]
    #[case(ErrorType::Api, "ECONNRESET by peer", None)]
    #[case(ErrorType::Validation, "invalid body", None)]
    fn test_pattern_matching(
        #[case] error_type: ErrorType,
        #[case] message: &str,
        #[case] expected: Option<&str>,
    ) {
        let record = record(error_type, message, Utc::now());
        let matched: Vec<_> = builtin_patterns()
            .into_iter()
            .filter(|p| p.matches(&record))
            .map(|p| p.name.into_inner())
            .collect();
        assert_eq!(matched, expected.into_iter().map(str::to_string).collect::<Vec<_>>());
    }

    #[test]
    fn test_critical_records_raise_critical_risk() {
        let (predictor, _rx) = predictor();
        let now = Utc::now();
        let critical = |secs| {
            CanonicalErrorRecord::from_info(
                ErrorInfo::new(ErrorType::Config, Severity::Critical, "config file is corrupt"),
                now + Duration::seconds(secs),
            )
        };
        predictor.observe(&critical(0));
        let predictions = predictor.observe(&critical(1));
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].risk, PredictionRisk::Critical);
    }

    #[test]
    fn test_accelerating_trend_is_flagged() {
        let (predictor, _rx) = predictor();
        let now = Utc::now();
        let mut flagged = Vec::new();
        // 1, 2 and 4 errors in the last three minutes
        for (minutes_ago, count) in [(2, 1), (1, 2), (0, 4)] {
            for i in 0..count {
                let at = now - Duration::minutes(minutes_ago) + Duration::seconds(i);
                flagged.extend(predictor.observe(&record(ErrorType::Unknown, "boom", at)));
            }
        }
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].pattern.as_ref(), TREND_PATTERN);
    }

    #[test]
    fn test_flat_rate_is_not_a_trend() {
        assert!(!is_accelerating(&[2, 2, 2, 2, 2, 2]));
        assert!(!is_accelerating(&[5, 4, 3, 2, 1, 0]));
        assert!(is_accelerating(&[0, 0, 0, 1, 2, 4]));
    }
}
