//! Strategy selection, cooldowns and attempt caps

use super::{ConfirmationProvider, RecoveryStrategy};
use crate::config::RecoverySettings;
use crate::diagnostics::{CanonicalErrorRecord, Fingerprint};
use crate::events::{AppEvent, EventBus};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Remediation attempts made for one fingerprint
#[derive(Debug, Clone, Copy)]
struct RecoveryAttempt {
    count: u32,
    last_attempt: Instant,
    in_progress: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub fingerprint: String,
    /// Last strategy that ran, whether or not it succeeded
    pub strategy: Option<String>,
    pub success: bool,
    pub attempts: u32,
    pub message: String,
}

pub struct AutoRecoveryManager {
    settings: RecoverySettings,
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    attempts: Mutex<HashMap<Fingerprint, RecoveryAttempt>>,
    last_run: Mutex<HashMap<&'static str, Instant>>,
    stats: Mutex<BTreeMap<&'static str, StrategyStats>>,
    confirmations: Arc<dyn ConfirmationProvider>,
    events: EventBus,
}

impl AutoRecoveryManager {
    pub fn new(
        settings: RecoverySettings,
        mut strategies: Vec<Arc<dyn RecoveryStrategy>>,
        confirmations: Arc<dyn ConfirmationProvider>,
        events: EventBus,
    ) -> Self {
        strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        Self {
            settings,
            strategies,
            attempts: Mutex::new(HashMap::new()),
            last_run: Mutex::new(HashMap::new()),
            stats: Mutex::new(BTreeMap::new()),
            confirmations,
            events,
        }
    }

    /// Strategy names, highest priority first
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn stats(&self) -> BTreeMap<&'static str, StrategyStats> {
        self.stats.lock().clone()
    }

    pub fn attempts_for(&self, fingerprint: &Fingerprint) -> u32 {
        self.attempts.lock().get(fingerprint).map_or(0, |a| a.count)
    }

    /// Forward a user's answer to a pending confirmation
    pub fn answer_confirmation(&self, confirmation_id: &str, approved: bool) -> bool {
        self.confirmations.answer(confirmation_id, approved)
    }

    /// Try the applicable strategies in priority order until one succeeds.
    ///
    /// Returns `None` when recovery is disabled, nothing applies, or another
    /// recovery for the same fingerprint is already running.
    #[instrument(skip_all, fields(fingerprint = %record.fingerprint))]
    pub async fn recover(&self, record: &CanonicalErrorRecord) -> Option<RecoveryReport> {
        if !self.settings.enabled {
            return None;
        }
        let candidates: Vec<_> = self
            .strategies
            .iter()
            .filter(|s| s.applies(record))
            .cloned()
            .collect();
        if candidates.is_empty() {
            debug!("No recovery strategy applies");
            return None;
        }

        let attempts = match self.begin_attempt(&record.fingerprint) {
            Attempt::Busy => return None,
            Attempt::Exhausted(count) => {
                let report = RecoveryReport {
                    fingerprint: record.fingerprint.to_string(),
                    strategy: None,
                    success: false,
                    attempts: count,
                    message: format!("Gave up after {count} recovery attempts"),
                };
                warn!(attempts = count, "Recovery attempt limit reached");
                self.publish(&report);
                return Some(report);
            }
            Attempt::Started(count) => count,
        };
        let attempt = AttemptGuard {
            manager: self,
            fingerprint: &record.fingerprint,
        };

        let mut report = RecoveryReport {
            fingerprint: record.fingerprint.to_string(),
            strategy: None,
            success: false,
            attempts,
            message: "Every applicable strategy was skipped or failed".to_string(),
        };
        for strategy in candidates {
            if self.in_cooldown(strategy.as_ref()) {
                debug!(strategy = strategy.name(), "Strategy in cooldown");
                continue;
            }
            if strategy.destructive() && !self.confirm(strategy.as_ref(), record).await {
                info!(strategy = strategy.name(), "Destructive recovery not confirmed");
                continue;
            }
            if !self.claim_cooldown(strategy.as_ref()) {
                debug!(strategy = strategy.name(), "Strategy claimed by a concurrent recovery");
                continue;
            }

            let outcome = strategy.execute(record).await;
            self.count(strategy.name(), outcome.is_ok());
            match outcome {
                Ok(message) => {
                    info!(strategy = strategy.name(), %message, "Recovery succeeded");
                    report.strategy = Some(strategy.name().to_string());
                    report.success = true;
                    report.message = message;
                    break;
                }
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "Recovery strategy failed");
                    report.strategy = Some(strategy.name().to_string());
                    report.message = e.to_string();
                }
            }
        }

        drop(attempt);
        self.publish(&report);
        Some(report)
    }

    /// Reserve an attempt for `fingerprint` in one step, forgetting idle
    /// fingerprints whose last attempt is older than the reset window
    fn begin_attempt(&self, fingerprint: &Fingerprint) -> Attempt {
        let now = Instant::now();
        let reset_after = Duration::from_secs(self.settings.attempt_reset_secs);
        let mut attempts = self.attempts.lock();
        attempts.retain(|_, a| a.in_progress || now.duration_since(a.last_attempt) < reset_after);
        let entry = attempts.entry(fingerprint.clone()).or_insert(RecoveryAttempt {
            count: 0,
            last_attempt: now,
            in_progress: false,
        });

        if entry.in_progress {
            return Attempt::Busy;
        }
        if entry.count >= self.settings.max_attempts_per_error {
            return Attempt::Exhausted(entry.count);
        }
        entry.count += 1;
        entry.last_attempt = now;
        entry.in_progress = true;
        Attempt::Started(entry.count)
    }

    fn finish_attempt(&self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.attempts.lock().get_mut(fingerprint) {
            entry.in_progress = false;
        }
    }

    fn in_cooldown(&self, strategy: &dyn RecoveryStrategy) -> bool {
        self.last_run
            .lock()
            .get(strategy.name())
            .is_some_and(|at| at.elapsed() < strategy.cooldown())
    }

    /// Start the strategy's cooldown unless it is already running one
    fn claim_cooldown(&self, strategy: &dyn RecoveryStrategy) -> bool {
        let now = Instant::now();
        let mut last_run = self.last_run.lock();
        match last_run.get(strategy.name()) {
            Some(at) if now.duration_since(*at) < strategy.cooldown() => false,
            _ => {
                last_run.insert(strategy.name(), now);
                true
            }
        }
    }

    async fn confirm(&self, strategy: &dyn RecoveryStrategy, record: &CanonicalErrorRecord) -> bool {
        let message = format!("Run '{}' to recover from: {}", strategy.name(), record.message);
        let timeout = Duration::from_secs(self.settings.confirmation_timeout_secs);
        self.confirmations
            .confirm(strategy.name(), &message, timeout)
            .await
    }

    fn count(&self, strategy: &'static str, success: bool) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(strategy).or_default();
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }

    fn publish(&self, report: &RecoveryReport) {
        self.events.publish(AppEvent::RecoveryCompleted {
            fingerprint: report.fingerprint.clone(),
            strategy: report.strategy.clone(),
            success: report.success,
            attempts: report.attempts,
            message: report.message.clone(),
        });
    }
}

enum Attempt {
    Started(u32),
    Exhausted(u32),
    Busy,
}

/// Clears `in_progress` even when the recovery future is dropped mid-flight
struct AttemptGuard<'a> {
    manager: &'a AutoRecoveryManager,
    fingerprint: &'a Fingerprint,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.manager.finish_attempt(self.fingerprint);
    }
}
