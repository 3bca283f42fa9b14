//! Continuous health scoring
//!
//! Independent timers poll five metric groups. Each poll produces a
//! [`ComponentReport`]; the overall status is the worst component status.
//! The overall status is published on a `watch` channel so the proxy can
//! read it without locking, and transitions are announced on the event bus.

use crate::config::{HealthSettings, HealthThresholds};
use crate::diagnostics::{ErrorHandler, ErrorHistory};
use crate::events::{AppEvent, EventBus};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Ordered from best to worst
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    #[display("healthy")]
    Healthy,
    #[display("unknown")]
    Unknown,
    #[display("warning")]
    Warning,
    #[display("critical")]
    Critical,
}

impl HealthStatus {
    /// Grade `value` against ascending warning/critical thresholds
    pub fn grade(value: f64, warning: f64, critical: f64) -> Self {
        if value >= critical {
            Self::Critical
        } else if value >= warning {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum MetricGroup {
    #[display("system")]
    System,
    #[display("network")]
    Network,
    #[display("application")]
    Application,
    #[display("process")]
    Process,
    #[display("error_rate")]
    ErrorRate,
}

impl MetricGroup {
    pub const ALL: [MetricGroup; 5] = [
        MetricGroup::System,
        MetricGroup::Network,
        MetricGroup::Application,
        MetricGroup::Process,
        MetricGroup::ErrorRate,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReport {
    pub component: MetricGroup,
    pub status: HealthStatus,
    pub detail: String,
    pub metrics: BTreeMap<String, f64>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentReport {
    pub fn new(component: MetricGroup, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            component,
            status,
            detail: detail.into(),
            metrics: BTreeMap::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// Every component's latest report at one point in time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub overall: HealthStatus,
    pub components: Vec<ComponentReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub total_memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub uptime_secs: u64,
}

/// Host and process measurements
pub trait MetricsSource: Send + Sync {
    fn system(&self) -> SystemSample;
    /// `None` when the current process cannot be inspected
    fn process(&self) -> Option<ProcessSample>;
}

/// [`MetricsSource`] backed by `sysinfo`
pub struct SysinfoSource {
    system: Mutex<System>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn system(&self) -> SystemSample {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total > 0 {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };
        SystemSample {
            cpu_percent: system.global_cpu_usage(),
            memory_percent,
            total_memory_bytes: total,
        }
    }

    fn process(&self) -> Option<ProcessSample> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = system.process(pid)?;
        Some(ProcessSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
            uptime_secs: process.run_time(),
        })
    }
}

/// Named application-level check polled with the application group
#[async_trait]
pub trait ApplicationCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> (HealthStatus, String);
}

/// Flags an error pipeline that is failing or shedding records
pub struct ErrorPipelineCheck {
    errors: Arc<ErrorHandler>,
    last: Mutex<(u64, u64)>,
}

impl ErrorPipelineCheck {
    pub fn new(errors: Arc<ErrorHandler>) -> Self {
        Self {
            errors,
            last: Mutex::new((0, 0)),
        }
    }
}

#[async_trait]
impl ApplicationCheck for ErrorPipelineCheck {
    fn name(&self) -> &str {
        "error-pipeline"
    }

    async fn check(&self) -> (HealthStatus, String) {
        let stats = self.errors.stats();
        let mut last = self.last.lock();
        let failures = stats.handler_failures.saturating_sub(last.0);
        let dropped = stats.dropped_for_subscribers.saturating_sub(last.1);
        *last = (stats.handler_failures, stats.dropped_for_subscribers);

        if failures > 0 {
            (
                HealthStatus::Critical,
                format!("{failures} error records failed to process"),
            )
        } else if dropped > 0 {
            (
                HealthStatus::Warning,
                format!("{dropped} error records dropped by full queues"),
            )
        } else {
            (HealthStatus::Healthy, format!("{} records handled", stats.handled))
        }
    }
}

struct MonitorState {
    components: BTreeMap<MetricGroup, ComponentReport>,
    snapshots: VecDeque<HealthSnapshot>,
}

struct MonitorInner {
    settings: HealthSettings,
    source: Arc<dyn MetricsSource>,
    checks: Mutex<Vec<Arc<dyn ApplicationCheck>>>,
    errors: Arc<ErrorHistory>,
    events: EventBus,
    http: reqwest::Client,
    state: Mutex<MonitorState>,
    status: watch::Sender<HealthStatus>,
}

pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        settings: HealthSettings,
        source: Arc<dyn MetricsSource>,
        errors: Arc<ErrorHistory>,
        events: EventBus,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.network_timeout_ms.max(1)))
            .build()
            .unwrap_or_default();
        let (status, _) = watch::channel(HealthStatus::Healthy);

        Self {
            inner: Arc::new(MonitorInner {
                settings,
                source,
                checks: Mutex::new(Vec::new()),
                errors,
                events,
                http,
                state: Mutex::new(MonitorState {
                    components: BTreeMap::new(),
                    snapshots: VecDeque::new(),
                }),
                status,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_check(&self, check: Arc<dyn ApplicationCheck>) {
        self.inner.checks.lock().push(check);
    }

    /// Receiver that always holds the current overall status
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> HealthStatus {
        *self.inner.status.borrow()
    }

    pub fn current(&self) -> HealthSnapshot {
        let state = self.inner.state.lock();
        HealthSnapshot {
            timestamp: Utc::now(),
            overall: self.status(),
            components: state.components.values().cloned().collect(),
        }
    }

    /// Snapshots, oldest first
    pub fn history(&self) -> Vec<HealthSnapshot> {
        self.inner.state.lock().snapshots.iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Spawn one timer per metric group; a second call is a no-op
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for group in MetricGroup::ALL {
            let inner = Arc::clone(&self.inner);
            let period = inner.interval(group);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let report = inner.poll(group).await;
                    inner.apply(report);
                }
            }));
        }
        info!(groups = MetricGroup::ALL.len(), "Health monitor started");
    }

    pub fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        info!("Health monitor stopped");
    }

    /// Poll every group now and return the resulting snapshot
    pub async fn force_check(&self) -> HealthSnapshot {
        debug!("Forced health check");
        for group in MetricGroup::ALL {
            let report = self.inner.poll(group).await;
            self.inner.apply(report);
        }
        self.current()
    }

    /// Record an externally produced report as if a timer had polled it
    pub fn record(&self, report: ComponentReport) -> HealthStatus {
        self.inner.apply(report)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl MonitorInner {
    fn interval(&self, group: MetricGroup) -> Duration {
        let secs = match group {
            MetricGroup::System => self.settings.system_interval_secs,
            MetricGroup::Network => self.settings.network_interval_secs,
            MetricGroup::Application => self.settings.application_interval_secs,
            MetricGroup::Process => self.settings.process_interval_secs,
            MetricGroup::ErrorRate => self.settings.error_rate_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    async fn poll(&self, group: MetricGroup) -> ComponentReport {
        let thresholds = &self.settings.thresholds;
        match group {
            MetricGroup::System => {
                let source = Arc::clone(&self.source);
                match tokio::task::spawn_blocking(move || source.system()).await {
                    Ok(sample) => system_report(&sample, thresholds),
                    Err(e) => ComponentReport::new(group, HealthStatus::Unknown, e.to_string()),
                }
            }
            MetricGroup::Process => {
                let source = Arc::clone(&self.source);
                match tokio::task::spawn_blocking(move || source.process()).await {
                    Ok(Some(sample)) => process_report(&sample, thresholds),
                    Ok(None) => ComponentReport::new(
                        group,
                        HealthStatus::Unknown,
                        "current process not visible",
                    ),
                    Err(e) => ComponentReport::new(group, HealthStatus::Unknown, e.to_string()),
                }
            }
            MetricGroup::Network => self.network_report().await,
            MetricGroup::Application => self.application_report().await,
            MetricGroup::ErrorRate => {
                let window = self.settings.error_rate_window_secs.max(60);
                let count = self.errors.count_since(
                    Utc::now(),
                    ChronoDuration::seconds(i64::try_from(window).unwrap_or(i64::MAX)),
                );
                error_rate_report(count, window, thresholds)
            }
        }
    }

    async fn network_report(&self) -> ComponentReport {
        let endpoints = &self.settings.network_endpoints;
        if endpoints.is_empty() {
            return ComponentReport::new(
                MetricGroup::Network,
                HealthStatus::Unknown,
                "no endpoints configured",
            );
        }

        let probes = endpoints.iter().map(|url| async move {
            let started = Instant::now();
            let reachable = self.http.head(url).send().await.is_ok();
            (reachable, started.elapsed())
        });
        let results = futures_util::future::join_all(probes).await;

        let reachable = results.iter().filter(|(ok, _)| *ok).count();
        let slowest = results
            .iter()
            .filter(|(ok, _)| *ok)
            .map(|(_, latency)| latency.as_millis())
            .max()
            .unwrap_or(0);
        let slowest = u64::try_from(slowest).unwrap_or(u64::MAX);

        let status = if reachable == 0 {
            HealthStatus::Critical
        } else if reachable < results.len()
            || slowest >= self.settings.thresholds.network_latency_warning_ms
        {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        ComponentReport::new(
            MetricGroup::Network,
            status,
            format!("{reachable}/{} endpoints reachable", results.len()),
        )
        .with_metric("reachable", reachable as f64)
        .with_metric("latency_ms", slowest as f64)
    }

    async fn application_report(&self) -> ComponentReport {
        let checks: Vec<_> = self.checks.lock().clone();
        if checks.is_empty() {
            return ComponentReport::new(MetricGroup::Application, HealthStatus::Healthy, "no checks");
        }

        let mut worst = HealthStatus::Healthy;
        let mut details = Vec::with_capacity(checks.len());
        for check in &checks {
            let (status, detail) = check.check().await;
            worst = worst.max(status);
            details.push(format!("{}: {detail}", check.name()));
        }
        ComponentReport::new(MetricGroup::Application, worst, details.join("; "))
    }

    /// Store a report and recompute the overall status in one step
    fn apply(&self, report: ComponentReport) -> HealthStatus {
        let (previous, overall, components) = {
            let mut state = self.state.lock();
            state.components.insert(report.component, report);
            let overall = state
                .components
                .values()
                .map(|r| r.status)
                .max()
                .unwrap_or_default();
            let components: Vec<_> = state.components.values().cloned().collect();

            state.snapshots.push_back(HealthSnapshot {
                timestamp: Utc::now(),
                overall,
                components: components.clone(),
            });
            while state.snapshots.len() > self.settings.history_capacity.max(1) {
                state.snapshots.pop_front();
            }

            let previous = *self.status.borrow();
            if previous != overall {
                self.status.send_replace(overall);
            }
            (previous, overall, components)
        };

        if previous != overall {
            info!(%previous, current = %overall, "Health status changed");
            self.events.publish(AppEvent::HealthStatusChanged {
                previous,
                current: overall,
            });
        }
        if overall >= self.settings.alert_threshold {
            warn!(status = %overall, "Health alert");
            self.events.publish(AppEvent::HealthAlert {
                status: overall,
                components: components
                    .into_iter()
                    .filter(|c| c.status >= self.settings.alert_threshold)
                    .collect(),
            });
        }
        overall
    }
}

fn system_report(sample: &SystemSample, t: &HealthThresholds) -> ComponentReport {
    let cpu = HealthStatus::grade(
        f64::from(sample.cpu_percent),
        f64::from(t.cpu_warning_percent),
        f64::from(t.cpu_critical_percent),
    );
    let memory = HealthStatus::grade(
        f64::from(sample.memory_percent),
        f64::from(t.memory_warning_percent),
        f64::from(t.memory_critical_percent),
    );
    ComponentReport::new(
        MetricGroup::System,
        cpu.max(memory),
        format!(
            "cpu {:.0}%, memory {:.0}%",
            sample.cpu_percent, sample.memory_percent
        ),
    )
    .with_metric("cpu_percent", f64::from(sample.cpu_percent))
    .with_metric("memory_percent", f64::from(sample.memory_percent))
}

fn process_report(sample: &ProcessSample, t: &HealthThresholds) -> ComponentReport {
    let memory_mb = sample.memory_bytes / (1024 * 1024);
    let status = HealthStatus::grade(
        memory_mb as f64,
        t.process_memory_warning_mb as f64,
        t.process_memory_critical_mb as f64,
    );
    ComponentReport::new(
        MetricGroup::Process,
        status,
        format!("rss {memory_mb} MiB, up {}s", sample.uptime_secs),
    )
    .with_metric("memory_mb", memory_mb as f64)
    .with_metric("cpu_percent", f64::from(sample.cpu_percent))
}

fn error_rate_report(count: usize, window_secs: u64, t: &HealthThresholds) -> ComponentReport {
    let per_minute = count as f64 / (window_secs as f64 / 60.0);
    ComponentReport::new(
        MetricGroup::ErrorRate,
        HealthStatus::grade(
            per_minute,
            t.error_rate_warning_per_min,
            t.error_rate_critical_per_min,
        ),
        format!("{count} errors in {window_secs}s"),
    )
    .with_metric("errors_per_minute", per_minute)
}
