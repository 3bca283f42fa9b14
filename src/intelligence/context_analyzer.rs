//! Contextual risk analysis of individual errors
//!
//! Five context groups are collected per error. Each group reports the
//! patterns it recognises; a static relevance table weights the groups by
//! error type, and the result is a ranked insight list, detected anomalies
//! and a risk level. Record-independent groups are cached for a short TTL
//! and a semaphore caps concurrent analyses.

use crate::config::AnalyzerSettings;
use crate::diagnostics::{CanonicalErrorRecord, ErrorHistory, ErrorType};
use crate::intelligence::health::MetricsSource;
use crate::proxy::stats::UsageTracker;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Timelike, Utc, Weekday};
use derive_more::Display;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

static STATUS_IN_TEXT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(?:HTTP[ _]?|status )([1-5]\d\d)\b").ok());

static SOCKET_CODE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\bE[A-Z]{3,}\b").ok());

const HEAP_ANOMALY_PERCENT: f32 = 95.0;
const HIGH_MEMORY_PERCENT: f32 = 85.0;
const HIGH_CPU_PERCENT: f32 = 90.0;
const OFF_HOURS_BURST: usize = 5;
const RECURRING_ERROR: usize = 3;
const RECURRING_CRITICAL: usize = 10;
const STARTUP_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[display("low")]
    Low,
    #[display("medium")]
    Medium,
    #[display("high")]
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ContextGroup {
    #[display("environment")]
    Environment,
    #[display("temporal")]
    Temporal,
    #[display("application")]
    Application,
    #[display("user_behavior")]
    UserBehavior,
    #[display("technical")]
    Technical,
}

impl ContextGroup {
    pub const ALL: [ContextGroup; 5] = [
        ContextGroup::Environment,
        ContextGroup::Temporal,
        ContextGroup::Application,
        ContextGroup::UserBehavior,
        ContextGroup::Technical,
    ];

    /// How much this group matters for errors of `error_type`
    pub fn relevance(self, error_type: ErrorType) -> f64 {
        use ContextGroup::*;
        match (error_type, self) {
            (ErrorType::Network, Technical) => 0.9,
            (ErrorType::Network, Environment) => 0.7,
            (ErrorType::Network, Temporal) => 0.5,
            (ErrorType::Api, Technical) => 0.9,
            (ErrorType::Api, UserBehavior) => 0.7,
            (ErrorType::Api, Temporal) => 0.4,
            (ErrorType::Config, Application) => 0.9,
            (ErrorType::Config, Technical) => 0.6,
            (ErrorType::System, Environment) => 0.9,
            (ErrorType::System, Application) => 0.6,
            (ErrorType::Process, Application) => 0.8,
            (ErrorType::Process, Environment) => 0.7,
            (ErrorType::Validation, Technical) => 0.8,
            (ErrorType::Validation, UserBehavior) => 0.6,
            (ErrorType::Permission | ErrorType::File, Environment) => 0.7,
            (ErrorType::Permission | ErrorType::File, Technical) => 0.6,
            (_, Temporal) => 0.3,
            _ => 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPattern {
    pub name: String,
    pub description: String,
    pub significance: f64,
    pub critical: bool,
}

impl ContextPattern {
    fn new(name: &str, description: impl Into<String>, significance: f64, critical: bool) -> Self {
        Self {
            name: name.to_string(),
            description: description.into(),
            significance,
            critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupContext {
    pub group: ContextGroup,
    pub facts: BTreeMap<String, Value>,
    pub patterns: Vec<ContextPattern>,
}

impl GroupContext {
    fn new(group: ContextGroup) -> Self {
        Self {
            group,
            facts: BTreeMap::new(),
            patterns: Vec::new(),
        }
    }

    fn fact(&mut self, name: &str, value: Value) {
        self.facts.insert(name.to_string(), value);
    }

    fn score(&self) -> f64 {
        self.patterns
            .iter()
            .map(|p| p.significance)
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insight {
    pub group: ContextGroup,
    pub pattern: String,
    pub message: String,
    pub significance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAnalysis {
    pub error_id: String,
    pub groups: Vec<GroupContext>,
    /// Most significant first
    pub insights: Vec<Insight>,
    pub anomalies: Vec<Anomaly>,
    pub relevance: f64,
    pub risk_level: RiskLevel,
    pub analyzed_at: DateTime<Utc>,
}

impl ContextAnalysis {
    pub fn critical_patterns(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| &g.patterns)
            .filter(|p| p.critical)
            .count()
    }
}

pub struct ContextAnalyzer {
    settings: AnalyzerSettings,
    source: Arc<dyn MetricsSource>,
    history: Arc<ErrorHistory>,
    usage: Arc<UsageTracker>,
    cache: Mutex<HashMap<ContextGroup, (Instant, GroupContext)>>,
    permits: Semaphore,
}

impl ContextAnalyzer {
    pub fn new(
        settings: AnalyzerSettings,
        source: Arc<dyn MetricsSource>,
        history: Arc<ErrorHistory>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        let permits = Semaphore::new(settings.max_concurrent.max(1));
        Self {
            settings,
            source,
            history,
            usage,
            cache: Mutex::new(HashMap::new()),
            permits,
        }
    }

    #[instrument(skip_all, fields(error_id = %record.id, error_type = %record.error_type))]
    pub async fn analyze(&self, record: &CanonicalErrorRecord) -> ContextAnalysis {
        // the semaphore is never closed
        let _permit = self.permits.acquire().await.ok();

        let groups = vec![
            self.environment().await,
            self.temporal(record),
            self.application(record),
            self.user_behavior(record),
            technical(record),
        ];

        let weights: Vec<f64> = groups
            .iter()
            .map(|g| g.group.relevance(record.error_type))
            .collect();
        let total_weight: f64 = weights.iter().sum();
        let relevance = groups
            .iter()
            .zip(&weights)
            .map(|(g, w)| g.score() * w)
            .sum::<f64>()
            / total_weight.max(f64::EPSILON);

        let mut insights: Vec<Insight> = groups
            .iter()
            .zip(&weights)
            .flat_map(|(g, w)| {
                g.patterns.iter().map(move |p| Insight {
                    group: g.group,
                    pattern: p.name.clone(),
                    message: p.description.clone(),
                    significance: p.significance * w,
                })
            })
            .collect();
        insights.sort_by(|a, b| b.significance.total_cmp(&a.significance));

        let anomalies = anomalies(&groups);
        let critical = groups
            .iter()
            .flat_map(|g| &g.patterns)
            .filter(|p| p.critical)
            .count();
        let risk_level = risk_level(critical, relevance);

        debug!(%risk_level, relevance, critical, insights = insights.len(), "Context analysed");
        ContextAnalysis {
            error_id: record.id.to_string(),
            groups,
            insights,
            anomalies,
            relevance,
            risk_level,
            analyzed_at: Utc::now(),
        }
    }

    fn cached(&self, group: ContextGroup) -> Option<GroupContext> {
        let ttl = Duration::from_secs(self.settings.cache_ttl_secs);
        let cache = self.cache.lock();
        cache
            .get(&group)
            .filter(|(at, _)| at.elapsed() < ttl)
            .map(|(_, context)| context.clone())
    }

    fn store(&self, context: &GroupContext) {
        self.cache
            .lock()
            .insert(context.group, (Instant::now(), context.clone()));
    }

    async fn environment(&self) -> GroupContext {
        if let Some(context) = self.cached(ContextGroup::Environment) {
            return context;
        }
        let mut context = GroupContext::new(ContextGroup::Environment);
        let source = Arc::clone(&self.source);
        let Ok(sample) = tokio::task::spawn_blocking(move || source.system()).await else {
            context.fact("available", json!(false));
            return context;
        };

        context.fact("cpu_percent", json!(sample.cpu_percent));
        context.fact("memory_percent", json!(sample.memory_percent));
        context.fact("os", json!(std::env::consts::OS));
        if sample.memory_percent > HEAP_ANOMALY_PERCENT {
            context.patterns.push(ContextPattern::new(
                "memory_exhausted",
                format!("Memory usage is at {:.0}%", sample.memory_percent),
                1.0,
                true,
            ));
        } else if sample.memory_percent > HIGH_MEMORY_PERCENT {
            context.patterns.push(ContextPattern::new(
                "high_memory",
                format!("Memory usage is high ({:.0}%)", sample.memory_percent),
                0.6,
                false,
            ));
        }
        if sample.cpu_percent > HIGH_CPU_PERCENT {
            context.patterns.push(ContextPattern::new(
                "high_cpu",
                format!("CPU usage is at {:.0}%", sample.cpu_percent),
                0.6,
                false,
            ));
        }
        self.store(&context);
        context
    }

    fn temporal(&self, record: &CanonicalErrorRecord) -> GroupContext {
        let mut context = GroupContext::new(ContextGroup::Temporal);
        let local = record.timestamp.with_timezone(&Local);
        let off_hours = is_off_hours(
            local.hour(),
            self.settings.off_hours_start,
            self.settings.off_hours_end,
        );
        let weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
        let last_five = self
            .history
            .count_since(record.timestamp, ChronoDuration::minutes(5));

        context.fact("hour", json!(local.hour()));
        context.fact("weekend", json!(weekend));
        context.fact("off_hours", json!(off_hours));
        context.fact("errors_last_5m", json!(last_five));

        if off_hours && last_five >= OFF_HOURS_BURST {
            context.patterns.push(ContextPattern::new(
                "off_hours_burst",
                format!("{last_five} errors in five minutes outside working hours"),
                0.8,
                true,
            ));
        } else if last_five >= OFF_HOURS_BURST * 2 {
            context.patterns.push(ContextPattern::new(
                "error_burst",
                format!("{last_five} errors in the last five minutes"),
                0.7,
                false,
            ));
        }
        context
    }

    fn application(&self, record: &CanonicalErrorRecord) -> GroupContext {
        let mut context = GroupContext::new(ContextGroup::Application);
        let uptime = self.usage.uptime_secs();
        let repeats = self.history.count_matching(&record.fingerprint);
        let same_type = self.history.count_of_type(record.error_type);

        context.fact("uptime_secs", json!(uptime));
        context.fact("requests", json!(self.usage.total_requests()));
        context.fact("same_fingerprint", json!(repeats));
        context.fact("same_type", json!(same_type));
        context.fact("history_len", json!(self.history.len()));

        if repeats >= RECURRING_ERROR {
            context.patterns.push(ContextPattern::new(
                "recurring_error",
                format!("This error has occurred {repeats} times"),
                if repeats >= RECURRING_CRITICAL { 0.9 } else { 0.6 },
                repeats >= RECURRING_CRITICAL,
            ));
        }
        if uptime < STARTUP_SECS {
            context.patterns.push(ContextPattern::new(
                "startup_phase",
                "The error happened shortly after startup",
                0.4,
                false,
            ));
        }
        context
    }

    fn user_behavior(&self, record: &CanonicalErrorRecord) -> GroupContext {
        let mut context = GroupContext::new(ContextGroup::UserBehavior);
        let recent = self
            .history
            .since(record.timestamp, ChronoDuration::minutes(1));
        let same_in_minute = recent
            .iter()
            .filter(|r| r.fingerprint == record.fingerprint)
            .count();
        let uptime_minutes = (self.usage.uptime_secs() as f64 / 60.0).max(1.0);
        let request_rate = self.usage.total_requests() as f64 / uptime_minutes;

        context.fact("requests_per_minute", json!(request_rate));
        context.fact("same_error_last_minute", json!(same_in_minute));
        if let Some(service) = record.context.service() {
            context.fact("service", json!(service));
        }

        if same_in_minute >= RECURRING_ERROR {
            context.patterns.push(ContextPattern::new(
                "retry_storm",
                format!("The same request failed {same_in_minute} times within a minute"),
                0.7,
                false,
            ));
        }
        context
    }
}

fn technical(record: &CanonicalErrorRecord) -> GroupContext {
    let mut context = GroupContext::new(ContextGroup::Technical);
    let status = record.context.status().or_else(|| status_in_text(&record.message));
    let code = record
        .original_error
        .as_ref()
        .and_then(|o| o.code.clone())
        .or_else(|| socket_code(&record.message));

    context.fact("error_type", json!(record.error_type));
    context.fact("severity", json!(record.severity));
    context.fact("status", json!(status));
    context.fact("code", json!(code));
    context.fact("has_stack", json!(record.stack.is_some()));

    match status {
        Some(401 | 403) => context.patterns.push(ContextPattern::new(
            "auth_failure",
            "The backend rejected the credentials",
            0.9,
            true,
        )),
        Some(429) => context.patterns.push(ContextPattern::new(
            "rate_limited",
            "The backend is rate limiting requests",
            0.7,
            false,
        )),
        Some(s) if s >= 500 => context.patterns.push(ContextPattern::new(
            "server_error",
            format!("The backend failed with HTTP {s}"),
            0.6,
            false,
        )),
        _ => {}
    }
    if code.as_deref().is_some_and(|c| c.starts_with("ECONN") || c == "ETIMEDOUT" || c == "ENOTFOUND") {
        context.patterns.push(ContextPattern::new(
            "transport_failure",
            "The connection to the backend could not be established",
            0.7,
            false,
        ));
    }
    context
}

fn status_in_text(text: &str) -> Option<u16> {
    STATUS_IN_TEXT
        .as_ref()?
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn socket_code(text: &str) -> Option<String> {
    SOCKET_CODE
        .as_ref()?
        .find(text)
        .map(|m| m.as_str().to_string())
}

/// Off-hours wrap around midnight when `start > end`
pub fn is_off_hours(hour: u32, start: u32, end: u32) -> bool {
    if start > end {
        hour >= start || hour < end
    } else {
        hour >= start && hour < end
    }
}

fn anomalies(groups: &[GroupContext]) -> Vec<Anomaly> {
    groups
        .iter()
        .flat_map(|g| &g.patterns)
        .filter(|p| p.critical && matches!(p.name.as_str(), "memory_exhausted" | "off_hours_burst"))
        .map(|p| Anomaly {
            kind: p.name.clone(),
            description: p.description.clone(),
        })
        .collect()
}

fn risk_level(critical: usize, relevance: f64) -> RiskLevel {
    if critical >= 2 || (critical == 1 && relevance >= 0.6) {
        RiskLevel::High
    } else if critical == 1 || relevance >= 0.4 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}
