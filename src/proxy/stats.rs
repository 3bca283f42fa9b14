//! Token, cost and request accounting behind `GET /stats`

use crate::providers::pricing::TokenUsage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;

/// Size of the `recentRequests` list
pub const RECENT_REQUESTS: usize = 50;

/// One completed upstream call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub request_id: String,
    pub service: Option<String>,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(serialize_with = "serialize_usd")]
    pub cost_usd: Decimal,
    pub duration_ms: u64,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

fn serialize_usd<S: serde::Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.to_f64().unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_tokens: u64,
    #[serde(serialize_with = "serialize_usd")]
    pub total_cost: Decimal,
    /// Seconds since the tracker was created
    pub uptime: u64,
    pub average_tokens_per_request: f64,
    pub recent_requests: Vec<UsageRecord>,
}

#[derive(Default)]
struct Totals {
    requests: u64,
    tokens: u64,
    cost: Decimal,
    recent: VecDeque<UsageRecord>,
}

pub struct UsageTracker {
    started: Instant,
    totals: Mutex<Totals>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Count an inbound proxied request
    pub fn record_request(&self) -> u64 {
        let mut totals = self.totals.lock();
        totals.requests += 1;
        totals.requests
    }

    pub fn record_usage(&self, record: UsageRecord) {
        let mut totals = self.totals.lock();
        totals.tokens += record.usage().total();
        totals.cost += record.cost_usd;
        if totals.recent.len() == RECENT_REQUESTS {
            totals.recent.pop_front();
        }
        totals.recent.push_back(record);
    }

    pub fn total_requests(&self) -> u64 {
        self.totals.lock().requests
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let totals = self.totals.lock();
        let average = if totals.requests == 0 {
            0.0
        } else {
            totals.tokens as f64 / totals.requests as f64
        };
        StatsSnapshot {
            total_requests: totals.requests,
            total_tokens: totals.tokens,
            total_cost: totals.cost,
            uptime: self.uptime_secs(),
            average_tokens_per_request: average,
            recent_requests: totals.recent.iter().rev().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, input: u64, output: u64, cost: Decimal) -> UsageRecord {
        UsageRecord {
            request_id: id.to_string(),
            service: Some("openai".to_string()),
            model: Some("gpt-4o".to_string()),
            input_tokens: input,
            output_tokens: output,
            cost_usd: cost,
            duration_ms: 12,
            status: 200,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_totals() {
        let tracker = UsageTracker::new();
        tracker.record_request();
        tracker.record_request();
        tracker.record_usage(record("a", 10, 20, Decimal::new(5, 3)));
        tracker.record_usage(record("b", 5, 5, Decimal::new(1, 3)));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.total_tokens, 40);
        assert_eq!(snapshot.total_cost, Decimal::new(6, 3));
        assert_eq!(snapshot.average_tokens_per_request, 20.0);
        assert_eq!(snapshot.recent_requests[0].request_id, "b");
    }

    #[test]
    fn test_recent_list_is_bounded() {
        let tracker = UsageTracker::new();
        for i in 0..(RECENT_REQUESTS + 5) {
            tracker.record_usage(record(&i.to_string(), 1, 1, Decimal::ZERO));
        }
        assert_eq!(tracker.snapshot().recent_requests.len(), RECENT_REQUESTS);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let tracker = UsageTracker::new();
        tracker.record_usage(record("a", 1, 1, Decimal::new(25, 2)));
        let json = serde_json::to_value(tracker.snapshot()).unwrap();

        assert_eq!(json["totalCost"], 0.25);
        assert!(json["recentRequests"][0]["costUsd"].is_number());
        assert!(json.get("averageTokensPerRequest").is_some());
    }
}
