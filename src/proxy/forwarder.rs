//! Outbound calls with bounded linear-backoff retry
//!
//! A retryable status or transport failure waits `retry_delay * attempt`
//! before the next try. Anything else, success included, returns at once.
//! Once the attempt budget is spent the last failure is wrapped in
//! [`ProxyError::RetriesExhausted`].

use crate::config::ProxySettings;
use crate::providers::ServiceDescriptor;
use crate::proxy::headers::parse_retry_after;
use crate::proxy::types::{ProxyError, ProxyResult, TransportErrorCode};
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Statuses retried by default
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Transport failures retried by default
pub const DEFAULT_RETRYABLE_CODES: [TransportErrorCode; 4] = [
    TransportErrorCode::ConnectionRefused,
    TransportErrorCode::TimedOut,
    TransportErrorCode::ConnectionReset,
    TransportErrorCode::HostNotFound,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retryable_codes: Vec<TransportErrorCode>,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            retryable_codes: DEFAULT_RETRYABLE_CODES.to_vec(),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay(),
            ..Default::default()
        }
    }

    /// Service-specific attempt budget and base delay
    pub fn for_service(&self, service: &ServiceDescriptor) -> Self {
        Self {
            max_retries: service.max_retries,
            retry_delay: service.retry_delay(),
            ..self.clone()
        }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    pub fn is_retryable_code(&self, code: TransportErrorCode) -> bool {
        self.retryable_codes.contains(&code)
    }

    fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }
}

struct ClientState {
    client: reqwest::Client,
    timeout: Duration,
    proxy: Option<String>,
}

/// Holds the pooled HTTP client and can rebuild it to drop every connection
pub struct UpstreamClient {
    state: RwLock<ClientState>,
    rebuilds: Mutex<u64>,
}

impl UpstreamClient {
    pub fn new(settings: &ProxySettings) -> ProxyResult<Self> {
        Ok(Self {
            state: RwLock::new(client_state(settings)?),
            rebuilds: Mutex::new(0),
        })
    }

    pub fn client(&self) -> reqwest::Client {
        self.state.read().client.clone()
    }

    /// Apply new timeout and outbound proxy settings
    pub fn reconfigure(&self, settings: &ProxySettings) -> ProxyResult<()> {
        *self.state.write() = client_state(settings)?;
        Ok(())
    }

    /// Replace the client, closing idle pooled connections
    pub fn rebuild(&self) -> ProxyResult<()> {
        let mut state = self.state.write();
        state.client = build_client(state.timeout, state.proxy.as_deref())?;
        drop(state);
        *self.rebuilds.lock() += 1;
        info!("Rebuilt upstream HTTP client");
        Ok(())
    }

    pub fn rebuilds(&self) -> u64 {
        *self.rebuilds.lock()
    }
}

fn client_state(settings: &ProxySettings) -> ProxyResult<ClientState> {
    let timeout = settings.request_timeout();
    let proxy = settings.proxy.clone().filter(|p| !p.trim().is_empty());
    Ok(ClientState {
        client: build_client(timeout, proxy.as_deref())?,
        timeout,
        proxy,
    })
}

fn build_client(timeout: Duration, proxy: Option<&str>) -> ProxyResult<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90));
    let builder = match proxy {
        Some(url) => builder.proxy(
            reqwest::Proxy::all(url)
                .map_err(|e| ProxyError::NotConfigured(format!("invalid outbound proxy: {e}")))?,
        ),
        None => builder.no_proxy(),
    };
    builder
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))
}

/// Delays upstream calls per key until a rate-limit window has passed
#[derive(Clone, Default)]
pub struct ThrottleGate {
    deadlines: Arc<Mutex<HashMap<String, Instant>>>,
}

impl ThrottleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold calls for `key` for `duration`; a later deadline wins
    pub fn arm(&self, key: &str, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut deadlines = self.deadlines.lock();
        let entry = deadlines.entry(key.to_string()).or_insert(deadline);
        if *entry < deadline {
            *entry = deadline;
        }
    }

    pub fn remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut deadlines = self.deadlines.lock();
        match deadlines.get(key) {
            Some(deadline) if *deadline > now => Some(*deadline - now),
            Some(_) => {
                deadlines.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn wait(&self, key: &str) {
        if let Some(remaining) = self.remaining(key) {
            debug!(key, wait_ms = remaining.as_millis(), "Throttled, waiting before upstream call");
            tokio::time::sleep(remaining).await;
        }
    }
}

/// A request ready to go upstream; cloned per attempt
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Key used with the [`ThrottleGate`], normally the service id
    pub throttle_key: String,
}

/// Successful (or non-retryable) upstream answer
#[derive(Debug)]
pub struct Forwarded {
    pub response: reqwest::Response,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct Forwarder {
    client: Arc<UpstreamClient>,
    throttle: ThrottleGate,
}

impl Forwarder {
    pub fn new(client: Arc<UpstreamClient>, throttle: ThrottleGate) -> Self {
        Self { client, throttle }
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.client
    }

    pub fn throttle(&self) -> &ThrottleGate {
        &self.throttle
    }

    pub async fn forward_with_retry(
        &self,
        request: &OutboundRequest,
        policy: &RetryPolicy,
    ) -> ProxyResult<Forwarded> {
        let budget = policy.attempt_budget();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.throttle.wait(&request.throttle_key).await;

            let sent = self
                .client
                .client()
                .request(request.method.clone(), &request.url)
                .headers(request.headers.clone())
                .body(request.body.clone())
                .send()
                .await;

            let failure = match sent {
                Ok(response) if policy.is_retryable_status(response.status().as_u16()) => {
                    let status = response.status().as_u16();
                    let retry_after_secs = parse_retry_after(response.headers(), Utc::now());
                    let body = response.text().await.unwrap_or_default();
                    ProxyError::Upstream {
                        status,
                        body,
                        retry_after_secs,
                    }
                }
                Ok(response) => {
                    return Ok(Forwarded {
                        response,
                        attempts: attempt,
                    })
                }
                Err(e) => {
                    let error = ProxyError::transport(&e);
                    match error.transport_code() {
                        Some(code) if policy.is_retryable_code(code) => error,
                        _ => return Err(error),
                    }
                }
            };

            if attempt >= budget {
                warn!(
                    url = %request.url,
                    attempts = attempt,
                    error = %failure,
                    "Upstream retries exhausted"
                );
                return Err(ProxyError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(failure),
                });
            }

            let delay = policy.backoff_delay(attempt);
            warn!(
                url = %request.url,
                attempt,
                delay_ms = delay.as_millis(),
                error = %failure,
                "Retryable upstream failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
