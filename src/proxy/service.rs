//! Shared proxy state and router assembly
//!
//! A [`ProxyService`] is built once per `start()` from the caller's
//! [`ProxySettings`] and the long-lived [`ProxyComponents`] owned by the
//! application context. It decides the routing mode, owns the per-request
//! bookkeeping (events, usage, error reporting) and turns itself into an
//! axum router with the middleware stack applied.

use crate::config::ProxySettings;
use crate::diagnostics::{ErrorHandler, ErrorInfo, OriginalError};
use crate::events::{AppEvent, EventBus};
use crate::intelligence::health::HealthStatus;
use crate::providers::pricing::{estimate_cost, TokenUsage};
use crate::providers::{
    format::sse::anthropic_message_to_sse, FormatConverter, ModelMap, ServiceCatalog,
    ServiceRegistry, WireFormat,
};
use crate::proxy::context::ProxyRequestContext;
use crate::proxy::error_response::proxy_error_response;
use crate::proxy::forwarder::{Forwarded, Forwarder, RetryPolicy};
use crate::proxy::headers::{
    content_types, forwardable_response_headers, is_event_stream, parse_retry_after, paths,
    CONTENT_LENGTH, CONTENT_TYPE,
};
use crate::proxy::middleware::AdmissionControl;
use crate::proxy::middleware_stack::ProxyMiddlewareStack;
use crate::proxy::stats::{UsageRecord, UsageTracker};
use crate::proxy::types::*;
use crate::proxy::{dynamic, static_mode};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Longest upstream error body kept as record detail
const MAX_DETAIL_CHARS: usize = 2_000;

/// Long-lived collaborators shared by every server start
#[derive(Clone)]
pub struct ProxyComponents {
    pub forwarder: Forwarder,
    pub usage: Arc<UsageTracker>,
    pub events: EventBus,
    pub errors: Arc<ErrorHandler>,
    pub health: watch::Receiver<HealthStatus>,
}

/// The single backend of static mode
#[derive(Debug, Clone)]
pub struct StaticTarget {
    pub url: TargetUrl,
    pub key: ApiKey,
    pub model: Option<String>,
}

/// Chat Completions backend behind `POST /v1/messages` in static mode
#[derive(Debug, Clone)]
pub struct SecondaryBackend {
    pub url: TargetUrl,
    pub key: ApiKey,
}

pub struct ProxyService {
    pub(crate) settings: ProxySettings,
    pub(crate) catalog: Arc<dyn ServiceCatalog>,
    pub(crate) converter: FormatConverter,
    pub(crate) forwarder: Forwarder,
    pub(crate) policy: RetryPolicy,
    pub(crate) usage: Arc<UsageTracker>,
    pub(crate) events: EventBus,
    pub(crate) errors: Arc<ErrorHandler>,
    pub(crate) health: watch::Receiver<HealthStatus>,
    pub(crate) static_target: Option<StaticTarget>,
    pub(crate) secondary: Option<SecondaryBackend>,
}

impl ProxyService {
    pub fn new(settings: ProxySettings, components: ProxyComponents) -> ProxyResult<Self> {
        let static_target = if settings.is_dynamic() {
            None
        } else {
            Some(static_target(&settings)?)
        };
        let secondary = match (&settings.openai_base_url, &settings.openai_api_key) {
            (Some(url), Some(key)) if !settings.is_dynamic() => Some(SecondaryBackend {
                url: TargetUrl::try_new(url.clone())
                    .map_err(|e| ProxyError::NotConfigured(format!("openaiBaseUrl: {e}")))?,
                key: ApiKey::try_new(key.clone())
                    .map_err(|e| ProxyError::NotConfigured(format!("openaiApiKey: {e}")))?,
            }),
            _ => None,
        };

        Ok(Self {
            catalog: Arc::new(ServiceRegistry::from_settings(&settings)),
            converter: FormatConverter::new(ModelMap::from_settings(&settings)),
            policy: RetryPolicy::from_settings(&settings),
            forwarder: components.forwarder,
            usage: components.usage,
            events: components.events,
            errors: components.errors,
            health: components.health,
            static_target,
            secondary,
            settings,
        })
    }

    /// Swap the service catalog, e.g. for a test double
    pub fn with_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.static_target.is_none()
    }

    /// Axum router for the configured mode with the middleware stack applied
    pub fn into_router(self) -> Router {
        let admission = AdmissionControl::new(self.settings.max_in_flight)
            .with_error_handler(Arc::clone(&self.errors));
        let max_request_bytes = self.settings.max_request_bytes;
        let dynamic_mode = self.is_dynamic();
        let has_secondary = self.secondary.is_some();

        let proxied = if dynamic_mode {
            Router::new()
                .route("/proxy/{service}/{model}/{*rest}", any(dynamic::handle))
                .route("/proxy/{service}/{model}", any(dynamic::handle_without_operation))
                .fallback(route_not_found)
        } else {
            let router = Router::new();
            let router = if has_secondary {
                router.route(paths::MESSAGES, post(static_mode::translate_messages))
            } else {
                router
            };
            router.fallback(static_mode::passthrough)
        };
        let proxied = proxied.layer(from_fn_with_state(
            admission,
            crate::proxy::middleware::admission_middleware,
        ));

        let router = Router::new()
            .route(paths::HEALTH, get(health_handler))
            .route(paths::STATS, get(stats_handler))
            .merge(proxied)
            .with_state(Arc::new(self));

        ProxyMiddlewareStack::new(max_request_bytes).apply_to_router(router)
    }

    /// Count the request and announce it
    pub(crate) fn begin(&self, ctx: &ProxyRequestContext) {
        self.usage.record_request();
        self.events.publish(AppEvent::Request {
            request_id: ctx.request_id.to_string(),
            method: ctx.method.to_string(),
            path: ctx.path.clone(),
            model: ctx.model.clone(),
        });
    }

    pub(crate) fn finish(&self, ctx: &ProxyRequestContext, status: StatusCode) {
        self.events.publish(AppEvent::Response {
            request_id: ctx.request_id.to_string(),
            status: status.as_u16(),
            duration_ms: elapsed_ms(ctx),
        });
    }

    /// Answer with the JSON error body, then hand the failure to the pipeline
    pub(crate) fn fail(&self, ctx: &ProxyRequestContext, error: &ProxyError) -> Response {
        let response = proxy_error_response(error, ctx.request_id.as_ref());
        warn!(
            request_id = %ctx.request_id,
            status = response.status().as_u16(),
            error = %error,
            "Proxy request failed"
        );
        self.report(ctx, error);
        self.finish(ctx, response.status());
        response
    }

    /// Push a classified record to the error handler without waiting
    pub(crate) fn report(&self, ctx: &ProxyRequestContext, error: &ProxyError) {
        let classification = error.classify();
        let code = error
            .transport_code()
            .map(|c| c.to_string())
            .or_else(|| error.upstream_status().map(|s| format!("HTTP_{s}")))
            .unwrap_or_else(|| classification.code.to_string());
        let status = error
            .upstream_status()
            .unwrap_or_else(|| classification.status.as_u16());

        let mut info = ErrorInfo::new(
            classification.error_type,
            classification.severity,
            error.to_string(),
        )
        .with_context(ctx.error_context(Some(status), error.attempts(), error.retry_after_secs()))
        .with_original(OriginalError::new(Some(code), error.to_string()))
        .with_suggestion(classification.suggestion);

        if let Some(body) = upstream_body(error).filter(|b| !b.is_empty()) {
            info = info.with_detail(body.chars().take(MAX_DETAIL_CHARS).collect::<String>());
        }
        self.errors.report(info);
    }

    /// Buffer the request body, enforcing the configured size cap
    pub(crate) async fn read_body(&self, headers: &HeaderMap, body: Body) -> ProxyResult<Bytes> {
        let max_size = self.settings.max_request_bytes;
        axum::body::to_bytes(body, max_size).await.map_err(|_| {
            let size = headers
                .get(CONTENT_LENGTH)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(max_size);
            ProxyError::RequestTooLarge { size, max_size }
        })
    }

    /// Relay an upstream answer to the client.
    ///
    /// Event streams pass through untouched when no conversion is needed.
    /// Otherwise the body is buffered, usage is recorded from the upstream
    /// shape, and the body is converted back to the client's format. With
    /// `wants_stream` a successful Messages response is re-emitted as SSE.
    pub(crate) async fn relay(
        &self,
        ctx: &ProxyRequestContext,
        forwarded: Forwarded,
        wants_stream: bool,
    ) -> ProxyResult<Response> {
        let upstream = forwarded.response;
        let status = upstream.status();
        let mut headers = forwardable_response_headers(upstream.headers());

        if !ctx.needs_conversion() && is_event_stream(&headers) {
            debug!(request_id = %ctx.request_id, "Streaming upstream response through");
            return Ok(build_response(
                status,
                headers,
                Body::from_stream(upstream.bytes_stream()),
            ));
        }

        let retry_after_secs = parse_retry_after(upstream.headers(), Utc::now());
        let bytes = upstream
            .bytes()
            .await
            .map_err(|e| ProxyError::transport(&e))?;
        let upstream_json: Option<Value> = serde_json::from_slice(&bytes).ok();

        if status.is_success() {
            if let Some(json) = &upstream_json {
                self.record_usage(ctx, json, status, forwarded.attempts);
            }
        } else {
            self.report(
                ctx,
                &ProxyError::Upstream {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                    retry_after_secs,
                },
            );
        }

        let json = match upstream_json {
            Some(json) if ctx.needs_conversion() => json,
            _ => return Ok(build_response(status, headers, Body::from(bytes))),
        };
        let converted =
            self.converter
                .convert_response(ctx.target_format, ctx.source_format, &json)?;

        if wants_stream && status.is_success() && ctx.source_format == WireFormat::Anthropic {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static(content_types::EVENT_STREAM),
            );
            return Ok(build_response(
                status,
                headers,
                Body::from(anthropic_message_to_sse(&converted)),
            ));
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_types::JSON));
        let body = serde_json::to_vec(&converted)
            .map_err(|e| ProxyError::Internal(format!("failed to encode response: {e}")))?;
        Ok(build_response(status, headers, Body::from(body)))
    }

    fn record_usage(&self, ctx: &ProxyRequestContext, upstream: &Value, status: StatusCode, attempts: u32) {
        let Some(usage) = TokenUsage::from_response(ctx.target_format, upstream) else {
            return;
        };
        let model = ctx
            .model
            .clone()
            .or_else(|| upstream.get("model").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        let cost = estimate_cost(&model, usage);

        debug!(
            request_id = %ctx.request_id,
            model = %model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            attempts,
            "Recorded usage"
        );
        self.usage.record_usage(UsageRecord {
            request_id: ctx.request_id.to_string(),
            service: ctx.resolved_service.clone(),
            model: (!model.is_empty()).then(|| model.clone()),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: cost,
            duration_ms: elapsed_ms(ctx),
            status: status.as_u16(),
            timestamp: Utc::now(),
        });
        self.events.publish(AppEvent::Usage {
            request_id: ctx.request_id.to_string(),
            model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: cost.to_f64().unwrap_or_default(),
        });
    }
}

fn static_target(settings: &ProxySettings) -> ProxyResult<StaticTarget> {
    let url = settings
        .api_url
        .clone()
        .ok_or_else(|| ProxyError::NotConfigured("apiUrl is required in static mode".to_string()))?;
    let key = settings
        .api_key
        .clone()
        .ok_or_else(|| ProxyError::NotConfigured("apiKey is required in static mode".to_string()))?;

    Ok(StaticTarget {
        url: TargetUrl::try_new(url).map_err(|e| ProxyError::NotConfigured(format!("apiUrl: {e}")))?,
        key: ApiKey::try_new(key).map_err(|e| ProxyError::NotConfigured(format!("apiKey: {e}")))?,
        model: settings.model.clone().filter(|m| !m.trim().is_empty()),
    })
}

fn upstream_body(error: &ProxyError) -> Option<&str> {
    match error {
        ProxyError::Upstream { body, .. } => Some(body),
        ProxyError::RetriesExhausted { last, .. } => upstream_body(last),
        _ => None,
    }
}

fn elapsed_ms(ctx: &ProxyRequestContext) -> u64 {
    u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Parse a non-empty body as JSON; an empty body yields `None`
pub(crate) fn parse_json_body(bytes: &Bytes) -> ProxyResult<Option<Value>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|e| ProxyError::InvalidRequestBody(e.to_string()))
}

async fn route_not_found(request: axum::extract::Request) -> Response {
    let request_id = crate::proxy::middleware::request_id_of(&request);
    let error = ProxyError::RouteNotFound {
        path: request.uri().path().to_string(),
    };
    proxy_error_response(&error, request_id.as_ref())
}

async fn health_handler(State(proxy): State<Arc<ProxyService>>) -> impl IntoResponse {
    let health = *proxy.health.borrow();
    let config = if proxy.is_dynamic() {
        json!({
            "mode": "dynamic",
            "services": proxy.catalog.service_ids(),
        })
    } else {
        json!({
            "mode": "static",
            "target": proxy.static_target.as_ref().map(|t| t.url.to_string()),
            "model": proxy.static_target.as_ref().and_then(|t| t.model.clone()),
            "secondary": proxy.secondary.as_ref().map(|s| s.url.to_string()),
        })
    };

    Json(json!({
        "status": "ok",
        "health": health,
        "uptime": proxy.usage.uptime_secs(),
        "requests": proxy.usage.total_requests(),
        "config": config,
    }))
}

async fn stats_handler(State(proxy): State<Arc<ProxyService>>) -> impl IntoResponse {
    Json(proxy.usage.snapshot())
}
