//! Middleware implementations for the proxy service

use crate::diagnostics::{ErrorContext, ErrorHandler, ErrorInfo};
use crate::proxy::error_response::proxy_error_response;
use crate::proxy::headers::{content_types, CONTENT_LENGTH, CONTENT_TYPE, X_REQUEST_ID};
use crate::proxy::types::*;
use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Request id of the current request, stored in request extensions
pub fn request_id_of(request: &Request) -> RequestId {
    request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(RequestId::generate)
}

/// Request ID middleware - ensures every request has a unique ID for tracing
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|h| h.to_str().ok())
        .and_then(RequestId::from_header)
        .unwrap_or_else(RequestId::generate);

    let header_value = HeaderValue::from_str(request_id.as_ref()).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert(X_REQUEST_ID, value.clone());
    }
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// Logging middleware - logs request/response details with timing
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request_id_of(&request);

    info!(
        request_id = %request_id,
        method = %method,
        path = %uri.path(),
        "Incoming request"
    );

    let response = next.run(request).await;
    let duration = start.elapsed();

    info!(
        request_id = %request_id,
        method = %method,
        path = %uri.path(),
        status = response.status().as_u16(),
        duration_ms = duration.as_millis(),
        "Request completed"
    );

    response
}

/// Rewrites bare 413 rejections from the body limit layer into the JSON error shape
pub async fn error_handling_middleware(
    State(max_size): State<usize>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request_id_of(&request);
    let declared_size = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok());

    let response = next.run(request).await;
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE || is_json(&response) {
        return response;
    }

    error!(
        request_id = %request_id,
        status = response.status().as_u16(),
        "Request failed"
    );
    let error = ProxyError::RequestTooLarge {
        size: declared_size.unwrap_or(max_size),
        max_size,
    };
    proxy_error_response(&error, request_id.as_ref())
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(content_types::JSON))
}

/// Bounded in-flight request counter
#[derive(Clone)]
pub struct AdmissionControl {
    permits: Arc<Semaphore>,
    limit: usize,
    errors: Option<Arc<ErrorHandler>>,
}

impl AdmissionControl {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            errors: None,
        }
    }

    pub fn with_error_handler(mut self, errors: Arc<ErrorHandler>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Fails fast with 503 once every permit is taken
pub async fn admission_middleware(
    State(admission): State<AdmissionControl>,
    request: Request,
    next: Next,
) -> Response {
    let Ok(_permit) = Arc::clone(&admission.permits).try_acquire_owned() else {
        let request_id = request_id_of(&request);
        let error = ProxyError::Overloaded {
            limit: admission.limit,
        };
        warn!(request_id = %request_id, limit = admission.limit, "Rejecting request, proxy overloaded");

        if let Some(errors) = &admission.errors {
            let classification = error.classify();
            errors.report(
                ErrorInfo::new(classification.error_type, classification.severity, error.to_string())
                    .with_context(ErrorContext::Request {
                        request_id: request_id.to_string(),
                        method: request.method().to_string(),
                        path: request.uri().path().to_string(),
                        service: None,
                        model: None,
                        status: Some(classification.status.as_u16()),
                        attempts: None,
                        retry_after_secs: None,
                    })
                    .with_suggestion(classification.suggestion),
            );
        }
        return proxy_error_response(&error, request_id.as_ref());
    };

    next.run(request).await
}
