//! Unified error response handling for the proxy service
//!
//! Every failure leaves the proxy as the same JSON shape:
//! `{ "error": { "type", "code", "message", "suggestion" }, "requestId" }`
//! with the request id mirrored in the `x-request-id` header.

use crate::diagnostics::ErrorType;
use crate::proxy::headers::X_REQUEST_ID;
use crate::proxy::types::ProxyError;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    /// Stable code for programmatic handling
    pub code: String,
    pub message: String,
    pub suggestion: Option<String>,
}

/// Standard error response format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub request_id: Option<String>,
    /// Extra machine-readable data, such as the list of known services
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error_type: ErrorType, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                error_type,
                code: code.into(),
                message: message.into(),
                suggestion: None,
            },
            request_id: None,
            details: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.error.suggestion = Some(suggestion.into());
        self
    }

    /// Add request ID for correlation
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convert to HTTP response with proper headers
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = self.request_id.clone();
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = request_id {
            if let Ok(header_value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(X_REQUEST_ID, header_value);
            }
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    /// Convert to standardized error response
    fn to_error_response(&self) -> ErrorResponse;

    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        let classification = self.classify();
        let response = ErrorResponse::new(
            classification.error_type,
            classification.code,
            self.to_string(),
        )
        .with_suggestion(classification.suggestion);

        match self {
            ProxyError::UnknownService { known, .. } => response
                .with_details(serde_json::json!({ "availableServices": known })),
            ProxyError::RetriesExhausted { attempts, .. } => {
                response.with_details(serde_json::json!({ "attempts": attempts }))
            }
            _ => response,
        }
    }

    fn status_code(&self) -> StatusCode {
        self.classify().status
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.to_error_response().into_response_with_status(status)
    }
}

/// Build the response for `error` on behalf of request `request_id`
pub fn proxy_error_response(error: &ProxyError, request_id: &str) -> Response {
    error
        .to_error_response()
        .with_request_id(request_id)
        .into_response_with_status(error.status_code())
}
