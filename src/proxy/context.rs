//! Per-request state, owned by one handler invocation

use crate::diagnostics::ErrorContext;
use crate::providers::WireFormat;
use crate::proxy::types::RequestId;
use http::Method;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ProxyRequestContext {
    pub request_id: RequestId,
    pub method: Method,
    pub path: String,
    pub source_format: WireFormat,
    pub target_format: WireFormat,
    pub resolved_service: Option<String>,
    pub model: Option<String>,
    pub start_time: Instant,
}

impl ProxyRequestContext {
    pub fn new(request_id: RequestId, method: Method, path: impl Into<String>) -> Self {
        Self {
            request_id,
            method,
            path: path.into(),
            source_format: WireFormat::Anthropic,
            target_format: WireFormat::Anthropic,
            resolved_service: None,
            model: None,
            start_time: Instant::now(),
        }
    }

    pub fn needs_conversion(&self) -> bool {
        self.source_format != self.target_format
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Context payload for an error raised while serving this request
    pub fn error_context(
        &self,
        status: Option<u16>,
        attempts: Option<u32>,
        retry_after_secs: Option<u64>,
    ) -> ErrorContext {
        ErrorContext::Request {
            request_id: self.request_id.to_string(),
            method: self.method.to_string(),
            path: self.path.clone(),
            service: self.resolved_service.clone(),
            model: self.model.clone(),
            status,
            attempts,
            retry_after_secs,
        }
    }
}
