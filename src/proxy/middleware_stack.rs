//! Middleware stack builder for clean composition
//!
//! This module provides a builder for composing the Tower middleware stack,
//! making it easier to maintain and test the middleware pipeline.

use crate::config::DEFAULT_MAX_REQUEST_BYTES;
use crate::proxy::middleware::*;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

/// Builder for composing the proxy middleware stack
pub struct ProxyMiddlewareStack {
    max_request_bytes: usize,
}

impl Default for ProxyMiddlewareStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUEST_BYTES)
    }
}

impl ProxyMiddlewareStack {
    pub fn new(max_request_bytes: usize) -> Self {
        Self { max_request_bytes }
    }

    /// Apply the complete middleware stack to a router
    ///
    /// The middleware are applied in the following order (outer to inner):
    /// 1. Request ID generation/propagation
    /// 2. Logging (with request ID)
    /// 3. Error handling
    /// 4. Request body limit
    pub fn apply_to_router<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router
            // Apply middleware in reverse order (innermost first in the builder)
            .layer(RequestBodyLimitLayer::new(self.max_request_bytes))
            .layer(from_fn_with_state(
                self.max_request_bytes,
                error_handling_middleware,
            ))
            .layer(from_fn(logging_middleware))
            .layer(from_fn(request_id_middleware))
    }
}
