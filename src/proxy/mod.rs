//! Proxy module for translating LLM API requests
//!
//! Two routing modes share one pipeline:
//! - Dynamic: `/proxy/{service}/{model}/{*rest}` resolved through the service catalog
//! - Static: one fixed backend, plus an optional Messages → Chat Completions route
//!
//! Every failure is answered with a structured JSON error and reported to
//! the error handler without delaying the response.

pub mod classification;
pub mod context;
pub mod dynamic;
pub mod error_response;
pub mod forwarder;
pub mod headers;
pub mod middleware;
pub mod middleware_stack;
pub mod server;
pub mod service;
pub mod static_mode;
pub mod stats;
pub mod types;
pub mod url_resolver;

#[cfg(test)]
pub mod test_utils;

pub use server::{ProxyServer, ServerError, StartedServer, StopOutcome};
pub use service::{ProxyComponents, ProxyService};
pub use stats::{StatsSnapshot, UsageTracker};
pub use types::{ProxyError, ProxyResult};
