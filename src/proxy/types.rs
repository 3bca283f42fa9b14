//! Type definitions for the proxy module

use crate::providers::format::ConversionError;
use crate::providers::WireFormat;
use derive_more::Display;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque per-request identifier, propagated through `x-request-id`
#[nutype(
    sanitize(trim),
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize, AsRef)
)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh v7 UUID identifier
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7().to_string())
    }

    /// Accept a client-supplied id if it is safe to echo back
    pub fn from_header(value: &str) -> Option<Self> {
        let value = value.trim();
        let acceptable = !value.is_empty()
            && value.len() <= 128
            && value.bytes().all(|b| b.is_ascii_graphic());
        acceptable.then(|| Self::new(value.to_string()))
    }
}

/// Upstream base URL for static mode
#[nutype(
    sanitize(trim),
    validate(predicate = |s: &str| s.starts_with("http://") || s.starts_with("https://")),
    derive(Clone, Debug, Display, PartialEq, Eq, Deserialize, Serialize, AsRef)
)]
pub struct TargetUrl(String);

impl TargetUrl {
    /// Join a request path (and query) onto the base without doubling slashes
    pub fn join(&self, path_and_query: &str) -> String {
        format!(
            "{}/{}",
            self.as_ref().trim_end_matches('/'),
            path_and_query.trim_start_matches('/')
        )
    }
}

/// Credential presented to or by the proxy
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Clone, PartialEq, Eq, Hash, Deserialize, Serialize, AsRef)
)]
pub struct ApiKey(String);

impl ApiKey {
    /// Keys of this shape authenticate with `x-api-key`, everything else with a bearer token
    pub fn uses_api_key_header(&self) -> bool {
        self.as_ref().starts_with(super::headers::ANTHROPIC_KEY_PREFIX)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Transport-level failure codes, named after their socket error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum TransportErrorCode {
    #[display("ECONNREFUSED")]
    ConnectionRefused,
    #[display("ETIMEDOUT")]
    TimedOut,
    #[display("ECONNRESET")]
    ConnectionReset,
    #[display("ENOTFOUND")]
    HostNotFound,
    #[display("EUNKNOWN")]
    Other,
}

impl TransportErrorCode {
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::TimedOut;
        }

        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
        while let Some(current) = source {
            if let Some(io) = current.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::ConnectionRefused => return Self::ConnectionRefused,
                    std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe => return Self::ConnectionReset,
                    std::io::ErrorKind::TimedOut => return Self::TimedOut,
                    _ => {}
                }
            }
            let text = current.to_string().to_lowercase();
            if text.contains("dns error") || text.contains("failed to lookup") {
                return Self::HostNotFound;
            }
            source = current.source();
        }

        if error.is_connect() {
            Self::ConnectionRefused
        } else {
            Self::Other
        }
    }
}

/// Errors that can occur while handling a proxied request
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Missing API key: supply an x-api-key or Authorization header, or a key query parameter")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Unknown service '{service}'")]
    UnknownService {
        service: String,
        known: Vec<String>,
    },

    #[error("No route for {path}")]
    RouteNotFound { path: String },

    #[error("Invalid request body: {0}")]
    InvalidRequestBody(String),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Service '{service}' speaks {format}, which cannot be reached from {source_format}")]
    UnsupportedRoute {
        service: String,
        format: WireFormat,
        source_format: WireFormat,
    },

    #[error("Request too large: {size} bytes (max: {max_size} bytes)")]
    RequestTooLarge { size: usize, max_size: usize },

    #[error("Upstream returned HTTP {status}")]
    Upstream {
        status: u16,
        body: String,
        retry_after_secs: Option<u64>,
    },

    #[error("{code}: {message}")]
    Transport {
        code: TransportErrorCode,
        message: String,
    },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ProxyError>,
    },

    #[error("Too many requests in flight ({limit})")]
    Overloaded { limit: usize },

    #[error("Proxy is not configured: {0}")]
    NotConfigured(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn transport(error: &reqwest::Error) -> Self {
        Self::Transport {
            code: TransportErrorCode::from_reqwest(error),
            message: error.to_string(),
        }
    }

    /// Upstream status, unwrapping retry exhaustion
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            Self::RetriesExhausted { last, .. } => last.upstream_status(),
            _ => None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Upstream {
                retry_after_secs, ..
            } => *retry_after_secs,
            Self::RetriesExhausted { last, .. } => last.retry_after_secs(),
            _ => None,
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Transport code, unwrapping retry exhaustion
    pub fn transport_code(&self) -> Option<TransportErrorCode> {
        match self {
            Self::Transport { code, .. } => Some(*code),
            Self::RetriesExhausted { last, .. } => last.transport_code(),
            _ => None,
        }
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_from_header() {
        assert_eq!(
            RequestId::from_header(" abc-123 ").unwrap().as_ref(),
            "abc-123"
        );
        assert!(RequestId::from_header("").is_none());
        assert!(RequestId::from_header("has space").is_none());
        assert!(RequestId::from_header(&"x".repeat(200)).is_none());
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn test_target_url_join() {
        let url = TargetUrl::try_new("https://api.example.com/".to_string()).unwrap();
        assert_eq!(url.join("/v1/messages?x=1"), "https://api.example.com/v1/messages?x=1");
        assert!(TargetUrl::try_new("ftp://x".to_string()).is_err());
    }

    #[test]
    fn test_api_key_scheme_and_redaction() {
        let anthropic = ApiKey::try_new("sk-ant-abc".to_string()).unwrap();
        let other = ApiKey::try_new(" sk-proj-1 ".to_string()).unwrap();

        assert!(anthropic.uses_api_key_header());
        assert!(!other.uses_api_key_header());
        assert_eq!(other.as_ref(), "sk-proj-1");
        assert_eq!(format!("{anthropic:?}"), "ApiKey(***)");
        assert!(ApiKey::try_new("   ".to_string()).is_err());
    }

    #[test]
    fn test_exhaustion_exposes_last_error() {
        let error = ProxyError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ProxyError::Upstream {
                status: 503,
                body: String::new(),
                retry_after_secs: Some(7),
            }),
        };

        assert_eq!(error.upstream_status(), Some(503));
        assert_eq!(error.retry_after_secs(), Some(7));
        assert_eq!(error.attempts(), Some(3));
        assert!(error.to_string().contains("3 attempts"));
    }
}
