//! HTTP header constants and utilities for the proxy service
//!
//! Credential extraction, credential substitution and hop-by-hop filtering
//! live here so every route treats headers the same way.

use crate::proxy::types::ApiKey;
use ::http::{header, HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};

/// Header name for request ID used for tracing and correlation
pub const X_REQUEST_ID: &str = "x-request-id";

/// Header name for API key authentication
pub const X_API_KEY: &str = "x-api-key";

/// Header name used by generateContent clients
pub const X_GOOG_API_KEY: &str = "x-goog-api-key";

/// Authorization header prefix for bearer tokens
pub const BEARER_PREFIX: &str = "Bearer ";

/// Keys with this prefix authenticate through `x-api-key`
pub const ANTHROPIC_KEY_PREFIX: &str = "sk-ant-";

/// Query parameters accepted as a credential
pub const KEY_QUERY_PARAMS: [&str; 2] = ["key", "api_key"];

/// Standard header re-exports for convenience
pub use header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, RETRY_AFTER};

/// Well-known paths
pub mod paths {
    /// Health check endpoint path
    pub const HEALTH: &str = "/health";

    /// Usage statistics endpoint path
    pub const STATS: &str = "/stats";

    /// Translation route served in static mode
    pub const MESSAGES: &str = "/v1/messages";

    /// Prefix of every dynamic route
    pub const PROXY: &str = "/proxy";
}

pub mod content_types {
    pub const JSON: &str = "application/json";
    pub const EVENT_STREAM: &str = "text/event-stream";
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const CLIENT_CREDENTIALS: [&str; 3] = ["authorization", X_API_KEY, X_GOOG_API_KEY];

/// Credential from headers first, then from the query string
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<ApiKey> {
    let from_headers = [X_API_KEY, X_GOOG_API_KEY]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .chain(headers.get(AUTHORIZATION))
        .filter_map(|value| value.to_str().ok())
        .map(|value| value.strip_prefix(BEARER_PREFIX).unwrap_or(value))
        .find_map(|value| ApiKey::try_new(value.to_string()).ok());

    from_headers.or_else(|| {
        query?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .filter(|(name, _)| KEY_QUERY_PARAMS.contains(name))
            .filter_map(|(_, value)| urlencoding::decode(value).ok())
            .find_map(|value| ApiKey::try_new(value.into_owned()).ok())
    })
}

/// Query string with credential parameters removed
pub fn strip_key_params(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name);
            !pair.is_empty() && !KEY_QUERY_PARAMS.contains(&name)
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Copy of the client's headers that is safe to forward upstream
pub fn forwardable_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || CLIENT_CREDENTIALS.contains(&lower)
            || name == HOST
            || name == CONTENT_LENGTH
            || name == header::ACCEPT_ENCODING
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Replace whatever credential the client sent with the configured one
pub fn inject_credential(headers: &mut HeaderMap, key: &ApiKey) {
    for name in CLIENT_CREDENTIALS {
        headers.remove(name);
    }

    let (name, value) = if key.uses_api_key_header() {
        (HeaderName::from_static(X_API_KEY), key.as_ref().to_string())
    } else {
        (AUTHORIZATION, format!("{BEARER_PREFIX}{}", key.as_ref()))
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

/// Upstream response headers minus hop-by-hop and length headers
pub fn forwardable_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(&name.as_str()) || name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// `Retry-After` as seconds, accepting delta-seconds or an HTTP date
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(u64::try_from((at.with_timezone(&Utc) - now).num_seconds()).unwrap_or(0))
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(content_types::EVENT_STREAM))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_extract_api_key_sources() {
        let key = |h: HeaderMap, q: Option<&str>| extract_api_key(&h, q).map(|k| k.as_ref().to_string());

        assert_eq!(key(headers(&[("x-api-key", "k1")]), None).as_deref(), Some("k1"));
        assert_eq!(
            key(headers(&[("authorization", "Bearer k2")]), None).as_deref(),
            Some("k2")
        );
        assert_eq!(key(HeaderMap::new(), Some("a=1&key=k%203")).as_deref(), Some("k 3"));
        assert_eq!(key(headers(&[("x-api-key", "  ")]), Some("api_key=k4")).as_deref(), Some("k4"));
        assert!(key(HeaderMap::new(), None).is_none());
    }

    #[test]
    fn test_strip_key_params() {
        assert_eq!(strip_key_params("alt=sse&key=secret"), "alt=sse");
        assert_eq!(strip_key_params("key=secret"), "");
    }

    #[test]
    fn test_credentials_are_replaced() {
        let mut map = forwardable_request_headers(&headers(&[
            ("authorization", "Bearer client"),
            ("x-api-key", "client"),
            ("connection", "keep-alive"),
            ("anthropic-version", "2023-06-01"),
        ]));
        assert!(map.get("connection").is_none());
        assert!(map.get("authorization").is_none());
        assert_eq!(map["anthropic-version"], "2023-06-01");

        inject_credential(&mut map, &ApiKey::try_new("sk-ant-server".to_string()).unwrap());
        assert_eq!(map["x-api-key"], "sk-ant-server");
        assert!(map.get("authorization").is_none());

        inject_credential(&mut map, &ApiKey::try_new("sk-other".to_string()).unwrap());
        assert_eq!(map["authorization"], "Bearer sk-other");
        assert!(map.get("x-api-key").is_none());
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_retry_after(&headers(&[("retry-after", "20")]), now), Some(20));
        assert_eq!(
            parse_retry_after(
                &headers(&[("retry-after", "Mon, 01 Jan 2024 00:01:00 GMT")]),
                now
            ),
            Some(60)
        );
        assert_eq!(parse_retry_after(&HeaderMap::new(), now), None);
    }

    #[test]
    fn test_event_stream_detection() {
        assert!(is_event_stream(&headers(&[(
            "content-type",
            "text/event-stream; charset=utf-8"
        )])));
        assert!(!is_event_stream(&headers(&[("content-type", "application/json")])));
    }
}
