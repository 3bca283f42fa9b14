//! Test utilities for proxy module testing
//!
//! Fresh collaborators per test, request builders and body helpers.

#[cfg(test)]
pub mod test_helpers {
    use crate::config::ProxySettings;
    use crate::diagnostics::{ErrorHandler, ErrorHistory, ErrorNotifier};
    use crate::events::EventBus;
    use crate::intelligence::health::HealthStatus;
    use crate::proxy::forwarder::{Forwarder, ThrottleGate, UpstreamClient};
    use crate::proxy::service::ProxyComponents;
    use crate::proxy::stats::UsageTracker;
    use axum::{body::Body, extract::Request, response::Response};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    /// Settings with fast retries so failing tests finish quickly
    pub fn fast_settings() -> ProxySettings {
        ProxySettings {
            retry_delay_ms: 1,
            request_timeout_ms: 5_000,
            ..Default::default()
        }
    }

    /// Independent collaborators for one test case
    pub fn test_components() -> ProxyComponents {
        let events = EventBus::default();
        let notifier = ErrorNotifier::new(events.clone(), Duration::from_secs(30));
        let errors = Arc::new(ErrorHandler::new(
            Arc::new(ErrorHistory::new(50)),
            notifier,
            events.clone(),
        ));
        let client = Arc::new(
            UpstreamClient::new(&fast_settings()).expect("default client settings are valid"),
        );
        let (_tx, health) = watch::channel(HealthStatus::Healthy);

        ProxyComponents {
            forwarder: Forwarder::new(client, ThrottleGate::new()),
            usage: Arc::new(UsageTracker::new()),
            events,
            errors,
            health,
        }
    }

    /// JSON POST request with optional credential header
    pub fn json_request(uri: &str, body: &Value, api_key: Option<&str>) -> Request {
        let builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        let builder = match api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        };
        builder
            .body(Body::from(body.to_string()))
            .expect("test request is valid")
    }

    pub fn get_request(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("test request is valid")
    }

    pub async fn body_bytes(response: Response) -> bytes::Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("body is readable")
            .to_bytes()
    }

    pub async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("body is JSON")
    }

    /// Minimal Messages API request
    pub fn anthropic_chat(model: &str) -> Value {
        serde_json::json!({
            "model": model,
            "max_tokens": 256,
            "system": "Be brief.",
            "messages": [{"role": "user", "content": "Hello"}]
        })
    }

    /// Minimal Chat Completions response
    pub fn openai_completion(model: &str, text: &str) -> Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
        })
    }
}
