//! End-to-end scenarios against a real listener on an ephemeral port
//!
//! Run with: cargo test --test dynamic_proxy

use llm_bridge::config::Settings;
use llm_bridge::events::AppEvent;
use llm_bridge::providers::ServiceDescriptorConfig;
use llm_bridge::proxy::{ServerError, StopOutcome};
use llm_bridge::{Application, Error};
use serde_json::{json, Value};
use std::time::Duration;

fn settings_for(upstream: &str) -> Settings {
    let service: ServiceDescriptorConfig = serde_json::from_value(json!({
        "id": "vendorb",
        "baseUrlTemplate": upstream,
        "wireFormat": "openai",
        "maxRetries": 1,
        "retryBaseDelayMs": 1
    }))
    .unwrap();

    let mut settings = Settings::default();
    settings.proxy.server_port = 0;
    settings.proxy.services = vec![service];
    settings.intelligence.health.enabled = false;
    settings.intelligence.recovery.confirmation_timeout_secs = 1;
    settings
}

fn anthropic_chat() -> Value {
    json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

fn openai_completion() -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "vendor-large",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hi from upstream"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 4, "total_tokens": 9}
    })
}

#[tokio::test]
async fn test_dynamic_route_translates_and_records_usage() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-vendor")
        .match_body(mockito::Matcher::PartialJson(json!({"model": "vendor-large"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(openai_completion().to_string())
        .create_async()
        .await;

    let app = Application::with_settings(settings_for(&upstream.url())).unwrap();
    let started = app.start().await.unwrap();
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/proxy/vendorb/vendor-large/chat", started.url))
        .header("x-api-key", "sk-vendor")
        .json(&anthropic_chat())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "Hi from upstream");
    mock.assert_async().await;

    let stats: Value = client
        .get(format!("{}/stats", started.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stats["totalRequests"].as_u64().unwrap() >= 1);
    assert_eq!(stats["totalTokens"], 9);

    assert_eq!(app.stop().await, StopOutcome::Stopped { port: started.port });
}

#[tokio::test]
async fn test_unknown_service_lists_available_services() {
    let upstream = mockito::Server::new_async().await;
    let app = Application::with_settings(settings_for(&upstream.url())).unwrap();
    let started = app.start().await.unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/proxy/nosuchvendor/some-model/chat", started.url))
        .header("x-api-key", "sk-vendor")
        .json(&anthropic_chat())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body["requestId"].is_string());
    let services = body["details"]["availableServices"].as_array().unwrap();
    assert!(services.contains(&json!("vendorb")));
    assert!(services.contains(&json!("openai")));

    app.stop().await;
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let upstream = mockito::Server::new_async().await;
    let app = Application::with_settings(settings_for(&upstream.url())).unwrap();
    let started = app.start().await.unwrap();

    let error = app.start_proxy(None).await.unwrap_err();
    assert!(matches!(
        error,
        Error::Server(ServerError::AlreadyRunning { port }) if port == started.port
    ));

    assert_eq!(app.stop().await, StopOutcome::Stopped { port: started.port });
    assert_eq!(app.stop().await, StopOutcome::NotRunning);
}

#[tokio::test]
async fn test_failed_request_reaches_intelligence_pipeline() {
    let upstream = mockito::Server::new_async().await;
    let app = Application::with_settings(settings_for(&upstream.url())).unwrap();
    let mut events = app.context().events.subscribe();
    let started = app.start().await.unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/proxy/vendorb/vendor-large/chat", started.url))
        .json(&anthropic_chat())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let handled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(AppEvent::IntelligentErrorHandled { risk_level, .. }) => return risk_level,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("pipeline should publish a handled-error event");

    assert!(handled.is_some());
    assert!(!app.context().history.is_empty());
    app.stop().await;
}
