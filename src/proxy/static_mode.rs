//! Static mode: one fixed backend proxied transparently
//!
//! Every path is forwarded to `apiUrl` with the client's credential swapped
//! for the configured one. When a Chat Completions backend is configured,
//! `POST /v1/messages` is translated to it and back instead.

use crate::providers::constants::json_fields;
use crate::providers::WireFormat;
use crate::proxy::context::ProxyRequestContext;
use crate::proxy::forwarder::OutboundRequest;
use crate::proxy::headers::{
    content_types, extract_api_key, forwardable_request_headers, inject_credential, CONTENT_TYPE,
};
use crate::proxy::middleware::request_id_of;
use crate::proxy::service::{parse_json_body, ProxyService};
use crate::proxy::types::*;
use crate::proxy::url_resolver::UrlResolver;
use axum::{
    extract::{Request, State},
    http::HeaderValue,
    response::Response,
};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Service name (and throttle key) of the static backend
pub const STATIC_SERVICE: &str = "static";

/// Service name (and throttle key) of the Chat Completions backend
pub const SECONDARY_SERVICE: &str = "secondary";

pub async fn passthrough(State(proxy): State<Arc<ProxyService>>, request: Request) -> Response {
    let mut ctx = ProxyRequestContext::new(
        request_id_of(&request),
        request.method().clone(),
        request.uri().path(),
    );
    proxy.begin(&ctx);

    match forward_passthrough(&proxy, &mut ctx, request).await {
        Ok(response) => {
            proxy.finish(&ctx, response.status());
            response
        }
        Err(error) => proxy.fail(&ctx, &error),
    }
}

pub async fn translate_messages(
    State(proxy): State<Arc<ProxyService>>,
    request: Request,
) -> Response {
    let mut ctx = ProxyRequestContext::new(
        request_id_of(&request),
        request.method().clone(),
        request.uri().path(),
    );
    ctx.source_format = WireFormat::Anthropic;
    ctx.target_format = WireFormat::OpenAi;
    proxy.begin(&ctx);

    match forward_translated(&proxy, &mut ctx, request).await {
        Ok(response) => {
            proxy.finish(&ctx, response.status());
            response
        }
        Err(error) => proxy.fail(&ctx, &error),
    }
}

#[instrument(skip_all, fields(request_id = %ctx.request_id))]
async fn forward_passthrough(
    proxy: &ProxyService,
    ctx: &mut ProxyRequestContext,
    request: Request,
) -> ProxyResult<Response> {
    let target = proxy
        .static_target
        .as_ref()
        .ok_or_else(|| ProxyError::NotConfigured("no static backend".to_string()))?;

    ctx.resolved_service = Some(STATIC_SERVICE.to_string());
    let (parts, body) = request.into_parts();
    let bytes = proxy.read_body(&parts.headers, body).await?;

    // Non-JSON bodies are forwarded untouched
    let json = serde_json::from_slice::<Value>(&bytes).ok();
    if let Some(json) = &json {
        let format = proxy.converter.detect_request_format(json);
        ctx.source_format = format;
        ctx.target_format = format;
        ctx.model = json
            .get(json_fields::MODEL)
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    let outgoing = match (json, &target.model) {
        (Some(json), Some(model)) => {
            ctx.model = Some(model.clone());
            rewrite_model(json, model)
                .map(Bytes::from)
                .unwrap_or(bytes)
        }
        _ => bytes,
    };

    let mut headers = forwardable_request_headers(&parts.headers);
    inject_credential(&mut headers, &target.key);

    let url = UrlResolver::resolve_static(&target.url, &parts.uri);
    debug!(url = %url, "Forwarding to static backend");

    let outbound = OutboundRequest {
        method: parts.method.clone(),
        url,
        headers,
        body: outgoing,
        throttle_key: STATIC_SERVICE.to_string(),
    };
    let forwarded = proxy.forwarder.forward_with_retry(&outbound, &proxy.policy).await?;
    proxy.relay(ctx, forwarded, false).await
}

/// Re-encode `body` with its `model` replaced; `None` when nothing changed
fn rewrite_model(mut body: Value, model: &str) -> Option<Vec<u8>> {
    let object = body.as_object_mut()?;
    if object.get(json_fields::MODEL).and_then(Value::as_str) == Some(model) {
        return None;
    }
    object.get(json_fields::MODEL)?;
    object.insert(json_fields::MODEL.to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&body).ok()
}

#[instrument(skip_all, fields(request_id = %ctx.request_id))]
async fn forward_translated(
    proxy: &ProxyService,
    ctx: &mut ProxyRequestContext,
    request: Request,
) -> ProxyResult<Response> {
    let secondary = proxy
        .secondary
        .as_ref()
        .ok_or_else(|| ProxyError::NotConfigured("openaiBaseUrl and openaiApiKey".to_string()))?;

    ctx.resolved_service = Some(SECONDARY_SERVICE.to_string());
    let (parts, body) = request.into_parts();
    if let Some(expected) = &proxy.settings.expected_anthropic_api_key {
        let presented =
            extract_api_key(&parts.headers, parts.uri.query()).ok_or(ProxyError::MissingApiKey)?;
        if presented.as_ref() != expected.trim() {
            return Err(ProxyError::InvalidApiKey);
        }
    }

    let bytes = proxy.read_body(&parts.headers, body).await?;
    let body = parse_json_body(&bytes)?
        .ok_or_else(|| ProxyError::InvalidRequestBody("empty body".to_string()))?;

    let wants_stream = body.get(json_fields::STREAM).and_then(Value::as_bool) == Some(true);
    let mut converted =
        proxy
            .converter
            .convert_request(WireFormat::Anthropic, WireFormat::OpenAi, &body)?;
    if let Some(object) = converted.as_object_mut() {
        if wants_stream {
            object.insert(json_fields::STREAM.to_string(), Value::Bool(false));
        }
        if let Some(max_tokens) = proxy.settings.max_tokens {
            object
                .entry("max_tokens")
                .or_insert_with(|| Value::from(max_tokens));
        }
        if let Some(temperature) = proxy.settings.temperature {
            object
                .entry("temperature")
                .or_insert_with(|| Value::from(temperature));
        }
    }
    ctx.model = converted
        .get(json_fields::MODEL)
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut headers = forwardable_request_headers(&parts.headers);
    headers.remove("anthropic-version");
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_types::JSON));
    inject_credential(&mut headers, &secondary.key);

    let encoded = serde_json::to_vec(&converted)
        .map_err(|e| ProxyError::Internal(format!("failed to encode request: {e}")))?;
    let outbound = OutboundRequest {
        method: parts.method.clone(),
        url: secondary.url.join(CHAT_COMPLETIONS_PATH),
        headers,
        body: Bytes::from(encoded),
        throttle_key: SECONDARY_SERVICE.to_string(),
    };
    let forwarded = proxy.forwarder.forward_with_retry(&outbound, &proxy.policy).await?;
    proxy.relay(ctx, forwarded, wants_stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyMode, ProxySettings};
    use crate::proxy::test_utils::test_helpers::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    fn static_settings(api_url: &str) -> ProxySettings {
        ProxySettings {
            mode: ProxyMode::Static,
            api_url: Some(api_url.to_string()),
            api_key: Some("sk-ant-configured".to_string()),
            ..fast_settings()
        }
    }

    #[test]
    fn test_rewrite_model_only_touches_existing_field() {
        let rewritten = rewrite_model(json!({"model": "a", "x": 1}), "b").unwrap();
        let value: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value, json!({"model": "b", "x": 1}));

        assert!(rewrite_model(json!({"x": 1}), "b").is_none());
        assert!(rewrite_model(json!({"model": "b"}), "b").is_none());
        assert!(rewrite_model(json!([1, 2]), "b").is_none());
    }

    #[tokio::test]
    async fn test_passthrough_swaps_credentials_and_model() {
        let mut server = mockito::Server::new_async().await;
        let upstream = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-ant-configured")
            .match_header("authorization", mockito::Matcher::Missing)
            .match_body(mockito::Matcher::PartialJson(json!({"model": "claude-custom"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "msg_1",
                    "type": "message",
                    "role": "assistant",
                    "content": [{"type": "text", "text": "ok"}],
                    "usage": {"input_tokens": 3, "output_tokens": 1}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let settings = ProxySettings {
            model: Some("claude-custom".to_string()),
            ..static_settings(&server.url())
        };
        let components = test_components();
        let usage = components.usage.clone();
        let router = ProxyService::new(settings, components).unwrap().into_router();

        let request = axum::extract::Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("authorization", "Bearer client-key")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(anthropic_chat("claude-3-haiku").to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        upstream.assert_async().await;
        assert_eq!(usage.snapshot().total_tokens, 4);
    }

    #[tokio::test]
    async fn test_passthrough_streams_event_streams() {
        let mut server = mockito::Server::new_async().await;
        let sse = "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n";
        let _upstream = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse)
            .create_async()
            .await;

        let router = ProxyService::new(static_settings(&server.url()), test_components())
            .unwrap()
            .into_router();

        let mut body = anthropic_chat("claude-3-haiku");
        body["stream"] = json!(true);
        let response = router
            .oneshot(json_request("/v1/messages", &body, Some("ignored")))
            .await
            .unwrap();

        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(body_bytes(response).await, sse.as_bytes());
    }

    #[tokio::test]
    async fn test_translation_route_checks_expected_key() {
        let settings = ProxySettings {
            openai_base_url: Some("http://127.0.0.1:9".to_string()),
            openai_api_key: Some("sk-openai".to_string()),
            expected_anthropic_api_key: Some("sk-ant-expected".to_string()),
            ..static_settings("http://127.0.0.1:9")
        };
        let router = ProxyService::new(settings, test_components())
            .unwrap()
            .into_router();

        let response = router
            .clone()
            .oneshot(json_request("/v1/messages", &anthropic_chat("m"), Some("sk-ant-wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(json_request("/v1/messages", &anthropic_chat("m"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_translation_route_converts_both_ways() {
        let mut server = mockito::Server::new_async().await;
        let upstream = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-openai")
            .match_body(mockito::Matcher::PartialJson(json!({"model": "gpt-4o-mini"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(openai_completion("gpt-4o-mini", "translated").to_string())
            .create_async()
            .await;

        let settings = ProxySettings {
            openai_base_url: Some(format!("{}/v1", server.url())),
            openai_api_key: Some("sk-openai".to_string()),
            small_model: Some("gpt-4o-mini".to_string()),
            ..static_settings("http://127.0.0.1:9")
        };
        let router = ProxyService::new(settings, test_components())
            .unwrap()
            .into_router();

        let response = router
            .oneshot(json_request(
                "/v1/messages",
                &anthropic_chat("claude-3-haiku-20240307"),
                Some("anything"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["content"][0]["text"], "translated");
        assert_eq!(json["role"], "assistant");
        upstream.assert_async().await;
    }
}
