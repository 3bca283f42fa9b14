//! Dynamic routing: `/proxy/{service}/{model}/{*rest}`
//!
//! The service segment picks a backend from the catalog, the model segment
//! overrides the payload's model, and the rest of the path names the
//! operation. Bodies are converted to the backend's wire format and the
//! answer is converted back to whatever the client spoke.

use crate::events::AppEvent;
use crate::providers::constants::json_fields;
use crate::providers::{FormatConverter, ServiceDescriptor, WireFormat};
use crate::proxy::context::ProxyRequestContext;
use crate::proxy::forwarder::OutboundRequest;
use crate::proxy::headers::{
    content_types, extract_api_key, forwardable_request_headers, CONTENT_TYPE,
};
use crate::proxy::middleware::request_id_of;
use crate::proxy::service::{parse_json_body, ProxyService};
use crate::proxy::types::*;
use crate::proxy::url_resolver::UrlResolver;
use axum::{
    extract::{Path, Request, State},
    http::HeaderValue,
    response::Response,
};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

pub async fn handle(
    State(proxy): State<Arc<ProxyService>>,
    Path((service, model, rest)): Path<(String, String, String)>,
    request: Request,
) -> Response {
    dispatch(proxy, service, model, rest, request).await
}

/// `/proxy/{service}/{model}` with no operation: the base URL itself
pub async fn handle_without_operation(
    State(proxy): State<Arc<ProxyService>>,
    Path((service, model)): Path<(String, String)>,
    request: Request,
) -> Response {
    dispatch(proxy, service, model, String::new(), request).await
}

async fn dispatch(
    proxy: Arc<ProxyService>,
    service: String,
    model: String,
    rest: String,
    request: Request,
) -> Response {
    let mut ctx = ProxyRequestContext::new(
        request_id_of(&request),
        request.method().clone(),
        request.uri().path(),
    );
    ctx.model = Some(model.clone());
    proxy.begin(&ctx);

    match forward_dynamic(&proxy, &mut ctx, &service, &model, &rest, request).await {
        Ok(response) => {
            proxy.finish(&ctx, response.status());
            response
        }
        Err(error) => proxy.fail(&ctx, &error),
    }
}

#[instrument(skip_all, fields(request_id = %ctx.request_id, service = %service, model = %model))]
async fn forward_dynamic(
    proxy: &ProxyService,
    ctx: &mut ProxyRequestContext,
    service: &str,
    model: &str,
    rest: &str,
    request: Request,
) -> ProxyResult<Response> {
    let descriptor = proxy
        .catalog
        .resolve(service)
        .ok_or_else(|| ProxyError::UnknownService {
            service: service.to_string(),
            known: proxy.catalog.service_ids(),
        })?;
    ctx.resolved_service = Some(descriptor.id.to_string());
    ctx.target_format = descriptor.wire_format;

    let (parts, body) = request.into_parts();
    let api_key = extract_api_key(&parts.headers, parts.uri.query()).ok_or(ProxyError::MissingApiKey)?;
    let bytes = proxy.read_body(&parts.headers, body).await?;

    let (outgoing, is_json, wants_stream) = match parse_json_body(&bytes)? {
        Some(body) => {
            ctx.source_format = proxy.converter.detect_request_format(&body);
            let (converted, wants_stream) =
                prepare_body(&proxy.converter, ctx, &descriptor, model, &body)?;
            let encoded = serde_json::to_vec(&converted)
                .map_err(|e| ProxyError::Internal(format!("failed to encode request: {e}")))?;
            (Bytes::from(encoded), true, wants_stream)
        }
        None => {
            ctx.source_format = descriptor.wire_format;
            (bytes, false, false)
        }
    };

    let mut headers = forwardable_request_headers(&parts.headers);
    if is_json {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_types::JSON));
    }
    headers.extend(descriptor.auth_headers(api_key.as_ref()));

    let url = UrlResolver::resolve_dynamic(&descriptor, model, rest, parts.uri.query());
    debug!(url = %url, source = %ctx.source_format, target = %ctx.target_format, "Resolved dynamic route");

    proxy.events.publish(AppEvent::DynamicRequest {
        request_id: ctx.request_id.to_string(),
        service: descriptor.id.to_string(),
        model: model.to_string(),
        source_format: ctx.source_format.to_string(),
        target_format: ctx.target_format.to_string(),
        path: rest.to_string(),
    });

    let outbound = OutboundRequest {
        method: parts.method.clone(),
        url,
        headers,
        body: outgoing,
        throttle_key: descriptor.id.to_string(),
    };
    let policy = proxy.policy.for_service(&descriptor);
    let forwarded = proxy.forwarder.forward_with_retry(&outbound, &policy).await?;

    proxy.relay(ctx, forwarded, wants_stream).await
}

/// Convert the client body for the backend and apply the route's model.
///
/// Returns the outgoing body and whether the client expects a synthesized
/// event stream back.
fn prepare_body(
    converter: &FormatConverter,
    ctx: &ProxyRequestContext,
    descriptor: &ServiceDescriptor,
    model: &str,
    body: &Value,
) -> ProxyResult<(Value, bool)> {
    if !FormatConverter::supports(ctx.source_format, ctx.target_format) {
        return Err(ProxyError::UnsupportedRoute {
            service: descriptor.id.to_string(),
            format: ctx.target_format,
            source_format: ctx.source_format,
        });
    }

    let wants_stream = ctx.needs_conversion()
        && body.get(json_fields::STREAM).and_then(Value::as_bool) == Some(true);
    let mut converted = converter.convert_request(ctx.source_format, ctx.target_format, body)?;

    if let Some(object) = converted.as_object_mut() {
        // generateContent carries the model in the URL
        if ctx.target_format != WireFormat::Gemini {
            object.insert(json_fields::MODEL.to_string(), Value::String(model.to_string()));
        }
        if wants_stream {
            match ctx.target_format {
                WireFormat::Gemini => {
                    object.remove(json_fields::STREAM);
                }
                _ => {
                    object.insert(json_fields::STREAM.to_string(), Value::Bool(false));
                    object.remove("stream_options");
                }
            }
        }
    }
    Ok((converted, wants_stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxySettings;
    use crate::providers::ServiceDescriptorConfig;
    use crate::proxy::service::ProxyService;
    use crate::proxy::test_utils::test_helpers::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    fn vendor_settings(base_url: &str) -> ProxySettings {
        let service: ServiceDescriptorConfig = serde_json::from_value(json!({
            "id": "vendorb",
            "baseUrlTemplate": base_url,
            "wireFormat": "openai",
            "maxRetries": 2,
            "retryBaseDelayMs": 1
        }))
        .unwrap();
        ProxySettings {
            services: vec![service],
            ..fast_settings()
        }
    }

    fn descriptor(format: WireFormat) -> ServiceDescriptor {
        ServiceDescriptor::try_from(ServiceDescriptorConfig {
            id: "svc".to_string(),
            base_url_template: "http://localhost".to_string(),
            wire_format: format,
            auth_scheme: None,
            max_retries: None,
            retry_base_delay_ms: None,
            operations: Default::default(),
            extra_headers: Default::default(),
            default_model: None,
        })
        .unwrap()
    }

    fn ctx(source: WireFormat, target: WireFormat) -> ProxyRequestContext {
        let mut ctx = ProxyRequestContext::new(RequestId::generate(), http::Method::POST, "/proxy/svc/m/chat");
        ctx.source_format = source;
        ctx.target_format = target;
        ctx
    }

    #[test]
    fn test_prepare_overrides_model_and_disables_stream() {
        let mut body = anthropic_chat("claude-3-haiku");
        body["stream"] = json!(true);

        let (converted, wants_stream) = prepare_body(
            &FormatConverter::default(),
            &ctx(WireFormat::Anthropic, WireFormat::OpenAi),
            &descriptor(WireFormat::OpenAi),
            "gpt-4o-mini",
            &body,
        )
        .unwrap();

        assert!(wants_stream);
        assert_eq!(converted["model"], "gpt-4o-mini");
        assert_eq!(converted["stream"], false);
        assert_eq!(converted["messages"][0]["role"], "system");
    }

    #[test]
    fn test_prepare_same_format_keeps_stream() {
        let mut body = anthropic_chat("claude-3-haiku");
        body["stream"] = json!(true);

        let (converted, wants_stream) = prepare_body(
            &FormatConverter::default(),
            &ctx(WireFormat::Anthropic, WireFormat::Anthropic),
            &descriptor(WireFormat::Anthropic),
            "claude-3-5-sonnet",
            &body,
        )
        .unwrap();

        assert!(!wants_stream);
        assert_eq!(converted["stream"], true);
        assert_eq!(converted["model"], "claude-3-5-sonnet");
    }

    #[test]
    fn test_prepare_rejects_unsupported_pair() {
        let body = json!({"model": "gpt-4o", "messages": [], "n": 1});
        let error = prepare_body(
            &FormatConverter::default(),
            &ctx(WireFormat::OpenAi, WireFormat::Gemini),
            &descriptor(WireFormat::Gemini),
            "gemini-1.5-pro",
            &body,
        )
        .unwrap_err();

        assert!(matches!(error, ProxyError::UnsupportedRoute { .. }));
        assert_eq!(error.classify().status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_service_lists_known_ids() {
        let router = ProxyService::new(ProxySettings::default(), test_components())
            .unwrap()
            .into_router();

        let response = router
            .oneshot(get_request("/proxy/unknownsvc/modelX/anything"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "validation");
        let known = json["details"]["availableServices"].as_array().unwrap();
        assert!(known.contains(&json!("openai")));
        assert!(known.contains(&json!("anthropic")));
    }

    #[tokio::test]
    async fn test_missing_key_is_401() {
        let router = ProxyService::new(ProxySettings::default(), test_components())
            .unwrap()
            .into_router();

        let response = router
            .oneshot(json_request("/proxy/openai/gpt-4o/chat", &anthropic_chat("x"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "api");
        assert!(json["requestId"].is_string());
    }

    #[tokio::test]
    async fn test_translates_both_directions() {
        let mut server = mockito::Server::new_async().await;
        let upstream = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-vendor")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::PartialJson(json!({"model": "vendor-large"})),
                mockito::Matcher::Regex(r#""role":"system""#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(openai_completion("vendor-large", "Hi there").to_string())
            .create_async()
            .await;

        let components = test_components();
        let usage = components.usage.clone();
        let router = ProxyService::new(vendor_settings(&server.url()), components)
            .unwrap()
            .into_router();

        let response = router
            .oneshot(json_request(
                "/proxy/vendorb/vendor-large/chat",
                &anthropic_chat("claude-3-opus"),
                Some("sk-vendor"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["type"], "message");
        assert_eq!(json["content"][0]["text"], "Hi there");
        assert_eq!(json["usage"]["input_tokens"], 12);
        upstream.assert_async().await;

        let stats = usage.snapshot();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_tokens, 17);
    }

    #[tokio::test]
    async fn test_stream_request_gets_synthesized_events() {
        let mut server = mockito::Server::new_async().await;
        let _upstream = server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(json!({"stream": false})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(openai_completion("vendor-large", "streamed").to_string())
            .create_async()
            .await;

        let router = ProxyService::new(vendor_settings(&server.url()), test_components())
            .unwrap()
            .into_router();

        let mut body = anthropic_chat("claude-3-opus");
        body["stream"] = json!(true);
        let response = router
            .oneshot(json_request("/proxy/vendorb/vendor-large/chat", &body, Some("sk-vendor")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(text.starts_with("event: message_start"));
        assert!(text.contains("streamed"));
        assert!(text.trim_end().ends_with("\"type\":\"message_stop\"}"));
    }

    #[tokio::test]
    async fn test_upstream_error_is_converted_back() {
        let mut server = mockito::Server::new_async().await;
        let _upstream = server
            .mock("POST", "/chat/completions")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"error": {"message": "bad model", "type": "invalid_request_error"}})
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let router = ProxyService::new(vendor_settings(&server.url()), test_components())
            .unwrap()
            .into_router();

        let response = router
            .oneshot(json_request(
                "/proxy/vendorb/nope/chat",
                &anthropic_chat("claude-3-opus"),
                Some("sk-vendor"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["message"], "bad model");
    }
}
