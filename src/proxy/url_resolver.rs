//! Target URL resolution and path handling for proxy requests

use crate::providers::ServiceDescriptor;
use crate::proxy::headers::strip_key_params;
use crate::proxy::types::TargetUrl;
use http::Uri;
use std::collections::BTreeMap;

/// Strategy for resolving upstream URLs in both routing modes
pub struct UrlResolver;

impl UrlResolver {
    /// Upstream URL for a dynamic route.
    ///
    /// `rest` is looked up in the service's operation table, `{model}` is
    /// filled from the route, and the client's query string is carried over
    /// minus any credential parameters.
    pub fn resolve_dynamic(
        descriptor: &ServiceDescriptor,
        model: &str,
        rest: &str,
        query: Option<&str>,
    ) -> String {
        let params = BTreeMap::from([("model", model)]);
        let url = descriptor.url_for(rest, &params);
        Self::append_query(url, query)
    }

    /// Upstream URL for the static backend, keeping the original path
    pub fn resolve_static(target: &TargetUrl, original_uri: &Uri) -> String {
        let url = target.join(original_uri.path());
        Self::append_query(url, original_uri.query())
    }

    fn append_query(url: String, query: Option<&str>) -> String {
        let query = query.map(strip_key_params).unwrap_or_default();
        if query.is_empty() {
            return url;
        }
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{url}{separator}{query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{builtin_services, ServiceDescriptor};

    fn descriptor(id: &str) -> ServiceDescriptor {
        let config = builtin_services()
            .into_iter()
            .find(|c| c.id == id)
            .unwrap();
        ServiceDescriptor::try_from(config).unwrap()
    }

    #[test]
    fn test_dynamic_operation_lookup() {
        let openai = descriptor("openai");
        assert_eq!(
            UrlResolver::resolve_dynamic(&openai, "gpt-4o", "chat", None),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_dynamic_model_placeholder_and_query() {
        let gemini = descriptor("gemini");
        assert_eq!(
            UrlResolver::resolve_dynamic(&gemini, "gemini-1.5-pro", "chat", Some("key=secret&alt=sse")),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:generateContent?alt=sse"
        );
    }

    #[test]
    fn test_static_keeps_path_and_query() {
        let target = TargetUrl::try_new("https://api.example.com/".to_string()).unwrap();
        let original: Uri = "/v1/messages?beta=true&api_key=x".parse().unwrap();

        assert_eq!(
            UrlResolver::resolve_static(&target, &original),
            "https://api.example.com/v1/messages?beta=true"
        );
    }

    #[test]
    fn test_static_without_query() {
        let target = TargetUrl::try_new("http://localhost:9000".to_string()).unwrap();
        let original: Uri = "/v1/models".parse().unwrap();

        assert_eq!(
            UrlResolver::resolve_static(&target, &original),
            "http://localhost:9000/v1/models"
        );
    }
}
