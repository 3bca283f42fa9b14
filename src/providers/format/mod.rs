//! Translation between vendor request/response shapes
//!
//! Conversion is pure: the same body and model map always produce the same
//! output. Fields outside the source schema are copied to the output
//! unchanged so nothing is silently lost.

mod gemini;
mod openai;
pub mod sse;

use crate::config::ProxySettings;
use crate::providers::constants::{json_fields, schema_fields};
use crate::providers::WireFormat;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Unsupported conversion from {from} to {to}")]
    UnsupportedPair { from: WireFormat, to: WireFormat },

    #[error("Expected a JSON object body for {format} conversion")]
    NotAnObject { format: WireFormat },
}

/// Substring remap of model-class names onto configured targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMap {
    pub big: Option<String>,
    pub middle: Option<String>,
    pub small: Option<String>,
}

impl ModelMap {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            big: settings.big_model.clone(),
            middle: settings.middle_model.clone(),
            small: settings.small_model.clone(),
        }
    }

    /// Configured replacement for `model`, if its class is mapped
    pub fn map(&self, model: &str) -> Option<&str> {
        let lower = model.to_lowercase();
        let target = if lower.contains("haiku") {
            &self.small
        } else if lower.contains("sonnet") {
            &self.middle
        } else if lower.contains("opus") {
            &self.big
        } else {
            return None;
        };
        target.as_deref()
    }

    fn apply(&self, model: &Value) -> Value {
        match model.as_str().and_then(|m| self.map(m)) {
            Some(mapped) => Value::String(mapped.to_string()),
            None => model.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FormatConverter {
    models: ModelMap,
}

impl FormatConverter {
    pub fn new(models: ModelMap) -> Self {
        Self { models }
    }

    pub fn model_map(&self) -> &ModelMap {
        &self.models
    }

    /// Guess the wire format of a request body from vendor-specific fields
    pub fn detect_request_format(&self, body: &Value) -> WireFormat {
        detect_request_format(body)
    }

    pub fn convert_request(
        &self,
        from: WireFormat,
        to: WireFormat,
        body: &Value,
    ) -> Result<Value, ConversionError> {
        if from == to {
            return Ok(body.clone());
        }
        let object = body.as_object().ok_or(ConversionError::NotAnObject { format: from })?;

        match (from, to) {
            (WireFormat::Anthropic, WireFormat::OpenAi) => {
                Ok(openai::request_from_anthropic(object, &self.models))
            }
            (WireFormat::OpenAi, WireFormat::Anthropic) => {
                Ok(openai::request_to_anthropic(object, &self.models))
            }
            (WireFormat::Anthropic, WireFormat::Gemini) => Ok(gemini::request_from_anthropic(object)),
            (WireFormat::Gemini, WireFormat::Anthropic) => Ok(gemini::request_to_anthropic(object)),
            _ => Err(ConversionError::UnsupportedPair { from, to }),
        }
    }

    pub fn convert_response(
        &self,
        from: WireFormat,
        to: WireFormat,
        body: &Value,
    ) -> Result<Value, ConversionError> {
        if from == to {
            return Ok(body.clone());
        }
        let object = body.as_object().ok_or(ConversionError::NotAnObject { format: from })?;

        match (from, to) {
            (WireFormat::OpenAi, WireFormat::Anthropic) => Ok(openai::response_to_anthropic(object)),
            (WireFormat::Anthropic, WireFormat::OpenAi) => Ok(openai::response_from_anthropic(object)),
            (WireFormat::Gemini, WireFormat::Anthropic) => Ok(gemini::response_to_anthropic(object)),
            (WireFormat::Anthropic, WireFormat::Gemini) => Ok(gemini::response_from_anthropic(object)),
            _ => Err(ConversionError::UnsupportedPair { from, to }),
        }
    }

    /// Whether a conversion between the two formats exists
    pub fn supports(from: WireFormat, to: WireFormat) -> bool {
        from == to || from == WireFormat::Anthropic || to == WireFormat::Anthropic
    }
}

/// Shape heuristics; ambiguous minimal bodies count as Anthropic
pub fn detect_request_format(body: &Value) -> WireFormat {
    let Some(object) = body.as_object() else {
        return WireFormat::Anthropic;
    };

    if object.contains_key("contents")
        || object.contains_key("generationConfig")
        || object.contains_key("systemInstruction")
    {
        return WireFormat::Gemini;
    }

    const ANTHROPIC_ONLY: &[&str] = &["system", "stop_sequences", "anthropic_version", "top_k", "thinking"];
    const OPENAI_ONLY: &[&str] = &[
        "n",
        "max_completion_tokens",
        "response_format",
        "frequency_penalty",
        "presence_penalty",
        "logit_bias",
        "stop",
        "stream_options",
        "seed",
    ];

    if ANTHROPIC_ONLY.iter().any(|k| object.contains_key(*k)) {
        return WireFormat::Anthropic;
    }
    if OPENAI_ONLY.iter().any(|k| object.contains_key(*k)) {
        return WireFormat::OpenAi;
    }

    if let Some(tools) = object.get("tools").and_then(Value::as_array) {
        if tools.iter().any(|t| t.get("input_schema").is_some()) {
            return WireFormat::Anthropic;
        }
        if tools.iter().any(|t| t.get("function").is_some()) {
            return WireFormat::OpenAi;
        }
    }

    let messages = object
        .get(json_fields::MESSAGES)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for message in messages {
        match message.get(json_fields::ROLE).and_then(Value::as_str) {
            Some("system") | Some("tool") | Some("developer") => return WireFormat::OpenAi,
            _ => {}
        }
        if message.get("tool_calls").is_some() {
            return WireFormat::OpenAi;
        }
        let blocks = message
            .get(json_fields::CONTENT)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for block in blocks {
            match block.get(json_fields::TYPE).and_then(Value::as_str) {
                Some("tool_use") | Some("tool_result") => return WireFormat::Anthropic,
                Some("image") if block.get("source").is_some() => return WireFormat::Anthropic,
                Some("image_url") => return WireFormat::OpenAi,
                _ => {}
            }
        }
    }

    WireFormat::Anthropic
}

/// Copy fields outside `known` from `source` into `target` without overwriting
fn carry_unknown(source: &Map<String, Value>, known: &[&str], target: &mut Map<String, Value>) {
    for (key, value) in source {
        if !known.contains(&key.as_str()) && !target.contains_key(key) {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Text of a string or an array of text blocks
fn flatten_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                Value::String(s) => Some(s.as_str()),
                other => other.get(json_fields::TEXT).and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn insert_if_present(
    source: &Map<String, Value>,
    from: &str,
    target: &mut Map<String, Value>,
    to: &str,
) {
    if let Some(value) = source.get(from) {
        if !value.is_null() {
            target.insert(to.to_string(), value.clone());
        }
    }
}

fn known_request_fields(format: WireFormat) -> &'static [&'static str] {
    match format {
        WireFormat::Anthropic => schema_fields::ANTHROPIC_REQUEST,
        WireFormat::OpenAi => schema_fields::OPENAI_REQUEST,
        WireFormat::Gemini => schema_fields::GEMINI_REQUEST,
    }
}

fn known_response_fields(format: WireFormat) -> &'static [&'static str] {
    match format {
        WireFormat::Anthropic => schema_fields::ANTHROPIC_RESPONSE,
        WireFormat::OpenAi => schema_fields::OPENAI_RESPONSE,
        WireFormat::Gemini => schema_fields::GEMINI_RESPONSE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn converter() -> FormatConverter {
        FormatConverter::new(ModelMap {
            big: Some("gpt-4o".to_string()),
            middle: Some("gpt-4o-mini".to_string()),
            small: None,
        })
    }

    #[rstest]
    #[case(json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}), WireFormat::Anthropic)]
    #[case(json!({"model": "m", "system": "be nice", "messages": []}), WireFormat::Anthropic)]
    #[case(json!({"messages": [{"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]}]}), WireFormat::Anthropic)]
    #[case(json!({"tools": [{"name": "f", "input_schema": {}}]}), WireFormat::Anthropic)]
    #[case(json!({"model": "m", "messages": [{"role": "system", "content": "x"}]}), WireFormat::OpenAi)]
    #[case(json!({"model": "m", "max_completion_tokens": 5, "messages": []}), WireFormat::OpenAi)]
    #[case(json!({"messages": [{"role": "user", "content": [{"type": "image_url", "image_url": {"url": "u"}}]}]}), WireFormat::OpenAi)]
    #[case(json!({"tools": [{"type": "function", "function": {"name": "f"}}]}), WireFormat::OpenAi)]
    #[case(json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}), WireFormat::Gemini)]
    #[case(json!("not an object"), WireFormat::Anthropic)]
    fn test_detect_request_format(#[case] body: Value, #[case] expected: WireFormat) {
        assert_eq!(detect_request_format(&body), expected);
    }

    #[rstest]
    #[case("claude-3-opus-20240229", Some("gpt-4o"))]
    #[case("claude-3-5-Sonnet-latest", Some("gpt-4o-mini"))]
    #[case("claude-3-haiku", None)]
    #[case("gpt-4", None)]
    fn test_model_map(#[case] model: &str, #[case] expected: Option<&str>) {
        assert_eq!(converter().model_map().map(model), expected);
    }

    #[test]
    fn test_unsupported_pair_is_rejected() {
        let body = json!({"messages": []});
        assert_eq!(
            converter().convert_request(WireFormat::OpenAi, WireFormat::Gemini, &body),
            Err(ConversionError::UnsupportedPair {
                from: WireFormat::OpenAi,
                to: WireFormat::Gemini
            })
        );
        assert!(!FormatConverter::supports(WireFormat::Gemini, WireFormat::OpenAi));
        assert!(FormatConverter::supports(WireFormat::Gemini, WireFormat::Gemini));
    }

    #[test]
    fn test_identity_is_a_copy() {
        let body = json!({"model": "claude-3-opus", "anything": [1, 2]});
        assert_eq!(
            converter()
                .convert_request(WireFormat::Anthropic, WireFormat::Anthropic, &body)
                .unwrap(),
            body
        );
    }

    #[test]
    fn test_non_object_body_fails() {
        assert_eq!(
            converter().convert_request(WireFormat::Anthropic, WireFormat::OpenAi, &json!([1])),
            Err(ConversionError::NotAnObject {
                format: WireFormat::Anthropic
            })
        );
    }

    #[test]
    fn test_conversion_is_deterministic() {
        let body = json!({
            "model": "claude-3-opus",
            "system": "s",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}],
            "x_extra": {"nested": true}
        });
        let a = converter().convert_request(WireFormat::Anthropic, WireFormat::OpenAi, &body);
        let b = converter().convert_request(WireFormat::Anthropic, WireFormat::OpenAi, &body);
        assert_eq!(a, b);
    }

    #[test]
    fn test_flatten_text() {
        assert_eq!(flatten_text(&json!("a")), "a");
        assert_eq!(
            flatten_text(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(flatten_text(&Value::Null), "");
    }
}
