//! Fields a converter does not understand must survive translation

use llm_bridge::providers::{FormatConverter, WireFormat};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

pub mod generators {
    use super::*;
    use proptest::collection::btree_map;
    use proptest::string::string_regex;

    /// Vendor-neutral extra fields keyed under a prefix no schema uses
    pub fn extra_fields() -> impl Strategy<Value = Map<String, Value>> {
        let key = string_regex("x_ext_[a-z]{1,12}").unwrap();
        let value = prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            string_regex("[a-zA-Z0-9 ]{0,24}").unwrap().prop_map(Value::from),
        ];
        btree_map(key, value, 0..6).prop_map(|fields| fields.into_iter().collect())
    }

    pub fn prompt() -> impl Strategy<Value = String> {
        string_regex("[a-zA-Z0-9 ,.?]{1,64}").unwrap()
    }
}

fn anthropic_request(prompt: &str, extra: &Map<String, Value>) -> Value {
    let mut body = json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 256,
        "messages": [{"role": "user", "content": prompt}]
    });
    if let Some(object) = body.as_object_mut() {
        object.extend(extra.clone());
    }
    body
}

proptest! {
    #[test]
    fn prop_identity_conversion_is_lossless(
        prompt in generators::prompt(),
        extra in generators::extra_fields(),
    ) {
        let converter = FormatConverter::default();
        let body = anthropic_request(&prompt, &extra);

        for format in [WireFormat::Anthropic, WireFormat::OpenAi, WireFormat::Gemini] {
            let converted = converter.convert_request(format, format, &body).unwrap();
            prop_assert_eq!(&converted, &body);
        }
    }

    #[test]
    fn prop_unknown_fields_survive_translation(
        prompt in generators::prompt(),
        extra in generators::extra_fields(),
        target in prop_oneof![Just(WireFormat::OpenAi), Just(WireFormat::Gemini)],
    ) {
        let converter = FormatConverter::default();
        let body = anthropic_request(&prompt, &extra);

        let converted = converter
            .convert_request(WireFormat::Anthropic, target, &body)
            .unwrap();

        for (key, value) in &extra {
            prop_assert_eq!(converted.get(key), Some(value));
        }
    }

    #[test]
    fn prop_round_trip_keeps_vendor_neutral_fields(
        prompt in generators::prompt(),
        extra in generators::extra_fields(),
        vendor in prop_oneof![Just(WireFormat::OpenAi), Just(WireFormat::Gemini)],
    ) {
        let converter = FormatConverter::default();
        let body = anthropic_request(&prompt, &extra);

        let outbound = converter
            .convert_request(WireFormat::Anthropic, vendor, &body)
            .unwrap();
        let returned = converter
            .convert_response(vendor, WireFormat::Anthropic, &outbound)
            .unwrap();

        for (key, value) in &extra {
            prop_assert_eq!(returned.get(key), Some(value));
        }
    }

    #[test]
    fn prop_prompt_text_is_preserved(prompt in generators::prompt()) {
        let converter = FormatConverter::default();
        let body = anthropic_request(&prompt, &Map::new());

        let openai = converter
            .convert_request(WireFormat::Anthropic, WireFormat::OpenAi, &body)
            .unwrap();
        let text = openai["messages"]
            .as_array()
            .and_then(|messages| messages.last())
            .and_then(|message| message["content"].as_str())
            .map(str::to_string);
        prop_assert_eq!(text, Some(prompt));
    }
}
