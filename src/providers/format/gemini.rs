//! Messages API <-> generateContent API
//!
//! Gemini carries the model in the URL, so request bodies going to it have
//! no `model` field; the router substitutes `{model}` instead.

use super::{
    carry_unknown, flatten_text, insert_if_present, known_request_fields, known_response_fields,
};
use crate::providers::constants::{defaults, json_fields};
use crate::providers::WireFormat;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub(super) fn request_from_anthropic(body: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    // tool_result blocks reference calls by id; Gemini matches them by name
    let mut tool_names: HashMap<String, Value> = HashMap::new();
    let mut contents = Vec::new();
    for message in body
        .get(json_fields::MESSAGES)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = match message.get(json_fields::ROLE).and_then(Value::as_str) {
            Some("assistant") => "model",
            _ => "user",
        };
        let parts: Vec<Value> = match message.get(json_fields::CONTENT) {
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|block| block_to_part(block, &mut tool_names))
                .collect(),
            Some(other) => vec![json!({"text": flatten_text(other)})],
            None => Vec::new(),
        };
        if !parts.is_empty() {
            contents.push(json!({"role": role, "parts": parts}));
        }
    }
    out.insert("contents".to_string(), Value::Array(contents));

    if let Some(system) = body.get("system") {
        let text = flatten_text(system);
        if !text.is_empty() {
            out.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": text}]}),
            );
        }
    }

    let mut generation = Map::new();
    insert_if_present(body, "max_tokens", &mut generation, "maxOutputTokens");
    insert_if_present(body, "temperature", &mut generation, "temperature");
    insert_if_present(body, "top_p", &mut generation, "topP");
    insert_if_present(body, "top_k", &mut generation, "topK");
    insert_if_present(body, "stop_sequences", &mut generation, "stopSequences");
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool["name"],
                    "description": tool.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": tool.get("input_schema").cloned().unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect();
        out.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
    }
    if let Some(choice) = body.get("tool_choice") {
        let config = match choice.get(json_fields::TYPE).and_then(Value::as_str) {
            Some("any") => json!({"mode": "ANY"}),
            Some("none") => json!({"mode": "NONE"}),
            Some("tool") => json!({"mode": "ANY", "allowedFunctionNames": [choice["name"]]}),
            _ => json!({"mode": "AUTO"}),
        };
        out.insert(
            "toolConfig".to_string(),
            json!({"functionCallingConfig": config}),
        );
    }

    carry_unknown(body, known_request_fields(WireFormat::Anthropic), &mut out);
    Value::Object(out)
}

fn block_to_part(block: &Value, tool_names: &mut HashMap<String, Value>) -> Option<Value> {
    match block.get(json_fields::TYPE).and_then(Value::as_str)? {
        "text" => Some(json!({"text": block[json_fields::TEXT]})),
        "image" => {
            let source = block.get("source")?;
            match source.get(json_fields::TYPE).and_then(Value::as_str)? {
                "base64" => Some(json!({
                    "inlineData": {"mimeType": source["media_type"], "data": source["data"]}
                })),
                "url" => Some(json!({"fileData": {"fileUri": source["url"]}})),
                _ => None,
            }
        }
        "tool_use" => {
            if let Some(id) = block.get("id").and_then(Value::as_str) {
                tool_names.insert(id.to_string(), block["name"].clone());
            }
            Some(json!({
                "functionCall": {
                    "name": block["name"],
                    "args": block.get("input").cloned().unwrap_or_else(|| json!({})),
                }
            }))
        }
        "tool_result" => {
            let id = block.get("tool_use_id").and_then(Value::as_str).unwrap_or_default();
            let name = tool_names
                .get(id)
                .cloned()
                .unwrap_or_else(|| Value::String(id.to_string()));
            Some(json!({
                "functionResponse": {
                    "name": name,
                    "response": {"content": flatten_text(&block[json_fields::CONTENT])},
                }
            }))
        }
        _ => None,
    }
}

pub(super) fn request_to_anthropic(body: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    let mut ids = ToolIds::default();
    let mut messages = Vec::new();
    for content in body
        .get("contents")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = match content.get(json_fields::ROLE).and_then(Value::as_str) {
            Some("model") => "assistant",
            _ => "user",
        };
        let blocks: Vec<Value> = content
            .get("parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|part| part_to_block(part, &mut ids))
            .collect();
        messages.push(json!({"role": role, "content": blocks}));
    }
    out.insert(json_fields::MESSAGES.to_string(), Value::Array(messages));

    let system = body
        .get("systemInstruction")
        .or_else(|| body.get("system_instruction"));
    if let Some(parts) = system.and_then(|s| s.get("parts")) {
        let text = flatten_text(parts);
        if !text.is_empty() {
            out.insert("system".to_string(), Value::String(text));
        }
    }

    let generation = body
        .get("generationConfig")
        .or_else(|| body.get("generation_config"))
        .and_then(Value::as_object);
    let max_tokens = generation
        .and_then(|g| g.get("maxOutputTokens"))
        .cloned()
        .unwrap_or_else(|| json!(defaults::MAX_TOKENS));
    out.insert("max_tokens".to_string(), max_tokens);
    if let Some(generation) = generation {
        insert_if_present(generation, "temperature", &mut out, "temperature");
        insert_if_present(generation, "topP", &mut out, "top_p");
        insert_if_present(generation, "topK", &mut out, "top_k");
        insert_if_present(generation, "stopSequences", &mut out, "stop_sequences");
    }

    let tools: Vec<Value> = body
        .get("tools")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|tool| tool.get("functionDeclarations").and_then(Value::as_array))
        .flatten()
        .map(|declaration| {
            json!({
                "name": declaration["name"],
                "description": declaration.get("description").cloned().unwrap_or(Value::Null),
                "input_schema": declaration.get("parameters").cloned().unwrap_or_else(|| json!({"type": "object"})),
            })
        })
        .collect();
    if !tools.is_empty() {
        out.insert("tools".to_string(), Value::Array(tools));
    }

    carry_unknown(body, known_request_fields(WireFormat::Gemini), &mut out);
    Value::Object(out)
}

/// Deterministic ids for function calls, which Gemini leaves unnamed
#[derive(Default)]
struct ToolIds {
    next: usize,
    last_by_name: HashMap<String, String>,
}

impl ToolIds {
    fn issue(&mut self, name: &str) -> String {
        self.next += 1;
        let id = format!("toolu_{:04}", self.next);
        self.last_by_name.insert(name.to_string(), id.clone());
        id
    }

    fn lookup(&self, name: &str) -> String {
        self.last_by_name
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

fn part_to_block(part: &Value, ids: &mut ToolIds) -> Option<Value> {
    if let Some(text) = part.get(json_fields::TEXT) {
        return Some(json!({"type": "text", "text": text}));
    }
    if let Some(inline) = part.get("inlineData") {
        return Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": inline["mimeType"], "data": inline["data"]}
        }));
    }
    if let Some(file) = part.get("fileData") {
        return Some(json!({"type": "image", "source": {"type": "url", "url": file["fileUri"]}}));
    }
    if let Some(call) = part.get("functionCall") {
        let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
        return Some(json!({
            "type": "tool_use",
            "id": ids.issue(name),
            "name": name,
            "input": call.get("args").cloned().unwrap_or_else(|| json!({})),
        }));
    }
    if let Some(response) = part.get("functionResponse") {
        let name = response.get("name").and_then(Value::as_str).unwrap_or_default();
        let content = response
            .pointer("/response/content")
            .map(flatten_text)
            .unwrap_or_else(|| response.get("response").map(Value::to_string).unwrap_or_default());
        return Some(json!({
            "type": "tool_result",
            "tool_use_id": ids.lookup(name),
            "content": content,
        }));
    }
    None
}

pub(super) fn response_to_anthropic(body: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    if let Some(error) = body.get(json_fields::ERROR).filter(|e| e.is_object()) {
        let kind = error
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .unwrap_or_else(|| "api_error".to_string());
        out.insert(json_fields::TYPE.to_string(), json!("error"));
        out.insert(
            json_fields::ERROR.to_string(),
            json!({"type": kind, "message": error.get("message").cloned().unwrap_or(Value::Null)}),
        );
        carry_unknown(body, known_response_fields(WireFormat::Gemini), &mut out);
        return Value::Object(out);
    }

    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    let mut ids = ToolIds::default();
    let content: Vec<Value> = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|part| part_to_block(part, &mut ids))
        .collect();
    let called_tool = content.iter().any(|b| b[json_fields::TYPE] == "tool_use");

    let stop_reason = match candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
    {
        _ if called_tool => json!("tool_use"),
        Some("MAX_TOKENS") => json!("max_tokens"),
        Some(_) => json!("end_turn"),
        None => Value::Null,
    };

    out.insert(
        json_fields::ID.to_string(),
        body.get("responseId").cloned().unwrap_or_else(|| json!("msg_bridge")),
    );
    out.insert(json_fields::TYPE.to_string(), json!("message"));
    out.insert(json_fields::ROLE.to_string(), json!("assistant"));
    insert_if_present(body, "modelVersion", &mut out, json_fields::MODEL);
    out.insert(json_fields::CONTENT.to_string(), Value::Array(content));
    out.insert("stop_reason".to_string(), stop_reason);
    out.insert("stop_sequence".to_string(), Value::Null);

    if let Some(usage) = body.get("usageMetadata") {
        out.insert(
            json_fields::USAGE.to_string(),
            json!({
                "input_tokens": usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
                "output_tokens": usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0),
            }),
        );
    }

    carry_unknown(body, known_response_fields(WireFormat::Gemini), &mut out);
    Value::Object(out)
}

pub(super) fn response_from_anthropic(body: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    if body.get(json_fields::TYPE).and_then(Value::as_str) == Some("error") {
        let error = body.get(json_fields::ERROR).cloned().unwrap_or_else(|| json!({}));
        out.insert(
            json_fields::ERROR.to_string(),
            json!({
                "code": 500,
                "message": error.get("message").cloned().unwrap_or(Value::Null),
                "status": error
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_uppercase)
                    .unwrap_or_else(|| "INTERNAL".to_string()),
            }),
        );
        carry_unknown(body, known_response_fields(WireFormat::Anthropic), &mut out);
        return Value::Object(out);
    }

    let mut tool_names = HashMap::new();
    let parts: Vec<Value> = body
        .get(json_fields::CONTENT)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|block| block_to_part(block, &mut tool_names))
        .collect();

    let finish_reason = match body.get("stop_reason").and_then(Value::as_str) {
        Some("max_tokens") => "MAX_TOKENS",
        _ => "STOP",
    };

    out.insert(
        "candidates".to_string(),
        json!([{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish_reason,
            "index": 0,
        }]),
    );
    if let Some(usage) = body.get(json_fields::USAGE) {
        let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
        out.insert(
            "usageMetadata".to_string(),
            json!({
                "promptTokenCount": input,
                "candidatesTokenCount": output,
                "totalTokenCount": input + output,
            }),
        );
    }
    insert_if_present(body, json_fields::MODEL, &mut out, "modelVersion");
    insert_if_present(body, json_fields::ID, &mut out, "responseId");

    carry_unknown(body, known_response_fields(WireFormat::Anthropic), &mut out);
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_anthropic_request_to_gemini() {
        let body = object(json!({
            "model": "gemini-1.5-pro",
            "system": "Answer in French.",
            "max_tokens": 100,
            "top_k": 3,
            "messages": [
                {"role": "user", "content": "Bonjour"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "lookup", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "found"}
                ]}
            ],
            "tools": [{"name": "lookup", "input_schema": {"type": "object"}}]
        }));

        let out = request_from_anthropic(&body);

        assert!(out.get("model").is_none());
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "Answer in French.");
        assert_eq!(out["generationConfig"], json!({"maxOutputTokens": 100, "topK": 3}));
        assert_eq!(out["contents"][1]["role"], "model");
        assert_eq!(out["contents"][1]["parts"][0]["functionCall"]["name"], "lookup");
        assert_eq!(out["contents"][2]["parts"][0]["functionResponse"]["name"], "lookup");
        assert_eq!(out["tools"][0]["functionDeclarations"][0]["name"], "lookup");
    }

    #[test]
    fn test_gemini_request_to_anthropic() {
        let body = object(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {"a": 1}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "f", "response": {"content": "ok"}}}]}
            ],
            "systemInstruction": {"parts": [{"text": "sys"}]},
            "safetySettings": []
        }));

        let out = request_to_anthropic(&body);

        assert_eq!(out["system"], "sys");
        assert_eq!(out["max_tokens"], defaults::MAX_TOKENS);
        assert_eq!(out["messages"][1]["content"][0]["id"], "toolu_0001");
        assert_eq!(out["messages"][2]["content"][0]["tool_use_id"], "toolu_0001");
        assert!(out.get("safetySettings").is_none());
    }

    #[test]
    fn test_gemini_response_to_anthropic() {
        let body = object(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Salut"}]}, "finishReason": "MAX_TOKENS"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6},
            "modelVersion": "gemini-1.5-pro-002",
            "x_debug": 1
        }));

        let out = response_to_anthropic(&body);

        assert_eq!(out["content"], json!([{"type": "text", "text": "Salut"}]));
        assert_eq!(out["stop_reason"], "max_tokens");
        assert_eq!(out["model"], "gemini-1.5-pro-002");
        assert_eq!(out["usage"]["input_tokens"], 4);
        assert_eq!(out["x_debug"], 1);
    }

    #[test]
    fn test_gemini_error_to_anthropic() {
        let body = object(json!({"error": {"code": 403, "message": "denied", "status": "PERMISSION_DENIED"}}));
        let out = response_to_anthropic(&body);

        assert_eq!(out["type"], "error");
        assert_eq!(out["error"]["type"], "permission_denied");
    }
}
