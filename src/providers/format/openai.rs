//! Messages API <-> Chat Completions API

use super::{
    carry_unknown, flatten_text, insert_if_present, known_request_fields, known_response_fields,
    ModelMap,
};
use crate::providers::constants::{defaults, json_fields};
use crate::providers::WireFormat;
use serde_json::{json, Map, Value};

pub(super) fn request_from_anthropic(body: &Map<String, Value>, models: &ModelMap) -> Value {
    let mut out = Map::new();

    if let Some(model) = body.get(json_fields::MODEL) {
        out.insert(json_fields::MODEL.to_string(), models.apply(model));
    }

    let mut messages = Vec::new();
    if let Some(system) = body.get("system") {
        let text = flatten_text(system);
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }
    for message in body
        .get(json_fields::MESSAGES)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        push_openai_messages(message, &mut messages);
    }
    out.insert(json_fields::MESSAGES.to_string(), Value::Array(messages));

    insert_if_present(body, "max_tokens", &mut out, "max_tokens");
    insert_if_present(body, "temperature", &mut out, "temperature");
    insert_if_present(body, "top_p", &mut out, "top_p");
    insert_if_present(body, "stop_sequences", &mut out, "stop");
    insert_if_present(body, json_fields::STREAM, &mut out, json_fields::STREAM);

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool["name"],
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned().unwrap_or_else(|| json!({"type": "object"})),
                    }
                })
            })
            .collect();
        out.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = body.get("tool_choice") {
        out.insert("tool_choice".to_string(), tool_choice_to_openai(choice));
    }
    if let Some(user_id) = body.get("metadata").and_then(|m| m.get("user_id")) {
        out.insert("user".to_string(), user_id.clone());
    }

    carry_unknown(body, known_request_fields(WireFormat::Anthropic), &mut out);
    Value::Object(out)
}

fn push_openai_messages(message: &Value, out: &mut Vec<Value>) {
    let role = message
        .get(json_fields::ROLE)
        .and_then(Value::as_str)
        .unwrap_or("user");

    let Some(blocks) = message.get(json_fields::CONTENT).and_then(Value::as_array) else {
        out.push(json!({
            "role": role,
            "content": message.get(json_fields::CONTENT).cloned().unwrap_or(Value::Null),
        }));
        return;
    };

    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get(json_fields::TYPE).and_then(Value::as_str) {
            Some("text") => parts.push(json!({"type": "text", "text": block[json_fields::TEXT]})),
            Some("image") => {
                if let Some(url) = image_url(&block["source"]) {
                    parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
            }
            Some("tool_use") => tool_calls.push(json!({
                "id": block["id"],
                "type": "function",
                "function": {
                    "name": block["name"],
                    "arguments": block.get("input").map_or_else(|| "{}".to_string(), Value::to_string),
                }
            })),
            // Tool results precede the rest of the turn in Chat Completions
            Some("tool_result") => out.push(json!({
                "role": "tool",
                "tool_call_id": block["tool_use_id"],
                "content": flatten_text(&block[json_fields::CONTENT]),
            })),
            _ => {}
        }
    }

    if parts.is_empty() && tool_calls.is_empty() {
        return;
    }
    let mut converted = Map::new();
    converted.insert(json_fields::ROLE.to_string(), Value::String(role.to_string()));
    converted.insert(json_fields::CONTENT.to_string(), parts_to_content(parts));
    if !tool_calls.is_empty() {
        converted.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    out.push(Value::Object(converted));
}

fn parts_to_content(parts: Vec<Value>) -> Value {
    if parts.is_empty() {
        return Value::Null;
    }
    if parts.iter().all(|p| p[json_fields::TYPE] == "text") {
        let text: Vec<&str> = parts
            .iter()
            .filter_map(|p| p[json_fields::TEXT].as_str())
            .collect();
        return Value::String(text.join("\n"));
    }
    Value::Array(parts)
}

fn image_url(source: &Value) -> Option<String> {
    match source.get(json_fields::TYPE).and_then(Value::as_str)? {
        "base64" => Some(format!(
            "data:{};base64,{}",
            source.get("media_type").and_then(Value::as_str).unwrap_or("image/png"),
            source.get("data").and_then(Value::as_str).unwrap_or_default()
        )),
        "url" => source.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn image_source(url: &str) -> Value {
    match url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        Some((media_type, data)) => json!({"type": "base64", "media_type": media_type, "data": data}),
        None => json!({"type": "url", "url": url}),
    }
}

fn tool_choice_to_openai(choice: &Value) -> Value {
    match choice.get(json_fields::TYPE).and_then(Value::as_str) {
        Some("auto") => json!("auto"),
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => json!({"type": "function", "function": {"name": choice["name"]}}),
        _ => choice.clone(),
    }
}

fn tool_choice_to_anthropic(choice: &Value) -> Value {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "required" => json!({"type": "any"}),
            "none" => json!({"type": "none"}),
            _ => json!({"type": "auto"}),
        },
        other => match other.pointer("/function/name") {
            Some(name) => json!({"type": "tool", "name": name}),
            None => json!({"type": "auto"}),
        },
    }
}

pub(super) fn request_to_anthropic(body: &Map<String, Value>, models: &ModelMap) -> Value {
    let mut out = Map::new();

    if let Some(model) = body.get(json_fields::MODEL) {
        out.insert(json_fields::MODEL.to_string(), models.apply(model));
    }

    let mut system = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    for message in body
        .get(json_fields::MESSAGES)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let content = message.get(json_fields::CONTENT).unwrap_or(&Value::Null);
        match message.get(json_fields::ROLE).and_then(Value::as_str) {
            Some("system") | Some("developer") => system.push(flatten_text(content)),
            Some("tool") => push_user_blocks(
                &mut messages,
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": message["tool_call_id"],
                    "content": flatten_text(content),
                })],
            ),
            Some("assistant") => messages.push(assistant_to_anthropic(message, content)),
            _ => match content {
                Value::Array(parts) => {
                    let blocks = parts.iter().filter_map(part_to_block).collect();
                    messages.push(json!({"role": "user", "content": Value::Array(blocks)}));
                }
                other => messages.push(json!({"role": "user", "content": other})),
            },
        }
    }

    if !system.is_empty() {
        out.insert("system".to_string(), Value::String(system.join("\n")));
    }
    out.insert(json_fields::MESSAGES.to_string(), Value::Array(messages));

    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .filter(|v| !v.is_null())
        .cloned()
        .unwrap_or_else(|| json!(defaults::MAX_TOKENS));
    out.insert("max_tokens".to_string(), max_tokens);

    insert_if_present(body, "temperature", &mut out, "temperature");
    insert_if_present(body, "top_p", &mut out, "top_p");
    insert_if_present(body, json_fields::STREAM, &mut out, json_fields::STREAM);
    match body.get("stop") {
        Some(Value::String(stop)) => {
            out.insert("stop_sequences".to_string(), json!([stop]));
        }
        Some(Value::Array(stops)) => {
            out.insert("stop_sequences".to_string(), Value::Array(stops.clone()));
        }
        _ => {}
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let function = tool.get("function").unwrap_or(tool);
                json!({
                    "name": function["name"],
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": function.get("parameters").cloned().unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect();
        out.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = body.get("tool_choice") {
        out.insert("tool_choice".to_string(), tool_choice_to_anthropic(choice));
    }
    if let Some(user) = body.get("user") {
        out.insert("metadata".to_string(), json!({"user_id": user}));
    }

    carry_unknown(body, known_request_fields(WireFormat::OpenAi), &mut out);
    Value::Object(out)
}

fn assistant_to_anthropic(message: &Value, content: &Value) -> Value {
    let mut blocks = Vec::new();
    let text = flatten_text(content);
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let input = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .and_then(|args| serde_json::from_str::<Value>(args).ok())
            .unwrap_or_else(|| json!({}));
        blocks.push(json!({
            "type": "tool_use",
            "id": call["id"],
            "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
            "input": input,
        }));
    }
    json!({"role": "assistant", "content": blocks})
}

fn part_to_block(part: &Value) -> Option<Value> {
    match part.get(json_fields::TYPE).and_then(Value::as_str)? {
        "text" => Some(json!({"type": "text", "text": part[json_fields::TEXT]})),
        "image_url" => {
            let url = part.pointer("/image_url/url").and_then(Value::as_str)?;
            Some(json!({"type": "image", "source": image_source(url)}))
        }
        _ => None,
    }
}

/// Tool results from consecutive tool messages share one user turn
fn push_user_blocks(messages: &mut Vec<Value>, blocks: Vec<Value>) {
    if let Some(last) = messages.last_mut() {
        let is_tool_turn = last[json_fields::ROLE] == "user"
            && last[json_fields::CONTENT]
                .as_array()
                .is_some_and(|c| c.iter().all(|b| b[json_fields::TYPE] == "tool_result"));
        if is_tool_turn {
            if let Some(content) = last[json_fields::CONTENT].as_array_mut() {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(json!({"role": "user", "content": blocks}));
}

fn finish_reason_from_stop(stop_reason: Option<&str>) -> Value {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => json!("stop"),
        Some("max_tokens") => json!("length"),
        Some("tool_use") => json!("tool_calls"),
        Some(other) => json!(other),
        None => Value::Null,
    }
}

fn stop_reason_from_finish(finish_reason: Option<&str>) -> Value {
    match finish_reason {
        Some("length") => json!("max_tokens"),
        Some("tool_calls") | Some("function_call") => json!("tool_use"),
        Some(_) => json!("end_turn"),
        None => Value::Null,
    }
}

pub(super) fn response_to_anthropic(body: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    if let Some(error) = body.get(json_fields::ERROR).filter(|e| e.is_object()) {
        out.insert(json_fields::TYPE.to_string(), json!("error"));
        out.insert(
            json_fields::ERROR.to_string(),
            json!({
                "type": error.get("type").cloned().unwrap_or_else(|| json!("api_error")),
                "message": error.get("message").cloned().unwrap_or(Value::Null),
            }),
        );
        carry_unknown(body, known_response_fields(WireFormat::OpenAi), &mut out);
        return Value::Object(out);
    }

    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    let message = choice.and_then(|c| c.get(json_fields::MESSAGE));
    let content = match message {
        Some(message) => assistant_to_anthropic(message, message.get(json_fields::CONTENT).unwrap_or(&Value::Null))
            [json_fields::CONTENT]
            .clone(),
        None => json!([]),
    };

    out.insert(
        json_fields::ID.to_string(),
        body.get(json_fields::ID).cloned().unwrap_or_else(|| json!("msg_bridge")),
    );
    out.insert(json_fields::TYPE.to_string(), json!("message"));
    out.insert(json_fields::ROLE.to_string(), json!("assistant"));
    insert_if_present(body, json_fields::MODEL, &mut out, json_fields::MODEL);
    out.insert(json_fields::CONTENT.to_string(), content);
    out.insert(
        "stop_reason".to_string(),
        stop_reason_from_finish(
            choice
                .and_then(|c| c.get("finish_reason"))
                .and_then(Value::as_str),
        ),
    );
    out.insert("stop_sequence".to_string(), Value::Null);

    if let Some(usage) = body.get(json_fields::USAGE) {
        out.insert(
            json_fields::USAGE.to_string(),
            json!({
                "input_tokens": usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                "output_tokens": usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            }),
        );
    }

    carry_unknown(body, known_response_fields(WireFormat::OpenAi), &mut out);
    Value::Object(out)
}

pub(super) fn response_from_anthropic(body: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    if body.get(json_fields::TYPE).and_then(Value::as_str) == Some("error") {
        let error = body.get(json_fields::ERROR).cloned().unwrap_or_else(|| json!({}));
        out.insert(
            json_fields::ERROR.to_string(),
            json!({
                "message": error.get("message").cloned().unwrap_or(Value::Null),
                "type": error.get("type").cloned().unwrap_or_else(|| json!("api_error")),
                "code": Value::Null,
            }),
        );
        carry_unknown(body, known_response_fields(WireFormat::Anthropic), &mut out);
        return Value::Object(out);
    }

    let blocks = body
        .get(json_fields::CONTENT)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let text: String = blocks
        .iter()
        .filter(|b| b[json_fields::TYPE] == "text")
        .filter_map(|b| b[json_fields::TEXT].as_str())
        .collect();
    let tool_calls: Vec<Value> = blocks
        .iter()
        .filter(|b| b[json_fields::TYPE] == "tool_use")
        .map(|b| {
            json!({
                "id": b["id"],
                "type": "function",
                "function": {
                    "name": b["name"],
                    "arguments": b.get("input").map_or_else(|| "{}".to_string(), Value::to_string),
                }
            })
        })
        .collect();

    let mut message = Map::new();
    message.insert(json_fields::ROLE.to_string(), json!("assistant"));
    message.insert(
        json_fields::CONTENT.to_string(),
        if text.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        },
    );
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    insert_if_present(body, json_fields::ID, &mut out, json_fields::ID);
    out.insert("object".to_string(), json!("chat.completion"));
    out.insert("created".to_string(), json!(0));
    insert_if_present(body, json_fields::MODEL, &mut out, json_fields::MODEL);
    out.insert(
        "choices".to_string(),
        json!([{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason_from_stop(body.get("stop_reason").and_then(Value::as_str)),
        }]),
    );

    if let Some(usage) = body.get(json_fields::USAGE) {
        let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
        out.insert(
            json_fields::USAGE.to_string(),
            json!({
                "prompt_tokens": input,
                "completion_tokens": output,
                "total_tokens": input + output,
            }),
        );
    }

    carry_unknown(body, known_response_fields(WireFormat::Anthropic), &mut out);
    Value::Object(out)
}
