//! Re-emits a complete Messages API response as a server-sent event stream
//!
//! Used when a client asked for `stream: true` but the upstream was called
//! without streaming because its format differs.

use crate::providers::constants::json_fields;
use serde_json::{json, Value};
use std::fmt::Write;

fn push_event(out: &mut String, name: &str, data: &Value) {
    // Writing into a String cannot fail
    let _ = write!(out, "event: {name}\ndata: {data}\n\n");
}

/// Full SSE body for one message, from `message_start` to `message_stop`
pub fn anthropic_message_to_sse(message: &Value) -> String {
    let mut out = String::new();
    let input_tokens = message
        .pointer("/usage/input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = message
        .pointer("/usage/output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    push_event(
        &mut out,
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": message.get(json_fields::ID).cloned().unwrap_or_else(|| json!("msg_bridge")),
                "type": "message",
                "role": "assistant",
                "model": message.get(json_fields::MODEL).cloned().unwrap_or(Value::Null),
                "content": [],
                "stop_reason": Value::Null,
                "stop_sequence": Value::Null,
                "usage": {"input_tokens": input_tokens, "output_tokens": 0},
            }
        }),
    );

    let blocks = message
        .get(json_fields::CONTENT)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for (index, block) in blocks.iter().enumerate() {
        let (start, delta) = match block.get(json_fields::TYPE).and_then(Value::as_str) {
            Some("tool_use") => (
                json!({"type": "tool_use", "id": block["id"], "name": block["name"], "input": {}}),
                json!({
                    "type": "input_json_delta",
                    "partial_json": block.get("input").map_or_else(|| "{}".to_string(), Value::to_string),
                }),
            ),
            _ => (
                json!({"type": "text", "text": ""}),
                json!({"type": "text_delta", "text": block.get(json_fields::TEXT).cloned().unwrap_or_else(|| json!(""))}),
            ),
        };
        push_event(
            &mut out,
            "content_block_start",
            &json!({"type": "content_block_start", "index": index, "content_block": start}),
        );
        push_event(
            &mut out,
            "content_block_delta",
            &json!({"type": "content_block_delta", "index": index, "delta": delta}),
        );
        push_event(
            &mut out,
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": index}),
        );
    }

    push_event(
        &mut out,
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": message.get("stop_reason").cloned().unwrap_or_else(|| json!("end_turn")),
                "stop_sequence": Value::Null,
            },
            "usage": {"output_tokens": output_tokens},
        }),
    );
    push_event(&mut out, "message_stop", &json!({"type": "message_stop"}));
    out
}
