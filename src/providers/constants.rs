//! Constants for wire-format handling
//!
//! Field names that the converters treat as part of each vendor's schema.
//! Anything outside these lists is carried through a conversion untouched.

/// JSON field names used across request and response bodies
pub mod json_fields {
    pub const MODEL: &str = "model";
    pub const MESSAGES: &str = "messages";
    pub const CONTENT: &str = "content";
    pub const ROLE: &str = "role";
    pub const TYPE: &str = "type";
    pub const TEXT: &str = "text";
    pub const STREAM: &str = "stream";
    pub const USAGE: &str = "usage";
    pub const ERROR: &str = "error";
    pub const MESSAGE: &str = "message";
    pub const ID: &str = "id";
}

/// Top-level fields owned by each schema
pub mod schema_fields {
    pub const ANTHROPIC_REQUEST: &[&str] = &[
        "model",
        "messages",
        "system",
        "max_tokens",
        "temperature",
        "top_p",
        "top_k",
        "stop_sequences",
        "stream",
        "tools",
        "tool_choice",
        "metadata",
        "thinking",
        "anthropic_version",
    ];

    pub const OPENAI_REQUEST: &[&str] = &[
        "model",
        "messages",
        "max_tokens",
        "max_completion_tokens",
        "temperature",
        "top_p",
        "stop",
        "stream",
        "stream_options",
        "tools",
        "tool_choice",
        "user",
        "n",
        "presence_penalty",
        "frequency_penalty",
        "logit_bias",
        "response_format",
        "seed",
        "parallel_tool_calls",
    ];

    pub const GEMINI_REQUEST: &[&str] = &[
        "contents",
        "systemInstruction",
        "system_instruction",
        "generationConfig",
        "generation_config",
        "tools",
        "toolConfig",
        "safetySettings",
        "cachedContent",
    ];

    pub const ANTHROPIC_RESPONSE: &[&str] = &[
        "id",
        "type",
        "role",
        "model",
        "content",
        "stop_reason",
        "stop_sequence",
        "usage",
        "error",
    ];

    pub const OPENAI_RESPONSE: &[&str] = &[
        "id",
        "object",
        "created",
        "model",
        "choices",
        "usage",
        "system_fingerprint",
        "service_tier",
        "error",
    ];

    pub const GEMINI_RESPONSE: &[&str] = &[
        "candidates",
        "usageMetadata",
        "modelVersion",
        "responseId",
        "promptFeedback",
        "error",
    ];
}

/// Values substituted when a target schema requires a field the source lacks
pub mod defaults {
    pub const MAX_TOKENS: u64 = 4096;
    pub const ANTHROPIC_VERSION: &str = "2023-06-01";
}
