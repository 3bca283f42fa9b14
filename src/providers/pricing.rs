//! Token usage extraction and cost estimation

use crate::providers::WireFormat;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counts reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Read usage from a response body in the given format
    pub fn from_response(format: WireFormat, body: &Value) -> Option<Self> {
        let (usage, input, output) = match format {
            WireFormat::Anthropic => (body.get("usage")?, "input_tokens", "output_tokens"),
            WireFormat::OpenAi => (body.get("usage")?, "prompt_tokens", "completion_tokens"),
            WireFormat::Gemini => (
                body.get("usageMetadata")?,
                "promptTokenCount",
                "candidatesTokenCount",
            ),
        };
        Some(Self {
            input_tokens: usage.get(input).and_then(Value::as_u64).unwrap_or(0),
            output_tokens: usage.get(output).and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

/// USD price per thousand tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

/// (model substring, input mantissa, output mantissa) at scale 6
const PRICE_TABLE: &[(&str, i64, i64)] = &[
    ("opus", 15_000, 75_000),
    ("sonnet", 3_000, 15_000),
    ("haiku", 250, 1_250),
    ("gpt-4o-mini", 150, 600),
    ("gpt-4o", 2_500, 10_000),
    ("gpt-4", 30_000, 60_000),
    ("gpt-3.5", 500, 1_500),
    ("gemini-1.5-flash", 75, 300),
    ("gemini", 1_250, 5_000),
    ("deepseek", 140, 280),
];

impl ModelPricing {
    /// First table entry whose substring occurs in `model`
    pub fn for_model(model: &str) -> Option<Self> {
        let model = model.to_lowercase();
        PRICE_TABLE
            .iter()
            .find(|(needle, _, _)| model.contains(needle))
            .map(|(_, input, output)| Self {
                input_per_1k: Decimal::new(*input, 6),
                output_per_1k: Decimal::new(*output, 6),
            })
    }

    pub fn calculate_cost(&self, usage: TokenUsage) -> Decimal {
        let thousand = Decimal::from(1000);
        let input = Decimal::from(usage.input_tokens) / thousand * self.input_per_1k;
        let output = Decimal::from(usage.output_tokens) / thousand * self.output_per_1k;
        (input + output).round_dp(6)
    }
}

/// Cost of `usage` on `model`; unknown models are free
pub fn estimate_cost(model: &str, usage: TokenUsage) -> Decimal {
    ModelPricing::for_model(model)
        .map(|pricing| pricing.calculate_cost(usage))
        .unwrap_or(Decimal::ZERO)
}
