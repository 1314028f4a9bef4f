//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// Verify periodically against OpenRouter model pages.
// Gemini 2.5 Flash: $0.30/1M input, $2.50/1M output
const GEMINI_25_FLASH: ModelPricing = ModelPricing::new(300, 2_500);
// Gemini 2.5 Flash Lite: $0.10/1M input, $0.40/1M output
const GEMINI_25_FLASH_LITE: ModelPricing = ModelPricing::new(100, 400);
// Gemini 2.5 Pro: $1.25/1M input, $10.00/1M output
const GEMINI_25_PRO: ModelPricing = ModelPricing::new(1_250, 10_000);
// GPT-5-mini: $0.25/1M input, $2.00/1M output
const GPT_5_MINI: ModelPricing = ModelPricing::new(250, 2_000);
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);
// Claude 3.5 Haiku: $0.80/1M input, $4.00/1M output
const CLAUDE_35_HAIKU: ModelPricing = ModelPricing::new(800, 4_000);

/// Fallback for unknown models: priced like a mid-range model so the
/// budget guard errs on the expensive side.
const UNKNOWN_MODEL: ModelPricing = ModelPricing::new(1_000, 5_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("google/gemini-2.5-flash", GEMINI_25_FLASH);
    map.insert("google/gemini-2.5-flash-lite", GEMINI_25_FLASH_LITE);
    map.insert("google/gemini-2.5-pro", GEMINI_25_PRO);
    map.insert("openai/gpt-5-mini", GPT_5_MINI);
    map.insert("openai/gpt-4o-mini", GPT_4O_MINI);
    map.insert("anthropic/claude-3-5-haiku", CLAUDE_35_HAIKU);

    map
}

pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    // The web plugin is also addressable as a ":online" model suffix.
    let base = model_id.strip_suffix(":online").unwrap_or(model_id);
    map.get(base).copied()
}

/// Calculate chat cost in nanodollars.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(UNKNOWN_MODEL)
        .calculate_cost(input_tokens, output_tokens)
}

/// Convert nanodollars to USD.
pub fn nanos_to_usd(nanos: i64) -> f64 {
    nanos as f64 / 1_000_000_000.0
}
