//! Advisory cost accounting.
//!
//! The price table is compiled in; changing prices means shipping a new
//! build. Cost is recorded for reporting, never enforced, so this stays a
//! pure function that cannot fail.

/// USD per one million tokens, input and output.
#[derive(Clone, Copy, Debug)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_million: 0.15,
    output_per_million: 0.60,
};

const PRICING: &[(&str, ModelPricing)] = &[
    (
        "gpt-4o-mini",
        ModelPricing {
            input_per_million: 0.15,
            output_per_million: 0.60,
        },
    ),
    (
        "gpt-4.1-mini",
        ModelPricing {
            input_per_million: 0.30,
            output_per_million: 1.20,
        },
    ),
    (
        "claude-3-5-sonnet",
        ModelPricing {
            input_per_million: 3.00,
            output_per_million: 15.00,
        },
    ),
];

pub fn pricing_for(model: &str) -> ModelPricing {
    PRICING
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, pricing)| *pricing)
        .unwrap_or(DEFAULT_PRICING)
}

/// Estimated USD cost of a completion, rounded half-away-from-zero to six
/// decimal places. Unknown models fall back to the cheapest tier.
pub fn estimate_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    let pricing = pricing_for(model);
    let cost = f64::from(prompt_tokens) / 1_000_000.0 * pricing.input_per_million
        + f64::from(completion_tokens) / 1_000_000.0 * pricing.output_per_million;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_uses_table_rates() {
        // 10 prompt + 20 completion on gpt-4o-mini: 1.5e-6 + 1.2e-5, rounded
        // up at the sixth decimal.
        assert_eq!(estimate_cost("gpt-4o-mini", 10, 20), 0.000014);
    }

    #[test]
    fn unknown_model_falls_back_to_cheapest_tier() {
        assert_eq!(
            estimate_cost("some-new-model", 10, 20),
            estimate_cost("gpt-4o-mini", 10, 20)
        );
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(estimate_cost("claude-3-5-sonnet", 0, 0), 0.0);
    }

    #[test]
    fn rounding_is_to_six_decimals() {
        // 1M prompt tokens on claude-3-5-sonnet is exactly 3 USD.
        assert_eq!(estimate_cost("claude-3-5-sonnet", 1_000_000, 0), 3.0);
        // A single input token (3e-6) survives rounding.
        assert_eq!(estimate_cost("claude-3-5-sonnet", 1, 0), 0.000003);
    }
}
