//! Token pricing

use conduit_core::UsdMicros;
use conduit_store::{ModelPricing, TokenCounts};

/// Cost of `tokens` at `pricing`, before any multiplier
///
/// Cached counts are billed at the cache prices and capped at their totals;
/// the remainder bills at the regular prices. Each term truncates to whole
/// micro-USD on its own.
pub fn cost(pricing: &ModelPricing, tokens: &TokenCounts) -> UsdMicros {
    let input = tokens.input.max(0);
    let output = tokens.output.max(0);
    let cached_input = tokens.cached_input.clamp(0, input);
    let cached_output = tokens.cached_output.clamp(0, output);

    UsdMicros::per_million(input - cached_input, pricing.input_per_million)
        + UsdMicros::per_million(output - cached_output, pricing.output_per_million)
        + UsdMicros::per_million(cached_input, pricing.cache_input_per_million)
        + UsdMicros::per_million(cached_output, pricing.cache_output_per_million)
}

/// Upper-bound cost of a request that has not run yet
pub fn estimate(pricing: &ModelPricing, input_tokens: i64, max_output_tokens: i64) -> UsdMicros {
    cost(
        pricing,
        &TokenCounts {
            input: input_tokens,
            output: max_output_tokens,
            ..TokenCounts::default()
        },
    )
}
