//! Telemetry
//!
//! Attribute keys for the adapter spans, plus helpers that record
//! turn results on the current span. Subscriber and exporter setup belong to
//! the embedding application.
//!
//! ## Span Hierarchy
//!
//! ```text
//! a3s.local_model.turn
//!   +-- a3s.local_model.transport.send
//!   +-- a3s.local_model.permission (repeated)
//! ```

use crate::metrics::UsageStats;

// Attribute keys recorded after a span opens; each must be declared as an
// empty field where the span is created
pub const ATTR_TOOL_CALLS_COUNT: &str = "a3s.local_model.tool_calls_count";

pub const ATTR_INPUT_TOKENS: &str = "a3s.llm.prompt_tokens";
pub const ATTR_OUTPUT_TOKENS: &str = "a3s.llm.completion_tokens";
pub const ATTR_TOTAL_TOKENS: &str = "a3s.llm.total_tokens";
pub const ATTR_COST_USD: &str = "a3s.llm.cost_usd";
pub const ATTR_STOP_REASON: &str = "a3s.llm.stop_reason";

pub const ATTR_TOOL_PERMISSION: &str = "a3s.tool.permission";

/// Record reported token counters on the current span
///
/// Absent counters are left unrecorded rather than written as zero.
pub fn record_turn_usage(usage: &UsageStats) {
    let span = tracing::Span::current();
    if let Some(input) = usage.input_tokens {
        span.record(ATTR_INPUT_TOKENS, input as i64);
    }
    if let Some(output) = usage.output_tokens {
        span.record(ATTR_OUTPUT_TOKENS, output as i64);
    }
    if let Some(total) = usage.total_tokens() {
        span.record(ATTR_TOTAL_TOKENS, total as i64);
    }
    if let Some(cost) = usage.total_cost_usd {
        span.record(ATTR_COST_USD, cost);
    }
}

/// Record how a finalized turn ended
pub fn record_turn_outcome(tool_calls: usize, stop_reason: Option<&str>) {
    let span = tracing::Span::current();
    span.record(ATTR_TOOL_CALLS_COUNT, tool_calls as i64);
    if let Some(reason) = stop_reason {
        span.record(ATTR_STOP_REASON, reason);
    }
}
