//! Usage accounting per turn and per session
//!
//! Every counter is optional: `None` means the backend did not report it,
//! which is distinct from a reported zero. Cumulative totals treat missing
//! counters as zero for summation but stay `None` when no turn reported them.

use serde::{Deserialize, Serialize};

/// Server-side tool usage counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerToolUse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_fetch_requests: Option<u64>,
}

impl ServerToolUse {
    fn accumulate(&mut self, other: &ServerToolUse) {
        self.web_search_requests = sum(self.web_search_requests, other.web_search_requests);
        self.web_fetch_requests = sum(self.web_fetch_requests, other.web_fetch_requests);
    }
}

/// Token, cost and timing counters reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_tool_use: Option<ServerToolUse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl UsageStats {
    /// Convenience constructor for the two headline counters
    pub fn tokens(input: u64, output: u64) -> Self {
        Self {
            input_tokens: Some(input),
            output_tokens: Some(output),
            ..Default::default()
        }
    }

    /// True when nothing was reported
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Input plus output tokens, if either was reported
    pub fn total_tokens(&self) -> Option<u64> {
        sum(self.input_tokens, self.output_tokens)
    }

    /// Add another turn's counters into this total
    pub fn accumulate(&mut self, other: &UsageStats) {
        self.input_tokens = sum(self.input_tokens, other.input_tokens);
        self.output_tokens = sum(self.output_tokens, other.output_tokens);
        self.cache_creation_input_tokens = sum(
            self.cache_creation_input_tokens,
            other.cache_creation_input_tokens,
        );
        self.cache_read_input_tokens =
            sum(self.cache_read_input_tokens, other.cache_read_input_tokens);
        self.duration_ms = sum(self.duration_ms, other.duration_ms);
        self.total_cost_usd = match (self.total_cost_usd, other.total_cost_usd) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
        if other.service_tier.is_some() {
            self.service_tier = other.service_tier.clone();
        }
        if let Some(other_tools) = &other.server_tool_use {
            self.server_tool_use
                .get_or_insert_with(ServerToolUse::default)
                .accumulate(other_tools);
        }
    }
}

fn sum(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
    }
}

/// Accumulates per-turn usage over the lifetime of a session
///
/// Only the latest snapshot and the running total are kept, so a
/// long-lived adapter holds constant state however many turns it runs.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    last: UsageStats,
    total: UsageStats,
    turns: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the usage snapshot of a finished turn
    pub fn record_turn(&mut self, usage: UsageStats) {
        self.total.accumulate(&usage);
        self.last = usage;
        self.turns += 1;
    }

    /// Usage of the most recent turn, empty before the first one
    pub fn last_turn(&self) -> UsageStats {
        self.last.clone()
    }

    pub fn turn_count(&self) -> usize {
        self.turns
    }

    /// Sum of all recorded turns
    pub fn cumulative(&self) -> UsageStats {
        self.total.clone()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_is_not_zero() {
        let usage = UsageStats::tokens(4, 1);
        assert_eq!(usage.cache_read_input_tokens, None);
        assert_eq!(usage.total_tokens(), Some(5));
        assert!(UsageStats::default().total_tokens().is_none());
    }

    #[test]
    fn test_cumulative_treats_missing_as_zero() {
        let mut collector = MetricsCollector::new();
        collector.record_turn(UsageStats {
            input_tokens: Some(10),
            output_tokens: Some(2),
            cache_read_input_tokens: Some(7),
            ..Default::default()
        });
        collector.record_turn(UsageStats {
            input_tokens: Some(5),
            output_tokens: None,
            total_cost_usd: Some(0.25),
            ..Default::default()
        });

        let total = collector.cumulative();
        assert_eq!(total.input_tokens, Some(15));
        assert_eq!(total.output_tokens, Some(2));
        assert_eq!(total.cache_read_input_tokens, Some(7));
        assert_eq!(total.cache_creation_input_tokens, None);
        assert_eq!(total.total_cost_usd, Some(0.25));

        // the latest snapshot keeps its gaps
        assert_eq!(collector.last_turn().output_tokens, None);
        assert_eq!(collector.last_turn().input_tokens, Some(5));
        assert_eq!(collector.turn_count(), 2);
    }

    #[test]
    fn test_service_tier_keeps_latest() {
        let mut total = UsageStats::default();
        total.accumulate(&UsageStats {
            service_tier: Some("standard".into()),
            ..Default::default()
        });
        total.accumulate(&UsageStats::tokens(1, 1));
        assert_eq!(total.service_tier.as_deref(), Some("standard"));
        total.accumulate(&UsageStats {
            service_tier: Some("priority".into()),
            ..Default::default()
        });
        assert_eq!(total.service_tier.as_deref(), Some("priority"));
    }

    #[test]
    fn test_server_tool_use_summed() {
        let turn = UsageStats {
            server_tool_use: Some(ServerToolUse {
                web_search_requests: Some(2),
                web_fetch_requests: None,
            }),
            ..Default::default()
        };
        let mut collector = MetricsCollector::new();
        collector.record_turn(turn.clone());
        collector.record_turn(turn);
        let tools = collector.cumulative().server_tool_use.unwrap();
        assert_eq!(tools.web_search_requests, Some(4));
        assert_eq!(tools.web_fetch_requests, None);
    }

    #[test]
    fn test_empty_collector() {
        let collector = MetricsCollector::new();
        assert!(collector.last_turn().is_empty());
        assert!(collector.cumulative().is_empty());
        assert_eq!(collector.turn_count(), 0);
    }

    #[test]
    fn test_many_turns_and_reset() {
        let mut collector = MetricsCollector::new();
        for _ in 0..10_000 {
            collector.record_turn(UsageStats::tokens(2, 1));
        }
        assert_eq!(collector.turn_count(), 10_000);
        assert_eq!(collector.cumulative().input_tokens, Some(20_000));
        assert_eq!(collector.last_turn(), UsageStats::tokens(2, 1));

        collector.reset();
        assert_eq!(collector.turn_count(), 0);
        assert!(collector.cumulative().is_empty());
        assert!(collector.last_turn().is_empty());
    }

    #[test]
    fn test_serialization_skips_absent_fields() {
        let json = serde_json::to_value(UsageStats::tokens(4, 1)).unwrap();
        assert_eq!(json, serde_json::json!({"input_tokens": 4, "output_tokens": 1}));
    }
}
