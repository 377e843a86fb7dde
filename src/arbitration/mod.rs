//! AI Arbitration
//!
//! Bounded, tool-augmented research loop that turns an AI-judged market into
//! a yes/no verdict, or an `UNRESOLVABLE` conclusion.

mod arbiter;
pub mod guard;
pub mod reasoning;
pub mod search;
pub mod session;
pub mod verdict;

pub use arbiter::{Arbiter, Verdict};
pub use reasoning::{ChatMessage, ModelTurn, OpenRouterClient, ReasoningService, ToolCall, ToolSpec};
pub use search::{GoogleSearchClient, SearchResult, WebSearch};
pub use session::{ArbitrationSession, Phase, Source};
pub use verdict::{parse_verdict, ResolutionStatus, VerdictPayload};

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Searches allowed per arbitration.
    pub search_budget: usize,
    /// Results kept per query after the blacklist.
    pub results_per_query: usize,
    /// Distinct sources reported with a verdict.
    pub max_sources: usize,
    pub call_timeout_ms: u64,
    pub model: String,
    pub temperature: f64,
    pub gather_max_tokens: u32,
    pub decide_max_tokens: u32,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            search_budget: 10,
            results_per_query: 8,
            max_sources: 10,
            call_timeout_ms: 30_000,
            model: "openai/gpt-4".to_string(),
            temperature: 0.1,
            gather_max_tokens: 4000,
            decide_max_tokens: 2000,
        }
    }
}

impl ArbitrationConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Wall-clock bound for a whole arbitration.
    pub fn loop_timeout(&self) -> Duration {
        let calls = u32::try_from(self.search_budget)
            .unwrap_or(u32::MAX)
            .saturating_add(2);
        self.call_timeout().saturating_mul(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_timeout_covers_budget_plus_two_calls() {
        let cfg = ArbitrationConfig {
            search_budget: 3,
            call_timeout_ms: 1_000,
            ..ArbitrationConfig::default()
        };
        assert_eq!(cfg.loop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_loop_timeout_saturates() {
        let cfg = ArbitrationConfig {
            search_budget: usize::MAX,
            ..ArbitrationConfig::default()
        };
        // 30s * u32::MAX still fits; it must not wrap to a short timeout
        assert_eq!(cfg.loop_timeout(), Duration::from_secs(30 * u64::from(u32::MAX)));

        let cfg = ArbitrationConfig {
            search_budget: usize::MAX,
            call_timeout_ms: u64::MAX,
            ..ArbitrationConfig::default()
        };
        assert_eq!(cfg.loop_timeout(), Duration::MAX);
    }
}
