//! Token usage and cost accounting for a scan run.

use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of token usage, also the wire shape of the
/// authoritative totals a backend may attach to `scan_complete`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub prompt_chars: u64,
    pub response_chars: u64,
    pub total_tokens: u64,
    pub average_tokens_per_entity: u64,
    pub estimated_cost: f64,
}

/// Accumulates usage from `scan_progress` payload sizes.
///
/// Token counts are derived from character counts at roughly four
/// characters per token; when the backend supplies authoritative totals on
/// completion those replace the estimate outright.
#[derive(Debug, Default)]
pub struct TokenAccountant {
    prompt_chars: u64,
    response_chars: u64,
    authoritative: Option<TokenStats>,
}

impl TokenAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroes all counters. Called at job start.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn add_prompt_chars(&mut self, chars: u64) {
        self.prompt_chars += chars;
    }

    pub fn add_response_chars(&mut self, chars: u64) {
        self.response_chars += chars;
    }

    /// Replaces (not merges) the client estimate with backend totals.
    pub fn apply_authoritative(&mut self, stats: TokenStats) {
        self.authoritative = Some(stats);
    }

    /// Current statistics for the given processed-entity count and
    /// per-token rate.
    pub fn stats(&self, processed: u64, cost_per_token: f64) -> TokenStats {
        if let Some(stats) = &self.authoritative {
            return stats.clone();
        }
        let chars = self.prompt_chars + self.response_chars;
        let total_tokens = chars.div_ceil(4);
        TokenStats {
            prompt_chars: self.prompt_chars,
            response_chars: self.response_chars,
            total_tokens,
            // max(processed, 1) keeps this defined before the first result.
            average_tokens_per_entity: total_tokens / processed.max(1),
            estimated_cost: total_tokens as f64 * cost_per_token,
        }
    }
}
