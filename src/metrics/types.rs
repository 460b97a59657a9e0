use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Running engine statistics; counters only grow until `reset_stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_inferences: u64,
    pub total_tokens_generated: u64,
    pub failed_inferences: u64,
    pub average_tokens_per_second: f64,
    pub average_latency: Duration,
}

/// One finished unit of work fed into the statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionRecord {
    pub tokens: usize,
    pub latency: Duration,
}

impl CompletionRecord {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.latency.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }
}
