use std::time::Duration;

use parking_lot::Mutex;

use super::types::{CompletionRecord, EngineStats};

/// Accumulates engine statistics under its own lock, independent of the
/// engine state field.
#[derive(Debug, Default)]
pub struct StatsCollector {
    state: Mutex<EngineStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one completed generation, stream, or batch item into the totals.
    pub fn record_completion(&self, record: CompletionRecord) {
        let mut stats = self.state.lock();

        stats.total_inferences += 1;
        stats.total_tokens_generated += record.tokens as u64;

        let n = stats.total_inferences as f64;
        stats.average_tokens_per_second +=
            (record.tokens_per_second() - stats.average_tokens_per_second) / n;

        let average_secs = stats.average_latency.as_secs_f64();
        let updated = average_secs + (record.latency.as_secs_f64() - average_secs) / n;
        stats.average_latency = Duration::from_secs_f64(updated.max(0.0));
    }

    pub fn record_failure(&self) {
        self.state.lock().failed_inferences += 1;
    }

    pub fn snapshot(&self) -> EngineStats {
        self.state.lock().clone()
    }

    pub fn reset(&self) {
        *self.state.lock() = EngineStats::default();
    }
}
