use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{
    error::{EngineError, ErrorExt},
    metrics::{CompletionRecord, StatsCollector},
    types::{BatchRequest, BatchResult, FinishReason, InferenceResult},
};

use super::common::{drive, RunContext};

const STOPPED_BEFORE_RUN: &str = "batch stopped before this item ran";

/// Counters for one batch run, logged when it ends
#[derive(Debug, Default)]
struct BatchSummary {
    succeeded: usize,
    failed: usize,
    skipped: usize,
    tokens: usize,
    elapsed: Duration,
}

/// Works through a batch one item at a time
pub(crate) struct BatchProcessor {
    ctx: RunContext,
    stop: Arc<AtomicBool>,
}

impl BatchProcessor {
    /// The stop flag is observed between items, never inside one.
    pub(crate) fn new(mut ctx: RunContext, stop: Arc<AtomicBool>) -> Self {
        ctx.stop = None;
        Self { ctx, stop }
    }

    /// Process every request in order. Each item yields exactly one
    /// [`BatchResult`]; failures are recorded on the item and the batch moves on.
    pub(crate) fn process(&self, requests: &[BatchRequest], stats: &StatsCollector) -> Vec<BatchResult> {
        let start = Instant::now();
        let mut summary = BatchSummary::default();
        let mut results = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            if self.stop.load(Ordering::SeqCst) {
                summary.skipped += 1;
                results.push(BatchResult {
                    index,
                    id: request.id.clone(),
                    result: InferenceResult::empty(FinishReason::Stop),
                    error: Some(STOPPED_BEFORE_RUN.to_string()),
                });
                continue;
            }

            let outcome = request
                .params
                .validate()
                .map_err(|error| (error, InferenceResult::empty(FinishReason::Error)))
                .and_then(|()| {
                    drive(&self.ctx, &request.params, |_, _| {})
                        .map_err(|failure| (failure.error, failure.partial))
                });

            match outcome {
                Ok(result) => {
                    stats.record_completion(CompletionRecord {
                        tokens: result.completion_tokens,
                        latency: result.elapsed,
                    });
                    summary.succeeded += 1;
                    summary.tokens += result.completion_tokens;
                    debug!(index, id = %request.id, tokens = result.completion_tokens, "Batch item done");
                    results.push(BatchResult {
                        index,
                        id: request.id.clone(),
                        result,
                        error: None,
                    });
                }
                Err((error, partial)) => {
                    stats.record_failure();
                    summary.failed += 1;
                    log_item_failure(index, &request.id, &error);
                    results.push(BatchResult {
                        index,
                        id: request.id.clone(),
                        result: partial,
                        error: Some(error.to_string()),
                    });
                }
            }
        }

        summary.elapsed = start.elapsed();
        info!(
            items = requests.len(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            tokens = summary.tokens,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Batch finished"
        );
        results
    }
}

fn log_item_failure(index: usize, id: &str, error: &EngineError) {
    if error.is_recoverable() {
        debug!(index, id, error = %error, "Batch item rejected");
    } else {
        warn!(index, id, error = %error, "Batch item failed");
    }
}
