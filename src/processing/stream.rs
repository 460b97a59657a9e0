use tracing::debug;

use crate::types::{InferenceParams, InferenceResult};

use super::common::{drive, GenerationFailure, RunContext};

/// Runs single and streaming generations against one model
pub(crate) struct StreamProcessor {
    ctx: RunContext,
}

impl StreamProcessor {
    pub(crate) fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    /// Generate without observing fragments
    pub(crate) fn generate(
        &self,
        params: &InferenceParams,
    ) -> Result<InferenceResult, GenerationFailure> {
        drive(&self.ctx, params, |_, _| {})
    }

    /// Generate, handing every fragment to `on_token` on the calling thread
    pub(crate) fn stream<F>(
        &self,
        params: &InferenceParams,
        mut on_token: F,
    ) -> Result<InferenceResult, GenerationFailure>
    where
        F: FnMut(&str, bool),
    {
        debug!(
            handle = %self.ctx.raw,
            max_tokens = params.max_tokens,
            buffer = self.ctx.buffer,
            "Starting stream"
        );
        let mut delivered = 0usize;
        let outcome = drive(&self.ctx, params, |text, is_last| {
            delivered += 1;
            on_token(text, is_last);
        });
        debug!(handle = %self.ctx.raw, callbacks = delivered, "Stream ended");
        outcome
    }
}
