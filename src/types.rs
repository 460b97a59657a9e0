//! Common type definitions used throughout the engine

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};

pub const MAX_PROMPT_CHARS: usize = 32768;

/// Per-request generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub batch_size: usize,
    /// Generation ends as soon as the output contains one of these
    pub stop_sequences: Vec<String>,
    pub seed: Option<u64>,
    pub stream: bool,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
            batch_size: 1,
            stop_sequences: Vec::new(),
            seed: None,
            stream: false,
        }
    }
}

impl InferenceParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }

    /// Constraint violations of everything except the prompt
    pub fn sampling_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if !(1..=8192).contains(&self.max_tokens) {
            violations.push("maxTokens must be between 1 and 8192".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            violations.push("temperature must be between 0.0 and 2.0".to_string());
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            violations.push("topP must be between 0.0 (exclusive) and 1.0".to_string());
        }
        if !(1..=1000).contains(&self.top_k) {
            violations.push("topK must be between 1 and 1000".to_string());
        }
        if !(0.0..=2.0).contains(&self.repetition_penalty) {
            violations.push("repetitionPenalty must be between 0.0 and 2.0".to_string());
        }
        if !(1..=32).contains(&self.batch_size) {
            violations.push("batchSize must be between 1 and 32".to_string());
        }

        violations
    }

    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.prompt.is_empty() {
            violations.push("prompt must not be empty".to_string());
        } else if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            violations.push(format!("prompt must not exceed {} characters", MAX_PROMPT_CHARS));
        }
        violations.extend(self.sampling_violations());
        violations
    }

    pub fn validate(&self) -> Result<()> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigurationError { violations })
        }
    }
}

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Completed,
    Error,
    Length,
    Stop,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Completed => "completed",
            FinishReason::Error => "error",
            FinishReason::Length => "length",
            FinishReason::Stop => "stop",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a single generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub text: String,
    pub token_count: usize,
    pub elapsed: Duration,
    pub tokens_per_second: f64,
    pub finished: bool,
    pub finish_reason: FinishReason,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl InferenceResult {
    pub(crate) fn new(
        text: String,
        prompt_tokens: usize,
        completion_tokens: usize,
        elapsed: Duration,
        finished: bool,
        finish_reason: FinishReason,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let tokens_per_second = if secs > 0.0 {
            completion_tokens as f64 / secs
        } else {
            0.0
        };

        Self {
            text,
            token_count: completion_tokens,
            elapsed,
            tokens_per_second,
            finished,
            finish_reason,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub(crate) fn empty(reason: FinishReason) -> Self {
        Self::new(String::new(), 0, 0, Duration::ZERO, false, reason)
    }
}

/// One entry of a batch submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: String,
    pub params: InferenceParams,
}

impl BatchRequest {
    pub fn new(id: impl Into<String>, params: InferenceParams) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }
}

/// Per-item outcome of a batch; failures never abort sibling items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub index: usize,
    pub id: String,
    pub result: InferenceResult,
    pub error: Option<String>,
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Handle to work running on a detached worker thread
#[derive(Debug)]
pub struct GenerationHandle<T> {
    receiver: oneshot::Receiver<Result<T>>,
    worker: std::thread::JoinHandle<()>,
}

impl<T> GenerationHandle<T> {
    pub(crate) fn new(
        receiver: oneshot::Receiver<Result<T>>,
        worker: std::thread::JoinHandle<()>,
    ) -> Self {
        Self { receiver, worker }
    }

    /// Whether the worker has delivered its outcome
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the outcome
    pub async fn wait(self) -> Result<T> {
        self.await
    }

    /// Block the current thread until the outcome arrives; must not be
    /// called from inside an async runtime.
    pub fn blocking_wait(self) -> Result<T> {
        self.receiver.blocking_recv().unwrap_or_else(|_| Err(worker_lost()))
    }
}

impl<T> Future for GenerationHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver
            .poll_unpin(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(worker_lost())))
    }
}

fn worker_lost() -> EngineError {
    EngineError::Unknown {
        message: "worker terminated before delivering a result".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validation_aggregates() {
        let params = InferenceParams::new("hi")
            .with_max_tokens(0)
            .with_temperature(3.0);

        match params.validate() {
            Err(err @ EngineError::ConfigurationError { .. }) => assert_eq!(
                err.to_string(),
                "Configuration error: maxTokens must be between 1 and 8192, temperature must be between 0.0 and 2.0"
            ),
            other => panic!("expected ConfigurationError, got {:?}", other),
        }
    }

    #[test]
    fn test_prompt_limits() {
        assert!(InferenceParams::default().validate().is_err());
        assert!(InferenceParams::new("a".repeat(MAX_PROMPT_CHARS)).validate().is_ok());
        assert!(InferenceParams::new("a".repeat(MAX_PROMPT_CHARS + 1)).validate().is_err());
        assert!(InferenceParams::default().sampling_violations().is_empty());
    }

    #[test]
    fn test_result_derived_fields() {
        let result = InferenceResult::new(
            "hello world".to_string(),
            3,
            10,
            Duration::from_secs(2),
            true,
            FinishReason::Completed,
        );
        assert_eq!(result.total_tokens, 13);
        assert_eq!(result.token_count, 10);
        assert!((result.tokens_per_second - 5.0).abs() < 1e-9);
        assert_eq!(result.finish_reason.to_string(), "completed");
    }

    #[test]
    fn test_finish_reason_serializes_lowercase() {
        let json = serde_json::to_string(&FinishReason::Length).unwrap();
        assert_eq!(json, "\"length\"");
    }

    #[tokio::test]
    async fn test_generation_handle() {
        let (tx, rx) = oneshot::channel();
        let worker = std::thread::spawn(move || {
            let _ = tx.send(Ok(42usize));
        });
        let handle = GenerationHandle::new(rx, worker);
        assert_eq!(handle.wait().await.unwrap(), 42);
    }

    #[test]
    fn test_generation_handle_outside_runtime() {
        let (tx, rx) = oneshot::channel();
        let worker = std::thread::spawn(move || {
            let _ = tx.send(Ok("done".to_string()));
        });
        let handle = GenerationHandle::new(rx, worker);
        assert_eq!(tokio_test::block_on(handle).unwrap(), "done");
    }

    #[tokio::test]
    async fn test_generation_handle_worker_lost() {
        let (tx, rx) = oneshot::channel::<Result<usize>>();
        let worker = std::thread::spawn(move || drop(tx));
        let handle = GenerationHandle::new(rx, worker);
        assert!(matches!(handle.await, Err(EngineError::Unknown { .. })));
    }
}
