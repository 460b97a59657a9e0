//! Narrow contract to the native inference runtime
//!
//! The runtime that executes the network on the NPU is opaque to this crate.
//! It is reached through [`NativeBackend`], which mirrors the C interface:
//! a handle-returning init call, a destroy call, and a run call that reports
//! incremental results through a callback. Here the callback plus its
//! user-data pointer is a [`ResultSink`], a bounded channel that may be fed
//! from whatever thread the runtime chooses.

mod simulated;

pub use simulated::SimulatedBackend;

use std::fmt;
use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender};

use crate::config::ModelConfig;
use crate::types::InferenceParams;

/// Handle issued by the native init call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Terminal tag attached to every callback invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Normal,
    Waiting,
    Finish,
    Error,
}

/// Token counts a runtime may report with its final event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// One callback invocation
#[derive(Debug, Clone, PartialEq)]
pub struct NativeEvent {
    pub state: CallState,
    pub text: String,
    pub token_id: Option<i32>,
    pub usage: Option<TokenUsage>,
}

impl NativeEvent {
    pub fn token(text: impl Into<String>) -> Self {
        Self {
            state: CallState::Normal,
            text: text.into(),
            token_id: None,
            usage: None,
        }
    }

    pub fn finish(usage: Option<TokenUsage>) -> Self {
        Self {
            state: CallState::Finish,
            text: String::new(),
            token_id: None,
            usage,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: CallState::Error,
            text: message.into(),
            token_id: None,
            usage: None,
        }
    }
}

/// Init record
#[derive(Debug, Clone, PartialEq)]
pub struct NativeParams {
    pub model_path: PathBuf,
    pub max_context_len: usize,
    pub max_new_tokens: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub npu_core_num: u32,
}

impl From<&ModelConfig> for NativeParams {
    fn from(config: &ModelConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            max_context_len: config.max_context_len,
            max_new_tokens: config.max_new_tokens,
            top_k: config.top_k,
            top_p: config.top_p,
            temperature: config.temperature,
            repeat_penalty: config.repeat_penalty,
            npu_core_num: config.npu_core_num,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Prompt,
    Token,
}

/// Run input record
#[derive(Debug, Clone, PartialEq)]
pub struct NativeInput {
    pub role: String,
    pub prompt: String,
    pub input_type: InputType,
}

impl NativeInput {
    pub fn user_prompt(prompt: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            prompt: prompt.into(),
            input_type: InputType::Prompt,
        }
    }
}

/// Inference-mode record passed with every run
#[derive(Debug, Clone, PartialEq)]
pub struct InferMode {
    pub keep_history: bool,
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub seed: Option<u64>,
}

impl InferMode {
    pub fn from_params(params: &InferenceParams, keep_history: bool) -> Self {
        Self {
            keep_history,
            max_new_tokens: params.max_tokens,
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            repeat_penalty: params.repetition_penalty,
            seed: params.seed,
        }
    }
}

/// Callback side of a run: fragments pushed here arrive at the engine in order
#[derive(Debug, Clone)]
pub struct ResultSink {
    sender: Sender<NativeEvent>,
}

impl ResultSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<NativeEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Deliver one event. Returns `false` once the consumer has gone away,
    /// after which the runtime should wind the run down.
    pub fn emit(&self, event: NativeEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// The native runtime. Return codes follow the C convention: zero is success.
pub trait NativeBackend: Send + Sync {
    fn init(&self, params: &NativeParams) -> std::result::Result<RawHandle, i32>;

    fn destroy(&self, handle: RawHandle) -> i32;

    /// Runs one request to completion, blocking the caller. Events may be
    /// emitted from any thread but must be emitted in generation order.
    fn run(
        &self,
        handle: RawHandle,
        input: &NativeInput,
        mode: &InferMode,
        sink: &ResultSink,
    ) -> i32;

    /// Ask an in-flight run to end early. Advisory; the run still returns
    /// through its normal path.
    fn abort(&self, _handle: RawHandle) -> i32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_preserves_order() {
        let (sink, receiver) = ResultSink::bounded(4);
        let producer = std::thread::spawn(move || {
            for i in 0..3 {
                assert!(sink.emit(NativeEvent::token(format!("t{}", i))));
            }
            assert!(sink.emit(NativeEvent::finish(None)));
        });

        let texts: Vec<String> = receiver.iter().map(|e| e.text).collect();
        producer.join().unwrap();
        assert_eq!(texts, vec!["t0", "t1", "t2", ""]);
    }

    #[test]
    fn test_sink_reports_closed_consumer() {
        let (sink, receiver) = ResultSink::bounded(1);
        drop(receiver);
        assert!(!sink.emit(NativeEvent::token("x")));
    }

    #[test]
    fn test_infer_mode_from_params() {
        let params = InferenceParams::new("p").with_max_tokens(7);
        let mode = InferMode::from_params(&params, false);
        assert_eq!(mode.max_new_tokens, 7);
        assert!(!mode.keep_history);
    }
}
