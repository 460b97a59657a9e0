use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use super::{
    InferMode, NativeBackend, NativeEvent, NativeInput, NativeParams, RawHandle, ResultSink,
    TokenUsage,
};
use crate::sampling::SamplingStrategy;
use crate::types::InferenceParams;

/// What the simulated model produces for each run
#[derive(Debug, Clone)]
enum Output {
    /// Replays the prompt word by word
    Echo,
    /// Replays a fixed token list
    Script(Vec<String>),
    /// Draws tokens from a vocabulary by sampling synthetic logits
    Vocabulary { words: Vec<String>, length: usize },
}

/// In-process stand-in for the NPU runtime.
///
/// Emits every fragment from a helper thread, the way the real runtime
/// invokes its callback from an internal worker.
#[derive(Debug)]
pub struct SimulatedBackend {
    output: Output,
    token_delay: Duration,
    init_failure: Option<i32>,
    destroy_failure: Option<i32>,
    run_failure: Option<i32>,
    fail_after: Option<usize>,
    report_usage: bool,
    next_handle: AtomicU64,
    live: Mutex<HashSet<u64>>,
    aborted: Mutex<HashSet<u64>>,
    init_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    run_calls: AtomicUsize,
    abort_calls: AtomicUsize,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            output: Output::Echo,
            token_delay: Duration::ZERO,
            init_failure: None,
            destroy_failure: None,
            run_failure: None,
            fail_after: None,
            report_usage: false,
            next_handle: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
            aborted: Mutex::new(HashSet::new()),
            init_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
            abort_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_script<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = Output::Script(tokens.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_vocabulary<I, S>(mut self, words: I, length: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = Output::Vocabulary {
            words: words.into_iter().map(Into::into).collect(),
            length,
        };
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn failing_init(mut self, code: i32) -> Self {
        self.init_failure = Some(code);
        self
    }

    pub fn failing_destroy(mut self, code: i32) -> Self {
        self.destroy_failure = Some(code);
        self
    }

    pub fn failing_run(mut self, code: i32) -> Self {
        self.run_failure = Some(code);
        self
    }

    /// Report an error event after emitting `tokens` fragments
    pub fn failing_after(mut self, tokens: usize) -> Self {
        self.fail_after = Some(tokens);
        self
    }

    pub fn reporting_usage(mut self) -> Self {
        self.report_usage = true;
        self
    }

    pub fn live_handles(&self) -> usize {
        self.live.lock().len()
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    fn tokens_for(&self, input: &NativeInput, mode: &InferMode) -> Vec<String> {
        match &self.output {
            Output::Echo => input
                .prompt
                .split_whitespace()
                .enumerate()
                .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {}", word) })
                .collect(),
            Output::Script(tokens) => tokens.clone(),
            Output::Vocabulary { words, length } => {
                if words.is_empty() {
                    return Vec::new();
                }
                let seed = mode.seed.unwrap_or_else(|| {
                    let mut hasher = DefaultHasher::new();
                    input.prompt.hash(&mut hasher);
                    hasher.finish()
                });
                let mut rng = StdRng::seed_from_u64(seed);
                let strategy = SamplingStrategy::from_params(&InferenceParams {
                    temperature: mode.temperature,
                    top_p: mode.top_p,
                    top_k: mode.top_k,
                    ..Default::default()
                });

                (0..*length)
                    .map(|_| {
                        let logits: Vec<f32> =
                            (0..words.len()).map(|_| rng.gen_range(-2.0..2.0)).collect();
                        let index = strategy.sample_with(&mut rng, &logits);
                        format!(" {}", words[index])
                    })
                    .collect()
            }
        }
    }
}

impl NativeBackend for SimulatedBackend {
    fn init(&self, params: &NativeParams) -> Result<RawHandle, i32> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.init_failure {
            return Err(code);
        }
        if params.model_path.as_os_str().is_empty() {
            return Err(-1);
        }

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(id);
        debug!(handle = id, cores = params.npu_core_num, "Simulated model initialized");
        Ok(RawHandle(id))
    }

    fn destroy(&self, handle: RawHandle) -> i32 {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if !self.live.lock().remove(&handle.0) {
            return -1;
        }
        self.destroy_failure.unwrap_or(0)
    }

    fn abort(&self, handle: RawHandle) -> i32 {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        if !self.live.lock().contains(&handle.0) {
            return -1;
        }
        self.aborted.lock().insert(handle.0);
        0
    }

    fn run(
        &self,
        handle: RawHandle,
        input: &NativeInput,
        mode: &InferMode,
        sink: &ResultSink,
    ) -> i32 {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        if !self.live.lock().contains(&handle.0) {
            return -1;
        }
        if let Some(code) = self.run_failure {
            return code;
        }

        self.aborted.lock().remove(&handle.0);
        let mut tokens = self.tokens_for(input, mode);
        tokens.truncate(mode.max_new_tokens);
        let prompt_tokens = input.prompt.split_whitespace().count();

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    for (emitted, token) in tokens.iter().enumerate() {
                        if self.fail_after == Some(emitted) {
                            sink.emit(NativeEvent::error("simulated NPU fault"));
                            return -1;
                        }
                        if !self.token_delay.is_zero() {
                            std::thread::sleep(self.token_delay);
                        }
                        if self.aborted.lock().remove(&handle.0) {
                            trace!(handle = %handle, emitted, "Run aborted");
                            return 0;
                        }
                        if !sink.emit(NativeEvent::token(token.clone())) {
                            trace!(handle = %handle, emitted, "Consumer gone, ending run");
                            return 0;
                        }
                    }
                    if self.fail_after == Some(tokens.len()) {
                        sink.emit(NativeEvent::error("simulated NPU fault"));
                        return -1;
                    }

                    let usage = self.report_usage.then(|| TokenUsage {
                        prompt_tokens,
                        completion_tokens: tokens.len(),
                    });
                    sink.emit(NativeEvent::finish(usage));
                    0
                })
                .join()
                .unwrap_or(-1)
        })
    }
}
