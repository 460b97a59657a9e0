use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::{
    config::EngineSettings,
    error::{EngineError, Result},
    metrics::EngineStats,
    processing::{BatchProcessor, RunContext, StreamProcessor},
    resource::{HandleId, ModelHandle},
    sampling::SamplingStrategy,
    types::{BatchRequest, BatchResult, GenerationHandle, InferenceParams, InferenceResult},
};

use super::builder::EngineBuilder;
use super::state::{EngineCore, EngineState, RunClaim};

/// Drives one loaded model through single, streaming and batch generation.
///
/// An engine runs one top-level operation at a time. A second call made
/// while one is in flight fails with [`EngineError::InvalidState`];
/// serializing calls per engine is up to the caller. After an unrecoverable
/// backend failure the engine stays in [`EngineState::Error`] and must be
/// recreated.
pub struct InferenceEngine {
    model: RwLock<Option<ModelHandle>>,
    core: Arc<EngineCore>,
    settings: RwLock<EngineSettings>,
}

impl InferenceEngine {
    /// Create an engine with default settings and no model bound
    pub fn new() -> Self {
        Self::from_parts(None, EngineSettings::default())
    }

    /// Create an engine bound to `model`
    pub fn with_model(model: ModelHandle) -> Self {
        Self::from_parts(Some(model), EngineSettings::default())
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn from_parts(model: Option<ModelHandle>, settings: EngineSettings) -> Self {
        Self {
            model: RwLock::new(model),
            core: Arc::new(EngineCore::new()),
            settings: RwLock::new(settings),
        }
    }

    /// Bind a model, returning the one previously bound. Requests already in
    /// flight keep running against the model they started with.
    pub fn set_model_handle(&self, model: ModelHandle) -> Option<ModelHandle> {
        info!(handle = %model.id(), "Model bound to engine");
        self.model.write().replace(model)
    }

    pub fn model_handle(&self) -> Option<HandleId> {
        self.model.read().as_ref().map(ModelHandle::id)
    }

    /// Unbind the model without unloading it
    pub fn take_model_handle(&self) -> Option<ModelHandle> {
        self.model.write().take()
    }

    /// Generate a completion, blocking until the backend finishes.
    pub fn generate(&self, params: &InferenceParams) -> Result<InferenceResult> {
        params.validate()?;
        let (claim, ctx) = self.begin(EngineState::Running, "generate")?;
        // stop() ends streams and batches, not a blocking generate
        let outcome = StreamProcessor::new(RunContext { stop: None, ..ctx }).generate(params);
        self.core.finish(&claim, outcome)
    }

    /// Generate with the engine's default parameters
    pub fn generate_with_defaults(&self, prompt: impl Into<String>) -> Result<InferenceResult> {
        let params = InferenceParams {
            prompt: prompt.into(),
            ..self.settings.read().default_params.clone()
        };
        self.generate(&params)
    }

    /// Generate, calling `on_token(fragment, is_last)` for each fragment in
    /// order on the calling thread. `is_last` is true exactly once, on normal
    /// completion. A `stop()` from another thread ends the stream at the next
    /// fragment with an unfinished result.
    pub fn generate_stream<F>(&self, params: &InferenceParams, on_token: F) -> Result<InferenceResult>
    where
        F: FnMut(&str, bool),
    {
        params.validate()?;
        let (claim, ctx) = self.begin(EngineState::Streaming, "stream")?;
        let outcome = StreamProcessor::new(ctx).stream(params, on_token);
        self.core.finish(&claim, outcome)
    }

    /// Start a streaming generation on a worker thread and return at once.
    /// `on_token` runs on the worker.
    pub fn generate_stream_async<F>(
        &self,
        params: InferenceParams,
        on_token: F,
    ) -> Result<GenerationHandle<InferenceResult>>
    where
        F: FnMut(&str, bool) + Send + 'static,
    {
        params.validate()?;
        let (claim, ctx) = self.begin(EngineState::Streaming, "stream")?;
        let core = Arc::clone(&self.core);

        self.spawn_worker("npu-stream", Some(claim.clone()), move || {
            let outcome = StreamProcessor::new(ctx).stream(&params, on_token);
            core.finish(&claim, outcome)
        })
    }

    /// Run every request in order and return one result per request.
    ///
    /// Per-item failures land in [`BatchResult::error`] and never abort the
    /// batch. After `stop()` the remaining items are returned unrun.
    pub fn generate_batch(&self, requests: &[BatchRequest]) -> Result<Vec<BatchResult>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let (claim, ctx) = self.begin(EngineState::BatchProcessing, "batch")?;
        Ok(run_batch(&self.core, &claim, ctx, requests))
    }

    pub fn generate_batch_async(
        &self,
        requests: Vec<BatchRequest>,
    ) -> Result<GenerationHandle<Vec<BatchResult>>> {
        if requests.is_empty() {
            return self.spawn_worker("npu-batch", None, || Ok(Vec::new()));
        }
        let (claim, ctx) = self.begin(EngineState::BatchProcessing, "batch")?;
        let core = Arc::clone(&self.core);

        self.spawn_worker("npu-batch", Some(claim.clone()), move || {
            Ok(run_batch(&core, &claim, ctx, &requests))
        })
    }

    /// Advisory: a request already inside the backend runs to completion.
    pub fn pause(&self) -> Result<()> {
        loop {
            let current = self.core.state.load();
            match current {
                EngineState::Paused => return Ok(()),
                EngineState::Error => {
                    return Err(EngineError::InvalidState {
                        state: current,
                        operation: "pause",
                    })
                }
                _ => {
                    if self.core.state.transition(current, EngineState::Paused).is_ok() {
                        debug!(from = ?current, "Engine paused");
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn resume(&self) -> Result<()> {
        match self.core.state.transition(EngineState::Paused, EngineState::Idle) {
            Ok(()) => {
                debug!("Engine resumed");
                Ok(())
            }
            Err(EngineState::Error) => Err(EngineError::InvalidState {
                state: EngineState::Error,
                operation: "resume",
            }),
            Err(_) => Ok(()),
        }
    }

    /// Ask the running stream or batch to end at the next fragment or batch
    /// item and return the engine to Idle. Does not interrupt a native call in
    /// progress, and a blocking `generate` runs to its normal end.
    pub fn stop(&self) {
        self.core.request_stop();
        loop {
            let current = self.core.state.load();
            if matches!(current, EngineState::Idle | EngineState::Error) {
                break;
            }
            if self.core.state.transition(current, EngineState::Idle).is_ok() {
                info!(from = ?current, "Engine stopped");
                break;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.state.load().is_active()
    }

    pub fn state(&self) -> EngineState {
        self.core.state.load()
    }

    pub fn set_max_concurrent_inferences(&self, max: usize) -> Result<()> {
        self.update_settings(|settings| settings.max_concurrent_inferences = max)
    }

    pub fn set_stream_buffer_size(&self, size: usize) -> Result<()> {
        self.update_settings(|settings| settings.stream_buffer_size = size)
    }

    pub fn enable_kv_cache(&self, enabled: bool) {
        self.settings.write().kv_cache_enabled = enabled;
    }

    /// The prompt is ignored; everything else must be within bounds.
    pub fn set_default_params(&self, params: InferenceParams) -> Result<()> {
        let violations = params.sampling_violations();
        if !violations.is_empty() {
            return Err(EngineError::ConfigurationError { violations });
        }
        self.settings.write().default_params = params;
        Ok(())
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings.read().clone()
    }

    pub fn get_stats(&self) -> EngineStats {
        self.core.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.core.stats.reset();
    }

    /// Pick a token index from `logits` with the strategy `params` selects
    pub fn sample(&self, logits: &[f32], params: &InferenceParams) -> usize {
        SamplingStrategy::from_params(params).sample(logits)
    }

    fn update_settings(&self, apply: impl FnOnce(&mut EngineSettings)) -> Result<()> {
        let mut settings = self.settings.write();
        let mut updated = settings.clone();
        apply(&mut updated);
        updated.validate()?;
        *settings = updated;
        Ok(())
    }

    /// Claim the engine and resolve everything a run needs. The claim is
    /// released again if no usable model is bound.
    fn begin(&self, target: EngineState, operation: &'static str) -> Result<(RunClaim, RunContext)> {
        let claim = self.core.enter(target, operation)?;

        let resolved = match self.model.read().as_ref() {
            Some(model) => model.resolve(),
            None => Err(EngineError::InvalidState {
                state: EngineState::Idle,
                operation,
            }),
        };
        let (backend, raw) = match resolved {
            Ok(binding) => binding,
            Err(e) => {
                self.core.leave(&claim);
                return Err(e);
            }
        };

        let settings = self.settings.read();
        let ctx = RunContext {
            backend,
            raw,
            keep_history: settings.kv_cache_enabled,
            buffer: settings.stream_buffer_size,
            stop: Some(Arc::clone(&claim.stop)),
        };
        Ok((claim, ctx))
    }

    fn spawn_worker<T, F>(
        &self,
        name: &str,
        claim: Option<RunClaim>,
        job: F,
    ) -> Result<GenerationHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // the caller may have dropped the handle
                let _ = sender.send(job());
            });

        match spawned {
            Ok(worker) => Ok(GenerationHandle::new(receiver, worker)),
            Err(e) => {
                if let Some(claim) = &claim {
                    self.core.leave(claim);
                }
                Err(EngineError::Unknown {
                    message: format!("failed to spawn {} worker: {}", name, e),
                })
            }
        }
    }
}

impl Default for InferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("model", &self.model_handle())
            .field("state", &self.state())
            .finish()
    }
}

fn run_batch(core: &EngineCore, claim: &RunClaim, ctx: RunContext, requests: &[BatchRequest]) -> Vec<BatchResult> {
    let results = BatchProcessor::new(ctx, Arc::clone(&claim.stop)).process(requests, &core.stats);
    core.leave(claim);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ResourceLimits};
    use crate::native::SimulatedBackend;
    use crate::resource::ResourceManager;
    use crate::types::FinishReason;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn setup(backend: SimulatedBackend) -> (Arc<SimulatedBackend>, ResourceManager, InferenceEngine) {
        let backend = Arc::new(backend);
        let manager = ResourceManager::new(backend.clone(), ResourceLimits::default().with_total_memory(8 * GIB));
        manager.initialize().unwrap();
        let model = manager.create_model(&ModelConfig::default()).unwrap();
        (backend, manager, InferenceEngine::with_model(model))
    }

    #[test]
    fn test_generate() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new());
        let result = engine.generate(&InferenceParams::new("hello there npu")).unwrap();

        assert_eq!(result.text, "hello there npu");
        assert!(result.finished);
        assert_eq!(result.finish_reason, FinishReason::Completed);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.get_stats().total_inferences, 1);
        assert_eq!(engine.get_stats().total_tokens_generated, 3);
    }

    #[test]
    fn test_invalid_params_never_reach_backend() {
        let (backend, _manager, engine) = setup(SimulatedBackend::new());
        let err = engine.generate(&InferenceParams::new("")).unwrap_err();

        assert!(matches!(err, EngineError::ConfigurationError { .. }));
        assert_eq!(backend.run_calls(), 0);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_stream_delivers_in_order_with_single_last() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new().with_script(["a", "b", "c"]));
        let mut fragments = Vec::new();
        let result = engine
            .generate_stream(&InferenceParams::new("x"), |text, last| fragments.push((text.to_string(), last)))
            .unwrap();

        assert_eq!(
            fragments,
            vec![
                ("a".to_string(), false),
                ("b".to_string(), false),
                ("c".to_string(), false),
                (String::new(), true),
            ]
        );
        assert_eq!(result.text, "abc");
    }

    #[test]
    fn test_stop_after_first_token() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new().with_script(["a", "b", "c", "d"]));
        let mut delivered = Vec::new();
        let result = engine
            .generate_stream(&InferenceParams::new("x"), |text, last| {
                delivered.push((text.to_string(), last));
                engine.stop();
            })
            .unwrap();

        assert_eq!(delivered, vec![("a".to_string(), false)]);
        assert!(!result.finished);
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(engine.state(), EngineState::Idle);
        // cancelled runs do not count as completions
        assert_eq!(engine.get_stats().total_inferences, 0);
    }

    #[test]
    fn test_stopped_stream_stays_stopped_when_engine_is_reused() {
        let (_backend, _manager, engine) = setup(
            SimulatedBackend::new()
                .with_script(["a", "b", "c", "d", "e", "f", "g", "h"])
                .with_token_delay(Duration::from_millis(30)),
        );
        let first = engine
            .generate_stream_async(InferenceParams::new("x"), |_, _| {})
            .unwrap();
        std::thread::sleep(Duration::from_millis(45));
        engine.stop();

        let second = engine.generate(&InferenceParams::new("x")).unwrap();
        assert!(second.finished);

        let first = first.blocking_wait().unwrap();
        assert!(!first.finished);
        assert_eq!(first.finish_reason, FinishReason::Stop);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_stop_does_not_cancel_blocking_generate() {
        let (_backend, _manager, engine) = setup(
            SimulatedBackend::new()
                .with_script(["a", "b", "c", "d"])
                .with_token_delay(Duration::from_millis(20)),
        );

        let result = std::thread::scope(|scope| {
            let worker = scope.spawn(|| engine.generate(&InferenceParams::new("x")));
            while !engine.is_running() {
                std::thread::yield_now();
            }
            engine.stop();
            worker.join().unwrap()
        })
        .unwrap();

        assert!(result.finished);
        assert_eq!(result.text, "abcd");
        assert_eq!(result.finish_reason, FinishReason::Completed);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_backend_failure_is_terminal() {
        let (backend, _manager, engine) = setup(SimulatedBackend::new().failing_after(1));
        let err = engine.generate(&InferenceParams::new("one two three")).unwrap_err();

        assert!(matches!(err, EngineError::InferenceFailed { .. }));
        assert_eq!(engine.state(), EngineState::Error);
        assert_eq!(engine.get_stats().failed_inferences, 1);

        let err = engine.generate(&InferenceParams::new("again")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { state: EngineState::Error, .. }));
        assert!(engine.pause().is_err());
        engine.stop();
        assert_eq!(engine.state(), EngineState::Error);
        assert_eq!(backend.run_calls(), 1);
    }

    #[test]
    fn test_no_model_bound() {
        let engine = InferenceEngine::new();
        let err = engine.generate(&InferenceParams::new("x")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_unloaded_model_is_rejected() {
        let (_backend, manager, engine) = setup(SimulatedBackend::new());
        manager.cleanup();

        let err = engine.generate(&InferenceParams::new("x")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidHandle { .. }));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_swap_model_handle() {
        let (_backend, manager, engine) = setup(SimulatedBackend::new());
        let first = engine.model_handle().unwrap();
        let second = manager.create_model(&ModelConfig::default()).unwrap();
        let second_id = second.id();

        let previous = engine.set_model_handle(second).unwrap();
        assert_eq!(previous.id(), first);
        assert_eq!(engine.model_handle(), Some(second_id));

        drop(previous);
        assert_eq!(manager.active_models(), vec![second_id]);

        let taken = engine.take_model_handle().unwrap();
        assert_eq!(engine.model_handle(), None);
        manager.destroy_model(taken).unwrap();
        assert!(manager.active_models().is_empty());
    }

    #[test]
    fn test_empty_batch_leaves_state() {
        let (backend, _manager, engine) = setup(SimulatedBackend::new());
        engine.pause().unwrap();

        assert!(engine.generate_batch(&[]).unwrap().is_empty());
        assert_eq!(engine.state(), EngineState::Paused);
        assert_eq!(backend.run_calls(), 0);
    }

    #[test]
    fn test_batch() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new());
        let requests = vec![
            BatchRequest::new("first", InferenceParams::new("alpha beta")),
            BatchRequest::new("second", InferenceParams::new("gamma")),
        ];

        let results = engine.generate_batch(&requests).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].result.text, "alpha beta");
        assert_eq!(results[1].index, 1);
        assert!(results.iter().all(BatchResult::is_ok));
        assert_eq!(engine.get_stats().total_inferences, 2);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_pause_and_resume() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new());
        engine.pause().unwrap();
        assert_eq!(engine.state(), EngineState::Paused);

        let err = engine.generate(&InferenceParams::new("x")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { state: EngineState::Paused, .. }));

        engine.resume().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.generate(&InferenceParams::new("x")).is_ok());
    }

    #[test]
    fn test_settings_setters() {
        let engine = InferenceEngine::new();
        assert!(engine.set_max_concurrent_inferences(4).is_ok());
        assert!(matches!(
            engine.set_max_concurrent_inferences(0),
            Err(EngineError::ConfigurationError { .. })
        ));
        assert!(engine.set_stream_buffer_size(4096).is_ok());
        assert!(engine.set_stream_buffer_size(4097).is_err());
        engine.enable_kv_cache(false);
        assert!(engine.set_default_params(InferenceParams::default().with_temperature(3.0)).is_err());

        let settings = engine.settings();
        assert_eq!(settings.max_concurrent_inferences, 4);
        assert_eq!(settings.stream_buffer_size, 4096);
        assert!(!settings.kv_cache_enabled);
        assert_eq!(settings.default_params, InferenceParams::default());
    }

    #[test]
    fn test_generate_with_defaults() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new());
        engine
            .set_default_params(InferenceParams::default().with_max_tokens(2))
            .unwrap();

        let result = engine.generate_with_defaults("one two three four").unwrap();
        assert_eq!(result.text, "one two");
        assert_eq!(result.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_sample_uses_params() {
        let engine = InferenceEngine::new();
        let greedy = InferenceParams::default().with_temperature(0.0);
        assert_eq!(engine.sample(&[0.1, 3.0, 0.2], &greedy), 1);
    }

    #[test]
    fn test_stats_reset() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new());
        engine.generate(&InferenceParams::new("a b")).unwrap();
        engine.reset_stats();
        assert_eq!(engine.get_stats(), EngineStats::default());
    }

    #[tokio::test]
    async fn test_stream_async() {
        let (_backend, _manager, engine) = setup(
            SimulatedBackend::new().with_token_delay(Duration::from_millis(5)),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = engine
            .generate_stream_async(InferenceParams::new("streamed over a worker"), move |text, last| {
                let _ = tx.send((text.to_string(), last));
            })
            .unwrap();
        assert!(engine.is_running());
        assert!(engine.generate(&InferenceParams::new("busy")).is_err());

        let result = handle.await.unwrap();
        assert_eq!(result.text, "streamed over a worker");
        assert_eq!(engine.state(), EngineState::Idle);

        let mut text = String::new();
        let mut lasts = 0;
        while let Some((fragment, last)) = rx.recv().await {
            text.push_str(&fragment);
            lasts += usize::from(last);
        }
        assert_eq!(text, "streamed over a worker");
        assert_eq!(lasts, 1);
    }

    #[tokio::test]
    async fn test_batch_async() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new());
        let requests = (0..3)
            .map(|i| BatchRequest::new(format!("req-{}", i), InferenceParams::new(format!("prompt {}", i))))
            .collect();

        let results = engine.generate_batch_async(requests).unwrap().await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["req-0", "req-1", "req-2"]);
        assert_eq!(engine.state(), EngineState::Idle);

        let empty = engine.generate_batch_async(Vec::new()).unwrap().await.unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_blocking_wait() {
        let (_backend, _manager, engine) = setup(SimulatedBackend::new());
        let handle = engine
            .generate_stream_async(InferenceParams::new("plain thread"), |_, _| {})
            .unwrap();
        let result = handle.blocking_wait().unwrap();
        assert_eq!(result.text, "plain thread");
    }
}
