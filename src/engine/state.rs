use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{EngineError, ErrorExt, Result};
use crate::metrics::{CompletionRecord, StatsCollector};
use crate::processing::GenerationFailure;
use crate::types::InferenceResult;

/// Lifecycle of an inference engine.
///
/// ```text
/// Idle --generate/stream/batch--> Running/Streaming/BatchProcessing --success--> Idle
/// Idle/Running/... --pause--> Paused --resume--> Idle
/// any --unrecoverable error--> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Running = 1,
    Streaming = 2,
    BatchProcessing = 3,
    Paused = 4,
    Error = 5,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Idle,
            1 => EngineState::Running,
            2 => EngineState::Streaming,
            3 => EngineState::BatchProcessing,
            4 => EngineState::Paused,
            _ => EngineState::Error,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            EngineState::Running | EngineState::Streaming | EngineState::BatchProcessing
        )
    }
}

/// Single atomically updated state field
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: EngineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move `from -> to`; returns the observed state on mismatch.
    pub(crate) fn transition(
        &self,
        from: EngineState,
        to: EngineState,
    ) -> std::result::Result<(), EngineState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(EngineState::from_u8)
    }
}

/// One claimed top-level operation: the state it entered and its own stop token
#[derive(Debug, Clone)]
pub(crate) struct RunClaim {
    pub(crate) active: EngineState,
    pub(crate) stop: Arc<AtomicBool>,
}

/// State shared between an engine and the workers it spawns
#[derive(Debug)]
pub(crate) struct EngineCore {
    pub(crate) state: StateCell,
    /// Stop token of the most recently claimed run
    current: Mutex<Arc<AtomicBool>>,
    pub(crate) stats: StatsCollector,
}

impl EngineCore {
    pub(crate) fn new() -> Self {
        Self {
            state: StateCell::new(EngineState::Idle),
            current: Mutex::new(Arc::new(AtomicBool::new(false))),
            stats: StatsCollector::new(),
        }
    }

    /// Claim the engine for one top-level operation. Each claim gets a fresh
    /// stop token; tokens of earlier runs are never lowered again.
    pub(crate) fn enter(&self, target: EngineState, operation: &'static str) -> Result<RunClaim> {
        let mut current = self.current.lock();
        self.state
            .transition(EngineState::Idle, target)
            .map_err(|state| EngineError::InvalidState { state, operation })?;
        let stop = Arc::new(AtomicBool::new(false));
        *current = Arc::clone(&stop);
        debug!(?target, operation, "Engine entered active state");
        Ok(RunClaim { active: target, stop })
    }

    /// Raise the stop token of the latest run
    pub(crate) fn request_stop(&self) {
        self.current.lock().store(true, Ordering::SeqCst);
    }

    /// Return to Idle unless pause/stop/failure moved the state meanwhile or
    /// a newer run has claimed the engine.
    pub(crate) fn leave(&self, claim: &RunClaim) {
        let current = self.current.lock();
        if !Arc::ptr_eq(&current, &claim.stop) {
            debug!(active = ?claim.active, "Superseded run ended");
            return;
        }
        if let Err(state) = self.state.transition(claim.active, EngineState::Idle) {
            debug!(active = ?claim.active, current = ?state, "State changed during operation");
        }
    }

    /// Book a finished single or streaming generation and settle the state.
    pub(crate) fn finish(
        &self,
        claim: &RunClaim,
        outcome: std::result::Result<InferenceResult, GenerationFailure>,
    ) -> Result<InferenceResult> {
        match outcome {
            Ok(result) => {
                // cancelled runs are not completions
                if result.finished {
                    self.stats.record_completion(CompletionRecord {
                        tokens: result.completion_tokens,
                        latency: result.elapsed,
                    });
                }
                self.leave(claim);
                Ok(result)
            }
            Err(failure) => {
                self.stats.record_failure();
                self.fail(claim);
                if failure.error.touched_backend() {
                    error!(error = %failure.error, partial_tokens = failure.partial.completion_tokens, "Generation failed");
                } else {
                    warn!(error = %failure.error, "Generation failed");
                }
                Err(failure.error)
            }
        }
    }

    /// Move the engine to Error, but only from the failed run's own state
    /// (or a pause taken during it).
    fn fail(&self, claim: &RunClaim) {
        let current = self.current.lock();
        if !Arc::ptr_eq(&current, &claim.stop) {
            debug!(active = ?claim.active, "Superseded run failed");
            return;
        }
        loop {
            let state = self.state.load();
            if state != claim.active && state != EngineState::Paused {
                debug!(active = ?claim.active, current = ?state, "Run failed after its state was left");
                return;
            }
            if self.state.transition(state, EngineState::Error).is_ok() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            EngineState::Idle,
            EngineState::Running,
            EngineState::Streaming,
            EngineState::BatchProcessing,
            EngineState::Paused,
            EngineState::Error,
        ] {
            let cell = StateCell::new(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let cell = StateCell::new(EngineState::Idle);
        assert!(cell.transition(EngineState::Idle, EngineState::Running).is_ok());
        assert_eq!(
            cell.transition(EngineState::Idle, EngineState::Streaming),
            Err(EngineState::Running)
        );
        assert_eq!(cell.load(), EngineState::Running);
    }

    #[test]
    fn test_enter_rejects_busy_engine() {
        let core = EngineCore::new();
        core.request_stop();
        let claim = core.enter(EngineState::Running, "generate").unwrap();
        assert!(!claim.stop.load(Ordering::SeqCst));

        match core.enter(EngineState::Streaming, "stream") {
            Err(EngineError::InvalidState { state, .. }) => assert_eq!(state, EngineState::Running),
            other => panic!("expected InvalidState, got {:?}", other),
        }

        core.leave(&claim);
        assert_eq!(core.state.load(), EngineState::Idle);
    }

    #[test]
    fn test_leave_respects_pause() {
        let core = EngineCore::new();
        let claim = core.enter(EngineState::Streaming, "stream").unwrap();
        core.state.store(EngineState::Paused);
        core.leave(&claim);
        assert_eq!(core.state.load(), EngineState::Paused);
    }

    #[test]
    fn test_each_run_has_its_own_stop_token() {
        let core = EngineCore::new();
        let first = core.enter(EngineState::Streaming, "stream").unwrap();
        core.request_stop();
        core.state.store(EngineState::Idle);

        let second = core.enter(EngineState::Streaming, "stream").unwrap();
        assert!(first.stop.load(Ordering::SeqCst));
        assert!(!second.stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stale_run_does_not_settle_newer_run() {
        let core = EngineCore::new();
        let stale = core.enter(EngineState::Streaming, "stream").unwrap();
        core.request_stop();
        core.state.store(EngineState::Idle);
        let fresh = core.enter(EngineState::Streaming, "stream").unwrap();

        let failure = GenerationFailure {
            error: EngineError::InferenceFailed {
                code: -1,
                message: "late failure".to_string(),
            },
            partial: InferenceResult::empty(crate::types::FinishReason::Error),
        };
        assert!(core.finish(&stale, Err(failure)).is_err());
        assert_eq!(core.state.load(), EngineState::Streaming);

        core.leave(&stale);
        assert_eq!(core.state.load(), EngineState::Streaming);

        core.leave(&fresh);
        assert_eq!(core.state.load(), EngineState::Idle);
        assert_eq!(core.stats.snapshot().failed_inferences, 1);
    }

    #[test]
    fn test_failure_after_stop_keeps_idle() {
        let core = EngineCore::new();
        let claim = core.enter(EngineState::Running, "generate").unwrap();
        core.state.store(EngineState::Idle);

        let failure = GenerationFailure {
            error: EngineError::InferenceFailed {
                code: -2,
                message: "after stop".to_string(),
            },
            partial: InferenceResult::empty(crate::types::FinishReason::Error),
        };
        assert!(core.finish(&claim, Err(failure)).is_err());
        assert_eq!(core.state.load(), EngineState::Idle);
    }
}
