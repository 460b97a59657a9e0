use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use tracing::{debug, trace};

use crate::{
    error::EngineError,
    native::{CallState, InferMode, NativeBackend, NativeEvent, NativeInput, RawHandle, ResultSink, TokenUsage},
    types::{FinishReason, InferenceParams, InferenceResult},
    utils::TokenCount,
};

/// Everything a worker needs to run requests against one model
#[derive(Clone)]
pub(crate) struct RunContext {
    pub backend: Arc<dyn NativeBackend>,
    pub raw: RawHandle,
    pub keep_history: bool,
    pub buffer: usize,
    /// Checked once per fragment when set
    pub stop: Option<Arc<AtomicBool>>,
}

/// A generation that did not complete, with whatever it produced
#[derive(Debug)]
pub(crate) struct GenerationFailure {
    pub error: EngineError,
    pub partial: InferenceResult,
}

/// How consumption of the fragment channel ended
#[derive(Debug)]
enum End {
    Completed,
    Length,
    StopSequence,
    Cancelled,
    Failed(String),
    Closed,
}

impl End {
    /// The engine stopped reading before the backend finished
    fn is_early(&self) -> bool {
        matches!(self, End::Length | End::StopSequence | End::Cancelled)
    }
}

struct Consumed {
    text: String,
    fragments: usize,
    usage: Option<TokenUsage>,
    end: End,
}

/// Run one request through the native backend.
///
/// The backend executes on a helper thread and pushes fragments into a
/// bounded channel; this thread consumes them in arrival order and forwards
/// each to `on_fragment(text, is_last)`. Dropping the receiver early (on
/// cancellation, length limit or stop sequence) tells the backend to wind down.
pub(crate) fn drive<F>(
    ctx: &RunContext,
    params: &InferenceParams,
    on_fragment: F,
) -> Result<InferenceResult, GenerationFailure>
where
    F: FnMut(&str, bool),
{
    let start = Instant::now();
    let (sink, receiver) = ResultSink::bounded(ctx.buffer);
    let input = NativeInput::user_prompt(params.prompt.as_str());
    let mode = InferMode::from_params(params, ctx.keep_history);

    let (consumed, code) = std::thread::scope(|scope| {
        let backend = &ctx.backend;
        let runner = scope.spawn(move || {
            let code = backend.run(ctx.raw, &input, &mode, &sink);
            drop(sink);
            code
        });

        let consumed = consume(receiver, params, ctx.stop.as_deref(), on_fragment);
        if consumed.end.is_early() {
            backend.abort(ctx.raw);
        }
        let code = runner.join().unwrap_or(-1);
        (consumed, code)
    });

    let counts = TokenCount::resolve(&params.prompt, consumed.fragments, consumed.usage);
    let elapsed = start.elapsed();
    let result = |finished, reason| {
        InferenceResult::new(
            consumed.text.clone(),
            counts.prompt,
            counts.completion,
            elapsed,
            finished,
            reason,
        )
    };

    debug!(
        handle = %ctx.raw,
        end = ?consumed.end,
        code,
        tokens = counts.completion,
        elapsed_ms = elapsed.as_millis() as u64,
        "Native run finished"
    );

    match consumed.end {
        End::Completed | End::Closed if code == 0 => Ok(result(true, FinishReason::Completed)),
        End::Completed | End::Closed => Err(GenerationFailure {
            error: EngineError::InferenceFailed {
                code,
                message: "native run returned a non-zero status".to_string(),
            },
            partial: result(false, FinishReason::Error),
        }),
        End::Length => Ok(result(true, FinishReason::Length)),
        End::StopSequence => Ok(result(true, FinishReason::Stop)),
        End::Cancelled => Ok(result(false, FinishReason::Stop)),
        End::Failed(message) => Err(GenerationFailure {
            error: EngineError::InferenceFailed {
                code: if code == 0 { -1 } else { code },
                message,
            },
            partial: result(false, FinishReason::Error),
        }),
    }
}

fn consume<F>(
    receiver: Receiver<NativeEvent>,
    params: &InferenceParams,
    stop: Option<&AtomicBool>,
    on_fragment: F,
) -> Consumed
where
    F: FnMut(&str, bool),
{
    let stopped = || stop.map_or(false, |flag| flag.load(Ordering::SeqCst));
    let mut out = Delivery::new(on_fragment, &params.stop_sequences);
    let mut consumed = Consumed {
        text: String::new(),
        fragments: 0,
        usage: None,
        end: End::Closed,
    };

    for event in receiver.iter() {
        if stopped() {
            consumed.end = End::Cancelled;
            break;
        }

        match event.state {
            CallState::Waiting => continue,
            CallState::Normal => {
                if event.text.is_empty() {
                    continue;
                }
                consumed.fragments += 1;
                consumed.text.push_str(&event.text);

                if let Some(at) = find_stop_sequence(&consumed.text, &params.stop_sequences) {
                    consumed.text.truncate(at);
                    out.finish(&consumed.text);
                    consumed.end = End::StopSequence;
                    break;
                }
                if consumed.fragments >= params.max_tokens {
                    out.finish(&consumed.text);
                    consumed.end = End::Length;
                    break;
                }
                out.advance(&consumed.text);
            }
            CallState::Finish => {
                consumed.usage = event.usage;
                out.finish(&consumed.text);
                consumed.end = End::Completed;
                break;
            }
            CallState::Error => {
                consumed.end = End::Failed(if event.text.is_empty() {
                    "native backend reported an error".to_string()
                } else {
                    event.text
                });
                break;
            }
        }

        if stopped() {
            trace!(fragments = consumed.fragments, "Stop requested after fragment");
            consumed.end = End::Cancelled;
            break;
        }
    }

    // a cancelled run reports only what the caller has already seen
    if matches!(consumed.end, End::Cancelled) {
        consumed.text.truncate(out.delivered);
    }
    consumed
}

/// Forwards generated text to the caller, holding back a tail that could
/// still turn out to be the start of a stop sequence.
struct Delivery<F> {
    on_fragment: F,
    delivered: usize,
    hold_back: usize,
}

impl<F> Delivery<F>
where
    F: FnMut(&str, bool),
{
    fn new(on_fragment: F, stop_sequences: &[String]) -> Self {
        let longest = stop_sequences.iter().map(String::len).max().unwrap_or(0);
        Self {
            on_fragment,
            delivered: 0,
            hold_back: longest.saturating_sub(1),
        }
    }

    /// Deliver everything in `text` that no stop sequence can still claim
    fn advance(&mut self, text: &str) {
        let mut safe = text.len().saturating_sub(self.hold_back);
        while !text.is_char_boundary(safe) {
            safe -= 1;
        }
        if safe > self.delivered {
            (self.on_fragment)(&text[self.delivered..safe], false);
            self.delivered = safe;
        }
    }

    /// Deliver the rest of the final `text` with `is_last` set
    fn finish(&mut self, text: &str) {
        let rest = text.get(self.delivered..).unwrap_or("");
        (self.on_fragment)(rest, true);
        self.delivered = text.len();
    }
}

/// Byte offset of the earliest stop sequence in `text`
fn find_stop_sequence(text: &str, stop_sequences: &[String]) -> Option<usize> {
    stop_sequences
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeParams, SimulatedBackend};
    use std::path::PathBuf;

    fn context(backend: SimulatedBackend) -> RunContext {
        let backend: Arc<dyn NativeBackend> = Arc::new(backend);
        let raw = backend
            .init(&NativeParams::from(&crate::config::ModelConfig {
                model_path: PathBuf::from("m"),
                ..Default::default()
            }))
            .unwrap();
        RunContext {
            backend,
            raw,
            keep_history: false,
            buffer: 2,
            stop: None,
        }
    }

    #[test]
    fn test_drive_collects_fragments_in_order() {
        let ctx = context(SimulatedBackend::new());
        let mut seen = Vec::new();
        let result = drive(&ctx, &InferenceParams::new("one two three four"), |text, last| {
            seen.push((text.to_string(), last))
        })
        .unwrap();

        assert_eq!(result.text, "one two three four");
        assert!(result.finished);
        assert_eq!(result.finish_reason, FinishReason::Completed);
        assert_eq!(result.completion_tokens, 4);
        assert_eq!(result.prompt_tokens, 5);
        assert_eq!(seen.last(), Some(&(String::new(), true)));
        assert_eq!(seen.iter().filter(|(_, last)| *last).count(), 1);
    }

    #[test]
    fn test_length_limit() {
        let ctx = context(SimulatedBackend::new().with_script(["a", "b", "c", "d", "e"]));
        let mut last_flags = Vec::new();
        let params = InferenceParams::new("x").with_max_tokens(3);
        let result = drive(&ctx, &params, |_, last| last_flags.push(last)).unwrap();

        assert_eq!(result.text, "abc");
        assert_eq!(result.finish_reason, FinishReason::Length);
        assert_eq!(last_flags, vec![false, false, true]);
    }

    #[test]
    fn test_stop_sequence_truncates() {
        let ctx = context(SimulatedBackend::new().with_script(["Hello", " world", "\n", "User:", " more"]));
        let params = InferenceParams::new("x").with_stop_sequence("\nUser:");
        let result = drive(&ctx, &params, |_, _| {}).unwrap();

        assert_eq!(result.text, "Hello world");
        assert!(result.finished);
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }

    fn streamed(script: &[&str], stop: &str) -> (String, Vec<bool>, InferenceResult) {
        let ctx = context(SimulatedBackend::new().with_script(script.iter().copied()));
        let params = InferenceParams::new("x").with_stop_sequence(stop);
        let mut text = String::new();
        let mut lasts = Vec::new();
        let result = drive(&ctx, &params, |fragment, last| {
            text.push_str(fragment);
            lasts.push(last);
        })
        .unwrap();
        (text, lasts, result)
    }

    #[test]
    fn test_streamed_text_matches_result_at_stop_sequence() {
        let (text, lasts, result) = streamed(&["Hi", "\n", "there END more"], "\nthere");
        assert_eq!(result.text, "Hi");
        assert_eq!(text, result.text);
        assert_eq!(lasts.iter().filter(|last| **last).count(), 1);
        assert_eq!(lasts.last(), Some(&true));

        let (text, _, result) = streamed(&["Hi", "\n", "there END more"], "END");
        assert_eq!(result.text, "Hi\nthere ");
        assert_eq!(text, result.text);
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_held_back_tail_is_flushed_on_completion() {
        let (text, lasts, result) = streamed(&["ab", "c", "é"], "xyz");
        assert_eq!(result.text, "abcé");
        assert_eq!(text, result.text);
        assert_eq!(result.finish_reason, FinishReason::Completed);
        assert_eq!(lasts.last(), Some(&true));
    }

    #[test]
    fn test_reported_usage_wins() {
        let ctx = context(SimulatedBackend::new().reporting_usage());
        let result = drive(&ctx, &InferenceParams::new("a b c"), |_, _| {}).unwrap();
        assert_eq!(result.prompt_tokens, 3);
        assert_eq!(result.completion_tokens, 3);
        assert_eq!(result.total_tokens, 6);
    }

    #[test]
    fn test_backend_error_is_a_failure() {
        let ctx = context(SimulatedBackend::new().with_script(["a", "b", "c"]).failing_after(2));
        let failure = drive(&ctx, &InferenceParams::new("x"), |_, _| {}).unwrap_err();

        assert!(matches!(failure.error, EngineError::InferenceFailed { code: -1, .. }));
        assert_eq!(failure.partial.text, "ab");
        assert_eq!(failure.partial.finish_reason, FinishReason::Error);
        assert!(!failure.partial.finished);
    }

    #[test]
    fn test_non_zero_run_code() {
        let ctx = context(SimulatedBackend::new().failing_run(-3));
        let failure = drive(&ctx, &InferenceParams::new("x"), |_, _| {}).unwrap_err();
        assert!(matches!(failure.error, EngineError::InferenceFailed { code: -3, .. }));
    }

    #[test]
    fn test_stop_flag_after_first_fragment() {
        let mut ctx = context(SimulatedBackend::new().with_script(["a", "b", "c"]));
        let stop = Arc::new(AtomicBool::new(false));
        ctx.stop = Some(stop.clone());

        let mut delivered = 0;
        let result = drive(&ctx, &InferenceParams::new("x"), |_, _| {
            delivered += 1;
            stop.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(delivered, 1);
        assert!(!result.finished);
        assert_eq!(result.text, "a");
    }

    #[test]
    fn test_early_end_aborts_native_run() {
        let backend = Arc::new(SimulatedBackend::new().with_script(["a", "b", "c", "d"]));
        let mut ctx = context(SimulatedBackend::new());
        ctx.raw = backend.init(&NativeParams::from(&crate::config::ModelConfig::default())).unwrap();
        ctx.backend = backend.clone();

        let params = InferenceParams::new("x").with_max_tokens(10).with_stop_sequence("b");
        drive(&ctx, &params, |_, _| {}).unwrap();
        assert_eq!(backend.abort_calls(), 1);

        drive(&ctx, &InferenceParams::new("x"), |_, _| {}).unwrap();
        assert_eq!(backend.abort_calls(), 1);
    }

    #[test]
    fn test_find_stop_sequence() {
        let stops = vec!["END".to_string(), "\n\n".to_string(), String::new()];
        assert_eq!(find_stop_sequence("abc\n\nxyz END", &stops), Some(3));
        assert_eq!(find_stop_sequence("nothing", &stops), None);
    }
}
