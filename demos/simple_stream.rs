use anyhow::Result;
use npu_llm_engine::{
    utils::{setup_logging, LogConfig},
    InferenceEngine, InferenceParams, ModelConfig, ResourceLimits, ResourceManager,
    SimulatedBackend,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    setup_logging(LogConfig::default()).map_err(anyhow::Error::msg)?;

    let backend = SimulatedBackend::new()
        .with_vocabulary(
            ["the", "npu", "runs", "tokens", "quickly", "and", "quietly", "on", "three", "cores"],
            24,
        )
        .with_token_delay(Duration::from_millis(40));

    let manager = ResourceManager::new(
        Arc::new(backend),
        ResourceLimits::default().with_total_memory(8 * 1024 * 1024 * 1024),
    );
    manager.initialize()?;

    let model = manager.create_model(&ModelConfig::optimized("models/qwen-1.8b.rkllm"))?;
    info!(handle = %model.id(), "Model loaded");
    let engine = InferenceEngine::with_model(model);

    // Stream on this thread
    let params = InferenceParams::new("Tell me about the NPU").with_max_tokens(16);
    let result = engine.generate_stream(&params, |fragment, is_last| {
        print!("{}", fragment);
        if is_last {
            println!();
        }
        let _ = std::io::stdout().flush();
    })?;
    info!(
        tokens = result.completion_tokens,
        tokens_per_second = result.tokens_per_second,
        reason = %result.finish_reason,
        "Stream finished"
    );

    // Stream on a worker and stop it part way
    let handle = engine.generate_stream_async(InferenceParams::new("Keep talking"), |fragment, _| {
        print!("{}", fragment);
        let _ = std::io::stdout().flush();
    })?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.stop();

    let result = handle.await?;
    println!();
    info!(finished = result.finished, text_len = result.text.len(), "Stopped stream");

    let stats = engine.get_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    manager.cleanup();
    Ok(())
}
