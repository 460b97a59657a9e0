use anyhow::Result;
use npu_llm_engine::{
    utils::{setup_logging, LogConfig},
    BatchRequest, EngineSettings, InferenceEngine, InferenceParams, ModelConfig, ResourceLimits,
    ResourceManager, SimulatedBackend,
};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(LogConfig::default()).map_err(anyhow::Error::msg)?;

    // Prompts come from a file, one per line, or a built-in list
    let args: Vec<String> = std::env::args().collect();
    let prompts: Vec<String> = match args.get(1) {
        Some(path) => BufReader::new(File::open(path)?)
            .lines()
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect(),
        None => vec![
            "Summarize the quarterly report".to_string(),
            "Translate good morning into French".to_string(),
            String::new(),
            "List three uses of an NPU".to_string(),
        ],
    };

    let manager = ResourceManager::new(
        Arc::new(SimulatedBackend::new()),
        ResourceLimits::default().with_total_memory(8 * 1024 * 1024 * 1024),
    );
    manager.initialize()?;

    let engine = InferenceEngine::builder()
        .with_model(manager.create_model(&ModelConfig::default())?)
        .with_settings(EngineSettings {
            stream_buffer_size: 64,
            ..Default::default()
        })
        .build()?;

    let requests: Vec<BatchRequest> = prompts
        .into_iter()
        .enumerate()
        .map(|(i, prompt)| BatchRequest::new(format!("req-{}", i), InferenceParams::new(prompt).with_max_tokens(64)))
        .collect();

    let start = Instant::now();
    let results = engine.generate_batch_async(requests)?.await?;
    info!(items = results.len(), elapsed_ms = start.elapsed().as_millis() as u64, "Batch done");

    for item in &results {
        match &item.error {
            None => println!("[{}] {} ({} tokens)", item.id, item.result.text, item.result.completion_tokens),
            Some(error) => println!("[{}] failed: {}", item.id, error),
        }
    }

    let stats = engine.get_stats();
    info!(
        total = stats.total_inferences,
        failed = stats.failed_inferences,
        tokens = stats.total_tokens_generated,
        "Engine statistics"
    );
    Ok(())
}
