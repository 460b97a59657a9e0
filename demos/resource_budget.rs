use anyhow::Result;
use npu_llm_engine::{
    utils::{setup_logging, LogConfig},
    EngineError, ModelConfig, ResourceLimits, ResourceManager, SimulatedBackend,
};
use std::sync::Arc;
use tracing::{info, warn};

fn main() -> Result<()> {
    setup_logging(LogConfig::default()).map_err(anyhow::Error::msg)?;

    // Total memory is read from /proc/meminfo when not overridden
    let manager = ResourceManager::new(Arc::new(SimulatedBackend::new()), ResourceLimits::default());
    manager.initialize()?;

    let config = ModelConfig {
        npu_core_num: 2,
        ..ResourceManager::default_config()
    };

    let mut loaded = Vec::new();
    for attempt in 1..=3 {
        match manager.create_model(&config) {
            Ok(handle) => {
                info!(attempt, handle = %handle.id(), "Model admitted");
                loaded.push(handle);
            }
            Err(e @ EngineError::ResourceExhausted { .. }) => {
                warn!(attempt, error = %e, code = e.kind().code(), "Model rejected");
            }
            Err(e) => return Err(e.into()),
        }
        let stats = manager.get_resource_stats();
        println!(
            "cores {}/{}  memory {}/{} MiB  utilization {:.0}%",
            stats.npu_cores_used,
            stats.npu_cores_total,
            stats.memory_used / (1024 * 1024),
            stats.memory_total / (1024 * 1024),
            stats.npu_utilization
        );
    }

    for handle in loaded {
        let info = manager.model_info(handle.id())?;
        info!(instance = %info.instance_id, cores = info.npu_cores, "Unloading");
        manager.destroy_model(handle)?;
    }

    println!("{}", serde_json::to_string_pretty(&manager.get_resource_stats())?);
    Ok(())
}
