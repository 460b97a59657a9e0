//! NPU LLM Engine - managed execution of language models on embedded NPUs
//!
//! This crate accounts NPU cores and memory across loaded models and drives
//! each model through single, streaming, and batch generation with
//! cooperative cancellation and running statistics. The network itself runs
//! behind the [`native::NativeBackend`] contract.
//!
//! ```no_run
//! use std::sync::Arc;
//! use npu_llm_engine::{
//!     InferenceEngine, InferenceParams, ModelConfig, ResourceLimits, ResourceManager,
//!     SimulatedBackend,
//! };
//!
//! # fn main() -> npu_llm_engine::Result<()> {
//! let manager = ResourceManager::new(Arc::new(SimulatedBackend::new()), ResourceLimits::default());
//! manager.initialize()?;
//!
//! let model = manager.create_model(&ModelConfig::default())?;
//! let engine = InferenceEngine::with_model(model);
//! let result = engine.generate(&InferenceParams::new("Hello"))?;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod native;
pub mod resource;
pub mod sampling;
pub mod types;
pub mod utils;

// Internal modules
mod processing;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_RUST_VERSION: &str = "1.73.0";

// Re-exports for public API
pub use config::{EngineSettings, ModelConfig, ResourceLimits};
pub use engine::{EngineBuilder, EngineState, InferenceEngine};
pub use error::{EngineError, ErrorKind, Result};
pub use metrics::EngineStats;
pub use native::{NativeBackend, SimulatedBackend};
pub use resource::{HandleId, ModelHandle, ResourceManager, ResourceStats};
pub use sampling::SamplingStrategy;
pub use types::{
    BatchRequest, BatchResult, FinishReason, GenerationHandle, InferenceParams, InferenceResult,
};
