// Location: src/config.rs

use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};

use crate::error::{EngineError, Result};
use crate::types::InferenceParams;

/// Upper bound on NPU cores a single model may request (RK3588 has three).
pub const MAX_NPU_CORES: u32 = 3;

/// Load-time parameters for one model instance on the NPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the converted model file
    pub model_path: PathBuf,

    /// Maximum context window in tokens
    pub max_context_len: usize,

    /// Maximum number of tokens generated per request
    pub max_new_tokens: usize,

    /// Top-k sampling default
    pub top_k: usize,

    /// Top-p sampling default
    pub top_p: f32,

    /// Sampling temperature default
    pub temperature: f32,

    /// Repetition penalty default
    pub repeat_penalty: f32,

    /// Number of NPU cores to bind the model to
    pub npu_core_num: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.rkllm"),
            max_context_len: 2048,
            max_new_tokens: 512,
            top_k: 40,
            top_p: 0.9,
            temperature: 0.7,
            repeat_penalty: 1.1,
            npu_core_num: 1,
        }
    }
}

impl ModelConfig {
    /// Configuration tuned for running a single large model across all cores
    pub fn optimized(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            max_context_len: 4096,
            max_new_tokens: 1024,
            top_k: 20,
            top_p: 0.8,
            temperature: 0.6,
            repeat_penalty: 1.1,
            npu_core_num: MAX_NPU_CORES,
        }
    }

    /// Every violated constraint, in declaration order
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.model_path.as_os_str().is_empty() {
            violations.push("model_path must not be empty".to_string());
        }
        if !(1..=4096).contains(&self.max_context_len) {
            violations.push("max_context_len must be between 1 and 4096".to_string());
        }
        if !(1..=2048).contains(&self.max_new_tokens) {
            violations.push("max_new_tokens must be between 1 and 2048".to_string());
        }
        if !(1..=100).contains(&self.top_k) {
            violations.push("top_k must be between 1 and 100".to_string());
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            violations.push("top_p must be in (0.0, 1.0]".to_string());
        }
        if !(self.temperature > 0.0 && self.temperature <= 2.0) {
            violations.push("temperature must be in (0.0, 2.0]".to_string());
        }
        if !(1.0..=2.0).contains(&self.repeat_penalty) {
            violations.push("repeat_penalty must be between 1.0 and 2.0".to_string());
        }
        if !(1..=MAX_NPU_CORES).contains(&self.npu_core_num) {
            violations.push(format!("npu_core_num must be between 1 and {}", MAX_NPU_CORES));
        }

        violations
    }

    pub fn is_valid(&self) -> bool {
        self.violations().is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig { violations })
        }
    }
}

/// Budget the resource manager admits models against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// NPU cores available to all models together
    pub total_npu_cores: u32,

    /// Coarse memory charge per loaded model, in bytes
    pub per_model_memory_bytes: u64,

    /// Fraction of system memory models may occupy
    pub memory_headroom: f64,

    /// Fixed total memory; read from the system when unset
    pub total_memory_bytes: Option<u64>,

    /// Refuse models whose file does not exist
    pub check_model_path: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            total_npu_cores: MAX_NPU_CORES,
            per_model_memory_bytes: 1024 * 1024 * 1024,
            memory_headroom: 0.8,
            total_memory_bytes: None,
            check_model_path: false,
        }
    }
}

impl ResourceLimits {
    pub fn with_total_memory(mut self, bytes: u64) -> Self {
        self.total_memory_bytes = Some(bytes);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        if self.total_npu_cores == 0 {
            violations.push("total_npu_cores must be at least 1".to_string());
        }
        if !(self.memory_headroom > 0.0 && self.memory_headroom <= 1.0) {
            violations.push("memory_headroom must be in (0.0, 1.0]".to_string());
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig { violations })
        }
    }

    pub(crate) fn model_file_missing(&self, path: &Path) -> bool {
        self.check_model_path && !path.exists()
    }
}

/// Tunables for an inference engine; changes apply to future requests only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Advisory limit on in-flight inferences per engine
    pub max_concurrent_inferences: usize,

    /// Capacity of the backend-to-engine fragment channel
    pub stream_buffer_size: usize,

    /// Whether the native backend keeps its KV cache between runs
    pub kv_cache_enabled: bool,

    /// Parameters used by `generate_with_defaults`
    pub default_params: InferenceParams,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_inferences: 1,
            stream_buffer_size: 256,
            kv_cache_enabled: true,
            default_params: InferenceParams::default(),
        }
    }
}

impl EngineSettings {
    pub const MAX_CONCURRENT_RANGE: std::ops::RangeInclusive<usize> = 1..=16;
    pub const STREAM_BUFFER_RANGE: std::ops::RangeInclusive<usize> = 1..=4096;

    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        if !Self::MAX_CONCURRENT_RANGE.contains(&self.max_concurrent_inferences) {
            violations.push("maxConcurrentInferences must be between 1 and 16".to_string());
        }
        if !Self::STREAM_BUFFER_RANGE.contains(&self.stream_buffer_size) {
            violations.push("streamBufferSize must be between 1 and 4096".to_string());
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigurationError { violations })
        }
    }
}
