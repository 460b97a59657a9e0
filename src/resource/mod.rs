//! NPU budget accounting and model lifecycle

mod handle;
mod manager;

pub use handle::{HandleId, ModelHandle};
pub use manager::{ModelInfo, ResourceManager, ResourceStats};
