//! Utility functions for logging, memory probing, and token accounting

mod logging;
mod memory;
mod tokenizer;

pub use logging::{setup_logging, LogConfig};
pub use memory::SystemMemory;
pub use tokenizer::{estimate_tokens, TokenCount};
