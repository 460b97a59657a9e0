//! Engine statistics

mod collector;
mod types;

pub use collector::StatsCollector;
pub use types::{CompletionRecord, EngineStats};
