//! Engine module providing the main interface for running generations

mod builder;
mod engine;
mod state;

pub use builder::EngineBuilder;
pub use engine::InferenceEngine;
pub use state::EngineState;
