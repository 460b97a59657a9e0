//! Generation paths shared by the engine's single, streaming and batch calls

mod batch;
mod common;
mod stream;

pub(crate) use batch::BatchProcessor;
pub(crate) use common::{GenerationFailure, RunContext};
pub(crate) use stream::StreamProcessor;
