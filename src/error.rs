use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineState;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid model configuration: {}", violations.join(", "))]
    InvalidConfig { violations: Vec<String> },

    #[error("{resource:?} exhausted: requested {requested}, available {available}")]
    ResourceExhausted {
        resource: ResourceType,
        requested: u64,
        available: u64,
    },

    #[error("Invalid model handle: {message}")]
    InvalidHandle { message: String },

    #[error("Resource manager not initialized: {message}")]
    InitializationFailed { message: String },

    #[error("Native model initialization failed with code {code}")]
    ModelLoadFailed { code: i32 },

    #[error("Configuration error: {}", violations.join(", "))]
    ConfigurationError { violations: Vec<String> },

    #[error("Cannot {operation} while engine is {state:?}")]
    InvalidState {
        state: EngineState,
        operation: &'static str,
    },

    #[error("Inference failed (code {code}): {message}")]
    InferenceFailed { code: i32, message: String },

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

/// Resources accounted by the admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    NpuCores,
    Memory,
}

/// Flat error classification with stable numeric codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Success,
    InvalidConfig,
    ResourceExhausted,
    InvalidHandle,
    InitializationFailed,
    ModelLoadFailed,
    ConfigurationError,
    InvalidState,
    InferenceFailed,
    Unknown,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Success => 0,
            ErrorKind::InvalidConfig => -1,
            ErrorKind::ResourceExhausted => -2,
            ErrorKind::InvalidHandle => -3,
            ErrorKind::InitializationFailed => -4,
            ErrorKind::ModelLoadFailed => -5,
            ErrorKind::ConfigurationError => -6,
            ErrorKind::InvalidState => -7,
            ErrorKind::InferenceFailed => -8,
            ErrorKind::Unknown => -99,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::Success => "Success",
            ErrorKind::InvalidConfig => "Invalid model configuration",
            ErrorKind::ResourceExhausted => "Insufficient NPU cores or memory",
            ErrorKind::InvalidHandle => "Invalid or inactive model handle",
            ErrorKind::InitializationFailed => "Resource manager is not initialized",
            ErrorKind::ModelLoadFailed => "Failed to load model on the NPU",
            ErrorKind::ConfigurationError => "Invalid inference parameters",
            ErrorKind::InvalidState => "Operation not allowed in the current engine state",
            ErrorKind::InferenceFailed => "Inference failed in the native backend",
            ErrorKind::Unknown => "Unknown error",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            EngineError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            EngineError::InvalidHandle { .. } => ErrorKind::InvalidHandle,
            EngineError::InitializationFailed { .. } => ErrorKind::InitializationFailed,
            EngineError::ModelLoadFailed { .. } => ErrorKind::ModelLoadFailed,
            EngineError::ConfigurationError { .. } => ErrorKind::ConfigurationError,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::InferenceFailed { .. } => ErrorKind::InferenceFailed,
            EngineError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub(crate) fn invalid_handle(message: impl Into<String>) -> Self {
        EngineError::InvalidHandle {
            message: message.into(),
        }
    }
}

/// Extension trait for error handling utilities
pub(crate) trait ErrorExt {
    fn is_recoverable(&self) -> bool;
    fn touched_backend(&self) -> bool;
}

impl ErrorExt for EngineError {
    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ResourceExhausted { .. }
                | EngineError::ConfigurationError { .. }
                | EngineError::InvalidConfig { .. }
        )
    }

    fn touched_backend(&self) -> bool {
        matches!(
            self,
            EngineError::ModelLoadFailed { .. }
                | EngineError::InferenceFailed { .. }
                | EngineError::Unknown { .. }
        )
    }
}
