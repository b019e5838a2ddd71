//! Error taxonomy shared by every stage of the offload pipeline.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by device discovery, compilation and execution.
///
/// None of these are fatal to the hosting process: the request-handling layer
/// reports any of them as a failed simulation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("No compute platform available")]
    NoPlatform,
    #[error("No compute device matches the selection")]
    NoDevice,
    #[error("Context creation failed: {0}")]
    ContextCreationFailed(String),
    #[error("Kernel build failed:\n{log}")]
    BuildFailed { log: String },
    #[error("Kernel execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Device operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Device session is closed")]
    SessionClosed,
}

impl DeviceError {
    /// Shorthand for an [`DeviceError::ExecutionFailed`] with context.
    pub fn execution(stage: &str, reason: impl std::fmt::Display) -> Self {
        DeviceError::ExecutionFailed(format!("{}: {}", stage, reason))
    }
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, DeviceError>;
