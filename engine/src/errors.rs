//! Error types for the deployment engine

use thiserror::Error;

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Malformed submission, rejected before any resource is touched
    #[error("Invalid input: {0}")]
    InputError(String),

    /// Clone or extraction exhausted every option
    #[error("Source acquisition failed: {0}")]
    AcquisitionError(String),

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// Image build failed; no container exists
    #[error("Build failed: {0}")]
    BuildFailed(String),

    /// A container was created but never reached the running state
    #[error("Container failed to start: {0}")]
    ContainerStartFailed(String),

    #[error("No free port in range {start}..{end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Container runtime error: {0}")]
    RuntimeError(String),

    #[error("Record store error: {0}")]
    StoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::IoError(_) => "io_error",
            EngineError::JsonError(_) => "json_error",
            EngineError::InputError(_) => "invalid_input",
            EngineError::AcquisitionError(_) => "acquisition_failed",
            EngineError::InvalidArchive(_) => "invalid_archive",
            EngineError::BuildFailed(_) => "build_failed",
            EngineError::ContainerStartFailed(_) => "start_failed",
            EngineError::ResourceExhausted { .. } => "resource_exhausted",
            EngineError::InvalidTransition(_) => "invalid_transition",
            EngineError::RuntimeError(_) => "runtime_error",
            EngineError::StoreError(_) => "store_error",
            EngineError::ConfigError(_) => "config_error",
            EngineError::ServerError(_) => "server_error",
            EngineError::ShutdownError(_) => "shutdown_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::Internal(_) => "internal_error",
        }
    }
}
