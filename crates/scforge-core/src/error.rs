//! Unified error types for scforge

use std::time::Duration;
use thiserror::Error;

/// Unified error type for all scforge operations
#[derive(Error, Debug)]
pub enum ForgeError {
    // Environment errors (fatal for a session)
    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Toolchain not found: {0}")]
    ToolchainMissing(String),

    // Toolchain errors
    #[error("Toolchain error: {0}")]
    Toolchain(String),

    #[error("Build timed out after {0:?}")]
    BuildTimeout(Duration),

    #[error("Program identity not found: {0}")]
    IdentityNotFound(String),

    // Generation errors
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("API error: {0}")]
    Api(String),

    #[error("API limit: {0}")]
    ApiLimit(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    // Session errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl ForgeError {
    /// Environment errors abort a session without consuming attempt budget.
    pub fn is_environment(&self) -> bool {
        matches!(self, Self::Workspace(_) | Self::ToolchainMissing(_))
    }
}

/// Result type alias using ForgeError
pub type Result<T> = std::result::Result<T, ForgeError>;
