//! Error types for the Delta cognition core

use std::fmt;

/// Main error type for the Delta crate
#[derive(Debug)]
pub enum DeltaError {
    /// IO related errors
    Io { source: std::io::Error },

    /// Serialization/deserialization errors
    Serialization { source: Box<dyn std::error::Error + Send + Sync> },

    /// The model host cannot be reached (recoverable; the health monitor re-probes)
    RemoteUnavailable,

    /// The model host returned a structured error (not retried)
    RemoteError { message: String },

    /// Operation was cancelled; never logged as an error
    Cancelled,

    /// Invalid input provided to a function
    InvalidInput(String),

    /// Persistent store failed; in-memory state remains authoritative
    StorageError(String),

    /// Non-fatal degradation (e.g. speculation disabled by low acceptance)
    Degraded(String),

    /// Configuration errors
    ConfigError(String),
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeltaError::Io { source } => write!(f, "IO error: {}", source),
            DeltaError::Serialization { source } => write!(f, "Serialization error: {}", source),
            DeltaError::RemoteUnavailable => write!(f, "Model host unavailable"),
            DeltaError::RemoteError { message } => write!(f, "Model host error: {}", message),
            DeltaError::Cancelled => write!(f, "Operation cancelled"),
            DeltaError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            DeltaError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            DeltaError::Degraded(msg) => write!(f, "Degraded: {}", msg),
            DeltaError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for DeltaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeltaError::Io { source } => Some(source),
            DeltaError::Serialization { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DeltaError {
    fn from(error: std::io::Error) -> Self {
        DeltaError::Io { source: error }
    }
}

impl From<serde_json::Error> for DeltaError {
    fn from(error: serde_json::Error) -> Self {
        DeltaError::Serialization { source: Box::new(error) }
    }
}

impl From<std::num::ParseIntError> for DeltaError {
    fn from(error: std::num::ParseIntError) -> Self {
        DeltaError::InvalidInput(format!("Failed to parse integer: {}", error))
    }
}

impl From<std::num::ParseFloatError> for DeltaError {
    fn from(error: std::num::ParseFloatError) -> Self {
        DeltaError::InvalidInput(format!("Failed to parse float: {}", error))
    }
}

impl From<regex::Error> for DeltaError {
    fn from(error: regex::Error) -> Self {
        DeltaError::ConfigError(format!("Invalid pattern: {}", error))
    }
}

/// Result type for the Delta crate
pub type Result<T> = std::result::Result<T, DeltaError>;
