//! Error types for the bolus_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for bolus_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dose computation input was rejected before calculation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The record source could not be reached or returned garbage
    #[error("Record source error: {0}")]
    RecordSource(String),

    /// A confirmed injection could not be written back to the source
    #[error("Sync failed: {0}")]
    SyncFailed(String),

    /// Timer state error
    #[error("Timer error: {0}")]
    Timer(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
