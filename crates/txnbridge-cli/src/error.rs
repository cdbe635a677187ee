//! Error handling for the txnbridge CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Bridge error: {0}")]
    Bridge(#[from] txnbridge_core::BridgeError),

    #[error("Workload error: {0}")]
    Workload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML encoding error: {0}")]
    TomlEncoding(#[from] toml::ser::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),
}

impl CliError {
    /// Stable failure name for the exit report
    pub fn reason(&self) -> &'static str {
        match self {
            CliError::Bridge(err) => err.reason(),
            CliError::Workload(_) => "workload",
            CliError::Io(_) => "io",
            CliError::Serialization(_) | CliError::TomlEncoding(_) => "serialization",
            CliError::TomlParsing(_) | CliError::HexDecoding(_) => "parse",
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
