//! Error types for the sonolink simulator

use thiserror::Error;

/// Result type alias for simulator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading or running a scenario
#[derive(Debug, Error)]
pub enum Error {
    /// Scenario file or value error
    #[error("Scenario error: {0}")]
    Config(String),

    /// Replication core error
    #[error(transparent)]
    Core(#[from] sonolink_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
