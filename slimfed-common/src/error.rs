//! Error types for slimfed

use thiserror::Error;

/// Error types for the slimfed library.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Architecture identifier parsing errors.
    #[error("Invalid architecture identifier '{arch}': {reason}")]
    InvalidArch {
        /// The offending identifier.
        arch: String,
        /// Why it could not be parsed.
        reason: String,
    },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}
