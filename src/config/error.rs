//! Error types for configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading port configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config from {path:?}: {source}")]
    ReadError {
        /// Path that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a configuration file.
    #[error("Failed to parse config at {path:?}: {source}")]
    ParseError {
        /// Path that failed to parse.
        path: PathBuf,
        /// The underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}
