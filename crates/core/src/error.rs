//! Error types for the renderer.

use thiserror::Error;

/// Main error type for the renderer's shared utilities.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse errors while loading a configuration file
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// TOML serialization errors while saving a configuration file
    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Variable registry errors
    #[error("Variable '{name}': {message}")]
    Var { name: String, message: String },
}

/// Result type alias using the renderer's Error type.
pub type Result<T> = std::result::Result<T, Error>;
