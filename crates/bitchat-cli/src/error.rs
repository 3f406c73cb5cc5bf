//! Error handling for the BitChat CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("BitChat core error: {0}")]
    BitchatCore(#[from] bitchat_core::BitchatError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Link initialization failed: {0}")]
    LinkInit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
