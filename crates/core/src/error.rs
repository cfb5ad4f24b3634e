//! Error types shared by the engine crates.

use thiserror::Error;

/// Main error type for engine-level failures outside the Vulkan layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Vulkan-related errors surfaced as text (surface creation, extension queries)
    #[error("Vulkan error: {0}")]
    Vulkan(String),

    /// Window creation or management errors
    #[error("Window error: {0}")]
    Window(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration file
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration values that parse but make no sense
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;
