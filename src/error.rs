//! vtunnel Error Types

use thiserror::Error;

/// Result type alias for vtunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// vtunnel error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    // Device errors
    #[error("Device error: {0}")]
    Device(String),

    // Per-datagram errors
    #[error("Malformed datagram: {0}")]
    Format(String),

    /// Digest mismatch or bad padding. Must not say which.
    #[error("Datagram failed authentication")]
    AuthOrPadding,

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(std::io::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Status serialization error: {0}")]
    Status(#[from] serde_json::Error),
}
