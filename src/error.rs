//! # Error Types
//!
//! Custom error types for fl2sitl using `thiserror`.

use thiserror::Error;

/// Main error type for the replay bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// MSP protocol errors (malformed or unexpected frames)
    #[error("MSP protocol error: {0}")]
    Msp(String),

    /// RC receiver encoder errors
    #[error("RX error: {0}")]
    Rx(String),

    /// Simulator process or handshake errors
    #[error("Simulator error: {0}")]
    Simulator(String),

    /// A host:port that could not be resolved or connected
    #[error("Cannot resolve address {0}")]
    AddressResolve(String),

    /// The peer end of a task channel has gone away
    #[error("Link closed: {0}")]
    LinkClosed(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Malformed or truncated replay log
    #[error("Log error: {0}")]
    Log(String),

    /// Log source parse errors
    #[error("Log record error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for fl2sitl
pub type Result<T> = std::result::Result<T, BridgeError>;
