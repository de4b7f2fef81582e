use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrapError {
    #[error("No token found in input")]
    TokenNotFound,

    #[error("No drop configured for token {0}")]
    UnknownDrop(String),

    #[error("Malformed protocol input: {0}")]
    MalformedProtocolInput(String),

    #[error("Hit reported on unregistered input channel: {0}")]
    InvalidChannel(String),

    #[error("Delivery failed on {channel}: {message}")]
    DeliveryFailure { channel: String, message: String },

    #[error("Failed to read file: {path}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    FileWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Drop validation failed: {0}")]
    DropValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type TrapResult<T> = Result<T, TrapError>;
