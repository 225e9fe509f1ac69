//! Error types for courier-core

use thiserror::Error;

/// Main error type for the courier-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// DSN could not be parsed or is missing required parts
    #[error("invalid DSN: {0}")]
    Dsn(String),

    /// Envelope could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transport-level failure (refused connection, timeout, DNS)
    #[error("network error: {0}")]
    Network(String),

    /// Offline buffer could not store or read an envelope
    #[error("storage error: {0}")]
    Storage(String),

    /// Offline buffer is at capacity, the envelope was not stored
    #[error("offline buffer is full ({0} envelopes)")]
    BufferFull(usize),

    /// Too many outstanding requests, the envelope was rejected
    #[error("send queue is full")]
    QueueOverflow,

    /// The transport no longer accepts work
    #[error("transport is closed")]
    Closed,
}

/// Result type alias for courier-core
pub type Result<T> = std::result::Result<T, Error>;
