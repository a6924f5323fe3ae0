//! Error types for the CDC pipeline
//!
//! The taxonomy mirrors the recovery behavior of the driver loop: only
//! configuration and pre-flight failures are fatal; everything else is
//! logged at the loop boundary and processing continues.

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Invalid configuration, detected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source unreachable, insufficient grants, binlog disabled
    #[error("Preflight error: {0}")]
    Preflight(String),

    /// Replication protocol error (handshake, auth, dump stream)
    #[error("Replication error: {0}")]
    Replication(String),

    /// Schema catalog lookup error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Binlog event decode error
    #[error("Decode error: {0}")]
    Decode(String),

    /// Rule or script transformation error
    #[error("Transform error: {0}")]
    Transform(String),

    /// Bus publish or KV error
    #[error("Sink error: {0}")]
    Sink(String),

    /// Position file persistence error
    #[error("Position error: {0}")]
    Position(String),

    /// Bounded read elapsed with no event; the loop retries silently
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Replication stream closed by the server
    #[error("Connection closed")]
    ConnectionClosed,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdcError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn position(msg: impl Into<String>) -> Self {
        Self::Position(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// True for the bounded-read timeout the loop treats as "no event yet".
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// True for errors that abort startup. Everything else is survivable:
    /// the driver loop logs, backs off, and continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Preflight(_))
    }

    /// True for errors worth reopening the replication session over.
    pub fn needs_reconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Replication(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::UnexpectedEof
                )
            }
            _ => false,
        }
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CdcError::replication("connection reset");
        assert!(err.to_string().contains("Replication error"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_timeout_classification() {
        assert!(CdcError::timeout("read").is_timeout());
        assert!(!CdcError::decode("bad event").is_timeout());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CdcError::config("missing server_id").is_fatal());
        assert!(CdcError::preflight("log_bin is OFF").is_fatal());

        assert!(!CdcError::decode("x").is_fatal());
        assert!(!CdcError::sink("x").is_fatal());
        assert!(!CdcError::timeout("x").is_fatal());
        assert!(!CdcError::ConnectionClosed.is_fatal());
    }

    #[test]
    fn test_reconnect_classification() {
        assert!(CdcError::ConnectionClosed.needs_reconnect());
        assert!(CdcError::replication("stream error").needs_reconnect());
        assert!(!CdcError::decode("x").needs_reconnect());
        assert!(!CdcError::timeout("x").needs_reconnect());
    }
}
