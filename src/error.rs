use std::path::PathBuf;

use thiserror::Error;

/// Failures establishing or using the underlying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("socket is closed")]
    Closed,
    #[error("send timed out")]
    SendTimeout,
    #[error("TLS identity file not found: {}", .0.display())]
    MissingIdentity(PathBuf),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures in the framed plist protocol. The connection should be
/// considered unusable after one of these; releasing it is the caller's
/// call.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("socket connection broken")]
    ConnectionBroken,
    #[error("malformed plist payload: {0}")]
    MalformedPayload(#[from] plist::Error),
    #[error("payload is not a dictionary")]
    UnexpectedPayload,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
