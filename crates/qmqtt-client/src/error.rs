//! Client error types.

use std::io;

use qmqtt_core::{ConnackCode, EncodeError, ProtocolError};
use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    /// An outgoing packet violated a field constraint. Only the failing call
    /// is affected.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodeError),

    /// Inbound bytes were malformed or broke the protocol. Fatal to the
    /// connection.
    #[error("Decode error: {0}")]
    Decode(#[from] ProtocolError),

    #[error("Connection refused: {0}")]
    ConnectionRefused(ConnackCode),

    #[error("Timed out waiting for CONNACK")]
    ConnectTimeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Not connected")]
    NotConnected,

    /// All 65535 packet identifiers are in flight.
    #[error("Packet identifiers exhausted")]
    IdentifiersExhausted,

    /// The in-flight message was aborted before its handshake completed.
    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
