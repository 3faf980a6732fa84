//! Client error types.

use std::io;

use mqfive_core::ProtocolError;
use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection refused: reason code {reason_code:#04x}")]
    ConnectionRefused { reason_code: u8 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// All 65535 packet identifiers are held by outstanding exchanges.
    #[error("Packet identifiers exhausted")]
    PacketIdsExhausted,

    /// The broker's Receive Maximum is already reached.
    #[error("Receive maximum exceeded")]
    ReceiveMaximumExceeded,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
