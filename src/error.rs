//! Error types shared across the server.

use std::io;

use crate::config::ConfigError;

/// Malformed or oversized frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame header must be {expected} bytes, got {len}", expected = crate::protocol::HEADER_LEN)]
    ShortHeader { len: usize },

    #[error("message body of {len} bytes exceeds max package size {max}")]
    TooLarge { len: u32, max: u32 },

    #[error("message body of {len} bytes does not fit a 32-bit length")]
    BodyTooLong { len: usize },
}

/// Failure on a single connection. Never escapes that connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection {0} is closed")]
    Closed(u32),

    #[error("connection {0} send queue is full")]
    SendQueueFull(u32),
}

impl ConnectionError {
    /// True when the peer simply went away (EOF or reset).
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Handler table misconfiguration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("handler already registered for msg id {0}")]
    DuplicateHandler(u32),
}

/// The connection cap has been reached.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("connection limit of {max} reached")]
pub struct CapacityError {
    pub max: usize,
}

/// Property lookup on a connection found nothing under the key.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("property '{0}' not found")]
pub struct PropertyNotFound(pub String);

/// Errors surfaced while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
}
