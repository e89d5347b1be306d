//! Defines wire-level error types.

use thiserror::Error;

use super::MessageKind;

/// A generic framing/protocol error.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The message is structurally invalid.
    #[error("invalid wire message: {0}")]
    Invalid(String),
    /// A message other than what we were expecting was received.
    #[error("unexpected message kind: {0:?}")]
    Unexpected(MessageKind),
    /// An I/O error occurred, such as an unexpected EOF mid-message.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
