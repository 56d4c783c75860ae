//! Error types for the chat server
//!
//! Defines protocol decode errors, per-connection errors, session queue
//! errors and listener-level errors. Uses thiserror for ergonomic error
//! definitions.

use thiserror::Error;

use crate::message::Kind;

/// Failure to turn a line into a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Leading token matches no message kind
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    /// Kind is known but carries the wrong number of fields
    #[error("{kind} expects {expected} field(s), got {found}")]
    ArityMismatch {
        kind: Kind,
        expected: usize,
        found: usize,
    },

    /// Kind is valid but travels in the other direction
    #[error("unexpected message kind {0}")]
    UnexpectedKind(Kind),

    /// Line bytes are not UTF-8
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Per-connection errors
///
/// Covers both business errors (reported to the client as an ERROR line,
/// connection stays open) and fatal errors (connection is torn down).
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed or unknown line
    #[error("{0}")]
    Protocol(#[from] DecodeError),

    /// Username failed validation
    #[error("invalid username")]
    InvalidUsername(String),

    /// Username already registered by another session
    #[error("username taken")]
    NameTaken(String),

    /// Whisper recipient is not registered
    #[error("no such user")]
    NoSuchUser(String),

    /// Command other than CONNECT before registering
    #[error("must connect first")]
    NotConnected,

    /// CONNECT after already registering
    #[error("already connected")]
    AlreadyConnected,

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound line over the configured maximum (fatal)
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The session's outbound queue is gone (fatal)
    #[error("session closed")]
    SessionClosed,

    /// The registry actor has stopped (fatal)
    #[error("registry unavailable")]
    RegistryClosed,
}

impl ChatError {
    /// Whether the connection survives this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChatError::Protocol(_)
                | ChatError::InvalidUsername(_)
                | ChatError::NameTaken(_)
                | ChatError::NoSuchUser(_)
                | ChatError::NotConnected
                | ChatError::AlreadyConnected
        )
    }
}

/// Session queue errors
///
/// Occurs when a message cannot be queued for a session's writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The writer has stopped (peer gone or session closed)
    #[error("Channel closed")]
    ChannelClosed,

    /// The queue is full and the caller chose not to wait
    #[error("Channel full")]
    Full,
}

impl From<SendError> for ChatError {
    fn from(_: SendError) -> Self {
        ChatError::SessionClosed
    }
}

/// Client-side input errors, printed locally and never sent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid command entered! Type '/help' to see a list of commands.")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

/// Listener-level errors, propagated to process exit
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}
