//! Error types for mailfeed
//!
//! Three error families, one per pipeline stage: connection
//! establishment, IMAP protocol exchange, and MIME decoding. The HTTP
//! boundary maps each family to a generic error kind and never exposes
//! the underlying cause to callers.

use crate::session::SessionState;
use thiserror::Error;

/// Failures while opening or securing the transport, or during
/// authentication.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Failures in the IMAP exchange after a session is established.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("mailbox not found: {0}")]
    MailboxNotFound(String),

    /// An operation was issued while the session was in a state that
    /// does not permit it, e.g. SELECT before a successful connect.
    #[error("{op} issued in {state:?} state")]
    OutOfOrder {
        op: &'static str,
        state: SessionState,
    },
}

/// Failures while decoding one raw message into a structured record.
///
/// Raised only for structurally malformed input; a message with no
/// attachments or an empty body is valid.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Generic error kind surfaced at the HTTP boundary in place of
    /// the underlying cause.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Protocol(_) => "protocol",
            Self::Decode(_) => "decode",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
