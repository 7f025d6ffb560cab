//! Message data model
//!
//! The types that flow through the fetch-and-parse pipeline: server
//! UIDs, raw undecoded payloads, and the structured records handed to
//! the boundary.

use std::fmt;

/// Server-assigned UID for a message.
///
/// Unique within the currently selected mailbox and only valid while
/// that selection is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The full encoded message (headers + body) as received from the
/// server, prior to structural decoding.
///
/// Ownership moves from the session into the decoder on dispatch.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: MessageId,
    pub bytes: Vec<u8>,
}

/// A decoded attachment part.
///
/// `content` holds the decoded bytes; re-encoding into a text-safe
/// transport form (base64) happens at the HTTP boundary, not here.
/// `size` is the decoded payload size, not the encoded size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Filename as declared by the part, absent if not declared.
    pub filename: Option<String>,
    /// Decoded size in bytes.
    pub size: usize,
    /// Decoded binary payload.
    pub content: Vec<u8>,
}

/// The structured representation of one message.
///
/// Immutable once constructed. Attachments keep their order of
/// appearance in the source message. A missing Subject header or an
/// absent text body is represented as `None`, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailRecord {
    /// UID the record was decoded from, the key for any future
    /// persistence of records.
    pub id: MessageId,
    pub from: String,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}
