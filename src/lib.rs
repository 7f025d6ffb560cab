//! Unread-mail fetch service
//!
//! Fetches unread messages from an IMAP mailbox, decodes each MIME
//! payload into a structured record (sender, subject, text body,
//! attachments), and serves the aggregated result over an HTTP
//! boundary for a presentation layer.
//!
//! The pipeline: [`EmailService`] triggers [`FetchCoordinator`], which
//! drives a [`MailSession`] state machine over the wire, streams each
//! matched message's raw payload into [`decode`], and resolves only
//! once every in-flight decode has completed.

mod config;
mod coordinator;
mod decoder;
mod error;
mod message;
mod service;
mod session;

pub use config::{DecodePolicy, MailConfig, TransportSecurity};
pub use coordinator::FetchCoordinator;
pub use decoder::decode;
pub use error::{ConnectionError, DecodeError, Error, ProtocolError, Result};
pub use message::{Attachment, EmailRecord, MessageId, RawMessage};
pub use service::{AttachmentDto, EmailDto, EmailService, router};
pub use session::{FetchEvent, MailSession, MailboxInfo, SessionState};
