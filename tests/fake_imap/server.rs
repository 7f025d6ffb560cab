//! In-process fake IMAP server for integration testing
//!
//! Speaks the subset of RFC 3501 the fetch pipeline exercises. Every
//! client command starts with a **tag** that the server echoes in its
//! completion response; lines prefixed with `*` are untagged data sent
//! before the final tagged OK/NO/BAD:
//!
//! ```text
//!   Client:  A0001 LOGIN user pass
//!   Server:  A0001 OK LOGIN completed
//!   Client:  A0002 UID SEARCH UNSEEN
//!   Server:  * SEARCH 1 3
//!   Server:  A0002 OK SEARCH completed
//! ```
//!
//! Message bodies are transferred as **counted literals**:
//! `{bytecount}\r\n` followed by exactly that many raw bytes. That is
//! the end-of-message framing the client codec relies on to reassemble
//! each payload; the end of the whole fetch is the tagged completion,
//! not a message count.
//!
//! Two transport modes: the default greets over plain TCP and upgrades
//! via STARTTLS; implicit mode runs the TLS handshake first and greets
//! over the encrypted stream. Both use an `rcgen` self-signed
//! certificate generated at startup.

use super::handlers::{
    handle_capability, handle_login, handle_logout, handle_noop, handle_select, handle_uid_fetch,
    handle_uid_search,
};
use super::io::write_line;
use super::mailbox::Mailbox;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Behavior switches for a test server instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Respond NO to every LOGIN attempt.
    pub reject_login: bool,
    /// Speak TLS from the first byte instead of greeting + STARTTLS.
    pub implicit_tls: bool,
}

/// A fake IMAP server on localhost with an OS-assigned port.
pub struct FakeImapServer {
    port: u16,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a server with the given mailbox state and default
    /// options.
    pub async fn start(mailbox: Mailbox) -> Self {
        Self::start_with_options(mailbox, ServerOptions::default()).await
    }

    /// Start a server with explicit [`ServerOptions`].
    ///
    /// Binds to `127.0.0.1:0` (the OS picks a free port), generates a
    /// self-signed certificate, and spawns the accept loop. The server
    /// runs until dropped.
    pub async fn start_with_options(mailbox: Mailbox, options: ServerOptions) -> Self {
        // Multiple tests may race to install the process-wide crypto
        // provider; ignore the error if it is already set.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let mailbox = Arc::new(mailbox);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let mailbox = mailbox.clone();
                tokio::spawn(async move {
                    handle_connection(stream, acceptor, &mailbox, options).await;
                });
            }
        });

        Self {
            port,
            _handle: handle,
        }
    }

    /// The port the server is listening on.
    pub const fn port(&self) -> u16 {
        self.port
    }
}

/// Handle a single client connection through greeting, TLS, and the
/// command loop.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    mailbox: &Mailbox,
    options: ServerOptions,
) {
    if options.implicit_tls {
        let Ok(tls_stream) = acceptor.accept(stream).await else {
            return;
        };
        handle_imap_session(tls_stream, mailbox, options, true).await;
        return;
    }

    // Pre-TLS phase: greeting, then wait for STARTTLS.
    let mut reader = BufReader::new(stream);
    if write_line(&mut reader, "* OK IMAP4rev1 Fake server ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    let mut line = String::new();
    if reader.read_line(&mut line).await.is_err() {
        return;
    }

    let parts: Vec<&str> = line.trim().splitn(2, ' ').collect();
    if parts.len() < 2 {
        return;
    }
    let tag = parts[0];
    let command = parts[1].to_uppercase();

    if command != "STARTTLS" {
        let resp = format!("{tag} BAD Expected STARTTLS\r\n");
        let _ = write_line(&mut reader, &resp).await;
        return;
    }

    let resp = format!("{tag} OK Begin TLS negotiation now\r\n");
    if write_line(&mut reader, &resp).await.is_err() {
        return;
    }

    let tcp = reader.into_inner();
    let Ok(tls_stream) = acceptor.accept(tcp).await else {
        return;
    };

    // Greeting was already sent over plain TCP.
    handle_imap_session(tls_stream, mailbox, options, false).await;
}

/// Extract the folder name from a parsed `imap_types::Mailbox`.
fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Run the IMAP command loop over an established stream.
///
/// Uses `imap-codec`'s `CommandCodec` to parse each client command
/// into a strongly-typed `Command`, then dispatches on the
/// `CommandBody` variant.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    mailbox: &Mailbox,
    options: ServerOptions,
    greet: bool,
) {
    let mut reader = BufReader::new(stream);
    let mut selected_folder: Option<String> = None;
    let codec = CommandCodec::default();

    if greet
        && write_line(&mut reader, "* OK IMAP4rev1 Fake server ready\r\n")
            .await
            .is_err()
    {
        return;
    }

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let line_bytes = line.as_bytes();
        let Ok((_, command)) = codec.decode(line_bytes) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            let resp = format!("{tag} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();

        match command.body {
            CommandBody::Capability => {
                handle_capability(tag, &mut reader).await;
            }
            CommandBody::Noop => {
                handle_noop(tag, &mut reader).await;
            }
            CommandBody::Login { .. } => {
                if !handle_login(tag, !options.reject_login, &mut reader).await {
                    break;
                }
            }
            CommandBody::Select { mailbox: mb, .. } => {
                let name = mailbox_name(&mb);
                selected_folder = handle_select(tag, &name, mailbox, &mut reader).await;
            }
            CommandBody::Search {
                criteria,
                uid: true,
                ..
            } => {
                handle_uid_search(
                    tag,
                    criteria.as_ref(),
                    mailbox,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Fetch {
                sequence_set,
                uid: true,
                ..
            } => {
                handle_uid_fetch(
                    tag,
                    &sequence_set,
                    mailbox,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
