//! IMAP session state machine
//!
//! One [`MailSession`] owns one connection to the mail server for the
//! duration of a fetch cycle. Every operation is a state transition:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticated -> MailboxOpen
//!     -> Searching -> Fetching -> Closing -> Disconnected
//! ```
//!
//! Any transport or protocol error moves the session to `Failed`;
//! [`MailSession::close`] is idempotent and releases the transport
//! from any state. Out-of-order operations are rejected with
//! [`ProtocolError::OutOfOrder`] instead of being sent to the server.

use crate::config::{MailConfig, TransportSecurity};
use crate::error::{ConnectionError, Error, ProtocolError};
use crate::message::{MessageId, RawMessage};
use async_imap::Session;
use futures::StreamExt;
use rustls::pki_types::ServerName;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

/// A TLS-wrapped IMAP session.
type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    MailboxOpen,
    Searching,
    Fetching,
    Closing,
    Failed,
}

/// Metadata returned by a successful mailbox select.
#[derive(Debug, Clone)]
pub struct MailboxInfo {
    pub name: String,
    /// Total message count reported by the server.
    pub exists: u32,
}

/// A typed event on the fetch stream.
///
/// The stream is terminated by `End`, emitted when the transport
/// signals end-of-fetch. The number of ids requested is a hint, not a
/// bound; consumers must account for completion per message rather
/// than counting down from the request size.
#[derive(Debug)]
pub enum FetchEvent {
    /// One message's raw payload, fully reassembled.
    Message(RawMessage),
    /// The server finished the fetch; no further messages will arrive.
    End,
}

/// One stateful connection to the mail server.
///
/// Borrows the process-wide configuration; exactly one instance is
/// active per fetch cycle and it owns its socket exclusively.
pub struct MailSession<'c> {
    config: &'c MailConfig,
    state: SessionState,
    inner: Option<ImapSession>,
}

impl<'c> MailSession<'c> {
    #[must_use]
    pub const fn new(config: &'c MailConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            inner: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Open the transport, negotiate TLS, and authenticate.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Network`/`Tls`/`Timeout` for
    /// transport failures and `ConnectionError::Auth` when the server
    /// rejects the credentials. The session ends in `Failed` on any
    /// error.
    pub async fn connect(&mut self) -> std::result::Result<(), ConnectionError> {
        if self.state != SessionState::Disconnected {
            return Err(ConnectionError::Network(
                "transport already open".to_string(),
            ));
        }
        self.state = SessionState::Connecting;

        match self.establish().await {
            Ok(session) => {
                self.inner = Some(session);
                self.state = SessionState::Authenticated;
                info!("authenticated with {}", self.config.host);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// SELECT a mailbox on the authenticated session.
    ///
    /// # Errors
    ///
    /// Fails with `ProtocolError::OutOfOrder` unless called directly
    /// after a successful [`connect`](Self::connect), and with
    /// `ProtocolError::MailboxNotFound` when the server refuses the
    /// name.
    pub async fn select_mailbox(&mut self, name: &str) -> Result<MailboxInfo, Error> {
        let timeout_step = self.config.command_timeout;
        let session = self.ready_for("SELECT", SessionState::Authenticated)?;

        let res = timeout(timeout_step, session.select(name)).await;
        match res {
            Err(_) => {
                self.state = SessionState::Failed;
                Err(ConnectionError::Timeout("SELECT").into())
            }
            Ok(Err(async_imap::error::Error::No(text))) => {
                self.state = SessionState::Failed;
                Err(ProtocolError::MailboxNotFound(format!("{name}: {text}")).into())
            }
            Ok(Err(e)) => {
                self.state = SessionState::Failed;
                Err(ProtocolError::UnexpectedResponse(format!("SELECT failed: {e}")).into())
            }
            Ok(Ok(mailbox)) => {
                self.state = SessionState::MailboxOpen;
                debug!("selected {} ({} messages)", name, mailbox.exists);
                Ok(MailboxInfo {
                    name: name.to_string(),
                    exists: mailbox.exists,
                })
            }
        }
    }

    /// UID SEARCH for unread messages in the open mailbox.
    ///
    /// An empty result is success, not an error. Ids are returned in
    /// ascending UID order.
    ///
    /// # Errors
    ///
    /// Fails with `ProtocolError::OutOfOrder` unless a mailbox is
    /// open, and with `ProtocolError::UnexpectedResponse` or
    /// `ConnectionError::Timeout` when the exchange fails.
    pub async fn search_unread(&mut self) -> Result<Vec<MessageId>, Error> {
        let timeout_step = self.config.command_timeout;
        let session = self.ready_for("SEARCH", SessionState::MailboxOpen)?;

        let res = timeout(timeout_step, session.uid_search("UNSEEN")).await;
        let uids = match res {
            Err(_) => {
                self.state = SessionState::Failed;
                return Err(ConnectionError::Timeout("SEARCH").into());
            }
            Ok(Err(e)) => {
                self.state = SessionState::Failed;
                return Err(ProtocolError::UnexpectedResponse(format!("SEARCH failed: {e}")).into());
            }
            Ok(Ok(uids)) => uids,
        };

        self.state = SessionState::Searching;
        let mut ids: Vec<MessageId> = uids.into_iter().map(MessageId).collect();
        ids.sort_unstable();
        debug!("{} unread messages", ids.len());
        Ok(ids)
    }

    /// UID FETCH the raw payload of each id, forwarding typed events
    /// to `events` as messages complete.
    ///
    /// The session is in `Fetching` for the whole exchange, from the
    /// moment the command is issued. Messages are emitted as they
    /// arrive from the server; the sequence ends with
    /// [`FetchEvent::End`] when the transport signals end-of-fetch.
    /// Responses for unsolicited UIDs and attribute-only responses
    /// without a body section are skipped. If the receiving side of
    /// `events` is dropped the fetch stops early without error.
    ///
    /// # Errors
    ///
    /// Fails with `ProtocolError::OutOfOrder` unless a search was
    /// issued first, and with `ProtocolError::UnexpectedResponse` or
    /// `ConnectionError::Timeout` when the exchange fails. On error
    /// the session ends in `Failed` and no `End` event is emitted.
    pub async fn fetch_raw(
        &mut self,
        ids: &[MessageId],
        events: mpsc::Sender<FetchEvent>,
    ) -> Result<(), Error> {
        let step_timeout = self.config.command_timeout;
        self.ready_for("FETCH", SessionState::Searching)?;

        // Streaming starts inside drive_fetch; the state reflects it
        // from the first byte out, not from the last byte in.
        self.state = SessionState::Fetching;
        let Some(session) = self.inner.as_mut() else {
            self.state = SessionState::Failed;
            return Err(ProtocolError::OutOfOrder {
                op: "FETCH",
                state: SessionState::Disconnected,
            }
            .into());
        };

        let requested: HashSet<u32> = ids.iter().map(|id| id.0).collect();
        let uid_set = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let res = drive_fetch(session, &requested, &uid_set, step_timeout, &events).await;
        match res {
            Ok(()) => {
                events.send(FetchEvent::End).await.ok();
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Log out and release the transport.
    ///
    /// Idempotent and safe to call from any state, including `Failed`
    /// (forced closure). Always leaves the session `Disconnected`.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.inner.take() {
            self.state = SessionState::Closing;
            session.logout().await.ok();
        }
        self.state = SessionState::Disconnected;
    }

    /// Guard an operation against the state machine and hand out the
    /// underlying session.
    fn ready_for(
        &mut self,
        op: &'static str,
        expected: SessionState,
    ) -> Result<&mut ImapSession, Error> {
        if self.state != expected {
            return Err(ProtocolError::OutOfOrder {
                op,
                state: self.state,
            }
            .into());
        }
        self.inner.as_mut().map_or_else(
            || {
                Err(ProtocolError::OutOfOrder {
                    op,
                    state: SessionState::Disconnected,
                }
                .into())
            },
            Ok,
        )
    }

    async fn establish(&self) -> std::result::Result<ImapSession, ConnectionError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!("connecting to mail server at {}", addr);

        let tcp_stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout("connect"))??;

        let tls_stream = match self.config.security {
            TransportSecurity::StartTls => {
                let mut client = async_imap::Client::new(tcp_stream.compat());
                timeout(
                    self.config.command_timeout,
                    client.run_command_and_check_ok("STARTTLS", None),
                )
                .await
                .map_err(|_| ConnectionError::Timeout("STARTTLS"))?
                .map_err(|e| ConnectionError::Tls(format!("STARTTLS failed: {e}")))?;

                let inner = client.into_inner().into_inner();
                self.tls_handshake(inner).await?
            }
            TransportSecurity::Implicit => self.tls_handshake(tcp_stream).await?,
        };

        let client = async_imap::Client::new(tls_stream.compat());
        let session = timeout(
            self.config.command_timeout,
            client.login(&self.config.username, &self.config.password),
        )
        .await
        .map_err(|_| ConnectionError::Timeout("LOGIN"))?
        .map_err(|(e, _)| ConnectionError::Auth(e.to_string()))?;

        Ok(session)
    }

    async fn tls_handshake(
        &self,
        tcp: TcpStream,
    ) -> std::result::Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectionError> {
        let connector = tls_connector();
        let server_name = ServerName::try_from(self.config.host.clone())
            .map_err(|e| ConnectionError::Tls(format!("invalid server name: {e}")))?;

        timeout(
            self.config.connect_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| ConnectionError::Timeout("TLS handshake"))?
        .map_err(|e| ConnectionError::Tls(e.to_string()))
    }
}

/// Consume the UID FETCH response stream and forward one event per
/// complete message.
///
/// The stream terminates when the server sends its tagged completion,
/// not when `requested.len()` messages have been seen; the underlying
/// codec reassembles each message's counted literal before yielding
/// it, so every emitted payload is complete.
async fn drive_fetch(
    session: &mut ImapSession,
    requested: &HashSet<u32>,
    uid_set: &str,
    step_timeout: Duration,
    events: &mpsc::Sender<FetchEvent>,
) -> Result<(), Error> {
    let mut stream = timeout(step_timeout, session.uid_fetch(uid_set, "(UID BODY.PEEK[])"))
        .await
        .map_err(|_| Error::from(ConnectionError::Timeout("FETCH")))?
        .map_err(|e| {
            Error::from(ProtocolError::UnexpectedResponse(format!(
                "FETCH failed: {e}"
            )))
        })?;

    loop {
        let item = match timeout(step_timeout, stream.next()).await {
            Err(_) => return Err(ConnectionError::Timeout("FETCH").into()),
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                return Err(ProtocolError::UnexpectedResponse(format!("FETCH failed: {e}")).into());
            }
            Ok(Some(Ok(item))) => item,
        };

        let Some(uid) = item.uid else {
            warn!("fetch response without UID, skipping");
            continue;
        };
        if !requested.contains(&uid) {
            warn!(uid, "unsolicited fetch response, skipping");
            continue;
        }
        // Attribute-only responses (e.g. flag updates) carry no body
        // section; the message is complete once its body arrives.
        let Some(body) = item.body() else {
            continue;
        };

        let raw = RawMessage {
            id: MessageId(uid),
            bytes: body.to_vec(),
        };
        if events.send(FetchEvent::Message(raw)).await.is_err() {
            debug!("fetch event consumer dropped, stopping early");
            return Ok(());
        }
    }

    Ok(())
}

/// Build a TLS connector that accepts all certificates.
///
/// Mail bridges and test servers present self-signed certificates, so
/// verification is skipped entirely.
fn tls_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier that accepts all certificates
/// (for self-signed bridge/test certs).
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
