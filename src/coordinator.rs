//! Fetch cycle orchestration
//!
//! [`FetchCoordinator`] runs exactly one fetch cycle end to end:
//! connect, select INBOX, search for unread messages, stream their raw
//! payloads, decode each one, and aggregate the results. Retrieval is
//! network-bound and decoding is CPU-bound, so the two overlap: the
//! decode of message *k* may still be running while message *k+1* is
//! arriving.
//!
//! The one subtle requirement is completion accounting. The transport
//! signalling end-of-fetch only means no further raw payloads will
//! arrive; decodes dispatched earlier may still be in flight. The
//! aggregator therefore resolves only once both conditions hold for
//! every searched id: its raw bytes were received (checked against the
//! search count at end-of-fetch) and its decode has been joined. An
//! implementation that resolves at end-of-fetch alone intermittently
//! loses records.

use crate::config::{DecodePolicy, MailConfig};
use crate::decoder::decode;
use crate::error::{DecodeError, Error, ProtocolError, Result};
use crate::message::{EmailRecord, MessageId};
use crate::session::{FetchEvent, MailSession};
use std::collections::HashSet;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// The one mailbox this service reads.
const INBOX: &str = "INBOX";

/// Backpressure bound between the fetch stream and the aggregator.
const FETCH_CHANNEL_DEPTH: usize = 32;

/// Orchestrates fetch cycles against one configured mail account.
///
/// Concurrent invocations are serialized: the mail session is an
/// exclusively-owned resource, and running cycles back to back keeps
/// the server-side connection count at one.
pub struct FetchCoordinator {
    config: MailConfig,
    cycle: Mutex<()>,
}

impl FetchCoordinator {
    #[must_use]
    pub fn new(config: MailConfig) -> Self {
        Self {
            config,
            cycle: Mutex::new(()),
        }
    }

    /// Run one fetch cycle and return every unread message, decoded.
    ///
    /// An empty mailbox is success with an empty result. Records are
    /// ordered by message id, so the result is stable for a given
    /// cycle regardless of decode completion order.
    ///
    /// # Errors
    ///
    /// Fail-fast: any connection, protocol, or (under the default
    /// policy) decode failure aborts the whole cycle; no partial
    /// result is returned. The session is closed in every case.
    pub async fn fetch_unread(&self) -> Result<Vec<EmailRecord>> {
        let _cycle = self.cycle.lock().await;

        let mut session = MailSession::new(&self.config);
        let result = self.run_cycle(&mut session).await;
        session.close().await;
        result
    }

    async fn run_cycle(&self, session: &mut MailSession<'_>) -> Result<Vec<EmailRecord>> {
        session.connect().await?;
        let info = session.select_mailbox(INBOX).await?;
        debug!("cycle opened {} with {} messages", info.name, info.exists);

        let ids = session.search_unread().await?;
        if ids.is_empty() {
            info!("no unread messages");
            return Ok(Vec::new());
        }
        info!("fetching {} unread messages", ids.len());

        let (tx, rx) = mpsc::channel(FETCH_CHANNEL_DEPTH);
        let aggregator = tokio::spawn(aggregate(
            rx,
            ids.len(),
            self.config.decode_policy,
            self.config.max_parallel_decodes,
        ));

        let fetch_result = session.fetch_raw(&ids, tx).await;
        let agg_result = aggregator.await;

        // A transport failure takes precedence over whatever the
        // aggregator saw through the closed channel.
        fetch_result?;
        let mut records = match agg_result {
            Ok(records) => records?,
            Err(e) => {
                return Err(
                    ProtocolError::UnexpectedResponse(format!("aggregation failed: {e}")).into(),
                );
            }
        };

        records.sort_by_key(|record| record.id);
        Ok(records)
    }
}

/// Consume fetch events, dispatch decodes, and account for their
/// completion.
///
/// Keeps at most `max_parallel` decodes in flight; each raw message is
/// decoded on a blocking worker thread. Resolves only after the `End`
/// event has arrived, every dispatched decode has been joined, and the
/// received-message count matches `expected`.
async fn aggregate(
    mut events: mpsc::Receiver<FetchEvent>,
    expected: usize,
    policy: DecodePolicy,
    max_parallel: usize,
) -> Result<Vec<EmailRecord>> {
    let mut decodes: JoinSet<std::result::Result<EmailRecord, (MessageId, DecodeError)>> =
        JoinSet::new();
    let mut seen: HashSet<MessageId> = HashSet::new();
    let mut records = Vec::with_capacity(expected);
    let mut skipped = 0_usize;
    let mut ended = false;

    while let Some(event) = events.recv().await {
        match event {
            FetchEvent::Message(raw) => {
                if !seen.insert(raw.id) {
                    warn!(uid = raw.id.0, "duplicate fetch response, skipping");
                    continue;
                }
                while decodes.len() >= max_parallel {
                    let Some(joined) = decodes.join_next().await else {
                        break;
                    };
                    settle(joined, policy, &mut records, &mut skipped)?;
                }
                decodes.spawn_blocking(move || {
                    let id = raw.id;
                    decode(raw).map_err(|e| (id, e))
                });
            }
            FetchEvent::End => {
                ended = true;
                break;
            }
        }
    }

    if !ended {
        return Err(
            ProtocolError::UnexpectedResponse("fetch stream closed without end-of-fetch".into())
                .into(),
        );
    }

    // End-of-fetch only bounds arrivals; drain every in-flight decode
    // before declaring the cycle complete.
    while let Some(joined) = decodes.join_next().await {
        settle(joined, policy, &mut records, &mut skipped)?;
    }

    if seen.len() != expected {
        return Err(ProtocolError::UnexpectedResponse(format!(
            "server returned {} of {} searched messages",
            seen.len(),
            expected
        ))
        .into());
    }

    debug!(
        records = records.len(),
        skipped, "fetch cycle aggregation complete"
    );
    Ok(records)
}

/// Fold one joined decode into the running result, honoring the
/// decode policy.
fn settle(
    joined: std::result::Result<std::result::Result<EmailRecord, (MessageId, DecodeError)>, JoinError>,
    policy: DecodePolicy,
    records: &mut Vec<EmailRecord>,
    skipped: &mut usize,
) -> Result<()> {
    match joined {
        Ok(Ok(record)) => {
            records.push(record);
            Ok(())
        }
        Ok(Err((id, e))) => match policy {
            DecodePolicy::FailFast => {
                error!(uid = id.0, "decode failed: {e}");
                Err(e.into())
            }
            DecodePolicy::SkipMalformed => {
                warn!(uid = id.0, "skipping malformed message: {e}");
                *skipped += 1;
                Ok(())
            }
        },
        Err(e) => Err(DecodeError::MalformedMessage(format!("decode task aborted: {e}")).into()),
    }
}
