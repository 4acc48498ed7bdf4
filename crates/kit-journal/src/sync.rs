//! Client side of cursor-based delta sync.
//!
//! One round against a hub: handshake with the cursor we hold for it, send
//! whatever the hub has not acknowledged, take in whatever it sends until it
//! half-closes, then echo the last accepted message back so the hub's
//! cursor for us moves past it.

use crate::journal::{AppendOutcome, Journal, JournalError};
use kit_core::{KeyPair, Message, NetworkId, UserId};
use kit_net::{Connection, FrameError, HandshakeError, PeerAddr, SyncParams};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connect error: {0}")]
    Connect(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("transport error: {0}")]
    Frame(#[from] FrameError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("sync timeout")]
    Timeout,
}

/// What one sync round did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub sent: usize,
    pub received: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Whether the last accepted message was echoed back.
    pub acked: bool,
}

/// Run one sync round with `hub` over an established byte stream.
pub async fn sync_with_hub<S>(
    journal: &mut Journal,
    stream: S,
    key: &KeyPair,
    network: NetworkId,
    hub: UserId,
    handshake_timeout: Duration,
) -> Result<SyncReport, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cursor = journal.cursor_for(&hub).unwrap_or_else(|e| {
        warn!(%hub, error = %e, "failed to read peer cursor");
        None
    });
    let conn = timeout(
        handshake_timeout,
        Connection::connect(stream, key, network, hub, SyncParams::new(cursor, false)),
    )
    .await
    .map_err(|_| SyncError::Timeout)??;
    let (session, mut reader, mut writer) = conn.into_split();

    let outgoing: Vec<Message> = journal
        .select_since(session.remote_sync.resume_point().as_ref())
        .to_vec();
    let mut report = SyncReport {
        sent: outgoing.len(),
        ..SyncReport::default()
    };
    for msg in &outgoing {
        debug!(%msg, "send");
    }

    let send = async move {
        writer.send_many(outgoing).await?;
        Ok::<_, SyncError>(writer)
    };
    let recv = async {
        let mut last_accepted = None;
        loop {
            let msg = match reader.recv().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) if e.is_message_level() => {
                    warn!(%hub, error = %e, "dropping invalid message");
                    report.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            report.received += 1;
            match journal.append_from_peer(&msg, &hub) {
                Ok(AppendOutcome::Accepted) => {
                    debug!(%msg, "recv");
                    last_accepted = Some(msg);
                }
                Ok(AppendOutcome::Duplicate) => {
                    debug!(%msg, "recv dup");
                    report.duplicates += 1;
                }
                Err(e) if e.is_rejection() => {
                    warn!(%hub, %msg, error = %e, "failed to append");
                    report.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok::<_, SyncError>(last_accepted)
    };
    let (mut writer, last_accepted) = tokio::try_join!(send, recv)?;

    if let Some(last) = last_accepted {
        debug!(msg = %last, "ack");
        writer.send(last).await?;
        report.acked = true;
    }
    writer.close_write().await?;

    info!(
        %hub,
        sent = report.sent,
        received = report.received,
        duplicates = report.duplicates,
        rejected = report.rejected,
        "sync complete"
    );
    Ok(report)
}

/// Dial `hub` over TCP and run one sync round.
pub async fn sync_tcp(
    journal: &mut Journal,
    key: &KeyPair,
    network: NetworkId,
    hub: &PeerAddr,
    connect_timeout: Duration,
) -> Result<SyncReport, SyncError> {
    let stream = timeout(connect_timeout, TcpStream::connect(&hub.addr))
        .await
        .map_err(|_| SyncError::Timeout)??;
    stream.set_nodelay(true)?;
    sync_with_hub(journal, stream, key, network, hub.id, connect_timeout).await
}
