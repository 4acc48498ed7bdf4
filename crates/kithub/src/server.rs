//! kithub server - listeners, peer dialing and per-connection tasks

use crate::config::ServeArgs;
use crate::hub::{ClientId, Hub, HubError, HubHandle};
use kit_core::{KeyPair, NetworkId, UserId};
use kit_journal::{Workspace, WorkspaceConfig, WorkspaceError};
use kit_net::{
    Connection, FrameError, HandshakeError, MessageReader, PeerAddr, SyncFlags, SyncParams,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("transport error: {0}")]
    Frame(#[from] FrameError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a connection task needs.
#[derive(Clone)]
pub struct ConnContext {
    key: Arc<KeyPair>,
    network: NetworkId,
    hub: HubHandle,
    handshake_timeout: Duration,
}

impl ConnContext {
    pub fn new(
        key: Arc<KeyPair>,
        network: NetworkId,
        hub: HubHandle,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            key,
            network,
            hub,
            handshake_timeout,
        }
    }

    /// Serve a peer that dialed us.
    pub async fn accept<S>(self, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hub = &self.hub;
        let conn = timeout(
            self.handshake_timeout,
            Connection::accept(stream, &self.key, self.network, SyncFlags::FOLLOW, move |peer| {
                hub.cursor_for(peer)
            }),
        )
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;
        self.serve(conn).await
    }

    /// Serve a peer hub we dialed, following its stream.
    pub async fn connect<S>(self, stream: S, peer: &PeerAddr) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let sync = SyncParams::new(self.hub.cursor_for(peer.id).await, true);
        let conn = timeout(
            self.handshake_timeout,
            Connection::connect(stream, &self.key, self.network, peer.id, sync),
        )
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;
        self.serve(conn).await
    }

    /// Pump messages between the connection and the hub loop until either
    /// side is done.
    async fn serve<S>(&self, conn: Connection<S>) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (session, mut reader, mut writer) = conn.into_split();
        let peer = session.remote;
        let mut sub = self.hub.register(peer, session.remote_sync).await?;
        let client = sub.id;
        let read = async {
            let res = pump_inbound(&self.hub, client, peer, &mut reader).await;
            self.hub.unregister(client).await;
            res
        };
        let write = async {
            while let Some(batch) = sub.batches.recv().await {
                for msg in &batch {
                    debug!(%peer, %msg, "send");
                }
                writer.send_many(batch).await?;
            }
            writer.close_write().await?;
            Ok::<_, ServerError>(())
        };
        tokio::try_join!(read, write)?;
        Ok(())
    }
}

async fn pump_inbound<R>(
    hub: &HubHandle,
    client: ClientId,
    peer: UserId,
    reader: &mut MessageReader<R>,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.recv().await {
            Ok(Some(msg)) => {
                debug!(%peer, %msg, "recv");
                hub.deliver(client, peer, msg).await?;
            }
            Ok(None) => return Ok(()),
            Err(e) if e.is_message_level() => {
                warn!(%peer, error = %e, "dropping invalid message");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A configured hub daemon.
pub struct Server {
    ctx: ConnContext,
    hub: Hub,
    config: WorkspaceConfig,
    args: ServeArgs,
}

impl Server {
    /// Open the hub workspace in `dir`.
    pub fn new(dir: &Path, network: NetworkId, args: ServeArgs) -> Result<Self, ServerError> {
        let loaded = Workspace::new(dir).open()?;
        let (hub, handle) = Hub::new(loaded.journal, args.hub_config())?;
        let ctx = ConnContext::new(
            Arc::new(loaded.key),
            network,
            handle,
            args.handshake_timeout(),
        );
        Ok(Self {
            ctx,
            hub,
            config: loaded.config,
            args,
        })
    }

    pub fn handle(&self) -> &HubHandle {
        &self.ctx.hub
    }

    /// Run until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let peers = self.config.hub_peers()?;
        let mut listeners = Vec::new();
        for addr in &self.config.addrs {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            info!("Listening on {}", listener.local_addr()?);
            listeners.push(listener);
        }
        if listeners.is_empty() && peers.is_empty() {
            warn!("no listen addresses and no peer hubs configured");
        }

        info!(identity = %self.ctx.hub.identity(), "starting kithub");
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut hub_done = self.hub.spawn_thread()?;

        for listener in listeners {
            tasks.push(tokio::spawn(accept_loop(listener, self.ctx.clone())));
        }
        for peer in peers {
            tasks.push(tokio::spawn(dial_loop(
                self.ctx.clone(),
                peer,
                self.args.reconnect_delay(),
            )));
        }
        tasks.push(tokio::spawn(stats_loop(
            self.ctx.hub.clone(),
            self.args.stats_interval(),
        )));

        tokio::select! {
            _ = shutdown => info!("Shutting down..."),
            _ = &mut hub_done => error!("hub loop stopped unexpectedly"),
        }

        // The loop thread exits on its own once the last handle is dropped.
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, ctx: ConnContext) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    match ctx.accept(stream).await {
                        Ok(()) => info!("Disconnected from {}", addr),
                        Err(e) => warn!("Connection error from {}: {}", addr, e),
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}

async fn dial_loop(ctx: ConnContext, peer: PeerAddr, reconnect: Duration) {
    loop {
        match TcpStream::connect(&peer.addr).await {
            Ok(stream) => {
                info!("Connected to {}", peer);
                match ctx.clone().connect(stream, &peer).await {
                    Ok(()) => info!("Disconnected from {}", peer),
                    Err(e) => warn!("Connection to {} failed: {}", peer, e),
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", peer, e),
        }
        sleep(reconnect).await;
    }
}

async fn stats_loop(hub: HubHandle, every: Duration) {
    let mut ticker = interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = hub.stats();
        info!(
            clients = stats.clients,
            accepted = stats.accepted,
            duplicates = stats.duplicates,
            rejected = stats.rejected,
            batches = stats.batches,
            "hub stats"
        );
    }
}
