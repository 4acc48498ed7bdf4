//! Subcommand implementations

use anyhow::{bail, Context};
use kit_core::{Change, Message, NetworkId, Payload, Register, UserId};
use kit_journal::{sync_tcp, Journal, SyncReport, Workspace, WorkspaceConfig};
use kit_net::PeerAddr;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Create the workspace and its self-registration message.
pub fn init(ws: &Workspace, email: String, hubs: Vec<(String, String)>) -> anyhow::Result<UserId> {
    let config = WorkspaceConfig {
        addrs: Vec::new(),
        hubs: hubs.into_iter().collect::<BTreeMap<_, _>>(),
    };
    // reject malformed hub keys before anything is written
    config.hub_peers()?;
    let loaded = ws
        .init(&config, Register { email })
        .context("failed to initialize workspace")?;
    Ok(loaded.identity())
}

/// Append a change to our own chain.
pub fn mail(ws: &Workspace, diff: String) -> anyhow::Result<Message> {
    let mut loaded = ws.open()?;
    let me = loaded.identity();
    let mut msg = loaded
        .journal
        .next_message(me, &Payload::from(Change { diff }))?;
    msg.seal(&loaded.key)?;
    loaded
        .journal
        .append(&msg)
        .context("failed to write journal")?;
    info!(%msg, "mailed");
    Ok(msg)
}

/// Every message in journal order.
pub fn list(ws: &Workspace) -> anyhow::Result<Vec<Message>> {
    let journal = Journal::open(ws.dir()).context("failed to open journal")?;
    Ok(journal.messages().to_vec())
}

/// One sync round against each configured hub.
pub async fn sync(
    ws: &Workspace,
    network: NetworkId,
    timeout: Duration,
) -> anyhow::Result<Vec<(PeerAddr, SyncReport)>> {
    let mut loaded = ws.open()?;
    let hubs = loaded.config.hub_peers()?;
    if hubs.is_empty() {
        bail!("no hubs configured in {}", ws.config_path().display());
    }

    let mut done = Vec::new();
    for hub in hubs {
        match sync_tcp(&mut loaded.journal, &loaded.key, network, &hub, timeout).await {
            Ok(report) => done.push((hub, report)),
            Err(e) => warn!("failed to sync with {}: {}", hub, e),
        }
    }
    if done.is_empty() {
        bail!("can't connect to any hub");
    }
    Ok(done)
}
