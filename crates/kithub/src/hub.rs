//! Hub relay engine.
//!
//! A single control loop owns the journal and the set of subscribed
//! clients. Connection tasks talk to it through a [`HubHandle`]: inbound
//! messages and (un)subscriptions go in over one mpsc channel, outbound
//! batches come back over a small per-client channel.
//!
//! Every accepted message is queued for all other followers right away. The
//! sender's own copy waits in a one-slot delay buffer and is echoed after
//! `echo_delay`, so a burst from one client costs it a single echo. A newer
//! message from anyone else replaces the need for the echo and clears the
//! slot.
//!
//! The loop writes the journal synchronously, so a daemon runs it on its own
//! OS thread (see [`Hub::spawn_thread`]) rather than on the shared runtime.

use kit_core::{Message, MsgId, UserId};
use kit_journal::{AppendOutcome, CursorStore, Journal};
use kit_net::SyncParams;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Messages handed to a connection's writer in one go.
pub type Batch = Vec<Message>;

pub type ClientId = u64;

/// Hub errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("journal is empty; initialize the hub first")]
    NotInitialized,
    #[error("hub loop has stopped")]
    Stopped,
}

/// Relay tuning.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Period of the delay/retry sweep.
    pub tick: Duration,
    /// How long a client's own message waits before it is echoed back.
    pub echo_delay: Duration,
    /// Batches buffered per client before the hub holds messages back.
    pub client_capacity: usize,
    /// Inbound event queue length.
    pub event_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            echo_delay: Duration::from_secs(3),
            client_capacity: 2,
            event_capacity: 100,
        }
    }
}

/// Counters reported by the stats task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStats {
    pub clients: usize,
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub batches: u64,
}

struct Registration {
    id: ClientId,
    user: UserId,
    sync: SyncParams,
    send: mpsc::Sender<Batch>,
}

enum HubEvent {
    Inbound {
        client: ClientId,
        from: UserId,
        msg: Message,
    },
    Subscribe(Registration),
    Unsubscribe(ClientId),
}

/// Receiving end handed to a connection after registration.
pub struct Subscription {
    pub id: ClientId,
    pub batches: mpsc::Receiver<Batch>,
}

/// Cheap clonable access to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    next_id: Arc<AtomicU64>,
    identity: UserId,
    cursors: CursorStore,
    stats: Arc<RwLock<HubStats>>,
    client_capacity: usize,
}

impl HubHandle {
    /// Subscribe a handshaked peer. Its backlog arrives on the returned
    /// channel; one-shot peers see the channel close after that.
    pub async fn register(
        &self,
        user: UserId,
        sync: SyncParams,
    ) -> Result<Subscription, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (send, batches) = mpsc::channel(self.client_capacity);
        self.events
            .send(HubEvent::Subscribe(Registration {
                id,
                user,
                sync,
                send,
            }))
            .await
            .map_err(|_| HubError::Stopped)?;
        Ok(Subscription { id, batches })
    }

    /// Hand a message received from `from` on connection `client` to the loop.
    pub async fn deliver(
        &self,
        client: ClientId,
        from: UserId,
        msg: Message,
    ) -> Result<(), HubError> {
        self.events
            .send(HubEvent::Inbound { client, from, msg })
            .await
            .map_err(|_| HubError::Stopped)
    }

    pub async fn unregister(&self, client: ClientId) {
        // A stopped loop has already dropped every client.
        let _ = self.events.send(HubEvent::Unsubscribe(client)).await;
    }

    /// Cursor held for `peer`, read from the cursor store on the blocking pool.
    pub async fn cursor_for(&self, peer: UserId) -> Option<MsgId> {
        let cursors = self.cursors.clone();
        let loaded = tokio::task::spawn_blocking(move || cursors.load(&peer)).await;
        match loaded {
            Ok(Ok(cursor)) => cursor,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "failed to read peer cursor");
                None
            }
            Err(e) => {
                warn!(%peer, error = %e, "cursor lookup task failed");
                None
            }
        }
    }

    pub fn identity(&self) -> UserId {
        self.identity
    }

    pub fn stats(&self) -> HubStats {
        *self.stats.read()
    }
}

struct Delayed {
    msg: Message,
    since: Instant,
}

struct Client {
    user: UserId,
    send: mpsc::Sender<Batch>,
    pending: Batch,
    delayed: Option<Delayed>,
}

struct Disconnected;

impl Client {
    fn new(user: UserId, send: mpsc::Sender<Batch>) -> Self {
        Self {
            user,
            send,
            pending: Vec::new(),
            delayed: None,
        }
    }

    /// Park the client's own message; the burst keeps its first timestamp.
    fn delay(&mut self, msg: Message, now: Instant) {
        let since = self.delayed.as_ref().map_or(now, |d| d.since);
        self.delayed = Some(Delayed { msg, since });
    }

    /// Offer pending messages to the connection without blocking.
    /// Returns whether a batch was handed off.
    fn flush(&mut self) -> Result<bool, Disconnected> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let batch = std::mem::take(&mut self.pending);
        match self.send.try_send(batch) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(batch)) => {
                self.pending = batch;
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(Disconnected),
        }
    }
}

/// The control loop. Owns the journal for as long as it runs.
pub struct Hub {
    journal: Journal,
    config: HubConfig,
    clients: HashMap<ClientId, Client>,
    events: mpsc::Receiver<HubEvent>,
    stats: Arc<RwLock<HubStats>>,
}

impl Hub {
    pub fn new(journal: Journal, mut config: HubConfig) -> Result<(Hub, HubHandle), HubError> {
        let identity = journal.identity().ok_or(HubError::NotInitialized)?;
        config.client_capacity = config.client_capacity.max(1);
        config.event_capacity = config.event_capacity.max(1);

        let (events_tx, events) = mpsc::channel(config.event_capacity);
        let stats = Arc::new(RwLock::new(HubStats::default()));
        let handle = HubHandle {
            events: events_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            identity,
            cursors: journal.cursors().clone(),
            stats: stats.clone(),
            client_capacity: config.client_capacity,
        };
        let hub = Hub {
            journal,
            config,
            clients: HashMap::new(),
            events,
            stats,
        };
        Ok((hub, handle))
    }

    /// Run the loop on a dedicated thread with its own single-threaded
    /// runtime. The journal is sent back once every [`HubHandle`] is gone.
    pub fn spawn_thread(self) -> io::Result<oneshot::Receiver<Journal>> {
        let rt = runtime::Builder::new_current_thread().enable_time().build()?;
        let (done, rx) = oneshot::channel();
        thread::Builder::new()
            .name("kithub-loop".into())
            .spawn(move || {
                let journal = rt.block_on(self.run());
                // the receiver may already be gone
                let _ = done.send(journal);
            })?;
        Ok(rx)
    }

    /// Run until every [`HubHandle`] is gone, then give the journal back.
    pub async fn run(mut self) -> Journal {
        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            identity = %self.journal.identity().unwrap_or_default(),
            messages = self.journal.len(),
            "hub loop started"
        );

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }

        info!("hub loop stopped");
        self.journal
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Inbound { client, from, msg } => self.inbound(client, from, msg),
            HubEvent::Subscribe(reg) => self.subscribe(reg),
            HubEvent::Unsubscribe(id) => {
                if self.clients.remove(&id).is_some() {
                    debug!(client = id, "unsubscribed");
                    self.stats.write().clients = self.clients.len();
                }
            }
        }
    }

    fn inbound(&mut self, origin: ClientId, from: UserId, msg: Message) {
        match self.journal.append_from_peer(&msg, &from) {
            Ok(AppendOutcome::Accepted) => {
                debug!(%from, %msg, "accepted");
                self.stats.write().accepted += 1;
            }
            Ok(AppendOutcome::Duplicate) => {
                debug!(%from, %msg, "duplicate");
                self.stats.write().duplicates += 1;
                return;
            }
            Err(e) => {
                warn!(%from, %msg, error = %e, "failed to append message");
                self.stats.write().rejected += 1;
                return;
            }
        }

        let now = Instant::now();
        for (id, client) in self.clients.iter_mut() {
            if *id == origin {
                client.delay(msg.clone(), now);
                continue;
            }
            client.delayed = None;
            client.pending.push(msg.clone());
        }
        self.flush_all();
    }

    fn subscribe(&mut self, reg: Registration) {
        let backlog = self.journal.select_since(reg.sync.resume_point().as_ref());
        debug!(
            client = reg.id,
            user = %reg.user,
            follow = reg.sync.follows(),
            backlog = backlog.len(),
            "subscribed"
        );
        let mut client = Client::new(reg.user, reg.send);
        client.pending = backlog.to_vec();
        match client.flush() {
            Ok(true) => self.stats.write().batches += 1,
            Ok(false) => {}
            Err(Disconnected) => return,
        }
        if reg.sync.follows() {
            self.clients.insert(reg.id, client);
            self.stats.write().clients = self.clients.len();
        }
        // One-shot clients are dropped here, which closes their channel
        // behind the backlog.
    }

    fn tick(&mut self, now: Instant) {
        let echo_delay = self.config.echo_delay;
        for client in self.clients.values_mut() {
            if let Some(delayed) = client.delayed.take() {
                if now.duration_since(delayed.since) >= echo_delay {
                    client.pending.push(delayed.msg);
                } else {
                    client.delayed = Some(delayed);
                }
            }
        }
        self.flush_all();
    }

    fn flush_all(&mut self) {
        let mut handed = 0;
        let mut gone = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            match client.flush() {
                Ok(true) => handed += 1,
                Ok(false) => {}
                Err(Disconnected) => gone.push(*id),
            }
        }
        for id in gone {
            if let Some(client) = self.clients.remove(&id) {
                debug!(client = id, user = %client.user, "client channel closed");
            }
        }
        let mut stats = self.stats.write();
        stats.batches += handed;
        stats.clients = self.clients.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kit_core::{Change, KeyPair, Payload, Register};
    use tempfile::tempdir;
    use tokio::time::{sleep, timeout_at};

    fn test_config() -> HubConfig {
        HubConfig {
            tick: Duration::from_millis(20),
            echo_delay: Duration::from_millis(200),
            client_capacity: 2,
            event_capacity: 100,
        }
    }

    fn register(kp: &KeyPair) -> Message {
        let payload = Payload::from(Register {
            email: String::new(),
        });
        let mut msg = Message::new(kp.user_id(), 0, MsgId::ZERO, &payload).unwrap();
        msg.seal(kp).unwrap();
        msg
    }

    fn chain(kp: &KeyPair, n: usize) -> Vec<Message> {
        let mut out = vec![register(kp)];
        while out.len() < n {
            let prev = out.last().unwrap();
            let payload = Payload::from(Change {
                diff: format!("+line {}", out.len()),
            });
            let mut msg = Message::new(kp.user_id(), prev.seq() + 1, prev.id(), &payload).unwrap();
            msg.seal(kp).unwrap();
            out.push(msg);
        }
        out
    }

    fn start(dir: &tempfile::TempDir) -> (HubHandle, tokio::task::JoinHandle<Journal>) {
        let hub_key = KeyPair::generate();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.append(&register(&hub_key)).unwrap();
        let (hub, handle) = Hub::new(journal, test_config()).unwrap();
        (handle, tokio::spawn(hub.run()))
    }

    /// Everything that arrives within `window`.
    async fn drain(sub: &mut Subscription, window: Duration) -> Vec<Message> {
        let mut out = Vec::new();
        let deadline = Instant::now() + window;
        while let Ok(Some(batch)) = timeout_at(deadline, sub.batches.recv()).await {
            out.extend(batch);
        }
        out
    }

    fn follow() -> SyncParams {
        SyncParams::new(None, true)
    }

    #[tokio::test]
    async fn test_requires_initialized_journal() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path()).unwrap();
        assert!(matches!(
            Hub::new(journal, HubConfig::default()),
            Err(HubError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_one_shot_gets_backlog_then_close() {
        let dir = tempdir().unwrap();
        let (handle, _hub) = start(&dir);
        let mut sub = handle
            .register(KeyPair::generate().user_id(), SyncParams::new(None, false))
            .await
            .unwrap();

        let batch = sub.batches.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].author(), handle.identity());
        assert!(sub.batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fan_out_and_delayed_echo() {
        let dir = tempdir().unwrap();
        let (handle, _hub) = start(&dir);
        let user = KeyPair::generate();
        let msgs = chain(&user, 2);

        let mut origin = handle.register(user.user_id(), follow()).await.unwrap();
        let mut other = handle
            .register(KeyPair::generate().user_id(), follow())
            .await
            .unwrap();
        // backlog: the hub's own registration
        assert_eq!(origin.batches.recv().await.unwrap().len(), 1);
        assert_eq!(other.batches.recv().await.unwrap().len(), 1);

        for m in &msgs {
            handle.deliver(origin.id, user.user_id(), m.clone()).await.unwrap();
        }

        // the origin's burst is held back and echoed once
        assert!(drain(&mut origin, Duration::from_millis(50)).await.is_empty());
        assert_eq!(drain(&mut other, Duration::from_millis(50)).await, msgs);
        let echoed = drain(&mut origin, Duration::from_millis(400)).await;
        assert_eq!(echoed, vec![msgs[1].clone()]);

        let stats = handle.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.clients, 2);
    }

    #[tokio::test]
    async fn test_message_from_other_origin_clears_delay() {
        let dir = tempdir().unwrap();
        let (handle, _hub) = start(&dir);
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let a_msgs = chain(&a, 1);
        let b_msgs = chain(&b, 1);

        let mut sub_a = handle.register(a.user_id(), follow()).await.unwrap();
        let sub_b = handle.register(b.user_id(), follow()).await.unwrap();
        sub_a.batches.recv().await.unwrap();

        handle.deliver(sub_a.id, a.user_id(), a_msgs[0].clone()).await.unwrap();
        handle.deliver(sub_b.id, b.user_id(), b_msgs[0].clone()).await.unwrap();

        let got = drain(&mut sub_a, Duration::from_millis(400)).await;
        assert_eq!(got, b_msgs);
    }

    #[tokio::test]
    async fn test_duplicates_absorbed() {
        let dir = tempdir().unwrap();
        let (handle, _hub) = start(&dir);
        let user = KeyPair::generate();
        let m0 = register(&user);

        let mut watcher = handle
            .register(KeyPair::generate().user_id(), follow())
            .await
            .unwrap();
        watcher.batches.recv().await.unwrap();

        handle.deliver(0, user.user_id(), m0.clone()).await.unwrap();
        handle.deliver(0, user.user_id(), m0.clone()).await.unwrap();

        assert_eq!(drain(&mut watcher, Duration::from_millis(100)).await, vec![m0]);
        let stats = handle.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_saturated_client_does_not_block_others() {
        let dir = tempdir().unwrap();
        let (handle, _hub) = start(&dir);
        let user = KeyPair::generate();
        let msgs = chain(&user, 20);

        // never read from
        let mut stuck = handle
            .register(KeyPair::generate().user_id(), follow())
            .await
            .unwrap();
        let mut live = handle
            .register(KeyPair::generate().user_id(), follow())
            .await
            .unwrap();
        live.batches.recv().await.unwrap();

        for m in &msgs {
            handle.deliver(0, user.user_id(), m.clone()).await.unwrap();
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(drain(&mut live, Duration::from_millis(200)).await, msgs);

        // the stuck client catches up once it reads: nothing was lost
        let mut got = drain(&mut stuck, Duration::from_millis(200)).await;
        assert_eq!(got.remove(0).author(), handle.identity());
        assert_eq!(got, msgs);
    }

    #[tokio::test]
    async fn test_closed_client_is_dropped() {
        let dir = tempdir().unwrap();
        let (handle, _hub) = start(&dir);
        let user = KeyPair::generate();

        let sub = handle
            .register(KeyPair::generate().user_id(), follow())
            .await
            .unwrap();
        drop(sub);
        handle.deliver(0, user.user_id(), register(&user)).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.stats().clients, 0);
    }

    #[tokio::test]
    async fn test_loop_thread_relays_and_returns_journal() {
        let dir = tempdir().unwrap();
        let hub_key = KeyPair::generate();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.append(&register(&hub_key)).unwrap();
        let (hub, handle) = Hub::new(journal, test_config()).unwrap();
        let done = hub.spawn_thread().unwrap();

        let user = KeyPair::generate();
        let msgs = chain(&user, 2);
        let mut watcher = handle
            .register(KeyPair::generate().user_id(), follow())
            .await
            .unwrap();
        watcher.batches.recv().await.unwrap();
        for m in &msgs {
            handle.deliver(0, user.user_id(), m.clone()).await.unwrap();
        }
        assert_eq!(drain(&mut watcher, Duration::from_millis(200)).await, msgs);
        assert_eq!(handle.cursor_for(user.user_id()).await, Some(msgs[1].id()));

        drop(watcher);
        drop(handle);
        let journal = done.await.unwrap();
        assert_eq!(journal.len(), 3);
    }

    #[tokio::test]
    async fn test_run_returns_journal_when_handles_drop() {
        let dir = tempdir().unwrap();
        let (handle, hub) = start(&dir);
        let user = KeyPair::generate();
        handle.deliver(0, user.user_id(), register(&user)).await.unwrap();
        drop(handle);
        let journal = hub.await.unwrap();
        assert_eq!(journal.len(), 2);
    }
}
