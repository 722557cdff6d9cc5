// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of concurrent.
//
// concurrent is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// concurrent is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with concurrent.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The realtime keeper
//!
//! Our clients may listen to timelines hosted elsewhere. For each peer domain hosting at least one
//! such timeline we hold a single websocket, over which we ask for the union of everything our
//! clients want from that peer. Events arriving over these connections are re-published on our
//! own bus (where the client connections will pick them up) & used to keep our cached chunks for
//! those timelines current.
//!
//! All the bookkeeping (which client wants what, which peers we're listening to & for what, which
//! connections are up) lives in a single [Keeper] task; everything else talks to it through a
//! [KeeperHandle]. The set of remote timelines we're subscribed to is published on a `watch`
//! channel for the [ChunkStore]'s benefit.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use http::Uri;
use itertools::Itertools;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{interval, sleep_until, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tokio_websockets::{ClientBuilder, Message};
use tracing::{debug, error, info, warn};

use concurrent_shared::{
    api::RealtimeFrame,
    entities::{split_qualified, Event},
    epoch::Epoch,
};

use crate::{
    chunk_store::ChunkStore,
    gauge_setu,
    metrics::{self, Instruments, Sort},
    peer::{self, Peers},
    pubsub::{Bus, SUBSCRIPTION_UPDATED},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to serialize a listen request: {source}"))]
    Frame {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The websocket handshake with {domain} failed: {source}"))]
    Handshake {
        domain: String,
        source: tokio_websockets::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The websocket handshake with {domain} timed out"))]
    HandshakeTimeout { domain: String, backtrace: Backtrace },
    #[snafu(display("Won't connect to {domain}: {source}"))]
    Peer {
        domain: String,
        source: peer::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While writing to {domain}: {source}"))]
    Send {
        domain: String,
        source: tokio_websockets::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} can't be used as a websocket URI: {source}"))]
    Uri {
        url: String,
        source: http::uri::InvalidUri,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

inventory::submit! { metrics::Registration::new("keeper.remote.subscriptions", Sort::IntegralGauge) }
inventory::submit! { metrics::Registration::new("keeper.remote.connections", Sort::IntegralGauge) }
inventory::submit! { metrics::Registration::new("keeper.relayed.events", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("keeper.rejected.events", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the mailbox                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Messages the [Keeper] understands
#[derive(Debug)]
pub enum ToKeeper {
    /// Client connection `connection` now listens to `channels` (and only those)
    Register {
        connection: u64,
        channels: Vec<String>,
    },
    /// Client connection `connection` has gone away
    Unregister { connection: u64 },
    /// Bring our peer connections in line with what our clients want
    Reconcile,
    /// The session with `domain` numbered `generation` has ended
    Closed { domain: String, generation: u64 },
    Status { reply: oneshot::Sender<KeeperStatus> },
}

/// A snapshot of the keeper's state
#[derive(Clone, Debug, Default)]
pub struct KeeperStatus {
    /// Peer domain => the timelines we've asked it for
    pub remote_subs: HashMap<String, Vec<String>>,
    /// Peer domains with which we hold (or are establishing) a session
    pub connections: Vec<String>,
}

/// A cloneable handle on the [Keeper]
#[derive(Clone, Debug)]
pub struct KeeperHandle {
    tx: mpsc::UnboundedSender<ToKeeper>,
}

impl KeeperHandle {
    fn send(&self, msg: ToKeeper) {
        if self.tx.send(msg).is_err() {
            warn!("The keeper has shut down");
        }
    }
    pub fn register(&self, connection: u64, channels: Vec<String>) {
        self.send(ToKeeper::Register {
            connection,
            channels,
        })
    }
    pub fn unregister(&self, connection: u64) {
        self.send(ToKeeper::Unregister { connection })
    }
    pub fn reconcile(&self) {
        self.send(ToKeeper::Reconcile)
    }
    /// None if the keeper isn't running
    pub async fn status(&self) -> Option<KeeperStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ToKeeper::Status { reply }).ok()?;
        rx.await.ok()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Keeper                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct PeerConnection {
    generation: u64,
    /// Listen requests for the session to forward
    listen: mpsc::UnboundedSender<Vec<String>>,
    cancel: CancellationToken,
}

/// The keeper task's state; see the [module](self) docs
pub struct Keeper {
    fqdn: String,
    peers: Arc<Peers>,
    chunks: Arc<ChunkStore>,
    bus: Arc<dyn Bus + Send + Sync>,
    instruments: Arc<Instruments>,
    inbox: mpsc::UnboundedReceiver<ToKeeper>,
    tx: mpsc::UnboundedSender<ToKeeper>,
    subs_tx: watch::Sender<HashSet<String>>,
    client_subs: HashMap<u64, Vec<String>>,
    remote_subs: HashMap<String, Vec<String>>,
    remote_conns: HashMap<String, PeerConnection>,
    generation: u64,
    shutdown: CancellationToken,
}

/// When the epoch following `epoch` begins
fn boundary_after(epoch: Epoch) -> Instant {
    Instant::now()
        + (epoch.next().start() - Utc::now())
            .to_std()
            .unwrap_or_default()
}

impl Keeper {
    /// `subs_tx` is the sending half of the channel given to the [ChunkStore]
    pub fn new(
        fqdn: &str,
        peers: Arc<Peers>,
        chunks: Arc<ChunkStore>,
        bus: Arc<dyn Bus + Send + Sync>,
        subs_tx: watch::Sender<HashSet<String>>,
        instruments: Arc<Instruments>,
        shutdown: CancellationToken,
    ) -> (Keeper, KeeperHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        (
            Keeper {
                fqdn: fqdn.to_owned(),
                peers,
                chunks,
                bus,
                instruments,
                inbox,
                tx: tx.clone(),
                subs_tx,
                client_subs: HashMap::new(),
                remote_subs: HashMap::new(),
                remote_conns: HashMap::new(),
                generation: 0,
                shutdown,
            },
            KeeperHandle { tx },
        )
    }

    pub async fn run(mut self) {
        tokio::spawn(watch_events(
            self.bus.clone(),
            KeeperHandle {
                tx: self.tx.clone(),
            },
            self.shutdown.clone(),
        ));

        let mut reconcile = interval(RECONCILE_INTERVAL);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut epoch = Epoch::current();
        let roll = sleep_until(boundary_after(epoch));
        tokio::pin!(roll);

        info!("Keeper running");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = reconcile.tick() => self.reconcile(),
                _ = &mut roll => {
                    let now = Epoch::current();
                    if now != epoch {
                        self.roll(epoch, now);
                        epoch = now;
                    }
                    roll.as_mut().reset(boundary_after(now));
                }
            }
        }
        for (_, conn) in self.remote_conns.drain() {
            conn.cancel.cancel();
        }
        info!("Keeper shut down");
    }

    fn handle(&mut self, msg: ToKeeper) {
        match msg {
            ToKeeper::Register {
                connection,
                channels,
            } => {
                debug!("client {connection} listens to {channels:?}");
                self.client_subs.insert(connection, channels);
            }
            ToKeeper::Unregister { connection } => {
                self.client_subs.remove(&connection);
            }
            ToKeeper::Reconcile => self.reconcile(),
            ToKeeper::Closed { domain, generation } => {
                if self
                    .remote_conns
                    .get(&domain)
                    .is_some_and(|conn| conn.generation == generation)
                {
                    info!("Remote connection to {domain} closed");
                    self.remote_conns.remove(&domain);
                    self.report();
                }
            }
            ToKeeper::Status { reply } => {
                let _ = reply.send(KeeperStatus {
                    remote_subs: self.remote_subs.clone(),
                    connections: self.remote_conns.keys().cloned().sorted().collect(),
                });
            }
        }
    }

    /// Remote timelines our clients want, by hosting domain
    fn wanted(&self) -> HashMap<String, Vec<String>> {
        self.client_subs
            .values()
            .flatten()
            .unique()
            .filter_map(|timeline| match split_qualified(timeline).1 {
                Some(domain) if domain != self.fqdn => Some((domain.to_owned(), timeline.clone())),
                _ => None,
            })
            .into_group_map()
    }

    /// Add subscriptions our clients need but we lack, & restore broken connections
    ///
    /// Subscriptions are only ever added here; they're pruned at epoch boundaries.
    fn reconcile(&mut self) {
        let mut changed = Vec::new();
        for (domain, timelines) in self.wanted() {
            let subs = self.remote_subs.entry(domain.clone()).or_default();
            let mut grew = false;
            for timeline in timelines {
                if !subs.contains(&timeline) {
                    subs.push(timeline);
                    grew = true;
                }
            }
            if grew {
                changed.push(domain);
            }
        }
        if !changed.is_empty() {
            self.publish_subs();
        }
        for domain in changed {
            self.listen(&domain);
        }
        let broken = self
            .remote_subs
            .keys()
            .filter(|domain| !self.remote_conns.contains_key(*domain))
            .cloned()
            .collect::<Vec<_>>();
        for domain in broken {
            info!("Broken connection found: {domain}");
            self.listen(&domain);
        }
        self.report();
    }

    /// Ask `domain` for everything we want from it, connecting if need be
    fn listen(&mut self, domain: &str) {
        let Some(channels) = self.remote_subs.get(domain).cloned() else {
            return;
        };
        if let Some(conn) = self.remote_conns.get(domain) {
            if conn.listen.send(channels.clone()).is_ok() {
                return;
            }
        }
        self.generation += 1;
        let cancel = self.shutdown.child_token();
        let (listen, listen_rx) = mpsc::unbounded_channel();
        let _ = listen.send(channels);
        let session = PeerSession {
            domain: domain.to_owned(),
            generation: self.generation,
            peers: self.peers.clone(),
            chunks: self.chunks.clone(),
            bus: self.bus.clone(),
            instruments: self.instruments.clone(),
            keeper: self.tx.clone(),
            subs: self.subs_tx.subscribe(),
            cancel: cancel.clone(),
        };
        tokio::spawn(session.run(listen_rx));
        self.remote_conns.insert(
            domain.to_owned(),
            PeerConnection {
                generation: self.generation,
                listen,
                cancel,
            },
        );
    }

    /// Epoch `from` has given way to `to`: drop subscriptions no client wants any longer (&
    /// connections left with nothing to do), then seed the new chunks for what remains
    fn roll(&mut self, from: Epoch, to: Epoch) {
        info!("Rolling chunks: {from} -> {to}");
        let wanted = self.wanted();
        self.remote_subs.retain(|domain, subs| {
            subs.retain(|tl| wanted.get(domain).is_some_and(|w| w.contains(tl)));
            !subs.is_empty()
        });
        let closing = self
            .remote_conns
            .keys()
            .filter(|domain| !self.remote_subs.contains_key(*domain))
            .cloned()
            .collect::<Vec<_>>();
        for domain in &closing {
            if let Some(conn) = self.remote_conns.remove(domain) {
                conn.cancel.cancel();
            }
        }
        info!("Subscriptions cleaned up: {closing:?}");
        self.publish_subs();
        self.report();

        let timelines = self.remote_subs.values().flatten().cloned().collect::<Vec<_>>();
        let chunks = self.chunks.clone();
        tokio::spawn(async move { chunks.roll_epoch(&timelines, from, to).await });
    }

    fn publish_subs(&self) {
        self.subs_tx
            .send_replace(self.remote_subs.values().flatten().cloned().collect());
    }

    fn report(&self) {
        gauge_setu!(
            self.instruments,
            "keeper.remote.subscriptions",
            self.remote_subs.values().map(Vec::len).sum::<usize>() as u64,
            &[]
        );
        gauge_setu!(
            self.instruments,
            "keeper.remote.connections",
            self.remote_conns.len() as u64,
            &[]
        );
    }
}

/// Reconcile whenever anyone announces a subscription change
async fn watch_events(
    bus: Arc<dyn Bus + Send + Sync>,
    keeper: KeeperHandle,
    shutdown: CancellationToken,
) {
    let mut updates = match bus.subscribe(&[SUBSCRIPTION_UPDATED.to_owned()]).await {
        Ok(updates) => updates,
        Err(err) => {
            error!("Failed to subscribe to {SUBSCRIPTION_UPDATED}: {err}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = updates.next() => match msg {
                Some((_, payload)) => {
                    debug!("Subscriptions updated: {payload}");
                    keeper.reconcile();
                }
                None => break,
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          peer sessions                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One websocket session with a peer
///
/// The session task itself writes (listen requests & pings); a reader task hands text frames to a
/// relay task. All three share `cancel`, & whichever finishes first takes the others down.
struct PeerSession {
    domain: String,
    generation: u64,
    peers: Arc<Peers>,
    chunks: Arc<ChunkStore>,
    bus: Arc<dyn Bus + Send + Sync>,
    instruments: Arc<Instruments>,
    keeper: mpsc::UnboundedSender<ToKeeper>,
    /// The remote timelines we're currently subscribed to
    subs: watch::Receiver<HashSet<String>>,
    cancel: CancellationToken,
}

impl PeerSession {
    async fn run(self, listen: mpsc::UnboundedReceiver<Vec<String>>) {
        tokio::select! {
            _ = self.cancel.cancelled() => debug!("Session with {} cancelled", self.domain),
            res = self.session(listen) => {
                if let Err(err) = res {
                    warn!("Session with {} ended: {err}", self.domain);
                }
            }
        }
        self.cancel.cancel();
        let _ = self.keeper.send(ToKeeper::Closed {
            domain: self.domain.clone(),
            generation: self.generation,
        });
    }

    async fn session(&self, mut listen: mpsc::UnboundedReceiver<Vec<String>>) -> Result<()> {
        let domain = &self.domain;
        self.peers
            .ensure_same_dimension(domain)
            .await
            .context(PeerSnafu { domain })?;
        let url = self.peers.ws_url(domain).context(PeerSnafu { domain })?;
        let uri = url
            .as_str()
            .parse::<Uri>()
            .context(UriSnafu { url: url.as_str() })?;
        let (ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, ClientBuilder::from_uri(uri).connect())
            .await
            .ok()
            .context(HandshakeTimeoutSnafu { domain })?
            .context(HandshakeSnafu { domain })?;
        info!("Connected to {domain}");

        let (mut sink, stream) = ws.split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        tokio::spawn(read_frames(
            domain.clone(),
            stream,
            frames_tx,
            pong_tx,
            self.cancel.clone(),
        ));
        tokio::spawn(relay(
            domain.clone(),
            self.subs.clone(),
            frames_rx,
            self.bus.clone(),
            self.chunks.clone(),
            self.instruments.clone(),
            self.cancel.clone(),
        ));

        let mut ping = interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                channels = listen.recv() => {
                    let Some(channels) = channels else { break };
                    let frame = serde_json::to_string(&RealtimeFrame::Listen {
                        channels: channels.clone(),
                    })
                    .context(FrameSnafu)?;
                    sink.send(Message::text(frame))
                        .await
                        .context(SendSnafu { domain })?;
                    info!("Remote connection updated: {domain} > {channels:?}");
                    tokio::spawn(prefetch(self.chunks.clone(), channels));
                }
                _ = ping.tick() => {
                    sink.send(Message::ping(Bytes::new()))
                        .await
                        .context(SendSnafu { domain })?;
                    if pong_rx.borrow().elapsed() > DISCONNECT_TIMEOUT {
                        warn!("Pong timeout: {domain}");
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
        Ok(())
    }
}

/// Load the current chunks for freshly-subscribed remote timelines, & make sure there's a body
/// for the current epoch into which relayed items can be prepended
async fn prefetch(chunks: Arc<ChunkStore>, timelines: Vec<String>) {
    let current = Epoch::current();
    let itrs = chunks.lookup_chunk_itrs(&timelines, current).await;
    chunks.load_chunk_bodies(&itrs).await;
    chunks.roll_epoch(&timelines, current, current).await;
}

async fn read_frames<S>(
    domain: String,
    mut stream: S,
    frames: mpsc::UnboundedSender<String>,
    pong: watch::Sender<Instant>,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_websockets::Error>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(msg)) if msg.is_pong() => {
                pong.send_replace(Instant::now());
            }
            Some(Ok(msg)) => {
                if let Some(text) = msg.as_text() {
                    if frames.send(text.to_owned()).is_err() {
                        break;
                    }
                } else if msg.is_close() {
                    info!("{domain} closed the connection");
                    break;
                }
            }
            Some(Err(err)) => {
                error!("Failed to read from {domain}: {err}");
                break;
            }
            None => break,
        }
    }
    cancel.cancel();
}

/// True if `domain` may speak for `timeline`: it must be hosted there, & we must have asked for it
fn vouches_for(domain: &str, subs: &HashSet<String>, timeline: &str) -> bool {
    split_qualified(timeline).1 == Some(domain) && subs.contains(timeline)
}

/// Re-publish events relayed by `domain` (in the order received) & fold their items into our
/// cached chunks
async fn relay(
    domain: String,
    subs: watch::Receiver<HashSet<String>>,
    mut frames: mpsc::UnboundedReceiver<String>,
    bus: Arc<dyn Bus + Send + Sync>,
    chunks: Arc<ChunkStore>,
    instruments: Arc<Instruments>,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            text = frames.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        let event = match serde_json::from_str::<Event>(&text) {
            Ok(event) => event,
            Err(err) => {
                debug!("Ignoring a frame that's not an event ({err})");
                continue;
            }
        };
        let vouched = vouches_for(&domain, &subs.borrow(), &event.timeline);
        if !vouched {
            warn!("Dropping an event for {} relayed by {domain}", event.timeline);
            crate::counter_add!(instruments, "keeper.rejected.events", 1, &[]);
            continue;
        }
        if let Err(err) = bus.publish(&event.timeline, &text).await {
            error!("Failed to publish an event for {}: {err}", event.timeline);
            continue;
        }
        crate::counter_add!(instruments, "keeper.relayed.events", 1, &[]);
        if let Some(mut item) = event.item.filter(|item| !item.resource_id.is_empty()) {
            item.timeline_id = event.timeline;
            chunks.absorb_remote_item(&item).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{
        cache::{Cache, MemoryCache},
        chunk_store::itr_key,
        client::make_client,
        memory::MemoryBackend,
        pubsub::LocalBus,
    };

    async fn keeper_for(server: &MockServer) -> (Keeper, watch::Receiver<HashSet<String>>) {
        let instruments = Arc::new(Instruments::new("concurrent-test"));
        let storage = Arc::new(MemoryBackend::new());
        let cache = Arc::new(MemoryCache::new());
        let client = make_client("concurrent unit tests", instruments.clone()).unwrap();
        let peers = Arc::new(Peers::new(
            client,
            storage.clone(),
            "cc-test",
            HashMap::from([(
                "peer.example".to_owned(),
                url::Url::parse(&server.uri()).unwrap(),
            )]),
        ));
        let (subs_tx, subs_rx) = watch::channel(HashSet::new());
        let chunks = Arc::new(ChunkStore::new(
            storage,
            cache,
            peers.clone(),
            "ours.example",
            subs_rx.clone(),
            instruments.clone(),
        ));
        let (keeper, _) = Keeper::new(
            "ours.example",
            peers,
            chunks,
            Arc::new(LocalBus::new()),
            subs_tx,
            instruments,
            CancellationToken::new(),
        );
        (keeper, subs_rx)
    }

    #[tokio::test]
    async fn subscriptions_track_clients() {
        let server = MockServer::start().await;
        // a peer in some other dimension: we'll never dial it
        Mock::given(method("GET"))
            .and(path("/api/v1/domain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "content": {"fqdn": "peer.example", "ccid": "con1x", "dimension": "elsewhere"}
            })))
            .mount(&server)
            .await;
        let (mut keeper, subs) = keeper_for(&server).await;

        keeper.handle(ToKeeper::Register {
            connection: 1,
            channels: vec![
                "ta@peer.example".to_owned(),
                "tb@ours.example".to_owned(),
            ],
        });
        keeper.handle(ToKeeper::Register {
            connection: 2,
            channels: vec!["tc@peer.example".to_owned(), "ta@peer.example".to_owned()],
        });
        keeper.reconcile();
        assert_eq!(
            *subs.borrow(),
            HashSet::from(["ta@peer.example".to_owned(), "tc@peer.example".to_owned()])
        );
        assert_eq!(keeper.remote_conns.len(), 1);

        // The session fails the dimension check & reports back
        match keeper.inbox.recv().await.unwrap() {
            msg @ ToKeeper::Closed { .. } => keeper.handle(msg),
            other => panic!("unexpected {other:?}"),
        }
        assert!(keeper.remote_conns.is_empty());

        // Subscriptions persist until the epoch rolls over
        keeper.handle(ToKeeper::Unregister { connection: 2 });
        keeper.reconcile();
        assert_eq!(keeper.remote_subs["peer.example"].len(), 2);
        let now = Epoch::current();
        keeper.roll(now, now.next());
        assert_eq!(
            *subs.borrow(),
            HashSet::from(["ta@peer.example".to_owned()])
        );
        keeper.handle(ToKeeper::Unregister { connection: 1 });
        keeper.roll(now.next(), now.next().next());
        assert!(subs.borrow().is_empty());
        assert!(keeper.remote_conns.is_empty());
    }

    #[tokio::test]
    async fn peers_speak_only_for_their_own_timelines() {
        let instruments = Arc::new(Instruments::new("concurrent-test"));
        let storage = Arc::new(MemoryBackend::new());
        let cache = Arc::new(MemoryCache::new());
        let client = make_client("concurrent unit tests", instruments.clone()).unwrap();
        let peers = Arc::new(Peers::new(client, storage.clone(), "cc-test", HashMap::new()));
        let (subs_tx, subs_rx) = watch::channel(HashSet::from([
            "tsubscribed@peer.example".to_owned(),
            "tother@elsewhere.example".to_owned(),
        ]));
        let chunks = Arc::new(ChunkStore::new(
            storage,
            cache.clone(),
            peers,
            "ours.example",
            subs_rx.clone(),
            instruments.clone(),
        ));
        let bus: Arc<dyn Bus + Send + Sync> = Arc::new(LocalBus::new());
        let mut events = bus
            .subscribe(&[
                "tlocal@ours.example".to_owned(),
                "tother@elsewhere.example".to_owned(),
                "tunasked@peer.example".to_owned(),
                "tsubscribed@peer.example".to_owned(),
            ])
            .await
            .unwrap();

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(relay(
            "peer.example".to_owned(),
            subs_tx.subscribe(),
            frames_rx,
            bus.clone(),
            chunks,
            instruments,
            cancel.clone(),
        ));

        let now = Utc::now();
        let frame = |timeline: &str, document: &str| {
            json!({
                "timeline": timeline,
                "item": {
                    "resourceID": "m0123456789abcdefghijklmno",
                    "timelineID": timeline,
                    "owner": "con1victim",
                    "cdate": now,
                },
                "document": document,
                "signature": "",
            })
            .to_string()
        };
        // One of ours, one hosted elsewhere & one we never asked for: all dropped
        frames_tx
            .send(frame("tlocal@ours.example", "forged"))
            .unwrap();
        frames_tx
            .send(frame("tother@elsewhere.example", "forged"))
            .unwrap();
        frames_tx
            .send(frame("tunasked@peer.example", "forged"))
            .unwrap();
        frames_tx
            .send(frame("tsubscribed@peer.example", "genuine"))
            .unwrap();

        let (channel, payload) =
            tokio::time::timeout(Duration::from_secs(1), events.next())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(channel, "tsubscribed@peer.example");
        assert!(payload.contains("genuine"));

        // The item is absorbed just after the event goes out
        let epoch = Epoch::of(&now);
        let mut absorbed = false;
        for _ in 0..10 {
            if cache
                .get(&itr_key("tsubscribed@peer.example", epoch))
                .await
                .unwrap()
                .is_some()
            {
                absorbed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(absorbed);
        assert!(cache
            .get(&itr_key("tlocal@ours.example", epoch))
            .await
            .unwrap()
            .is_none());
        cancel.cancel();
    }
}
