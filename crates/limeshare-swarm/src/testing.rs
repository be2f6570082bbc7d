//! In-process stand-ins for the relay, the keystream provider and peer links.
//!
//! Available behind the `test-util` feature. `MemoryNetwork` implements
//! `SwarmTransport`, so whole swarms of orchestrators can run inside one
//! test without sockets. Clones share the same network.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use limeshare_crypto::{ProviderFrame, CLOSE_NORMAL};
use limeshare_types::{chunk_count, chunk_len, PeerFrame, PeerId, RelayFrame, RelayMessage};
use rand::RngCore;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransferError;
use crate::links::{LinkBackend, LinkError, LinkEvent, LinkEventKind};
use crate::orchestrator::{CompletedTransfer, TransferEvent};
use crate::relay::{relay_pipe, RelayChannel};
use crate::transport::SwarmTransport;

/// Initialise a tracing subscriber for tests.
///
/// Respects `RUST_LOG`, defaults to `limeshare=debug`. Safe to call more
/// than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "limeshare=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// `len` random bytes.
pub fn random_file(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    Bytes::from(data)
}

/// Drain `events` until the transfer completes.
///
/// Returns `None` on `Failed`, on a closed channel or after `within`.
pub async fn wait_completed(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    within: Duration,
) -> Option<CompletedTransfer> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Completed(done) => return Some(done),
                TransferEvent::Failed(e) => {
                    tracing::warn!("transfer failed: {}", e);
                    return None;
                }
                _ => {}
            }
        }
        None
    };
    tokio::time::timeout(within, wait).await.ok().flatten()
}

#[derive(Debug, Clone, Copy)]
enum ProviderMode {
    Complete,
    FailAfter { frames: u32, code: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Offerer,
    Answerer,
}

#[derive(Debug)]
struct Endpoint {
    side: Side,
    token: String,
    /// Backend id of the other end and the name it knows us by.
    remote: Option<(u64, PeerId)>,
}

#[derive(Default)]
struct Mesh {
    next_backend: u64,
    events: HashMap<u64, mpsc::UnboundedSender<LinkEvent>>,
    endpoints: HashMap<(u64, PeerId), Endpoint>,
    /// Open offers by token: offering backend and the peer it offered to.
    offers: HashMap<String, (u64, PeerId)>,
    /// Links report `Open` only once this many binary relay frames went out.
    open_after: u64,
    binary_forwarded: u64,
    /// Connected endpoints still waiting for `open_after`.
    deferred_opens: Vec<(u64, PeerId)>,
}

impl Mesh {
    fn emit(&self, backend: u64, peer: &PeerId, kind: LinkEventKind) {
        if let Some(tx) = self.events.get(&backend) {
            let _ = tx.send(LinkEvent::new(peer.clone(), kind));
        }
    }

    /// Report both ends of a fresh connection as open, now or once enough
    /// relay traffic has passed.
    fn open(&mut self, ends: [(u64, PeerId); 2]) {
        for (backend, peer) in ends {
            if self.binary_forwarded >= self.open_after {
                self.emit(backend, &peer, LinkEventKind::Open);
            } else {
                self.deferred_opens.push((backend, peer));
            }
        }
    }

    fn count_binary_frame(&mut self) {
        self.binary_forwarded += 1;
        if self.binary_forwarded < self.open_after || self.deferred_opens.is_empty() {
            return;
        }
        tracing::debug!(frames = self.binary_forwarded, "releasing deferred link opens");
        for (backend, peer) in std::mem::take(&mut self.deferred_opens) {
            let connected = self
                .endpoints
                .get(&(backend, peer.clone()))
                .is_some_and(|e| e.remote.is_some());
            if connected {
                self.emit(backend, &peer, LinkEventKind::Open);
            }
        }
    }

    /// Drop one endpoint and tell the other end, if any.
    fn close(&mut self, backend: u64, peer: &PeerId) {
        let Some(endpoint) = self.endpoints.remove(&(backend, peer.clone())) else {
            return;
        };
        if self.offers.get(&endpoint.token) == Some(&(backend, peer.clone())) {
            self.offers.remove(&endpoint.token);
        }
        if let Some((remote, label)) = endpoint.remote {
            self.endpoints.remove(&(remote, label.clone()));
            self.emit(remote, &label, LinkEventKind::Closed);
        }
    }
}

struct NetState {
    rooms: HashMap<String, BTreeMap<PeerId, mpsc::UnboundedSender<RelayFrame>>>,
    next_peer: u32,
    relay_opens: usize,
    binary_delay: Option<Duration>,
    provider: ProviderMode,
    links_enabled: bool,
    mesh: Mesh,
}

/// Relay, keystream provider and link mesh in one process.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                rooms: HashMap::new(),
                next_peer: 1,
                relay_opens: 0,
                binary_delay: None,
                provider: ProviderMode::Complete,
                links_enabled: true,
                mesh: Mesh::default(),
            })),
        }
    }

    /// Delay every binary relay frame by `delay` before it is forwarded.
    pub fn with_binary_delay(self, delay: Duration) -> Self {
        self.lock().binary_delay = Some(delay);
        self
    }

    /// Make the keystream provider close with `code` after `frames` frames.
    pub fn fail_provider_after(self, frames: u32, code: u16) -> Self {
        self.lock().provider = ProviderMode::FailAfter { frames, code };
        self
    }

    /// Hold every link's `Open` until `frames` binary relay frames have been
    /// forwarded, so links come up in the middle of a stream.
    pub fn with_links_after(self, frames: u64) -> Self {
        self.lock().mesh.open_after = frames;
        self
    }

    /// Refuse every peer link, leaving the relay as the only path.
    pub fn without_links(self) -> Self {
        self.lock().links_enabled = false;
        self
    }

    /// How many relay rooms have been joined so far.
    pub fn relay_opens(&self) -> usize {
        self.lock().relay_opens
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.lock().rooms.get(room).map(|r| r.len()).unwrap_or(0)
    }

    /// Cut every member of `room` off the relay.
    pub fn drop_room(&self, room: &str) {
        self.lock().rooms.remove(room);
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn join(&self, room: String) -> RelayChannel {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (sender, mut outbound) = relay_pipe();

        let id = {
            let mut state = self.lock();
            state.relay_opens += 1;
            let id = PeerId::new(format!("peer-{:04}", state.next_peer));
            state.next_peer += 1;

            let members = state.rooms.entry(room.clone()).or_default();
            let peers: Vec<PeerId> = members.keys().cloned().collect();
            let _ = inbound_tx.send(RelayFrame::Control(RelayMessage::Welcome {
                your_id: id.clone(),
                peers,
            }));
            for tx in members.values() {
                let _ = tx.send(RelayFrame::Control(RelayMessage::PeerJoin { peer_id: id.clone() }));
            }
            members.insert(id.clone(), inbound_tx);
            id
        };
        tracing::debug!(%room, peer = %id, "joined memory room");

        let network = self.clone();
        tokio::spawn(async move {
            while let Some(queued) = outbound.recv().await {
                let binary = matches!(queued.frame, RelayFrame::Binary(_));
                if binary {
                    let delay = network.lock().binary_delay;
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }
                let recipients: Vec<_> = network
                    .lock()
                    .rooms
                    .get(&room)
                    .map(|members| {
                        members
                            .iter()
                            .filter(|(peer, _)| **peer != id)
                            .map(|(_, tx)| tx.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                for tx in recipients {
                    let _ = tx.send(queued.frame.clone());
                }
                if binary {
                    network.lock().mesh.count_binary_frame();
                }
                outbound.written(&queued);
            }

            let mut state = network.lock();
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(&id);
                for tx in members.values() {
                    let _ = tx.send(RelayFrame::Control(RelayMessage::PeerLeave { peer_id: id.clone() }));
                }
                if members.is_empty() {
                    state.rooms.remove(&room);
                }
            }
        });

        RelayChannel { sender, inbound }
    }
}

impl SwarmTransport for MemoryNetwork {
    fn open_relay(&self, room: String) -> BoxFuture<'_, Result<RelayChannel, TransferError>> {
        async move { Ok(self.join(room)) }.boxed()
    }

    fn open_keystream(
        &self,
        total_size: u64,
        chunk_size: usize,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<ProviderFrame>, TransferError>> {
        let mode = self.lock().provider;
        async move {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let count = chunk_count(total_size, chunk_size).unwrap_or(0);
                for index in 0..count {
                    if let ProviderMode::FailAfter { frames, code } = mode {
                        if index == frames {
                            let _ = tx.send(ProviderFrame::Closed { code });
                            return;
                        }
                    }
                    let mut frame = vec![0u8; chunk_len(index, total_size, chunk_size)];
                    rand::rng().fill_bytes(&mut frame);
                    if tx.send(ProviderFrame::Binary(Bytes::from(frame))).is_err() {
                        return;
                    }
                    tokio::task::yield_now().await;
                }
                let _ = tx.send(ProviderFrame::Closed { code: CLOSE_NORMAL });
            });
            Ok(rx)
        }
        .boxed()
    }

    fn link_backend(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Box<dyn LinkBackend> {
        let mut state = self.lock();
        let id = state.mesh.next_backend;
        state.mesh.next_backend += 1;
        state.mesh.events.insert(id, events);
        Box::new(MemoryLinkBackend {
            id,
            network: self.clone(),
        })
    }
}

/// Link backend over the shared mesh.
///
/// The offerer publishes its token as the only candidate; the answerer
/// connects both ends when that candidate reaches it.
pub struct MemoryLinkBackend {
    id: u64,
    network: MemoryNetwork,
}

impl MemoryLinkBackend {
    fn disabled() -> LinkError {
        LinkError::Setup(std::io::Error::other("peer links disabled"))
    }
}

impl LinkBackend for MemoryLinkBackend {
    fn create_offer(&mut self, peer: &PeerId) -> Result<String, LinkError> {
        let mut state = self.network.lock();
        if !state.links_enabled {
            return Err(Self::disabled());
        }
        let mesh = &mut state.mesh;
        mesh.close(self.id, peer);

        let token = Uuid::new_v4().to_string();
        mesh.endpoints.insert(
            (self.id, peer.clone()),
            Endpoint {
                side: Side::Offerer,
                token: token.clone(),
                remote: None,
            },
        );
        mesh.offers.insert(token.clone(), (self.id, peer.clone()));
        mesh.emit(self.id, peer, LinkEventKind::Candidate(token.clone()));
        Ok(token)
    }

    fn accept_offer(&mut self, peer: &PeerId, offer: &str) -> Result<String, LinkError> {
        let mut state = self.network.lock();
        if !state.links_enabled {
            return Err(Self::disabled());
        }
        let mesh = &mut state.mesh;
        mesh.close(self.id, peer);
        mesh.endpoints.insert(
            (self.id, peer.clone()),
            Endpoint {
                side: Side::Answerer,
                token: offer.to_string(),
                remote: None,
            },
        );
        Ok(offer.to_string())
    }

    fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), LinkError> {
        let state = self.network.lock();
        match state.mesh.endpoints.get(&(self.id, peer.clone())) {
            Some(e) if e.side == Side::Offerer && e.token == answer => Ok(()),
            Some(_) => Err(LinkError::BadSignal {
                peer: peer.clone(),
                reason: "answer does not match our offer".into(),
            }),
            None => Err(LinkError::UnknownPeer(peer.clone())),
        }
    }

    fn add_candidate(&mut self, peer: &PeerId, candidate: &str) -> Result<(), LinkError> {
        let mut state = self.network.lock();
        let mesh = &mut state.mesh;
        let key = (self.id, peer.clone());
        let Some(endpoint) = mesh.endpoints.get(&key) else {
            return Err(LinkError::UnknownPeer(peer.clone()));
        };
        if endpoint.side == Side::Offerer || endpoint.remote.is_some() {
            return Ok(());
        }
        if endpoint.token != candidate {
            return Err(LinkError::BadSignal {
                peer: peer.clone(),
                reason: "candidate for another offer".into(),
            });
        }
        let Some((remote, label)) = mesh.offers.remove(candidate) else {
            return Err(LinkError::BadSignal {
                peer: peer.clone(),
                reason: "offer withdrawn".into(),
            });
        };
        let Some(offerer) = mesh.endpoints.get_mut(&(remote, label.clone())) else {
            return Err(LinkError::UnknownPeer(peer.clone()));
        };
        offerer.remote = Some((self.id, peer.clone()));
        if let Some(answerer) = mesh.endpoints.get_mut(&key) {
            answerer.remote = Some((remote, label.clone()));
        }

        mesh.open([(self.id, peer.clone()), (remote, label)]);
        Ok(())
    }

    fn send(&mut self, peer: &PeerId, frame: PeerFrame) -> Result<(), LinkError> {
        let state = self.network.lock();
        let Some((remote, label)) = state
            .mesh
            .endpoints
            .get(&(self.id, peer.clone()))
            .and_then(|e| e.remote.clone())
        else {
            return Err(LinkError::NotOpen(peer.clone()));
        };
        let tx = state.mesh.events.get(&remote).ok_or_else(|| LinkError::NotOpen(peer.clone()))?;
        tx.send(LinkEvent::new(label, LinkEventKind::Frame(frame)))
            .map_err(|_| LinkError::NotOpen(peer.clone()))
    }

    fn close(&mut self, peer: &PeerId) {
        self.network.lock().mesh.close(self.id, peer);
    }

    fn close_all(&mut self) {
        let mut state = self.network.lock();
        let peers: Vec<PeerId> = state
            .mesh
            .endpoints
            .keys()
            .filter(|(backend, _)| *backend == self.id)
            .map(|(_, peer)| peer.clone())
            .collect();
        for peer in peers {
            state.mesh.close(self.id, &peer);
        }
    }
}

impl Drop for MemoryLinkBackend {
    fn drop(&mut self) {
        self.close_all();
        self.network.lock().mesh.events.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_room_welcome_and_join() {
        let net = MemoryNetwork::new();
        let mut first = net.open_relay("zkv-room".into()).await.unwrap();
        let mut second = net.open_relay("zkv-room".into()).await.unwrap();

        match first.inbound.recv().await {
            Some(RelayFrame::Control(RelayMessage::Welcome { your_id, peers })) => {
                assert_eq!(your_id.as_str(), "peer-0001");
                assert!(peers.is_empty());
            }
            other => panic!("expected welcome, got {other:?}"),
        }
        match second.inbound.recv().await {
            Some(RelayFrame::Control(RelayMessage::Welcome { peers, .. })) => {
                assert_eq!(peers, vec![PeerId::from("peer-0001")]);
            }
            other => panic!("expected welcome, got {other:?}"),
        }
        assert!(matches!(
            first.inbound.recv().await,
            Some(RelayFrame::Control(RelayMessage::PeerJoin { .. }))
        ));

        second.sender.send(RelayFrame::Binary(Bytes::from_static(b"hi"))).unwrap();
        assert_eq!(
            first.inbound.recv().await,
            Some(RelayFrame::Binary(Bytes::from_static(b"hi")))
        );
        assert_eq!(net.room_size("zkv-room"), 2);
        assert_eq!(net.relay_opens(), 2);

        drop(second.sender);
        assert!(matches!(
            first.inbound.recv().await,
            Some(RelayFrame::Control(RelayMessage::PeerLeave { .. }))
        ));
    }

    #[tokio::test]
    async fn test_provider_failure_mode() {
        let net = MemoryNetwork::new().fail_provider_after(2, 1011);
        let mut rx = net.open_keystream(100, 10).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProviderFrame::Binary(_))));
        assert!(matches!(rx.recv().await, Some(ProviderFrame::Binary(_))));
        assert_eq!(rx.recv().await, Some(ProviderFrame::Closed { code: 1011 }));
    }

    #[tokio::test]
    async fn test_memory_link_connects_both_ends() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let mut a = net.link_backend(a_tx);
        let mut b = net.link_backend(b_tx);
        let (pa, pb) = (PeerId::from("a"), PeerId::from("b"));

        let offer = a.create_offer(&pb).unwrap();
        let candidate = match a_rx.recv().await.map(|e| e.kind) {
            Some(LinkEventKind::Candidate(c)) => c,
            other => panic!("expected candidate, got {other:?}"),
        };
        let answer = b.accept_offer(&pa, &offer).unwrap();
        a.accept_answer(&pb, &answer).unwrap();
        b.add_candidate(&pa, &candidate).unwrap();

        assert_eq!(b_rx.recv().await, Some(LinkEvent::new(pa.clone(), LinkEventKind::Open)));
        assert_eq!(a_rx.recv().await, Some(LinkEvent::new(pb.clone(), LinkEventKind::Open)));

        let frame = PeerFrame::chunk(4, Bytes::from_static(b"xyz"));
        a.send(&pb, frame.clone()).unwrap();
        assert_eq!(b_rx.recv().await, Some(LinkEvent::new(pa.clone(), LinkEventKind::Frame(frame))));

        b.close(&pa);
        assert_eq!(a_rx.recv().await, Some(LinkEvent::new(pb.clone(), LinkEventKind::Closed)));
        assert!(matches!(a.send(&pb, PeerFrame::chunk(0, Bytes::new())), Err(LinkError::NotOpen(_))));
    }

    #[tokio::test]
    async fn test_link_open_held_until_relay_traffic() {
        let net = MemoryNetwork::new().with_links_after(2);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let mut a = net.link_backend(a_tx);
        let mut b = net.link_backend(b_tx);
        let (pa, pb) = (PeerId::from("a"), PeerId::from("b"));

        let offer = a.create_offer(&pb).unwrap();
        let candidate = match a_rx.recv().await.map(|e| e.kind) {
            Some(LinkEventKind::Candidate(c)) => c,
            other => panic!("expected candidate, got {other:?}"),
        };
        b.accept_offer(&pa, &offer).unwrap();
        b.add_candidate(&pa, &candidate).unwrap();
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());

        let sender = net.open_relay("zkv-held".into()).await.unwrap();
        let mut listener = net.open_relay("zkv-held".into()).await.unwrap();
        for _ in 0..2 {
            sender.sender.send(RelayFrame::Binary(Bytes::from_static(b"k"))).unwrap();
        }
        // Welcome, then the two frames.
        for _ in 0..3 {
            listener.inbound.recv().await.unwrap();
        }
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap(),
            Some(LinkEvent::new(pa.clone(), LinkEventKind::Open))
        );
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), a_rx.recv()).await.unwrap(),
            Some(LinkEvent::new(pb.clone(), LinkEventKind::Open))
        );
    }
}
