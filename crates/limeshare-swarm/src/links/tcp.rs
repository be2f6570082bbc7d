//! TCP peer links.
//!
//! The offerer binds an ephemeral listener and advertises `ip:port`
//! candidates; the offer itself is a random token. The answerer dials every
//! candidate it learns and presents the token. The listener acks the first
//! connection that presents the right token and stops accepting, so both
//! sides settle on the same stream.
//!
//! Wire format after the handshake: `[len: u32 BE][PeerFrame bytes]`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use limeshare_types::{PeerFrame, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{LinkBackend, LinkError, LinkEvent, LinkEventKind};
use crate::config::SwarmConfig;

/// Largest frame accepted from a peer (a 16 KiB chunk is far below this).
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const HANDSHAKE_OK: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Offerer,
    Answerer,
}

struct Attempt {
    generation: u64,
    side: Side,
    token: Uuid,
    writer: Option<mpsc::Sender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Attempt {
    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Registry {
    attempts: HashMap<PeerId, Attempt>,
    next_generation: u64,
}

#[derive(Clone)]
struct Shared {
    registry: Arc<Mutex<Registry>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    queue: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, peer: &PeerId, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent::new(peer.clone(), kind));
    }

    fn is_current(&self, peer: &PeerId, generation: u64) -> bool {
        self.lock()
            .attempts
            .get(peer)
            .is_some_and(|a| a.generation == generation)
    }

    /// Install `stream` as the link for `peer` unless the attempt moved on
    /// or already has a stream.
    fn attach(&self, peer: &PeerId, generation: u64, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let mut registry = self.lock();
        let Some(attempt) = registry.attempts.get_mut(peer) else {
            return;
        };
        if attempt.generation != generation || attempt.writer.is_some() {
            trace!(%peer, "dropping surplus link stream");
            return;
        }

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(self.queue);
        attempt.writer = Some(tx);
        attempt.tasks.push(tokio::spawn(write_loop(writer, rx)));
        attempt
            .tasks
            .push(tokio::spawn(read_loop(self.clone(), peer.clone(), generation, reader)));
        drop(registry);

        self.emit(peer, LinkEventKind::Open);
    }

    /// The stream for this attempt ended.
    fn lost(&self, peer: &PeerId, generation: u64) {
        let removed = {
            let mut registry = self.lock();
            match registry.attempts.get(peer) {
                Some(a) if a.generation == generation => registry.attempts.remove(peer),
                _ => None,
            }
        };
        if let Some(attempt) = removed {
            attempt.abort();
            self.emit(peer, LinkEventKind::Closed);
        }
    }
}

/// `LinkBackend` over plain TCP.
pub struct TcpLinkBackend {
    shared: Shared,
    bind: IpAddr,
    advertise: Vec<IpAddr>,
}

impl TcpLinkBackend {
    pub fn new(config: &SwarmConfig, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        let advertise = if !config.link_advertise.is_empty() {
            config.link_advertise.clone()
        } else if config.link_bind.is_unspecified() {
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        } else {
            vec![config.link_bind]
        };
        Self {
            shared: Shared {
                registry: Arc::new(Mutex::new(Registry::default())),
                events,
                queue: config.link_queue.max(1),
            },
            bind: config.link_bind,
            advertise,
        }
    }

    fn start(&self, peer: &PeerId, side: Side, token: Uuid) -> u64 {
        let mut registry = self.shared.lock();
        registry.next_generation += 1;
        let generation = registry.next_generation;
        if let Some(old) = registry.attempts.insert(
            peer.clone(),
            Attempt {
                generation,
                side,
                token,
                writer: None,
                tasks: Vec::new(),
            },
        ) {
            old.abort();
        }
        generation
    }

    fn track(&self, peer: &PeerId, generation: u64, task: JoinHandle<()>) {
        let mut registry = self.shared.lock();
        match registry.attempts.get_mut(peer) {
            Some(a) if a.generation == generation => a.tasks.push(task),
            _ => task.abort(),
        }
    }
}

impl LinkBackend for TcpLinkBackend {
    fn create_offer(&mut self, peer: &PeerId) -> Result<String, LinkError> {
        let std_listener = std::net::TcpListener::bind(SocketAddr::new(self.bind, 0))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let port = listener.local_addr()?.port();

        let token = Uuid::new_v4();
        let generation = self.start(peer, Side::Offerer, token);
        let task = tokio::spawn(accept_loop(self.shared.clone(), peer.clone(), generation, token, listener));
        self.track(peer, generation, task);

        for ip in &self.advertise {
            let candidate = SocketAddr::new(*ip, port).to_string();
            self.shared.emit(peer, LinkEventKind::Candidate(candidate));
        }
        debug!(%peer, port, "link listener up");
        Ok(token.to_string())
    }

    fn accept_offer(&mut self, peer: &PeerId, offer: &str) -> Result<String, LinkError> {
        let token = Uuid::parse_str(offer).map_err(|e| LinkError::BadSignal {
            peer: peer.clone(),
            reason: e.to_string(),
        })?;
        self.start(peer, Side::Answerer, token);
        Ok(token.to_string())
    }

    fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), LinkError> {
        let registry = self.shared.lock();
        let attempt = registry
            .attempts
            .get(peer)
            .ok_or_else(|| LinkError::UnknownPeer(peer.clone()))?;
        if Uuid::parse_str(answer).ok() != Some(attempt.token) {
            return Err(LinkError::BadSignal {
                peer: peer.clone(),
                reason: "answer does not match our offer".into(),
            });
        }
        Ok(())
    }

    fn add_candidate(&mut self, peer: &PeerId, candidate: &str) -> Result<(), LinkError> {
        let (generation, token) = {
            let registry = self.shared.lock();
            let attempt = registry
                .attempts
                .get(peer)
                .ok_or_else(|| LinkError::UnknownPeer(peer.clone()))?;
            // Only the answering side dials.
            if attempt.side == Side::Offerer || attempt.writer.is_some() {
                return Ok(());
            }
            (attempt.generation, attempt.token)
        };
        let addr: SocketAddr = candidate.parse().map_err(|_| LinkError::BadSignal {
            peer: peer.clone(),
            reason: format!("bad candidate {candidate:?}"),
        })?;
        let task = tokio::spawn(dial(self.shared.clone(), peer.clone(), generation, token, addr));
        self.track(peer, generation, task);
        Ok(())
    }

    fn send(&mut self, peer: &PeerId, frame: PeerFrame) -> Result<(), LinkError> {
        let registry = self.shared.lock();
        let writer = registry
            .attempts
            .get(peer)
            .and_then(|a| a.writer.as_ref())
            .ok_or_else(|| LinkError::NotOpen(peer.clone()))?;
        writer.try_send(frame.encode()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::Congested(peer.clone()),
            mpsc::error::TrySendError::Closed(_) => LinkError::NotOpen(peer.clone()),
        })
    }

    fn close(&mut self, peer: &PeerId) {
        let removed = self.shared.lock().attempts.remove(peer);
        if let Some(attempt) = removed {
            attempt.abort();
        }
    }

    fn close_all(&mut self) {
        let drained: Vec<Attempt> = self.shared.lock().attempts.drain().map(|(_, a)| a).collect();
        for attempt in drained {
            attempt.abort();
        }
    }
}

impl Drop for TcpLinkBackend {
    fn drop(&mut self) {
        self.close_all();
    }
}

async fn accept_loop(shared: Shared, peer: PeerId, generation: u64, token: Uuid, listener: TcpListener) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%peer, "link accept error: {}", e);
                shared.lost(&peer, generation);
                return;
            }
        };
        let mut presented = [0u8; 16];
        let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut presented)).await;
        if !matches!(read, Ok(Ok(_))) || presented != *token.as_bytes() {
            debug!(%peer, %addr, "rejecting link connection");
            continue;
        }
        if stream.write_all(&[HANDSHAKE_OK]).await.is_err() {
            continue;
        }
        if shared.is_current(&peer, generation) {
            shared.attach(&peer, generation, stream);
        }
        return;
    }
}

async fn dial(shared: Shared, peer: PeerId, generation: u64, token: Uuid, addr: SocketAddr) {
    let connect = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await;
    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(%peer, %addr, "link dial failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer, %addr, "link dial timed out");
            return;
        }
    };
    if stream.write_all(token.as_bytes()).await.is_err() {
        return;
    }
    let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_u8()).await;
    if matches!(ack, Ok(Ok(HANDSHAKE_OK))) {
        shared.attach(&peer, generation, stream);
    } else {
        debug!(%peer, %addr, "link handshake refused");
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if writer.write_u32(frame.len() as u32).await.is_err() || writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(shared: Shared, peer: PeerId, generation: u64, mut reader: OwnedReadHalf) {
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        if len > MAX_FRAME_SIZE {
            warn!(%peer, len, "oversized link frame, dropping link");
            break;
        }
        let mut buf = vec![0u8; len];
        if reader.read_exact(&mut buf).await.is_err() {
            break;
        }
        match PeerFrame::decode(Bytes::from(buf)) {
            Ok(frame) => shared.emit(&peer, LinkEventKind::Frame(frame)),
            Err(e) => warn!(%peer, "bad link frame: {}", e),
        }
    }
    shared.lost(&peer, generation);
}
