use std::time::Duration;

use bytes::Bytes;
use limeshare_crypto::{Keystream, SplitKeyCipher};
use limeshare_types::{PeerId, RelayFrame, RelayMessage, SessionInfo};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::events::{EventSink, SourceAccounting, TransferEvent, TransferStage};
use super::{announce_in_batches, key_chunk_envelope, key_start_envelope};
use crate::config::SwarmConfig;
use crate::error::TransferError;
use crate::links::{LinkError, LinkEvent, MeshEvent, PeerLinkManager};
use crate::relay::RelaySender;
use crate::tracker::ChunkTracker;

/// Path keystream B takes for one stream. Chosen once, when the B stage starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyRoute {
    Peer(PeerId),
    Relay,
}

#[derive(Debug)]
enum StreamStage {
    Metadata,
    KeyA { next: u32 },
    KeyB { route: KeyRoute, next: u32 },
    Chunks { next: u32 },
    End,
}

/// One pass of metadata, keys and chunks for whoever asked.
#[derive(Debug)]
struct StreamJob {
    stage: StreamStage,
    /// Distinct receivers this pass answers. `None` is one whose relay id
    /// was not known yet.
    requesters: Vec<Option<PeerId>>,
    unannounced: Vec<u32>,
}

impl StreamJob {
    fn new(requesters: Vec<Option<PeerId>>) -> Self {
        Self {
            stage: StreamStage::Metadata,
            requesters,
            unannounced: Vec::new(),
        }
    }
}

/// Result of one streaming step.
enum Step {
    Continue,
    /// Outbound capacity exhausted; try again after a pause.
    Stalled,
    Finished,
}

pub(super) struct HostSession {
    info: SessionInfo,
    data: Bytes,
    key_a: Keystream,
    key_b: Keystream,
    cipher: SplitKeyCipher,
    config: SwarmConfig,
    relay: RelaySender,
    links: PeerLinkManager,
    tracker: ChunkTracker,
    events: EventSink,
    job: Option<StreamJob>,
    /// Requests that arrived mid-stream, answered together by one more pass.
    restream: Vec<Option<PeerId>>,
    stalled: bool,
}

impl HostSession {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        info: SessionInfo,
        data: Bytes,
        key_a: Keystream,
        key_b: Keystream,
        cipher: SplitKeyCipher,
        config: SwarmConfig,
        relay: RelaySender,
        links: PeerLinkManager,
        events: EventSink,
    ) -> Self {
        let mut tracker = ChunkTracker::with_request_timeout(config.request_timeout);
        tracker.init(info.total_chunks);
        Self {
            info,
            data,
            key_a,
            key_b,
            cipher,
            config,
            relay,
            links,
            tracker,
            events,
            job: None,
            restream: Vec::new(),
            stalled: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut relay_in: mpsc::UnboundedReceiver<RelayFrame>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        self.events.progress(TransferStage::Seeding, 0.0, SourceAccounting::default());

        loop {
            let streaming = self.job.is_some();
            let throttled = self.stalled || self.relay.buffered_amount() > self.config.relay_high_water;
            let poll = self.config.backpressure_poll;

            tokio::select! {
                _ = &mut shutdown => break,
                frame = relay_in.recv() => match frame {
                    Some(frame) => self.on_relay(frame),
                    None => {
                        warn!(session = %self.info.id, "relay closed");
                        self.events.emit(TransferEvent::Failed(TransferError::RelayClosed));
                        break;
                    }
                },
                Some(event) = link_events.recv() => self.on_link_event(event),
                _ = stream_turn(throttled, poll), if streaming => {
                    self.stalled = false;
                    if !throttled {
                        self.pump();
                    }
                }
            }
        }

        self.links.disconnect();
        self.tracker.clear();
        info!(session = %self.info.id, "host session closed");
    }

    fn on_relay(&mut self, frame: RelayFrame) {
        let msg = match frame {
            RelayFrame::Control(msg) => msg,
            RelayFrame::Binary(_) => return,
        };
        match msg {
            RelayMessage::Welcome { your_id, peers } => {
                debug!(session = %self.info.id, id = %your_id, peers = peers.len(), "joined relay room");
                self.links.set_local_id(your_id);
            }
            RelayMessage::PeerJoin { peer_id } => {
                debug!(session = %self.info.id, peer = %peer_id, "peer joined");
                self.links.connect_to_peer(&peer_id);
            }
            RelayMessage::PeerLeave { peer_id } => {
                if self.links.forget(&peer_id) {
                    self.events.emit(TransferEvent::PeerDisconnected(peer_id));
                }
                self.report_swarm();
            }
            RelayMessage::Signal { from, to, payload } => self.links.handle_signal(&from, &to, payload),
            RelayMessage::FileRequest { session, from } => {
                if session != self.info.id {
                    trace!(%session, "request for another session");
                    return;
                }
                if self.job.is_some() {
                    if !self.restream.contains(&from) {
                        debug!(session = %self.info.id, requester = ?from, "stream in flight, queueing requester");
                        self.restream.push(from);
                    }
                } else {
                    info!(session = %self.info.id, requester = ?from, "streaming file");
                    self.job = Some(StreamJob::new(vec![from]));
                }
            }
            other => trace!(?other, "ignoring relay frame"),
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let Some(mesh) = self.links.handle_link_event(event) else {
            return;
        };
        match mesh {
            MeshEvent::PeerReady(peer) => {
                self.events.emit(TransferEvent::PeerConnected(peer.clone()));
                let have = self.tracker.have_list();
                if let Err(e) = announce_in_batches(&mut self.links, &peer, &have, self.config.announce_batch) {
                    debug!(%peer, "initial announce failed: {}", e);
                }
                self.report_swarm();
            }
            MeshEvent::PeerDisconnected(peer) => {
                self.events.emit(TransferEvent::PeerDisconnected(peer));
                self.report_swarm();
            }
            MeshEvent::HaveChunks { .. } => self.report_swarm(),
            MeshEvent::WantChunk { peer, index } => self.serve(&peer, index),
            MeshEvent::Chunk { peer, index, .. } => trace!(%peer, index, "host ignores chunk"),
            MeshEvent::Envelope { peer, .. } => trace!(%peer, "host ignores envelope"),
        }
    }

    /// Send a held chunk to a peer, re-encrypted so only ciphertext crosses the link.
    fn serve(&mut self, peer: &PeerId, index: u32) {
        let Some(plain) = self.tracker.get_chunk(index) else {
            trace!(%peer, index, "asked for a chunk not streamed yet");
            return;
        };
        let cipher = self.cipher.combine(&plain, self.key_a.frame(index), self.key_b.frame(index));
        if let Err(e) = self.links.send_chunk(peer, index, Bytes::from(cipher)) {
            debug!(%peer, index, "could not serve chunk: {}", e);
        }
    }

    fn report_swarm(&mut self) {
        let availability = self.links.peer_availability();
        self.events.swarm(&availability, self.info.total_chunks);
    }

    /// Stream up to `yield_every` frames, stopping early on backpressure.
    fn pump(&mut self) {
        for _ in 0..self.config.yield_every.max(1) {
            if self.relay.buffered_amount() > self.config.relay_high_water {
                return;
            }
            let Some(mut job) = self.job.take() else {
                return;
            };
            match self.step(&mut job) {
                Ok(Step::Continue) => self.job = Some(job),
                Ok(Step::Stalled) => {
                    self.stalled = true;
                    self.job = Some(job);
                    return;
                }
                Ok(Step::Finished) => {
                    info!(session = %self.info.id, "stream finished");
                    self.events.progress(TransferStage::Seeding, 100.0, SourceAccounting::default());
                    if !self.restream.is_empty() {
                        let requesters = std::mem::take(&mut self.restream);
                        info!(session = %self.info.id, count = requesters.len(), "restreaming for late requests");
                        self.job = Some(StreamJob::new(requesters));
                    }
                    return;
                }
                Err(e) => {
                    // Only a closed relay fails a step; the select loop sees it next.
                    debug!(session = %self.info.id, "stream aborted: {}", e);
                    return;
                }
            }
        }
    }

    fn step(&mut self, job: &mut StreamJob) -> Result<Step, TransferError> {
        let total = self.info.total_chunks;
        match &mut job.stage {
            StreamStage::Metadata => {
                self.relay.send_control(RelayMessage::FileStart {
                    name: self.info.name.clone(),
                    size: self.info.total_size,
                    total_chunks: total,
                    session: self.info.id.clone(),
                    chunk_size: self.info.chunk_size,
                })?;
                self.relay.send_control(RelayMessage::KeyAStart { count: total })?;
                job.stage = StreamStage::KeyA { next: 0 };
            }
            StreamStage::KeyA { next } => {
                if *next < total {
                    let frame = self.key_a.frames().get(*next as usize).cloned().unwrap_or_default();
                    self.relay.send(RelayFrame::Binary(frame))?;
                    *next += 1;
                } else {
                    let route = self.choose_key_route(&job.requesters);
                    let route = self.start_key_b(route)?;
                    job.stage = StreamStage::KeyB { route, next: 0 };
                }
            }
            StreamStage::KeyB { route, next } => {
                if *next >= total {
                    job.stage = StreamStage::Chunks { next: 0 };
                    self.events.progress(TransferStage::Transferring, 0.0, SourceAccounting::default());
                    return Ok(Step::Continue);
                }
                match route {
                    KeyRoute::Relay => {
                        let frame = self.key_b.frames().get(*next as usize).cloned().unwrap_or_default();
                        self.relay.send(RelayFrame::Binary(frame))?;
                        *next += 1;
                    }
                    KeyRoute::Peer(peer) => {
                        let envelope = key_chunk_envelope(*next, self.key_b.frame(*next));
                        match self.links.send_control(peer, envelope) {
                            Ok(()) => *next += 1,
                            Err(LinkError::Congested(_)) => return Ok(Step::Stalled),
                            Err(e) => {
                                warn!(%peer, "keystream B link lost ({}), resending over relay", e);
                                *route = self.start_key_b(KeyRoute::Relay)?;
                                *next = 0;
                            }
                        }
                    }
                }
            }
            StreamStage::Chunks { next } => {
                if *next >= total {
                    self.flush_announcements(job);
                    self.relay.send_control(RelayMessage::FileEnd {
                        session: self.info.id.clone(),
                    })?;
                    job.stage = StreamStage::End;
                    return Ok(Step::Continue);
                }
                let index = *next;
                let plain = self.data.slice(self.info.chunk_range(index));
                let cipher = self.cipher.combine(&plain, self.key_a.frame(index), self.key_b.frame(index));
                self.relay.send(RelayFrame::Binary(Bytes::from(cipher)))?;
                *next += 1;

                self.tracker.mark_have(index, plain);
                job.unannounced.push(index);
                if job.unannounced.len() >= self.config.announce_every.max(1) as usize {
                    self.flush_announcements(job);
                }
                let percent = f64::from(index + 1) / f64::from(total) * 100.0;
                self.events.progress(TransferStage::Transferring, percent, SourceAccounting::default());
            }
            StreamStage::End => return Ok(Step::Finished),
        }
        Ok(Step::Continue)
    }

    /// A direct link only serves a pass with exactly one known requester.
    /// Anyone else who picked up this pass's metadata needs keystream B on
    /// the relay.
    fn choose_key_route(&self, requesters: &[Option<PeerId>]) -> KeyRoute {
        match requesters {
            [Some(peer)] if self.links.is_ready(peer) => KeyRoute::Peer(peer.clone()),
            _ => KeyRoute::Relay,
        }
    }

    /// Announce keystream B on `route`, falling back to the relay if the
    /// link refuses. Returns the route actually taken.
    fn start_key_b(&mut self, route: KeyRoute) -> Result<KeyRoute, TransferError> {
        let count = self.info.total_chunks;
        if let KeyRoute::Peer(peer) = &route {
            match self.links.send_control(peer, key_start_envelope(count)) {
                Ok(()) => {
                    debug!(%peer, "keystream B over peer link");
                    return Ok(route);
                }
                Err(e) => warn!(%peer, "peer route for keystream B unusable ({}), using relay", e),
            }
        }
        self.relay.send_control(RelayMessage::KeyBStart { count })?;
        Ok(KeyRoute::Relay)
    }

    fn flush_announcements(&mut self, job: &mut StreamJob) {
        if job.unannounced.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut job.unannounced);
        self.links.announce_chunks(&batch);
    }
}

/// Resolves when the stream may take its next turn: right away (after a
/// yield) or after a pause while outbound capacity is exhausted.
async fn stream_turn(throttled: bool, poll: Duration) {
    if throttled {
        tokio::time::sleep(poll).await;
    } else {
        tokio::task::yield_now().await;
    }
}
