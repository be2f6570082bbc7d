use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use limeshare_crypto::{Keystream, KeystreamError, SplitKeyCipher};
use limeshare_types::{PeerId, RelayFrame, RelayMessage, Role, SessionInfo, ShareLink};
use rand::seq::IndexedRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::events::{CompletedTransfer, EventSink, SourceAccounting, TransferEvent, TransferStage};
use super::{announce_in_batches, KeyEnvelope};
use crate::config::SwarmConfig;
use crate::error::TransferError;
use crate::links::{LinkEvent, MeshEvent, PeerLinkManager};
use crate::relay::RelaySender;
use crate::tracker::{ChunkTracker, HaveOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingMetadata,
    AwaitingKeyA,
    AwaitingKeyB,
    Streaming,
    Complete,
}

/// How the next binary relay frame is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayWindow {
    /// Between `file_start` and `key_a_start`: nothing here is a chunk.
    Header,
    /// Chunk ciphertext, index implied by arrival order.
    Chunks,
    KeyA { remaining: u32 },
    KeyB { remaining: u32 },
    /// Key frames of a stream meant for someone else.
    Discard { remaining: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkSource {
    Relay,
    Peer,
}

/// Keystream frames gathered by index, from relay windows or peer envelopes.
#[derive(Debug, Default)]
struct KeyCollector {
    frames: BTreeMap<u32, Bytes>,
    expected: Option<u32>,
    /// Next index for sequential (relay) delivery.
    cursor: u32,
}

impl KeyCollector {
    fn expect(&mut self, count: u32) {
        self.expected = Some(count);
        self.frames.split_off(&count);
    }

    fn insert(&mut self, index: u32, data: Bytes) {
        if self.expected.is_some_and(|n| index >= n) {
            trace!(index, "key frame past the end");
            return;
        }
        self.frames.entry(index).or_insert(data);
    }

    fn restart_window(&mut self) {
        self.cursor = 0;
    }

    fn push_next(&mut self, data: Bytes) {
        let index = self.cursor;
        self.cursor += 1;
        self.insert(index, data);
    }

    fn is_complete(&self) -> bool {
        self.expected.is_some_and(|n| self.frames.len() >= n as usize)
    }

    fn to_keystream(&self) -> Keystream {
        let count = self.expected.unwrap_or(0);
        Keystream::from_frames(
            (0..count)
                .map(|i| self.frames.get(&i).cloned().unwrap_or_default())
                .collect(),
        )
    }
}

pub(super) struct ReceiverSession {
    link: ShareLink,
    cipher: SplitKeyCipher,
    config: SwarmConfig,
    relay: RelaySender,
    links: PeerLinkManager,
    tracker: ChunkTracker,
    events: EventSink,
    completed: Arc<AtomicBool>,

    phase: Phase,
    info: Option<SessionInfo>,
    window: RelayWindow,
    relay_cursor: u32,
    key_a: KeyCollector,
    key_b: KeyCollector,
    keys: Option<(Keystream, Keystream)>,
    /// Relay chunks that arrived before keystream B was complete.
    pending_relay: Vec<(u32, Bytes)>,
    sources: SourceAccounting,
    failed: bool,
}

impl ReceiverSession {
    pub(super) fn new(
        link: ShareLink,
        cipher: SplitKeyCipher,
        config: SwarmConfig,
        relay: RelaySender,
        links: PeerLinkManager,
        events: EventSink,
        completed: Arc<AtomicBool>,
    ) -> Self {
        let tracker = ChunkTracker::with_request_timeout(config.request_timeout);
        Self {
            link,
            cipher,
            config,
            relay,
            links,
            tracker,
            events,
            completed,
            phase: Phase::AwaitingMetadata,
            info: None,
            window: RelayWindow::Header,
            relay_cursor: 0,
            key_a: KeyCollector::default(),
            key_b: KeyCollector::default(),
            keys: None,
            pending_relay: Vec::new(),
            sources: SourceAccounting::default(),
            failed: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut relay_in: mpsc::UnboundedReceiver<RelayFrame>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.failed {
            tokio::select! {
                _ = &mut shutdown => break,
                frame = relay_in.recv() => match frame {
                    Some(frame) => self.on_relay(frame),
                    None => {
                        if self.phase == Phase::Complete {
                            info!(session = %self.link.session_id, "relay closed, seeding stopped");
                        } else {
                            warn!(session = %self.link.session_id, "relay closed mid-transfer");
                            self.events.emit(TransferEvent::Failed(TransferError::RelayClosed));
                        }
                        break;
                    }
                },
                Some(event) = link_events.recv() => self.on_link_event(event),
                _ = sweep.tick() => self.sweep(),
            }
        }

        self.links.disconnect();
        self.tracker.clear();
        info!(session = %self.link.session_id, "receiver session closed");
    }

    fn on_relay(&mut self, frame: RelayFrame) {
        match frame {
            RelayFrame::Control(msg) => self.on_control(msg),
            RelayFrame::Binary(data) => self.on_binary(data),
        }
    }

    fn on_control(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Welcome { your_id, peers } => {
                debug!(session = %self.link.session_id, id = %your_id, peers = peers.len(), "joined relay room");
                self.links.set_local_id(your_id);
                for peer in &peers {
                    self.links.connect_to_peer(peer);
                }
                if peers.is_empty() {
                    info!(session = %self.link.session_id, "nobody is sharing this file right now");
                    self.events.emit(TransferEvent::SenderOffline);
                }
                self.request_file();
            }
            RelayMessage::PeerJoin { peer_id } => {
                self.links.connect_to_peer(&peer_id);
                if self.phase == Phase::AwaitingMetadata {
                    self.request_file();
                }
            }
            RelayMessage::PeerLeave { peer_id } => {
                if self.links.forget(&peer_id) {
                    self.release_requests(&peer_id);
                    self.events.emit(TransferEvent::PeerDisconnected(peer_id));
                }
                self.report_swarm();
            }
            RelayMessage::Signal { from, to, payload } => self.links.handle_signal(&from, &to, payload),
            RelayMessage::FileStart {
                name,
                size,
                total_chunks,
                session,
                chunk_size,
            } => {
                if session != self.link.session_id {
                    trace!(%session, "metadata for another session");
                    return;
                }
                self.on_metadata(name, size, total_chunks, chunk_size);
            }
            RelayMessage::KeyAStart { count } => {
                self.window = if self.phase == Phase::AwaitingKeyA && !self.key_a.is_complete() {
                    self.key_a.restart_window();
                    RelayWindow::KeyA { remaining: count }
                } else {
                    RelayWindow::Discard { remaining: count }
                };
                self.close_empty_window();
            }
            RelayMessage::KeyBStart { count } => {
                let wanted = matches!(self.phase, Phase::AwaitingKeyA | Phase::AwaitingKeyB) && !self.key_b.is_complete();
                self.window = if wanted && self.info.is_some() {
                    self.key_b.restart_window();
                    RelayWindow::KeyB { remaining: count }
                } else {
                    RelayWindow::Discard { remaining: count }
                };
                self.close_empty_window();
            }
            RelayMessage::FileEnd { session } => {
                trace!(%session, "relay stream ended");
            }
            RelayMessage::FileRequest { .. } => {}
        }
    }

    fn on_metadata(&mut self, name: String, size: u64, total_chunks: u32, chunk_size: usize) {
        if self.phase != Phase::AwaitingMetadata {
            // Another receiver's stream: chunks restart at zero.
            self.relay_cursor = 0;
            self.window = RelayWindow::Header;
            return;
        }
        if chunk_size != self.config.chunk_size {
            warn!(session = %self.link.session_id, chunk_size, "metadata with a foreign chunk size ignored");
            return;
        }
        if size == 0 || total_chunks > self.config.max_chunks {
            warn!(session = %self.link.session_id, size, total_chunks, "metadata out of bounds ignored");
            return;
        }
        let Some(info) = SessionInfo::new(self.link.session_id.clone(), name, size, chunk_size, Role::Receiver)
            .filter(|info| info.total_chunks == total_chunks)
        else {
            warn!(session = %self.link.session_id, size, total_chunks, "inconsistent file metadata ignored");
            return;
        };
        if info.name != self.link.file_name {
            debug!(link_name = %self.link.file_name, name = %info.name, "file name differs from link");
        }

        info!(session = %info.id, name = %info.name, size, chunks = total_chunks, "metadata received");
        self.tracker.init(total_chunks);
        self.key_a.expect(total_chunks);
        self.key_b.expect(total_chunks);
        self.relay_cursor = 0;
        self.window = RelayWindow::Header;
        self.info = Some(info);
        self.phase = Phase::AwaitingKeyA;
        self.events.progress(TransferStage::Keys, 0.0, self.sources);
    }

    fn on_binary(&mut self, data: Bytes) {
        match self.window {
            RelayWindow::KeyA { remaining } => {
                self.key_a.push_next(data);
                self.window = RelayWindow::KeyA { remaining: remaining - 1 };
                self.close_empty_window();
                self.advance_keys();
            }
            RelayWindow::KeyB { remaining } => {
                self.key_b.push_next(data);
                self.window = RelayWindow::KeyB { remaining: remaining - 1 };
                self.close_empty_window();
                self.advance_keys();
            }
            RelayWindow::Discard { remaining } => {
                self.window = RelayWindow::Discard { remaining: remaining - 1 };
                self.close_empty_window();
            }
            RelayWindow::Header => trace!("binary frame before key_a_start, dropped"),
            RelayWindow::Chunks => {
                let index = self.relay_cursor;
                self.relay_cursor += 1;
                match self.phase {
                    Phase::Streaming | Phase::Complete => self.handle_chunk(index, data, ChunkSource::Relay),
                    Phase::AwaitingKeyA | Phase::AwaitingKeyB => self.pending_relay.push((index, data)),
                    Phase::AwaitingMetadata => trace!(index, "chunk before metadata, dropped"),
                }
            }
        }
    }

    fn close_empty_window(&mut self) {
        let empty = match self.window {
            RelayWindow::KeyA { remaining } | RelayWindow::KeyB { remaining } | RelayWindow::Discard { remaining } => {
                remaining == 0
            }
            RelayWindow::Header | RelayWindow::Chunks => false,
        };
        if empty {
            self.window = RelayWindow::Chunks;
        }
    }

    /// Move through the key phases as collectors fill up.
    fn advance_keys(&mut self) {
        if self.phase == Phase::AwaitingKeyA && self.key_a.is_complete() {
            debug!(session = %self.link.session_id, "keystream A complete");
            self.phase = Phase::AwaitingKeyB;
        }
        if self.phase == Phase::AwaitingKeyB && self.key_b.is_complete() {
            self.finish_keys();
        }
    }

    fn finish_keys(&mut self) {
        let Some(info) = self.info.as_ref() else {
            return;
        };
        let key_a = self.key_a.to_keystream();
        let key_b = self.key_b.to_keystream();
        let checked: Result<(), KeystreamError> = key_a
            .validate(info.total_size, info.chunk_size)
            .and_then(|()| key_b.validate(info.total_size, info.chunk_size));
        if let Err(e) = checked {
            warn!(session = %info.id, "unusable keystream: {}", e);
            self.events.emit(TransferEvent::Failed(TransferError::KeyAcquisition(e)));
            self.failed = true;
            return;
        }

        debug!(session = %info.id, "keys complete, decrypting");
        self.keys = Some((key_a, key_b));
        self.key_a = KeyCollector::default();
        self.key_b = KeyCollector::default();
        self.phase = Phase::Streaming;
        self.events.progress(TransferStage::Transferring, self.tracker.get_progress(), self.sources);

        for (index, data) in std::mem::take(&mut self.pending_relay) {
            self.handle_chunk(index, data, ChunkSource::Relay);
        }
        self.request_needed();
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
                self.release_requests(&peer);
                self.events.emit(TransferEvent::PeerDisconnected(peer));
                self.report_swarm();
            }
            MeshEvent::HaveChunks { .. } => {
                self.report_swarm();
                self.request_needed();
            }
            MeshEvent::WantChunk { peer, index } => self.serve(&peer, index),
            MeshEvent::Chunk { peer, index, data } => {
                if matches!(self.phase, Phase::Streaming | Phase::Complete) {
                    self.handle_chunk(index, data, ChunkSource::Peer);
                } else {
                    trace!(%peer, index, "peer chunk before keys, dropped");
                }
            }
            MeshEvent::Envelope { peer, value } => self.on_envelope(&peer, value),
        }
    }

    fn on_envelope(&mut self, peer: &PeerId, value: serde_json::Value) {
        let envelope = match serde_json::from_value::<KeyEnvelope>(value) {
            Ok(envelope) => envelope,
            Err(_) => {
                debug!(%peer, "unknown envelope ignored");
                return;
            }
        };
        if self.keys.is_some() {
            return;
        }
        match envelope {
            KeyEnvelope::Start { count } => {
                debug!(%peer, count, "keystream B arriving over peer link");
            }
            KeyEnvelope::Chunk { index, data } => {
                // May arrive before the relay delivers the metadata.
                if index >= self.config.max_chunks {
                    debug!(%peer, index, "key frame beyond any acceptable file");
                    return;
                }
                match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
                    Ok(bytes) if bytes.len() > self.config.chunk_size => {
                        debug!(%peer, index, len = bytes.len(), "oversized key frame");
                        return;
                    }
                    Ok(bytes) => self.key_b.insert(index, Bytes::from(bytes)),
                    Err(e) => {
                        warn!(%peer, index, "undecodable key frame: {}", e);
                        return;
                    }
                }
                self.advance_keys();
            }
        }
    }

    /// Decrypt and record one chunk. Duplicates are dropped before any work.
    fn handle_chunk(&mut self, index: u32, ciphertext: Bytes, source: ChunkSource) {
        let (Some(info), Some((key_a, key_b))) = (self.info.as_ref(), self.keys.as_ref()) else {
            return;
        };
        if index >= info.total_chunks {
            trace!(index, ?source, "chunk index out of range");
            return;
        }
        if self.tracker.has_chunk(index) {
            trace!(index, ?source, "redundant chunk");
            self.sources.redundant += 1;
            return;
        }
        if ciphertext.len() != info.chunk_len(index) {
            warn!(index, got = ciphertext.len(), expected = info.chunk_len(index), "chunk has the wrong length");
            return;
        }

        let plain = self.cipher.combine(&ciphertext, key_a.frame(index), key_b.frame(index));
        if self.tracker.mark_have(index, Bytes::from(plain)) != HaveOutcome::Stored {
            return;
        }
        match source {
            ChunkSource::Relay => self.sources.relay += 1,
            ChunkSource::Peer => self.sources.peer += 1,
        }
        self.links.announce_chunks(&[index]);

        if self.tracker.is_complete() {
            self.finish();
        } else {
            self.events.progress(TransferStage::Transferring, self.tracker.get_progress(), self.sources);
            self.request_needed();
        }
    }

    /// Ask ready peers for needed chunks, rarest first, up to the batch cap.
    fn request_needed(&mut self) {
        if self.phase != Phase::Streaming {
            return;
        }
        let budget = self
            .config
            .request_batch
            .saturating_sub(self.tracker.live_request_count());
        if budget == 0 {
            return;
        }
        let availability = self.links.peer_availability();
        if availability.is_empty() {
            return;
        }

        let picks = self.tracker.get_rarest_chunks(&availability, budget);
        let mut rng = rand::rng();
        for index in picks {
            let holders = self.links.peers_with_chunk(index);
            let Some(peer) = holders.choose(&mut rng) else {
                continue;
            };
            match self.links.request_chunk(peer, index) {
                Ok(()) => self.tracker.mark_requested(index, peer),
                Err(e) => debug!(%peer, index, "request failed: {}", e),
            }
        }
    }

    /// Re-ask other holders for whatever a departed peer still owed us.
    fn release_requests(&mut self, peer: &PeerId) {
        let released = self.tracker.cancel_requests_to(peer);
        if !released.is_empty() {
            debug!(%peer, count = released.len(), "releasing requests to departed peer");
            self.request_needed();
        }
    }

    fn sweep(&mut self) {
        if self.phase != Phase::Streaming {
            return;
        }
        let expired = self.tracker.cancel_timed_out_requests();
        if !expired.is_empty() {
            debug!(session = %self.link.session_id, count = expired.len(), "requests timed out, rescheduling");
        }
        self.request_needed();
    }

    /// Serve a held chunk to a peer, re-encrypted.
    fn serve(&mut self, peer: &PeerId, index: u32) {
        let Some((key_a, key_b)) = self.keys.as_ref() else {
            return;
        };
        let Some(plain) = self.tracker.get_chunk(index) else {
            return;
        };
        let cipher = self.cipher.combine(&plain, key_a.frame(index), key_b.frame(index));
        if let Err(e) = self.links.send_chunk(peer, index, Bytes::from(cipher)) {
            debug!(%peer, index, "could not serve chunk: {}", e);
        }
    }

    fn finish(&mut self) {
        let data = match self.tracker.assemble_data() {
            Ok(data) => data,
            Err(e) => {
                self.events.emit(TransferEvent::Failed(e.into()));
                self.failed = true;
                return;
            }
        };
        let name = self
            .info
            .as_ref()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| self.link.file_name.clone());
        info!(
            session = %self.link.session_id,
            bytes = data.len(),
            relay = self.sources.relay,
            peer = self.sources.peer,
            "transfer complete"
        );

        self.phase = Phase::Complete;
        self.completed.store(true, Ordering::Release);
        self.events.progress(TransferStage::Complete, 100.0, self.sources);
        self.events.emit(TransferEvent::Completed(CompletedTransfer {
            name,
            data,
            sources: self.sources,
        }));

        let have = self.tracker.have_list();
        for peer in self.links.get_connected_peers() {
            if let Err(e) = announce_in_batches(&mut self.links, &peer, &have, self.config.announce_batch) {
                debug!(%peer, "seed announce failed: {}", e);
            }
        }
    }

    fn request_file(&mut self) {
        let msg = RelayMessage::FileRequest {
            session: self.link.session_id.clone(),
            from: self.links.local_id().cloned(),
        };
        if self.relay.send_control(msg).is_err() {
            debug!(session = %self.link.session_id, "relay gone, file request dropped");
        }
    }

    fn report_swarm(&mut self) {
        let total = self.info.as_ref().map(|i| i.total_chunks).unwrap_or(0);
        let availability = self.links.peer_availability();
        self.events.swarm(&availability, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_collector_merges_sources() {
        let mut keys = KeyCollector::default();
        // Peer frames may arrive before the count is known.
        keys.insert(2, Bytes::from_static(b"cc"));
        keys.insert(5, Bytes::from_static(b"zz"));
        assert!(!keys.is_complete());

        keys.expect(3);
        keys.restart_window();
        keys.push_next(Bytes::from_static(b"aa"));
        assert!(!keys.is_complete());
        keys.push_next(Bytes::from_static(b"bb"));
        assert!(keys.is_complete());

        // A late relay frame does not replace one already held.
        keys.push_next(Bytes::from_static(b"XX"));
        let stream = keys.to_keystream();
        assert_eq!(stream.frames().len(), 3);
        assert_eq!(stream.frame(0), b"aa");
        assert_eq!(stream.frame(2), b"cc");
    }

    #[test]
    fn test_key_collector_ignores_out_of_range() {
        let mut keys = KeyCollector::default();
        keys.expect(1);
        keys.insert(1, Bytes::from_static(b"x"));
        assert!(!keys.is_complete());
        keys.insert(0, Bytes::from_static(b"y"));
        keys.insert(0, Bytes::from_static(b"z"));
        assert!(keys.is_complete());
        assert_eq!(keys.to_keystream().frame(0), b"y");
    }
}
