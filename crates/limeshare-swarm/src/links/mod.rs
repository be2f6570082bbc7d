//! Direct peer links for one session.
//!
//! The manager owns the per-peer handshake state machine and the
//! announced-chunk registry. The actual connection primitive sits behind
//! `LinkBackend`; its asynchronous happenings come back as `LinkEvent`s on
//! a channel the session task polls, and `handle_link_event` turns them
//! into `MeshEvent`s for the orchestrator.
//!
//! Handshake material travels through the relay as addressed `signal`
//! frames. The relay broadcasts, so frames for other peers are dropped here.

pub mod tcp;

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use limeshare_types::{PeerControl, PeerFrame, PeerId, RelayMessage, SignalPayload};
use tracing::{debug, info, trace, warn};

use crate::relay::RelaySender;

pub use tcp::TcpLinkBackend;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no link attempt for peer {0}")]
    UnknownPeer(PeerId),
    #[error("link to {0} is not open")]
    NotOpen(PeerId),
    #[error("outbound queue to {0} is full")]
    Congested(PeerId),
    #[error("unusable signal from {peer}: {reason}")]
    BadSignal { peer: PeerId, reason: String },
    #[error("link setup failed: {0}")]
    Setup(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    /// Connectivity candidate to forward to the remote side.
    Candidate(String),
    /// The reliable channel is up.
    Open,
    Frame(PeerFrame),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub peer: PeerId,
    pub kind: LinkEventKind,
}

impl LinkEvent {
    pub fn new(peer: PeerId, kind: LinkEventKind) -> Self {
        Self { peer, kind }
    }
}

/// Connection primitive used by `PeerLinkManager`.
///
/// Calls return immediately; progress is reported through the event
/// channel the backend was created with. `close` and `close_all` do not
/// report `Closed` for the links they tear down.
pub trait LinkBackend: Send {
    /// Start an outbound attempt and return the offer description.
    fn create_offer(&mut self, peer: &PeerId) -> Result<String, LinkError>;
    /// Apply a remote offer and return the answer description.
    fn accept_offer(&mut self, peer: &PeerId, offer: &str) -> Result<String, LinkError>;
    fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), LinkError>;
    fn add_candidate(&mut self, peer: &PeerId, candidate: &str) -> Result<(), LinkError>;
    fn send(&mut self, peer: &PeerId, frame: PeerFrame) -> Result<(), LinkError>;
    fn close(&mut self, peer: &PeerId);
    fn close_all(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    New,
    Offering,
    Answering,
    Connected,
}

#[derive(Debug)]
struct PeerLink {
    phase: LinkPhase,
    chunks: HashSet<u32>,
    remote_described: bool,
    /// Candidates that arrived before the remote description, in arrival order.
    pending_candidates: Vec<String>,
}

impl PeerLink {
    fn new(phase: LinkPhase) -> Self {
        Self {
            phase,
            chunks: HashSet::new(),
            remote_described: false,
            pending_candidates: Vec::new(),
        }
    }

    fn is_ready(&self) -> bool {
        self.phase == LinkPhase::Connected
    }
}

/// What a link event means to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerReady(PeerId),
    PeerDisconnected(PeerId),
    HaveChunks { peer: PeerId, chunks: Vec<u32> },
    WantChunk { peer: PeerId, index: u32 },
    Chunk { peer: PeerId, index: u32, data: Bytes },
    Envelope { peer: PeerId, value: serde_json::Value },
}

/// Most candidates kept for a peer we have no link attempt with.
const MAX_ORPHAN_CANDIDATES: usize = 16;

pub struct PeerLinkManager {
    local_id: Option<PeerId>,
    backend: Box<dyn LinkBackend>,
    signals: RelaySender,
    links: HashMap<PeerId, PeerLink>,
    /// Candidates from peers with no link entry, kept for a later offer.
    orphan_candidates: HashMap<PeerId, Vec<String>>,
}

impl PeerLinkManager {
    pub fn new(backend: Box<dyn LinkBackend>, signals: RelaySender) -> Self {
        Self {
            local_id: None,
            backend,
            signals,
            links: HashMap::new(),
            orphan_candidates: HashMap::new(),
        }
    }

    /// Relay-assigned identity; signaling is impossible before it is known.
    pub fn set_local_id(&mut self, id: PeerId) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    /// Offer a link to `peer`. No-op for ourselves and for peers we already
    /// track in any phase.
    pub fn connect_to_peer(&mut self, peer: &PeerId) {
        let Some(local) = self.local_id.clone() else {
            debug!(%peer, "no local id yet, not connecting");
            return;
        };
        if *peer == local || self.links.contains_key(peer) {
            return;
        }
        match self.backend.create_offer(peer) {
            Ok(sdp) => {
                debug!(%peer, "offering link");
                self.links.insert(peer.clone(), PeerLink::new(LinkPhase::Offering));
                self.signal(peer, SignalPayload::Offer { sdp });
            }
            Err(e) => warn!(%peer, "could not create offer: {}", e),
        }
    }

    /// Apply a relay `signal` frame.
    pub fn handle_signal(&mut self, from: &PeerId, to: &PeerId, payload: SignalPayload) {
        let Some(local) = self.local_id.as_ref() else {
            return;
        };
        if to != local || from == local {
            trace!(%from, %to, "signal not for us");
            return;
        }
        let local_is_lower = local < from;

        match payload {
            SignalPayload::Offer { sdp } => {
                let phase = self.links.get(from).map(|l| l.phase).unwrap_or(LinkPhase::New);
                match phase {
                    LinkPhase::New => self.answer(from, &sdp),
                    LinkPhase::Offering if local_is_lower => {
                        debug!(peer = %from, "crossing offers, yielding to remote offer");
                        self.backend.close(from);
                        self.answer(from, &sdp);
                    }
                    LinkPhase::Offering => {
                        debug!(peer = %from, "crossing offers, keeping our own");
                    }
                    LinkPhase::Answering | LinkPhase::Connected => {
                        debug!(peer = %from, ?phase, "ignoring offer on a busy link");
                    }
                }
            }
            SignalPayload::Answer { sdp } => {
                let Some(link) = self.links.get_mut(from) else {
                    debug!(peer = %from, "answer for unknown link");
                    return;
                };
                if link.phase != LinkPhase::Offering || link.remote_described {
                    debug!(peer = %from, phase = ?link.phase, "stray answer");
                    return;
                }
                match self.backend.accept_answer(from, &sdp) {
                    Ok(()) => {
                        link.remote_described = true;
                        self.flush_candidates(from);
                    }
                    Err(e) => {
                        warn!(peer = %from, "rejecting answer: {}", e);
                        self.backend.close(from);
                        self.links.remove(from);
                    }
                }
            }
            SignalPayload::Candidate { candidate } => {
                let Some(link) = self.links.get_mut(from) else {
                    let orphans = self.orphan_candidates.entry(from.clone()).or_default();
                    if orphans.len() < MAX_ORPHAN_CANDIDATES {
                        orphans.push(candidate);
                    }
                    return;
                };
                if link.remote_described {
                    if let Err(e) = self.backend.add_candidate(from, &candidate) {
                        debug!(peer = %from, "candidate rejected: {}", e);
                    }
                } else {
                    link.pending_candidates.push(candidate);
                }
            }
        }
    }

    /// Digest one backend event.
    pub fn handle_link_event(&mut self, event: LinkEvent) -> Option<MeshEvent> {
        let LinkEvent { peer, kind } = event;
        match kind {
            LinkEventKind::Candidate(candidate) => {
                if self.links.contains_key(&peer) {
                    self.signal(&peer, SignalPayload::Candidate { candidate });
                }
                None
            }
            LinkEventKind::Open => {
                let Some(link) = self.links.get_mut(&peer) else {
                    debug!(%peer, "link opened after it was dropped");
                    self.backend.close(&peer);
                    return None;
                };
                if link.is_ready() {
                    return None;
                }
                link.phase = LinkPhase::Connected;
                info!(%peer, "peer link ready");
                Some(MeshEvent::PeerReady(peer))
            }
            LinkEventKind::Closed => {
                let link = self.links.remove(&peer)?;
                if link.is_ready() {
                    info!(%peer, "peer link closed");
                    Some(MeshEvent::PeerDisconnected(peer))
                } else {
                    debug!(%peer, phase = ?link.phase, "link attempt failed");
                    None
                }
            }
            LinkEventKind::Frame(frame) => {
                let link = self.links.get_mut(&peer).filter(|l| l.is_ready())?;
                Some(match frame {
                    PeerFrame::Control(PeerControl::HaveChunks { chunks }) => {
                        link.chunks.extend(chunks.iter().copied());
                        MeshEvent::HaveChunks { peer, chunks }
                    }
                    PeerFrame::Control(PeerControl::WantChunk { chunk }) => MeshEvent::WantChunk { peer, index: chunk },
                    PeerFrame::Chunk { index, data } => MeshEvent::Chunk { peer, index, data },
                    PeerFrame::Envelope(value) => MeshEvent::Envelope { peer, value },
                })
            }
        }
    }

    /// Broadcast availability to every ready peer.
    pub fn announce_chunks(&mut self, chunks: &[u32]) {
        if chunks.is_empty() {
            return;
        }
        for peer in self.get_connected_peers() {
            if let Err(e) = self.announce_to(&peer, chunks) {
                debug!(%peer, "announce failed: {}", e);
            }
        }
    }

    pub fn announce_to(&mut self, peer: &PeerId, chunks: &[u32]) -> Result<(), LinkError> {
        self.send_frame(
            peer,
            PeerFrame::Control(PeerControl::HaveChunks {
                chunks: chunks.to_vec(),
            }),
        )
    }

    pub fn request_chunk(&mut self, peer: &PeerId, index: u32) -> Result<(), LinkError> {
        self.send_frame(peer, PeerFrame::Control(PeerControl::WantChunk { chunk: index }))
    }

    pub fn send_chunk(&mut self, peer: &PeerId, index: u32, data: Bytes) -> Result<(), LinkError> {
        self.send_frame(peer, PeerFrame::chunk(index, data))
    }

    /// Send an orchestrator-defined JSON envelope.
    pub fn send_control(&mut self, peer: &PeerId, value: serde_json::Value) -> Result<(), LinkError> {
        self.send_frame(peer, PeerFrame::Envelope(value))
    }

    /// Ready peers, sorted.
    pub fn get_connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, l)| l.is_ready())
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Ready peers that announced `index`, sorted.
    pub fn peers_with_chunk(&self, index: u32) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, l)| l.is_ready() && l.chunks.contains(&index))
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn get_peer_chunks(&self, peer: &PeerId) -> Option<&HashSet<u32>> {
        self.links.get(peer).map(|l| &l.chunks)
    }

    /// Announced chunk sets of every ready peer.
    pub fn peer_availability(&self) -> HashMap<PeerId, HashSet<u32>> {
        self.links
            .iter()
            .filter(|(_, l)| l.is_ready())
            .map(|(p, l)| (p.clone(), l.chunks.clone()))
            .collect()
    }

    pub fn is_ready(&self, peer: &PeerId) -> bool {
        self.links.get(peer).is_some_and(|l| l.is_ready())
    }

    pub fn link_phase(&self, peer: &PeerId) -> Option<LinkPhase> {
        self.links.get(peer).map(|l| l.phase)
    }

    /// Drop one peer (it left the room). Returns whether its link was ready.
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        self.orphan_candidates.remove(peer);
        self.backend.close(peer);
        self.links.remove(peer).is_some_and(|l| l.is_ready())
    }

    /// Tear down every link. Not graceful.
    pub fn disconnect(&mut self) {
        self.backend.close_all();
        self.links.clear();
        self.orphan_candidates.clear();
    }

    fn answer(&mut self, peer: &PeerId, offer: &str) {
        match self.backend.accept_offer(peer, offer) {
            Ok(sdp) => {
                debug!(%peer, "answering link offer");
                let link = self
                    .links
                    .entry(peer.clone())
                    .or_insert_with(|| PeerLink::new(LinkPhase::Answering));
                link.phase = LinkPhase::Answering;
                link.remote_described = true;
                if let Some(orphans) = self.orphan_candidates.remove(peer) {
                    link.pending_candidates.extend(orphans);
                }
                self.signal(peer, SignalPayload::Answer { sdp });
                self.flush_candidates(peer);
            }
            Err(e) => {
                warn!(%peer, "could not answer offer: {}", e);
                self.links.remove(peer);
            }
        }
    }

    fn flush_candidates(&mut self, peer: &PeerId) {
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        for candidate in std::mem::take(&mut link.pending_candidates) {
            if let Err(e) = self.backend.add_candidate(peer, &candidate) {
                debug!(%peer, "buffered candidate rejected: {}", e);
            }
        }
    }

    fn send_frame(&mut self, peer: &PeerId, frame: PeerFrame) -> Result<(), LinkError> {
        if !self.is_ready(peer) {
            return Err(LinkError::NotOpen(peer.clone()));
        }
        self.backend.send(peer, frame)
    }

    fn signal(&self, to: &PeerId, payload: SignalPayload) {
        let Some(from) = self.local_id.clone() else {
            return;
        };
        let msg = RelayMessage::Signal {
            from,
            to: to.clone(),
            payload,
        };
        if self.signals.send_control(msg).is_err() {
            debug!(peer = %to, "relay gone, signal dropped");
        }
    }
}

impl Drop for PeerLinkManager {
    fn drop(&mut self) {
        self.backend.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{relay_pipe, RelayOutbound};
    use limeshare_types::RelayFrame;
    use std::sync::{Arc, Mutex};

    /// Records backend calls; answers echo the offer.
    #[derive(Default, Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
        fn push(&self, s: String) {
            self.calls.lock().unwrap().push(s);
        }
    }

    impl LinkBackend for Recorder {
        fn create_offer(&mut self, peer: &PeerId) -> Result<String, LinkError> {
            self.push(format!("offer {peer}"));
            Ok(format!("sdp-{peer}"))
        }
        fn accept_offer(&mut self, peer: &PeerId, offer: &str) -> Result<String, LinkError> {
            self.push(format!("accept_offer {peer} {offer}"));
            Ok(format!("ans-{offer}"))
        }
        fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), LinkError> {
            self.push(format!("accept_answer {peer} {answer}"));
            Ok(())
        }
        fn add_candidate(&mut self, peer: &PeerId, candidate: &str) -> Result<(), LinkError> {
            self.push(format!("candidate {peer} {candidate}"));
            Ok(())
        }
        fn send(&mut self, peer: &PeerId, frame: PeerFrame) -> Result<(), LinkError> {
            self.push(format!("send {peer} {frame:?}"));
            Ok(())
        }
        fn close(&mut self, peer: &PeerId) {
            self.push(format!("close {peer}"));
        }
        fn close_all(&mut self) {
            self.push("close_all".into());
        }
    }

    fn manager(local: &str) -> (PeerLinkManager, Recorder, RelayOutbound) {
        let rec = Recorder::default();
        let (sender, outbound) = relay_pipe();
        let mut m = PeerLinkManager::new(Box::new(rec.clone()), sender);
        m.set_local_id(PeerId::from(local));
        (m, rec, outbound)
    }

    fn drain_signals(outbound: &mut RelayOutbound) -> Vec<(PeerId, SignalPayload)> {
        let mut out = Vec::new();
        while let Some(queued) = outbound.try_recv() {
            outbound.written(&queued);
            if let RelayFrame::Control(RelayMessage::Signal { to, payload, .. }) = queued.frame {
                out.push((to, payload));
            }
        }
        out
    }

    fn open(m: &mut PeerLinkManager, peer: &str) -> Option<MeshEvent> {
        m.handle_link_event(LinkEvent::new(PeerId::from(peer), LinkEventKind::Open))
    }

    #[test]
    fn test_connect_is_idempotent_and_skips_self() {
        let (mut m, rec, mut out) = manager("b");
        m.connect_to_peer(&PeerId::from("b"));
        m.connect_to_peer(&PeerId::from("c"));
        m.connect_to_peer(&PeerId::from("c"));
        assert_eq!(rec.take(), vec!["offer c"]);
        assert_eq!(m.link_phase(&PeerId::from("c")), Some(LinkPhase::Offering));
        assert_eq!(
            drain_signals(&mut out),
            vec![(PeerId::from("c"), SignalPayload::Offer { sdp: "sdp-c".into() })]
        );
    }

    #[test]
    fn test_signals_for_others_ignored() {
        let (mut m, rec, _out) = manager("b");
        m.handle_signal(&PeerId::from("a"), &PeerId::from("z"), SignalPayload::Offer { sdp: "x".into() });
        m.handle_signal(&PeerId::from("b"), &PeerId::from("b"), SignalPayload::Offer { sdp: "x".into() });
        assert!(rec.take().is_empty());
        assert_eq!(m.link_phase(&PeerId::from("a")), None);
    }

    #[test]
    fn test_inbound_offer_is_answered() {
        let (mut m, rec, mut out) = manager("b");
        m.handle_signal(&PeerId::from("a"), &PeerId::from("b"), SignalPayload::Offer { sdp: "o1".into() });
        assert_eq!(rec.take(), vec!["accept_offer a o1"]);
        assert_eq!(m.link_phase(&PeerId::from("a")), Some(LinkPhase::Answering));
        assert_eq!(
            drain_signals(&mut out),
            vec![(PeerId::from("a"), SignalPayload::Answer { sdp: "ans-o1".into() })]
        );

        // Renegotiation attempts on a busy link are ignored.
        m.handle_signal(&PeerId::from("a"), &PeerId::from("b"), SignalPayload::Offer { sdp: "o2".into() });
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_candidates_buffered_until_description() {
        let (mut m, rec, _out) = manager("b");
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        m.handle_signal(&a, &b, SignalPayload::Candidate { candidate: "c1".into() });
        m.handle_signal(&a, &b, SignalPayload::Candidate { candidate: "c2".into() });
        assert!(rec.take().is_empty());

        m.handle_signal(&a, &b, SignalPayload::Offer { sdp: "o".into() });
        assert_eq!(rec.take(), vec!["accept_offer a o", "candidate a c1", "candidate a c2"]);

        m.handle_signal(&a, &b, SignalPayload::Candidate { candidate: "c3".into() });
        assert_eq!(rec.take(), vec!["candidate a c3"]);
    }

    #[test]
    fn test_orphan_candidate_does_not_block_connect() {
        let (mut m, rec, mut out) = manager("b");
        let c = PeerId::from("c");
        m.handle_signal(&c, &PeerId::from("b"), SignalPayload::Candidate { candidate: "stale".into() });
        assert_eq!(m.link_phase(&c), None);

        m.connect_to_peer(&c);
        assert_eq!(rec.take(), vec!["offer c"]);
        assert_eq!(m.link_phase(&c), Some(LinkPhase::Offering));
        assert_eq!(
            drain_signals(&mut out),
            vec![(c.clone(), SignalPayload::Offer { sdp: "sdp-c".into() })]
        );
    }

    #[test]
    fn test_answer_only_accepted_while_offering() {
        let (mut m, rec, _out) = manager("a");
        let a = PeerId::from("a");
        let c = PeerId::from("c");
        m.handle_signal(&c, &a, SignalPayload::Answer { sdp: "early".into() });
        assert!(rec.take().is_empty());

        m.connect_to_peer(&c);
        m.handle_signal(&c, &a, SignalPayload::Candidate { candidate: "c1".into() });
        rec.take();
        m.handle_signal(&c, &a, SignalPayload::Answer { sdp: "ok".into() });
        assert_eq!(rec.take(), vec!["accept_answer c ok", "candidate c c1"]);

        m.handle_signal(&c, &a, SignalPayload::Answer { sdp: "dup".into() });
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_crossing_offer_lower_id_yields() {
        let (mut low, low_rec, _o1) = manager("a");
        low.connect_to_peer(&PeerId::from("b"));
        low_rec.take();
        low.handle_signal(&PeerId::from("b"), &PeerId::from("a"), SignalPayload::Offer { sdp: "ob".into() });
        assert_eq!(low_rec.take(), vec!["close b", "accept_offer b ob"]);
        assert_eq!(low.link_phase(&PeerId::from("b")), Some(LinkPhase::Answering));

        let (mut high, high_rec, _o2) = manager("b");
        high.connect_to_peer(&PeerId::from("a"));
        high_rec.take();
        high.handle_signal(&PeerId::from("a"), &PeerId::from("b"), SignalPayload::Offer { sdp: "oa".into() });
        assert!(high_rec.take().is_empty());
        assert_eq!(high.link_phase(&PeerId::from("a")), Some(LinkPhase::Offering));
    }

    #[test]
    fn test_ready_link_carries_frames_and_availability() {
        let (mut m, rec, _out) = manager("a");
        let c = PeerId::from("c");
        m.connect_to_peer(&c);

        // Frames before the link is ready are dropped.
        let early = LinkEvent::new(c.clone(), LinkEventKind::Frame(PeerFrame::Control(PeerControl::HaveChunks { chunks: vec![1] })));
        assert_eq!(m.handle_link_event(early), None);
        assert!(m.request_chunk(&c, 1).is_err());

        assert_eq!(open(&mut m, "c"), Some(MeshEvent::PeerReady(c.clone())));
        assert_eq!(open(&mut m, "c"), None);
        assert_eq!(m.get_connected_peers(), vec![c.clone()]);

        let have = LinkEvent::new(c.clone(), LinkEventKind::Frame(PeerFrame::Control(PeerControl::HaveChunks { chunks: vec![3, 4] })));
        assert_eq!(m.handle_link_event(have), Some(MeshEvent::HaveChunks { peer: c.clone(), chunks: vec![3, 4] }));
        assert_eq!(m.peers_with_chunk(4), vec![c.clone()]);
        assert!(m.peers_with_chunk(5).is_empty());
        assert_eq!(m.peer_availability()[&c].len(), 2);

        let chunk = LinkEvent::new(c.clone(), LinkEventKind::Frame(PeerFrame::chunk(3, Bytes::from_static(b"zz"))));
        assert_eq!(
            m.handle_link_event(chunk),
            Some(MeshEvent::Chunk { peer: c.clone(), index: 3, data: Bytes::from_static(b"zz") })
        );

        rec.take();
        m.request_chunk(&c, 4).unwrap();
        m.announce_chunks(&[9]);
        m.announce_chunks(&[]);
        assert_eq!(rec.take().len(), 2);
    }

    #[test]
    fn test_close_reports_only_ready_links() {
        let (mut m, _rec, _out) = manager("a");
        m.connect_to_peer(&PeerId::from("c"));
        m.connect_to_peer(&PeerId::from("d"));
        open(&mut m, "c");

        let closed_c = LinkEvent::new(PeerId::from("c"), LinkEventKind::Closed);
        let closed_d = LinkEvent::new(PeerId::from("d"), LinkEventKind::Closed);
        assert_eq!(m.handle_link_event(closed_c), Some(MeshEvent::PeerDisconnected(PeerId::from("c"))));
        assert_eq!(m.handle_link_event(closed_d), None);
        assert_eq!(m.link_phase(&PeerId::from("d")), None);
        assert!(m.get_connected_peers().is_empty());
    }

    #[test]
    fn test_disconnect_tears_down_everything() {
        let (mut m, rec, _out) = manager("a");
        m.connect_to_peer(&PeerId::from("c"));
        open(&mut m, "c");
        rec.take();
        m.disconnect();
        assert_eq!(rec.take(), vec!["close_all"]);
        assert!(!m.is_ready(&PeerId::from("c")));
    }
}
