//! Per-session chunk bitfield and store.
//!
//! Each chunk index is absent, requested, or held. Held is terminal until
//! `clear`/`init`. A request expires after the request timeout and the
//! chunk counts as absent again, so a stalled peer never pins a chunk.
//!
//! Every method is total: out-of-range indices and calls before `init`
//! are no-ops or return empty/zero results.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use limeshare_types::PeerId;

/// Default lifetime of an outstanding chunk request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("chunk {index} of {total} is missing")]
    MissingChunk { index: u32, total: u32 },
}

/// Result of `mark_have`. Only `Stored` changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaveOutcome {
    Stored,
    /// Same bytes were already held.
    AlreadyHeld,
    /// Different bytes were already held; the first payload is kept.
    Conflicting,
    OutOfRange,
}

#[derive(Debug, Clone)]
struct ChunkRequest {
    peer: PeerId,
    requested_at: Instant,
}

#[derive(Debug)]
pub struct ChunkTracker {
    total_chunks: u32,
    chunks: Vec<Option<Bytes>>,
    held: u32,
    pending: HashMap<u32, ChunkRequest>,
    request_timeout: Duration,
}

impl Default for ChunkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkTracker {
    pub fn new() -> Self {
        Self::with_request_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            total_chunks: 0,
            chunks: Vec::new(),
            held: 0,
            pending: HashMap::new(),
            request_timeout,
        }
    }

    /// Reset for a session of `total_chunks` chunks.
    pub fn init(&mut self, total_chunks: u32) {
        self.total_chunks = total_chunks;
        self.chunks = vec![None; total_chunks as usize];
        self.held = 0;
        self.pending.clear();
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn held_count(&self) -> u32 {
        self.held
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Record a chunk payload. First writer wins.
    pub fn mark_have(&mut self, index: u32, data: Bytes) -> HaveOutcome {
        let Some(slot) = self.chunks.get_mut(index as usize) else {
            return HaveOutcome::OutOfRange;
        };
        self.pending.remove(&index);
        match slot {
            Some(existing) if *existing == data => HaveOutcome::AlreadyHeld,
            Some(_) => HaveOutcome::Conflicting,
            None => {
                *slot = Some(data);
                self.held += 1;
                HaveOutcome::Stored
            }
        }
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        matches!(self.chunks.get(index as usize), Some(Some(_)))
    }

    pub fn get_chunk(&self, index: u32) -> Option<Bytes> {
        self.chunks.get(index as usize).and_then(|c| c.clone())
    }

    /// Held indices, ascending.
    pub fn have_list(&self) -> Vec<u32> {
        (0..self.total_chunks).filter(|&i| self.has_chunk(i)).collect()
    }

    /// Absent indices (not held, no live request), ascending.
    pub fn get_needed_chunks(&self) -> Vec<u32> {
        self.needed_at(Instant::now())
    }

    pub fn needed_at(&self, now: Instant) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|&i| !self.has_chunk(i) && !self.is_requested_at(i, now))
            .collect()
    }

    /// Record an outstanding request, replacing any earlier one for `index`.
    pub fn mark_requested(&mut self, index: u32, peer: &PeerId) {
        self.mark_requested_at(index, peer, Instant::now());
    }

    pub fn mark_requested_at(&mut self, index: u32, peer: &PeerId, now: Instant) {
        if index >= self.total_chunks || self.has_chunk(index) {
            return;
        }
        self.pending.insert(
            index,
            ChunkRequest {
                peer: peer.clone(),
                requested_at: now,
            },
        );
    }

    pub fn is_requested(&self, index: u32) -> bool {
        self.is_requested_at(index, Instant::now())
    }

    pub fn is_requested_at(&self, index: u32, now: Instant) -> bool {
        self.pending
            .get(&index)
            .is_some_and(|req| !self.expired(req, now))
    }

    /// Drop every outstanding request sent to `peer`, e.g. because its link
    /// closed. Returns the released indices, ascending.
    pub fn cancel_requests_to(&mut self, peer: &PeerId) -> Vec<u32> {
        let mut released: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, req)| req.peer == *peer)
            .map(|(&i, _)| i)
            .collect();
        for i in &released {
            self.pending.remove(i);
        }
        released.sort_unstable();
        released
    }

    pub fn live_request_count(&self) -> usize {
        self.live_request_count_at(Instant::now())
    }

    pub fn live_request_count_at(&self, now: Instant) -> usize {
        self.pending.values().filter(|req| !self.expired(req, now)).count()
    }

    /// Drop requests older than the timeout. Returns the evicted indices,
    /// ascending, for rescheduling.
    pub fn cancel_timed_out_requests(&mut self) -> Vec<u32> {
        self.cancel_timed_out_requests_at(Instant::now())
    }

    pub fn cancel_timed_out_requests_at(&mut self, now: Instant) -> Vec<u32> {
        let timeout = self.request_timeout;
        let mut evicted: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, req)| now.saturating_duration_since(req.requested_at) > timeout)
            .map(|(&i, _)| i)
            .collect();
        for i in &evicted {
            self.pending.remove(i);
        }
        evicted.sort_unstable();
        evicted
    }

    /// Up to `count` needed chunks that at least one peer holds, fewest
    /// holders first, ties in index order.
    pub fn get_rarest_chunks(&self, peer_chunks: &HashMap<PeerId, HashSet<u32>>, count: usize) -> Vec<u32> {
        self.rarest_at(peer_chunks, count, Instant::now())
    }

    pub fn rarest_at(&self, peer_chunks: &HashMap<PeerId, HashSet<u32>>, count: usize, now: Instant) -> Vec<u32> {
        let mut candidates: Vec<(usize, u32)> = self
            .needed_at(now)
            .into_iter()
            .map(|idx| {
                let holders = peer_chunks.values().filter(|set| set.contains(&idx)).count();
                (holders, idx)
            })
            .filter(|&(holders, _)| holders > 0)
            .collect();
        candidates.sort_by_key(|&(holders, _)| holders);
        candidates.into_iter().take(count).map(|(_, idx)| idx).collect()
    }

    /// Held fraction as a percentage; 0 before `init`.
    pub fn get_progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.held as f64 / self.total_chunks as f64 * 100.0
    }

    /// True once every chunk is held. Never true before `init`.
    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.held == self.total_chunks
    }

    /// Concatenate all chunks in index order. Fails on the first gap rather
    /// than returning a short buffer.
    pub fn assemble_data(&self) -> Result<Bytes, TrackerError> {
        let size: usize = self.chunks.iter().flatten().map(|c| c.len()).sum();
        let mut out = BytesMut::with_capacity(size);
        for (index, chunk) in self.chunks.iter().enumerate() {
            let chunk = chunk.as_ref().ok_or(TrackerError::MissingChunk {
                index: index as u32,
                total: self.total_chunks,
            })?;
            out.extend_from_slice(chunk);
        }
        Ok(out.freeze())
    }

    pub fn clear(&mut self) {
        self.init(0);
    }

    fn expired(&self, req: &ChunkRequest, now: Instant) -> bool {
        now.saturating_duration_since(req.requested_at) > self.request_timeout
    }
}
