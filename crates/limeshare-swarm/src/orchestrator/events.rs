use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use limeshare_types::PeerId;
use tokio::sync::mpsc;

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Hashing,
    Keys,
    Connecting,
    Transferring,
    Seeding,
    Complete,
}

/// Where a receiver's chunks came from. Observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceAccounting {
    pub relay: u32,
    pub peer: u32,
    /// Copies of chunks that were already held when they arrived.
    pub redundant: u32,
}

impl SourceAccounting {
    pub fn total(&self) -> u32 {
        self.relay + self.peer
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub stage: TransferStage,
    pub percent: f64,
    pub sources: SourceAccounting,
}

#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub name: String,
    pub data: Bytes,
    pub sources: SourceAccounting,
}

#[derive(Debug)]
pub enum TransferEvent {
    Progress(TransferProgress),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// Linked peers holding the whole file vs. still downloading.
    Swarm { seeders: usize, leechers: usize },
    /// The room was empty when we joined. The request is repeated when
    /// someone joins.
    SenderOffline,
    Completed(CompletedTransfer),
    /// The session is over.
    Failed(TransferError),
}

/// Session-side end of the event channel. A dropped receiver is fine.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<TransferEvent>,
    last_swarm: Option<(usize, usize)>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self { tx, last_swarm: None }
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn progress(&self, stage: TransferStage, percent: f64, sources: SourceAccounting) {
        self.emit(TransferEvent::Progress(TransferProgress {
            stage,
            percent,
            sources,
        }));
    }

    /// Emit swarm counts if they changed since the last report.
    pub(crate) fn swarm(&mut self, availability: &HashMap<PeerId, HashSet<u32>>, total_chunks: u32) {
        let counts = swarm_counts(availability, total_chunks);
        if self.last_swarm != Some(counts) {
            self.last_swarm = Some(counts);
            self.emit(TransferEvent::Swarm {
                seeders: counts.0,
                leechers: counts.1,
            });
        }
    }
}

/// `(seeders, leechers)` among linked peers.
pub fn swarm_counts(availability: &HashMap<PeerId, HashSet<u32>>, total_chunks: u32) -> (usize, usize) {
    let seeders = availability
        .values()
        .filter(|chunks| total_chunks > 0 && chunks.iter().filter(|&&i| i < total_chunks).count() == total_chunks as usize)
        .count();
    (seeders, availability.len() - seeders)
}
