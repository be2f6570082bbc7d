/// Limeshare swarm engine: peer-assisted file distribution over a relay.
///
/// A host streams encrypted chunks through a signaling relay room while
/// receivers also trade chunks with each other over direct peer links:
/// - ChunkTracker: per-session chunk state and rarest-first selection
/// - PeerLinkManager: link handshakes over relay signals, chunk announcements
/// - TransferOrchestrator: host and receiver session tasks
/// - SwarmTransport: WebSocket relay/provider and TCP links, or in-memory
///   stand-ins behind the `test-util` feature

pub mod config;
pub mod error;
pub mod links;
pub mod orchestrator;
pub mod relay;
pub mod tracker;
pub mod transport;

#[cfg(feature = "test-util")]
pub mod testing;

// Re-export key types for convenience.
pub use config::{ConfigError, SwarmConfig, MAX_CHUNKS, RELAY_HIGH_WATER};
pub use error::TransferError;
pub use links::{
    LinkBackend, LinkError, LinkEvent, LinkEventKind, LinkPhase, MeshEvent, PeerLinkManager, TcpLinkBackend,
};
pub use orchestrator::{
    swarm_counts, CompletedTransfer, SourceAccounting, TransferEvent, TransferOrchestrator, TransferProgress,
    TransferSession, TransferStage,
};
pub use relay::{relay_pipe, QueuedFrame, RelayChannel, RelayOutbound, RelaySender};
pub use tracker::{ChunkTracker, HaveOutcome, TrackerError, REQUEST_TIMEOUT};
pub use transport::{SwarmTransport, WsTransport};
