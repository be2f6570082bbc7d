use limeshare_crypto::KeystreamError;
use limeshare_types::{LinkParseError, SessionId};

use crate::tracker::TrackerError;

/// Failures surfaced by the orchestrator.
///
/// Transport and key-acquisition errors end the session. Protocol
/// irregularities never show up here; they are logged and dropped where
/// they are detected.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cannot share an empty file")]
    EmptyFile,

    #[error("file of {size} bytes exceeds the {max_chunks}-chunk limit")]
    FileTooLarge { size: u64, max_chunks: u32 },

    #[error("invalid share link: {0}")]
    Link(#[from] LinkParseError),

    #[error("key acquisition failed: {0}")]
    KeyAcquisition(#[from] KeystreamError),

    #[error("keystream provider unreachable: {0}")]
    ProviderConnect(String),

    #[error("relay unreachable: {0}")]
    RelayConnect(String),

    #[error("relay channel closed")]
    RelayClosed,

    #[error("session {0} is already receiving")]
    ReceiveInProgress(SessionId),

    #[error("session {0} is already shared by this process")]
    AlreadySharing(SessionId),

    #[error("assembled file is incomplete: {0}")]
    Integrity(#[from] TrackerError),
}
