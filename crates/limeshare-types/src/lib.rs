/// Limeshare wire vocabulary.
///
/// Shared by every participant of a swarm:
/// - peer and session identifiers
/// - the `zkv://` share link
/// - relay control frames (JSON, tagged by `type`)
/// - per-peer link frames and their binary codec
/// - session metadata and chunk arithmetic

pub mod ids;
pub mod link;
pub mod peer;
pub mod relay;
pub mod session;

pub use ids::{PeerId, SessionId};
pub use link::{LinkParseError, ShareLink, LINK_SCHEME};
pub use peer::{FrameError, PeerControl, PeerFrame, CHUNK_INDEX_HEADER};
pub use relay::{RelayFrame, RelayMessage, SignalPayload};
pub use session::{chunk_count, chunk_len, Role, SessionInfo, DEFAULT_CHUNK_SIZE};
