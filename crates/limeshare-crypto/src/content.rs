use limeshare_types::SessionId;
use sha2::{Digest, Sha256};

/// Hex characters of the content hash used as the session id.
pub const SESSION_ID_LEN: usize = 16;

/// Hex SHA-256 of the file contents.
pub fn content_id(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Session id for a file: the first 16 hex characters of its content hash.
pub fn session_id_for(data: &[u8]) -> SessionId {
    let mut id = content_id(data);
    id.truncate(SESSION_ID_LEN);
    SessionId::new(id)
}
