use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{PeerId, SessionId};

/// Control frames exchanged through the per-session relay room.
///
/// The relay broadcasts every frame to all other members of the room, so
/// addressed frames (`signal`) carry explicit `from`/`to` fields and
/// receivers drop the ones not meant for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    /// Relay greets a new member with its assigned id and the current room.
    #[serde(rename = "welcome")]
    Welcome { your_id: PeerId, peers: Vec<PeerId> },

    #[serde(rename = "peer_join")]
    PeerJoin {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    #[serde(rename = "peer_leave")]
    PeerLeave {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    /// Receiver asks the host to (re)stream the session.
    #[serde(rename = "file_request")]
    FileRequest {
        session: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
    },

    #[serde(rename = "file_start")]
    FileStart {
        name: String,
        size: u64,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
        session: SessionId,
        #[serde(rename = "chunkSize", default = "default_chunk_size")]
        chunk_size: usize,
    },

    #[serde(rename = "file_end")]
    FileEnd { session: SessionId },

    /// Peer-link handshake material, addressed to one member.
    #[serde(rename = "signal")]
    Signal {
        from: PeerId,
        to: PeerId,
        payload: SignalPayload,
    },

    /// The next `count` binary frames are keystream A.
    #[serde(rename = "keyA_start")]
    KeyAStart { count: u32 },

    /// The next `count` binary frames are keystream B.
    #[serde(rename = "keyB_start")]
    KeyBStart { count: u32 },
}

fn default_chunk_size() -> usize {
    crate::session::DEFAULT_CHUNK_SIZE
}

/// Offer/answer/candidate payload of a `signal` frame. The contents are
/// opaque to everything but the link backend that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
}

/// One frame on the relay channel: structured control or raw binary.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Control(RelayMessage),
    Binary(Bytes),
}

impl RelayFrame {
    /// Bytes this frame occupies in an outbound socket buffer.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Control(msg) => serde_json::to_string(msg).map(|s| s.len()).unwrap_or(0),
            Self::Binary(data) => data.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names() {
        let msg = RelayMessage::FileStart {
            name: "a.bin".into(),
            size: 10,
            total_chunks: 1,
            session: SessionId::from("abcd"),
            chunk_size: 16384,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"type": "file_start", "name": "a.bin", "size": 10, "totalChunks": 1, "session": "abcd", "chunkSize": 16384})
        );

        let join: RelayMessage = serde_json::from_value(json!({"type": "peer_join", "peerId": "p-2"})).unwrap();
        assert_eq!(join, RelayMessage::PeerJoin { peer_id: PeerId::from("p-2") });

        let key: RelayMessage = serde_json::from_value(json!({"type": "keyB_start", "count": 62})).unwrap();
        assert_eq!(key, RelayMessage::KeyBStart { count: 62 });
    }

    #[test]
    fn test_optional_fields_default() {
        let msg: RelayMessage = serde_json::from_value(json!({
            "type": "file_start", "name": "x", "size": 1, "totalChunks": 1, "session": "ab"
        }))
        .unwrap();
        match msg {
            RelayMessage::FileStart { chunk_size, .. } => assert_eq!(chunk_size, 16 * 1024),
            other => panic!("unexpected {:?}", other),
        }

        let req: RelayMessage = serde_json::from_value(json!({"type": "file_request", "session": "ab"})).unwrap();
        assert_eq!(req, RelayMessage::FileRequest { session: SessionId::from("ab"), from: None });
        assert_eq!(serde_json::to_value(&req).unwrap(), json!({"type": "file_request", "session": "ab"}));
    }

    #[test]
    fn test_signal_payload_shape() {
        let msg = RelayMessage::Signal {
            from: PeerId::from("a"),
            to: PeerId::from("b"),
            payload: SignalPayload::Candidate { candidate: "10.0.0.2:4000".into() },
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["payload"], json!({"kind": "candidate", "candidate": "10.0.0.2:4000"}));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<RelayMessage>(r#"{"type":"mystery"}"#).is_err());
    }
}
