//! Wire protocol types.
//!
//! Two layers share this module: the relay envelope (JSON text frames over
//! the room WebSocket) and the peer-link frame codec (binary frames over an
//! established direct connection).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Fixed chunk size for file payload frames.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a control frame's JSON payload.
pub const MAX_CONTROL_BYTES: usize = 16 * 1024;

const TAG_CONTROL: u8 = 0x01;
const TAG_CHUNK: u8 = 0x02;

/// Messages a participant sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Register under a participant id in the connection's room.
    Join { id: String },
    /// Forward an opaque signaling payload to another participant.
    Signal { to: String, from: String, signal: Value },
}

/// Messages the relay sends to a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Snapshot of the other participants, sent once on join.
    AllPeers { peers: Vec<String> },
    /// Another participant joined after us.
    PeerJoined { id: String },
    /// Signaling payload routed from another participant.
    Signal { from: String, signal: Value },
    /// A participant left (or its connection dropped).
    PeerLeft { id: String },
}

/// Decode a relay frame, tolerating unknown or malformed messages.
///
/// Returns `None` (after a warn) instead of an error so a bad frame never
/// kills the connection.
pub fn decode_client_frame(raw: &str) -> Option<ClientFrame> {
    match serde_json::from_str(raw) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(error = %e, "unknown or malformed client frame, skipping");
            None
        }
    }
}

pub fn decode_server_frame(raw: &str) -> Option<ServerFrame> {
    match serde_json::from_str(raw) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(error = %e, "unknown or malformed relay frame, skipping");
            None
        }
    }
}

/// Control messages on a peer link, framed separately from chunk payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Announces an incoming file; chunks for it follow until `FileEnd`.
    FileStart {
        name: String,
        size: u64,
        #[serde(rename = "fileType")]
        file_type: String,
        #[serde(rename = "fileId")]
        file_id: String,
    },
    /// Trailer closing the transfer opened by the matching `FileStart`.
    FileEnd {
        #[serde(rename = "fileId")]
        file_id: String,
    },
}

/// A decoded peer-link frame.
#[derive(Debug, Clone)]
pub enum LinkFrame {
    Control(ControlFrame),
    Chunk(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag: {0:#04x}")]
    UnknownTag(u8),
    #[error("control frame too large: {0} bytes (max {MAX_CONTROL_BYTES})")]
    ControlTooLarge(usize),
    #[error("malformed control payload: {0}")]
    BadControl(#[from] serde_json::Error),
}

/// Encode a control frame with the one-byte discriminator prefix.
pub fn encode_control(frame: &ControlFrame) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(frame)?;
    debug_assert!(payload.len() <= MAX_CONTROL_BYTES);
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(TAG_CONTROL);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encode a chunk frame. The caller keeps chunks at or below [`CHUNK_SIZE`].
pub fn encode_chunk(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + bytes.len());
    out.push(TAG_CHUNK);
    out.extend_from_slice(bytes);
    out
}

/// Decode a peer-link frame by its discriminator byte.
///
/// The explicit tag replaces the original protocol's parse-as-JSON guess, so
/// a small chunk that happens to look like JSON can never be misread as a
/// control frame.
pub fn decode_link_frame(raw: &[u8]) -> Result<LinkFrame, FrameError> {
    let (&tag, payload) = raw.split_first().ok_or(FrameError::Empty)?;
    match tag {
        TAG_CONTROL => {
            if payload.len() > MAX_CONTROL_BYTES {
                return Err(FrameError::ControlTooLarge(payload.len()));
            }
            Ok(LinkFrame::Control(serde_json::from_slice(payload)?))
        }
        TAG_CHUNK => Ok(LinkFrame::Chunk(payload.to_vec())),
        other => Err(FrameError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_join_serde() {
        let json = r#"{"type":"join","id":"p-1"}"#;
        let frame = decode_client_frame(json).unwrap();
        match frame {
            ClientFrame::Join { id } => assert_eq!(id, "p-1"),
            _ => panic!("Expected Join"),
        }
    }

    #[test]
    fn client_frame_signal_serde() {
        let frame = ClientFrame::Signal {
            to: "p-2".into(),
            from: "p-1".into(),
            signal: serde_json::json!({"sdp": "offer"}),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "signal");
        assert_eq!(json["to"], "p-2");
        assert_eq!(json["from"], "p-1");
        assert_eq!(json["signal"]["sdp"], "offer");
    }

    #[test]
    fn server_frame_all_peers_serde() {
        let frame = ServerFrame::AllPeers {
            peers: vec!["a".into(), "b".into()],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("all-peers"));
        let rt = decode_server_frame(&json).unwrap();
        match rt {
            ServerFrame::AllPeers { peers } => assert_eq!(peers, vec!["a", "b"]),
            _ => panic!("Expected AllPeers"),
        }
    }

    #[test]
    fn server_frame_peer_joined_and_left() {
        let joined = decode_server_frame(r#"{"type":"peer-joined","id":"x"}"#).unwrap();
        match joined {
            ServerFrame::PeerJoined { id } => assert_eq!(id, "x"),
            _ => panic!("Expected PeerJoined"),
        }
        let left = decode_server_frame(r#"{"type":"peer-left","id":"x"}"#).unwrap();
        match left {
            ServerFrame::PeerLeft { id } => assert_eq!(id, "x"),
            _ => panic!("Expected PeerLeft"),
        }
    }

    #[test]
    fn unknown_frame_type_is_skipped() {
        assert!(decode_client_frame(r#"{"type":"dance","id":"x"}"#).is_none());
        assert!(decode_server_frame(r#"{"type":"dance"}"#).is_none());
        assert!(decode_client_frame("not json at all").is_none());
    }

    #[test]
    fn control_frame_wire_field_names() {
        let frame = ControlFrame::FileStart {
            name: "photo.png".into(),
            size: 12345,
            file_type: "image/png".into(),
            file_id: "t-1".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "file-start");
        assert_eq!(json["fileId"], "t-1");
        assert_eq!(json["fileType"], "image/png");

        let end = ControlFrame::FileEnd { file_id: "t-1".into() };
        let json = serde_json::to_value(&end).unwrap();
        assert_eq!(json["type"], "file-end");
        assert_eq!(json["fileId"], "t-1");
    }

    #[test]
    fn link_frame_roundtrip_control() {
        let frame = ControlFrame::FileEnd { file_id: "t-9".into() };
        let bytes = encode_control(&frame).unwrap();
        match decode_link_frame(&bytes).unwrap() {
            LinkFrame::Control(ControlFrame::FileEnd { file_id }) => {
                assert_eq!(file_id, "t-9");
            }
            other => panic!("Expected FileEnd, got {other:?}"),
        }
    }

    #[test]
    fn link_frame_roundtrip_chunk() {
        let data = vec![0u8, 1, 2, 255];
        let bytes = encode_chunk(&data);
        match decode_link_frame(&bytes).unwrap() {
            LinkFrame::Chunk(payload) => assert_eq!(payload, data),
            other => panic!("Expected Chunk, got {other:?}"),
        }
    }

    #[test]
    fn chunk_that_looks_like_json_stays_a_chunk() {
        // The byte tag removes the old heuristic's ambiguity.
        let sneaky = br#"{"type":"file-end","fileId":"t-1"}"#;
        let bytes = encode_chunk(sneaky);
        match decode_link_frame(&bytes).unwrap() {
            LinkFrame::Chunk(payload) => assert_eq!(payload, sneaky),
            other => panic!("Expected Chunk, got {other:?}"),
        }
    }

    #[test]
    fn link_frame_rejects_bad_input() {
        assert!(matches!(decode_link_frame(&[]), Err(FrameError::Empty)));
        assert!(matches!(
            decode_link_frame(&[0x07, 1, 2]),
            Err(FrameError::UnknownTag(0x07))
        ));

        let mut oversized = vec![0x01];
        oversized.extend(std::iter::repeat_n(b'x', MAX_CONTROL_BYTES + 1));
        assert!(matches!(
            decode_link_frame(&oversized),
            Err(FrameError::ControlTooLarge(_))
        ));

        let garbage = [&[0x01u8][..], b"not json"].concat();
        assert!(matches!(
            decode_link_frame(&garbage),
            Err(FrameError::BadControl(_))
        ));
    }

    #[test]
    fn chunk_size_matches_protocol() {
        assert_eq!(CHUNK_SIZE, 65536);
        assert_eq!(MAX_CONTROL_BYTES, 16384);
    }
}
