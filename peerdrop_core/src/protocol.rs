//! Signaling wire protocol
//!
//! JSON objects exchanged between peers and the room broker. Every message
//! carries a `type` discriminator; field names follow the browser
//! conventions (`roomId`, `peerId`, `sdpMid`, ...).

use serde::{Deserialize, Serialize};

/// Signaling messages relayed through the room broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Ask the broker to join (or create) a room
    JoinRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        peer_id: String,
    },
    /// Broker confirmation sent to the joining peer
    JoinedRoom { room_id: String },
    /// Another peer entered the room
    PeerJoined { room_id: String, peer_id: String },
    /// A peer left the room or disconnected
    PeerLeft { peer_id: String },
    Offer {
        room_id: String,
        from: String,
        sdp: SessionDescription,
    },
    Answer {
        room_id: String,
        from: String,
        sdp: SessionDescription,
    },
    Ice {
        room_id: String,
        from: String,
        candidate: IceCandidate,
    },
    /// Leave the current room
    Leave,
}

impl SignalMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::JoinRoom { .. } => "join-room",
            SignalMessage::JoinedRoom { .. } => "joined-room",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Ice { .. } => "ice",
            SignalMessage::Leave => "leave",
        }
    }

    /// Sender of a relayed negotiation message
    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::Ice { from, .. } => Some(from),
            SignalMessage::JoinRoom { peer_id, .. }
            | SignalMessage::PeerJoined { peer_id, .. }
            | SignalMessage::PeerLeft { peer_id } => Some(peer_id),
            SignalMessage::JoinedRoom { .. } | SignalMessage::Leave => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description (`{"type": "offer", "sdp": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_shape() {
        let msg = SignalMessage::JoinRoom {
            room_id: Some("482913".to_string()),
            peer_id: "peer-a".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "join-room", "roomId": "482913", "peerId": "peer-a"})
        );

        // roomId is optional on join
        let parsed: SignalMessage =
            serde_json::from_str(r#"{"type":"join-room","peerId":"peer-b"}"#).unwrap();
        assert_eq!(
            parsed,
            SignalMessage::JoinRoom {
                room_id: None,
                peer_id: "peer-b".to_string()
            }
        );
    }

    #[test]
    fn test_offer_from_browser_json() {
        let raw = r#"{
            "type": "offer",
            "roomId": "482913",
            "from": "peer-a",
            "sdp": {"type": "offer", "sdp": "v=0\r\n"}
        }"#;
        let msg: SignalMessage = serde_json::from_str(raw).unwrap();
        match msg {
            SignalMessage::Offer { room_id, from, sdp } => {
                assert_eq!(room_id, "482913");
                assert_eq!(from, "peer-a");
                assert_eq!(sdp.kind, SdpKind::Offer);
                assert_eq!(sdp.sdp, "v=0\r\n");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host");
        candidate.sdp_mid = Some("0".to_string());
        candidate.sdp_mline_index = Some(0);
        let msg = SignalMessage::Ice {
            room_id: "1".to_string(),
            from: "peer-a".to_string(),
            candidate,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice");
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert!(value["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn test_leave_ignores_extra_fields() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"leave","roomId":"482913"}"#).unwrap();
        assert_eq!(msg, SignalMessage::Leave);
        assert_eq!(msg.kind(), "leave");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<SignalMessage>(r#"{"type":"chat"}"#).is_err());
    }
}
