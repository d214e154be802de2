//! Broker wire messages. JSON text frames tagged by `type`.

use super::room::{ConnectionId, RoomKey};
use serde::{Deserialize, Serialize};

/// Client → broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    CreateRoom {
        key: String,
    },
    JoinRoom {
        key: String,
    },
    Signal {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnectionId>,
        /// Opaque connection-establishment payload.
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Broker → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    RoomCreated {
        key: String,
    },
    RoomJoined {
        key: String,
    },
    RoomNotFound {
        key: String,
    },
    PeerJoined {
        id: ConnectionId,
    },
    PeerLeft {
        id: ConnectionId,
    },
    Signal {
        from: ConnectionId,
        data: serde_json::Value,
    },
    Error {
        message: String,
        kind: ErrorKind,
        #[serde(
            rename = "retryAfterMs",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        retry_after_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Capacity,
    NotFound,
    RateLimited,
    Unauthorized,
}

impl ServerMessage {
    pub fn room_created(key: &RoomKey) -> Self {
        Self::RoomCreated {
            key: key.to_string(),
        }
    }

    pub fn room_joined(key: &RoomKey) -> Self {
        Self::RoomJoined {
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "create-room", "key": "ABCD1234"})).unwrap();
        assert_eq!(msg, ClientMessage::CreateRoom { key: "ABCD1234".into() });

        let msg: ClientMessage = serde_json::from_value(
            json!({"type": "signal", "key": "abcd1234", "data": {"kind": "offer", "sdp": "v=0"}}),
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Signal { to: None, .. }));
    }

    #[test]
    fn test_error_shape() {
        let msg = ServerMessage::Error {
            message: "slow down".into(),
            kind: ErrorKind::RateLimited,
            retry_after_ms: Some(1500),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "error", "message": "slow down", "kind": "rate-limited", "retryAfterMs": 1500})
        );

        let msg = ServerMessage::PeerLeft { id: "abc".into() };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "peer-left", "id": "abc"})
        );
    }
}
