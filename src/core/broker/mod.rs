//! Signaling broker: room registry, per-connection budgets and relay.
//!
//! The broker never sees payload bytes. It pairs at most two connections
//! under a room key and relays their opaque connection-establishment
//! messages until one of them leaves.
//!
//! ```text
//!   (none) ──create──► {A} ──create/join──► {A, B} ──leave──► {B} ──leave──► (none)
//!                                 │
//!                                 └─ create/join by a third party: Capacity
//! ```
//!
//! Every operation checks in the same order: rate budget, then input
//! validation, then room logic. A rejected operation leaves the registry
//! untouched.

pub mod protocol;
pub mod rate_limit;
pub mod room;
pub mod server;

use crate::core::config::{CONNECTION_RATE_LIMIT, CONNECTION_RATE_WINDOW, MAX_SIGNAL_FIELDS};
use protocol::{ClientMessage, ErrorKind, ServerMessage};
use rate_limit::FixedWindowLimiter;
use room::{ConnectionId, Room, RoomKey};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("{0}")]
    Validation(String),
    #[error("room is full")]
    Capacity,
    #[error("room not found")]
    NotFound,
    #[error("rate limit exceeded, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("not a member of this room")]
    Unauthorized,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Validation(_) => ErrorKind::Validation,
            BrokerError::Capacity => ErrorKind::Capacity,
            BrokerError::NotFound => ErrorKind::NotFound,
            BrokerError::RateLimited { .. } => ErrorKind::RateLimited,
            BrokerError::Unauthorized => ErrorKind::Unauthorized,
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        let retry_after_ms = match self {
            BrokerError::RateLimited { retry_after } => Some(retry_after.as_millis() as u64),
            _ => None,
        };
        ServerMessage::Error {
            message: self.to_string(),
            kind: self.kind(),
            retry_after_ms,
        }
    }
}

pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone, Copy)]
pub struct BrokerLimits {
    pub operations: u32,
    pub window: Duration,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            operations: CONNECTION_RATE_LIMIT,
            window: CONNECTION_RATE_WINDOW,
        }
    }
}

struct BrokerState {
    rooms: HashMap<RoomKey, Room>,
    limiter: FixedWindowLimiter<ConnectionId>,
    outboxes: HashMap<ConnectionId, Outbox>,
}

impl BrokerState {
    fn deliver(&self, to: &ConnectionId, msg: ServerMessage) {
        match self.outboxes.get(to) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!(conn = %to, "Outbox closed, dropping message");
                }
            }
            None => debug!(conn = %to, "No outbox for connection"),
        }
    }

    fn charge(&mut self, conn: &ConnectionId) -> Result<(), BrokerError> {
        self.limiter
            .check(conn, Instant::now())
            .map_err(|retry_after| {
                warn!(event = "rate_limited", conn = %conn, ?retry_after, "Connection over budget");
                BrokerError::RateLimited { retry_after }
            })
    }
}

/// Broker-owned state for all rooms and connections.
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerLimits::default())
    }
}

impl Broker {
    pub fn new(limits: BrokerLimits) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                rooms: HashMap::new(),
                limiter: FixedWindowLimiter::new(limits.operations, limits.window),
                outboxes: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection and return its id plus the stream of
    /// messages addressed to it.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let conn = ConnectionId::random();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().outboxes.insert(conn.clone(), tx);
        debug!(conn = %conn, "Connection registered");
        (conn, rx)
    }

    /// Create a room, or take the free seat of a room that already has its
    /// creator. Repeating it as a member is a no-op.
    pub fn create(&self, conn: &ConnectionId, raw_key: &str) -> Result<RoomKey, BrokerError> {
        let mut state = self.state();
        state.charge(conn)?;
        let key = RoomKey::parse(raw_key)?;

        match state.rooms.get_mut(&key) {
            None => {
                state.rooms.insert(key.clone(), Room::with_creator(conn.clone()));
                info!(event = "room_created", key = %key, conn = %conn, "Room created");
            }
            Some(room) if room.contains(conn) => {}
            Some(room) => {
                room.add(conn.clone())?;
                let others: Vec<_> = room.others(conn).cloned().collect();
                info!(event = "room_entered", key = %key, conn = %conn, "Second participant entered via create");
                for other in others {
                    state.deliver(&other, ServerMessage::PeerJoined { id: conn.clone() });
                }
            }
        }
        Ok(key)
    }

    pub fn join(&self, conn: &ConnectionId, raw_key: &str) -> Result<RoomKey, BrokerError> {
        let mut state = self.state();
        state.charge(conn)?;
        let key = RoomKey::parse(raw_key)?;

        let room = state.rooms.get_mut(&key).ok_or(BrokerError::NotFound)?;
        if room.contains(conn) {
            return Ok(key);
        }
        room.add(conn.clone())?;
        let others: Vec<_> = room.others(conn).cloned().collect();
        info!(event = "room_joined", key = %key, conn = %conn, "Participant joined room");
        for other in others {
            state.deliver(&other, ServerMessage::PeerJoined { id: conn.clone() });
        }
        Ok(key)
    }

    /// Relay an opaque payload to `to`, or to every other member. Returns
    /// how many connections it was delivered to.
    pub fn relay(
        &self,
        conn: &ConnectionId,
        raw_key: &str,
        to: Option<&ConnectionId>,
        data: serde_json::Value,
    ) -> Result<usize, BrokerError> {
        let mut state = self.state();
        state.charge(conn)?;
        let key = RoomKey::parse(raw_key)?;
        validate_payload(&data)?;

        let room = state
            .rooms
            .get(&key)
            .filter(|room| room.contains(conn))
            .ok_or(BrokerError::Unauthorized)?;
        let targets: Vec<ConnectionId> = match to {
            Some(target) if target != conn && room.contains(target) => vec![target.clone()],
            Some(_) => {
                return Err(BrokerError::Validation(
                    "signal target is not another member of this room".into(),
                ))
            }
            None => room.others(conn).cloned().collect(),
        };

        debug!(key = %key, from = %conn, targets = targets.len(), "Relaying signal");
        for target in &targets {
            state.deliver(
                target,
                ServerMessage::Signal {
                    from: conn.clone(),
                    data: data.clone(),
                },
            );
        }
        Ok(targets.len())
    }

    /// Drop every trace of a connection: room seats, budget, outbox.
    pub fn teardown(&self, conn: &ConnectionId) {
        let mut state = self.state();
        let mut notify = Vec::new();
        state.rooms.retain(|key, room| {
            if room.remove(conn) {
                info!(event = "peer_left", key = %key, conn = %conn, "Participant left room");
                notify.extend(room.participants().iter().cloned());
                if room.is_empty() {
                    info!(event = "room_deleted", key = %key, "Room deleted");
                    return false;
                }
            }
            true
        });
        state.limiter.remove(conn);
        state.outboxes.remove(conn);
        for other in notify {
            state.deliver(&other, ServerMessage::PeerLeft { id: conn.clone() });
        }
    }

    /// Parse and execute one text frame, replying on the caller's outbox.
    pub fn handle_text(&self, conn: &ConnectionId, text: &str) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                let mut state = self.state();
                let reply = match state.charge(conn) {
                    Err(limited) => limited.to_message(),
                    Ok(()) => {
                        debug!(conn = %conn, error = %e, "Malformed broker message");
                        BrokerError::Validation(format!("malformed message: {e}")).to_message()
                    }
                };
                state.deliver(conn, reply);
                return;
            }
        };

        let reply = match msg {
            ClientMessage::CreateRoom { key } => self
                .create(conn, &key)
                .map(|key| ServerMessage::room_created(&key)),
            ClientMessage::JoinRoom { key } => match self.join(conn, &key) {
                Err(BrokerError::NotFound) => Ok(ServerMessage::RoomNotFound {
                    key: key.trim().to_ascii_lowercase(),
                }),
                other => other.map(|key| ServerMessage::room_joined(&key)),
            },
            ClientMessage::Signal { key, to, data } => {
                match self.relay(conn, &key, to.as_ref(), data) {
                    Ok(_) => return,
                    Err(e) => Err(e),
                }
            }
        };

        let reply = reply.unwrap_or_else(|e| e.to_message());
        self.state().deliver(conn, reply);
    }

    pub fn room_count(&self) -> usize {
        self.state().rooms.len()
    }

    pub fn participants(&self, key: &RoomKey) -> Vec<ConnectionId> {
        self.state()
            .rooms
            .get(key)
            .map(|room| room.participants().to_vec())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.state().outboxes.len()
    }
}

fn validate_payload(data: &serde_json::Value) -> Result<(), BrokerError> {
    match data {
        serde_json::Value::Null => Err(BrokerError::Validation("signal payload is required".into())),
        serde_json::Value::Object(fields) if fields.len() > MAX_SIGNAL_FIELDS => {
            Err(BrokerError::Validation(format!(
                "signal payload has {} fields, at most {MAX_SIGNAL_FIELDS} allowed",
                fields.len()
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_create_join_then_capacity() {
        let broker = Broker::default();
        let (a, mut a_rx) = broker.connect();
        let (b, mut b_rx) = broker.connect();
        let (c, _c_rx) = broker.connect();

        assert_eq!(broker.create(&a, "ROOM1234").unwrap().as_str(), "room1234");
        assert_eq!(broker.join(&b, "room1234").unwrap().as_str(), "room1234");
        assert_eq!(broker.join(&c, "room1234"), Err(BrokerError::Capacity));
        assert_eq!(broker.create(&c, "room1234"), Err(BrokerError::Capacity));

        assert_eq!(drain(&mut a_rx), vec![ServerMessage::PeerJoined { id: b.clone() }]);
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(broker.participants(&RoomKey::parse("room1234").unwrap()), vec![a, b]);
    }

    #[tokio::test]
    async fn test_invalid_keys_register_nothing() {
        let broker = Broker::default();
        let (a, _rx) = broker.connect();
        for bad in ["abc", "toolongkey123", "ab!@#$%"] {
            assert!(matches!(broker.create(&a, bad), Err(BrokerError::Validation(_))));
            assert!(matches!(broker.join(&a, bad), Err(BrokerError::Validation(_))));
        }
        assert_eq!(broker.room_count(), 0);
    }

    #[tokio::test]
    async fn test_join_missing_room() {
        let broker = Broker::default();
        let (a, mut rx) = broker.connect();
        assert_eq!(broker.join(&a, "nothere1"), Err(BrokerError::NotFound));

        broker.handle_text(&a, r#"{"type":"join-room","key":"NOTHERE1"}"#);
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::RoomNotFound { key: "nothere1".into() }]
        );
    }

    #[tokio::test]
    async fn test_repeated_create_is_idempotent() {
        let broker = Broker::default();
        let (a, _rx) = broker.connect();
        broker.create(&a, "abcdefgh").unwrap();
        broker.create(&a, "abcdefgh").unwrap();
        assert_eq!(broker.participants(&RoomKey::parse("abcdefgh").unwrap()).len(), 1);
    }

    #[tokio::test]
    async fn test_relay_broadcast_and_target() {
        let broker = Broker::default();
        let (a, mut a_rx) = broker.connect();
        let (b, mut b_rx) = broker.connect();
        broker.create(&a, "relay123").unwrap();
        broker.join(&b, "relay123").unwrap();
        drain(&mut a_rx);

        let data = json!({"kind": "offer", "sdp": "v=0"});
        assert_eq!(broker.relay(&a, "relay123", None, data.clone()).unwrap(), 1);
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::Signal { from: a.clone(), data: data.clone() }]
        );

        assert_eq!(broker.relay(&b, "relay123", Some(&a), data.clone()).unwrap(), 1);
        assert_eq!(drain(&mut a_rx).len(), 1);

        let stranger = ConnectionId::from("stranger");
        assert!(matches!(
            broker.relay(&a, "relay123", Some(&stranger), data.clone()),
            Err(BrokerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_requires_membership_and_sane_payload() {
        let broker = Broker::default();
        let (a, _a_rx) = broker.connect();
        let (outsider, _o_rx) = broker.connect();
        broker.create(&a, "secure12").unwrap();

        assert_eq!(
            broker.relay(&outsider, "secure12", None, json!({"x": 1})),
            Err(BrokerError::Unauthorized)
        );
        assert!(matches!(
            broker.relay(&a, "secure12", None, serde_json::Value::Null),
            Err(BrokerError::Validation(_))
        ));

        let big: serde_json::Map<String, serde_json::Value> = (0..=MAX_SIGNAL_FIELDS)
            .map(|i| (format!("f{i}"), json!(i)))
            .collect();
        assert!(matches!(
            broker.relay(&a, "secure12", None, serde_json::Value::Object(big)),
            Err(BrokerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_teardown_notifies_and_deletes_empty_room() {
        let broker = Broker::default();
        let (a, _a_rx) = broker.connect();
        let (b, mut b_rx) = broker.connect();
        broker.create(&a, "bye12345").unwrap();
        broker.join(&b, "bye12345").unwrap();

        broker.teardown(&a);
        assert_eq!(drain(&mut b_rx), vec![ServerMessage::PeerLeft { id: a.clone() }]);
        assert_eq!(broker.room_count(), 1);

        broker.teardown(&b);
        assert_eq!(broker.room_count(), 0);
        assert_eq!(broker.connection_count(), 0);

        // The key is free again.
        let (c, _c_rx) = broker.connect();
        assert_eq!(broker.join(&c, "bye12345"), Err(BrokerError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_operation_is_rate_limited() {
        let broker = Broker::default();
        let (a, mut rx) = broker.connect();
        broker.create(&a, "limit123").unwrap();
        for _ in 0..9 {
            broker.relay(&a, "limit123", None, json!({"n": 1})).unwrap();
        }
        let err = broker.join(&a, "limit123").unwrap_err();
        assert!(matches!(err, BrokerError::RateLimited { .. }));

        broker.handle_text(&a, r#"{"type":"create-room","key":"other123"}"#);
        match drain(&mut rx).pop() {
            Some(ServerMessage::Error { kind, retry_after_ms, .. }) => {
                assert_eq!(kind, ErrorKind::RateLimited);
                assert!(retry_after_ms.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(broker.room_count(), 1);

        tokio::time::advance(CONNECTION_RATE_WINDOW + Duration::from_secs(1)).await;
        broker.create(&a, "other123").unwrap();
    }

    #[tokio::test]
    async fn test_malformed_messages_get_validation_error() {
        let broker = Broker::default();
        let (a, mut rx) = broker.connect();
        broker.handle_text(&a, "not json");
        broker.handle_text(&a, r#"{"type":"create-room"}"#);
        broker.handle_text(&a, r#"{"type":"create-room","key":"abc"}"#);

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 3);
        for reply in replies {
            assert!(matches!(
                reply,
                ServerMessage::Error { kind: ErrorKind::Validation, .. }
            ));
        }
    }
}
