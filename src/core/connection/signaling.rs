//! WebSocket client for the signaling broker.

use crate::core::broker::protocol::{ClientMessage, ErrorKind, ServerMessage};
use crate::core::broker::room::{ConnectionId, RoomKey};
use crate::core::config::JOIN_RETRY_INTERVAL;
use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(RoomKey),
    NotFound,
    /// The broker refused the attempt; retry after the hint.
    RateLimited(Duration),
}

pub struct SignalingClient {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    /// Messages read while waiting for something else.
    backlog: VecDeque<ServerMessage>,
    join_retry: Duration,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to broker at {url}"))?;
        info!(event = "broker_connected", %url, "Connected to signaling broker");
        let (sink, stream) = ws.split();
        Ok(Self {
            sink,
            stream,
            backlog: VecDeque::new(),
            join_retry: JOIN_RETRY_INTERVAL,
        })
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.sink.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<ServerMessage> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .with_context(|| format!("unexpected broker message: {text}"));
                }
                Some(Ok(Message::Close(_))) | None => bail!("broker closed the connection"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("broker connection failed"),
            }
        }
    }

    /// Return the first message `pick` accepts, from the backlog first and
    /// then from the wire. Everything else is kept for later.
    async fn expect<T>(
        &mut self,
        mut pick: impl FnMut(&ServerMessage) -> Option<Result<T>>,
    ) -> Result<T> {
        if let Some(i) = self.backlog.iter().position(|m| pick(m).is_some()) {
            if let Some(msg) = self.backlog.remove(i) {
                if let Some(result) = pick(&msg) {
                    return result;
                }
            }
        }
        loop {
            let msg = self.read().await?;
            match pick(&msg) {
                Some(result) => return result,
                None => self.backlog.push_back(msg),
            }
        }
    }

    pub async fn create_room(&mut self, key: &RoomKey) -> Result<RoomKey> {
        self.send(&ClientMessage::CreateRoom {
            key: key.to_string(),
        })
        .await?;
        self.expect(|msg| match msg {
            ServerMessage::RoomCreated { key } => Some(RoomKey::parse(key).map_err(Into::into)),
            ServerMessage::Error { message, .. } => Some(Err(anyhow!("create-room failed: {message}"))),
            _ => None,
        })
        .await
    }

    pub async fn join_room(&mut self, key: &RoomKey) -> Result<JoinOutcome> {
        self.send(&ClientMessage::JoinRoom {
            key: key.to_string(),
        })
        .await?;
        self.expect(|msg| match msg {
            ServerMessage::RoomJoined { key } => {
                Some(RoomKey::parse(key).map(JoinOutcome::Joined).map_err(Into::into))
            }
            ServerMessage::RoomNotFound { .. } => Some(Ok(JoinOutcome::NotFound)),
            ServerMessage::Error {
                kind: ErrorKind::RateLimited,
                retry_after_ms,
                ..
            } => Some(Ok(JoinOutcome::RateLimited(Duration::from_millis(
                retry_after_ms.unwrap_or_default(),
            )))),
            ServerMessage::Error { message, .. } => Some(Err(anyhow!("join-room failed: {message}"))),
            _ => None,
        })
        .await
    }

    /// Pause between join attempts while the room does not exist yet.
    pub fn set_join_retry_interval(&mut self, interval: Duration) {
        self.join_retry = interval;
    }

    /// Keep joining until the creator has opened the room.
    ///
    /// Rate-limit refusals are waited out using the broker's hint, so only
    /// `wait` bounds how long this keeps trying.
    pub async fn join_room_waiting(&mut self, key: &RoomKey, wait: Duration) -> Result<RoomKey> {
        let deadline = Instant::now() + wait;
        loop {
            let pause = match self.join_room(key).await? {
                JoinOutcome::Joined(key) => return Ok(key),
                JoinOutcome::NotFound => {
                    debug!(%key, "Room not found yet, retrying");
                    self.join_retry
                }
                JoinOutcome::RateLimited(hint) => {
                    debug!(%key, ?hint, "Join attempts rate limited, backing off");
                    hint.max(self.join_retry)
                }
            };
            let now = Instant::now();
            if now >= deadline {
                bail!("room {key} was not created within {wait:?}");
            }
            tokio::time::sleep(pause.min(deadline - now)).await;
        }
    }

    pub async fn wait_for_peer(&mut self) -> Result<ConnectionId> {
        self.expect(|msg| match msg {
            ServerMessage::PeerJoined { id } => Some(Ok(id.clone())),
            _ => None,
        })
        .await
    }

    pub async fn signal(
        &mut self,
        key: &RoomKey,
        to: Option<&ConnectionId>,
        data: serde_json::Value,
    ) -> Result<()> {
        self.send(&ClientMessage::Signal {
            key: key.to_string(),
            to: to.cloned(),
            data,
        })
        .await
    }

    /// Next relayed signal. Fails if the peer leaves or the broker reports
    /// an error first.
    pub async fn wait_signal(&mut self) -> Result<(ConnectionId, serde_json::Value)> {
        self.expect(|msg| match msg {
            ServerMessage::Signal { from, data } => Some(Ok((from.clone(), data.clone()))),
            ServerMessage::PeerLeft { id } => Some(Err(anyhow!("peer {id} left before signaling finished"))),
            ServerMessage::Error { message, .. } => Some(Err(anyhow!("signal failed: {message}"))),
            _ => None,
        })
        .await
    }

    pub async fn close(mut self) -> Result<()> {
        self.sink.send(Message::Close(None)).await?;
        Ok(())
    }
}
