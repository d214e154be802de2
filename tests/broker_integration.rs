use duodrop::core::broker::protocol::{ClientMessage, ErrorKind, ServerMessage};
use duodrop::core::broker::room::RoomKey;
use duodrop::core::broker::server::{BrokerConfig, BrokerServer};
use duodrop::core::broker::BrokerLimits;
use duodrop::core::connection::signaling::SignalingClient;
use duodrop::utils::sos::SignalOfStop;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_broker() -> (SocketAddr, SignalOfStop) {
    start_broker_with(BrokerConfig::default()).await
}

async fn start_broker_with(config: BrokerConfig) -> (SocketAddr, SignalOfStop) {
    let sos = SignalOfStop::new();
    let config = BrokerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        ..config
    };
    let server = BrokerServer::bind(config, sos.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    (addr, sos)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::Text(serde_json::to_string(msg).unwrap()))
        .await
        .unwrap();
}

async fn next(ws: &mut Ws) -> ServerMessage {
    let read = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("broker connection ended: {other:?}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("broker reply")
}

#[tokio::test]
async fn test_rendezvous_and_signal_relay() {
    let (addr, sos) = start_broker().await;
    let mut creator = connect(addr).await;
    let mut joiner = connect(addr).await;

    send(&mut creator, &ClientMessage::CreateRoom { key: "AbCd1234".into() }).await;
    assert_eq!(
        next(&mut creator).await,
        ServerMessage::RoomCreated { key: "abcd1234".into() }
    );

    send(&mut joiner, &ClientMessage::JoinRoom { key: "abcd1234".into() }).await;
    assert_eq!(
        next(&mut joiner).await,
        ServerMessage::RoomJoined { key: "abcd1234".into() }
    );
    let joiner_id = match next(&mut creator).await {
        ServerMessage::PeerJoined { id } => id,
        other => panic!("expected peer-joined, got {other:?}"),
    };

    let offer = json!({"type": "offer", "sdp": "v=0"});
    send(
        &mut creator,
        &ClientMessage::Signal {
            key: "abcd1234".into(),
            to: Some(joiner_id.clone()),
            data: offer.clone(),
        },
    )
    .await;
    let creator_id = match next(&mut joiner).await {
        ServerMessage::Signal { from, data } => {
            assert_eq!(data, offer);
            from
        }
        other => panic!("expected signal, got {other:?}"),
    };

    joiner.close(None).await.unwrap();
    assert_eq!(
        next(&mut creator).await,
        ServerMessage::PeerLeft { id: joiner_id }
    );
    assert_ne!(creator_id.to_string(), "");
    sos.cancel();
}

#[tokio::test]
async fn test_third_participant_rejected_and_unknown_room_reported() {
    let (addr, sos) = start_broker().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;

    send(&mut a, &ClientMessage::CreateRoom { key: "room0001".into() }).await;
    next(&mut a).await;
    send(&mut b, &ClientMessage::JoinRoom { key: "room0001".into() }).await;
    next(&mut b).await;

    send(&mut c, &ClientMessage::JoinRoom { key: "room0001".into() }).await;
    match next(&mut c).await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Capacity),
        other => panic!("expected capacity error, got {other:?}"),
    }

    send(&mut c, &ClientMessage::JoinRoom { key: "nothere1".into() }).await;
    assert_eq!(
        next(&mut c).await,
        ServerMessage::RoomNotFound { key: "nothere1".into() }
    );

    send(&mut c, &ClientMessage::JoinRoom { key: "bad".into() }).await;
    match next(&mut c).await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Validation),
        other => panic!("expected validation error, got {other:?}"),
    }
    sos.cancel();
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, sos) = start_broker().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with(r#"{"ok":true}"#), "{response}");
    sos.cancel();
}

#[tokio::test]
async fn test_waiting_join_outlasts_connection_rate_limit() {
    let (addr, sos) = start_broker_with(BrokerConfig {
        connection_limits: BrokerLimits {
            operations: 3,
            window: Duration::from_secs(1),
        },
        ..Default::default()
    })
    .await;

    let mut joiner = SignalingClient::connect(&format!("ws://{addr}/")).await.unwrap();
    joiner.set_join_retry_interval(Duration::from_millis(100));
    let key = RoomKey::parse("late1234").unwrap();
    let started = tokio::time::Instant::now();
    let waiting = tokio::spawn(async move {
        let joined = joiner.join_room_waiting(&key, Duration::from_secs(10)).await;
        (joined, joiner)
    });

    // Long enough for the joiner to exhaust its budget at least once.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let mut creator = connect(addr).await;
    send(&mut creator, &ClientMessage::CreateRoom { key: "late1234".into() }).await;
    assert_eq!(
        next(&mut creator).await,
        ServerMessage::RoomCreated { key: "late1234".into() }
    );

    let (joined, joiner) = waiting.await.unwrap();
    assert_eq!(joined.unwrap().as_str(), "late1234");
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert!(matches!(next(&mut creator).await, ServerMessage::PeerJoined { .. }));
    joiner.close().await.unwrap();
    sos.cancel();
}
