//! HTTP/WebSocket front of the broker.
//!
//! One listener serves three things:
//! - `GET /health` → `{"ok":true}`
//! - a WebSocket upgrade on any path, speaking [`protocol`](super::protocol)
//! - `OPTIONS` preflight for allowed origins
//!
//! Every request first passes the per-address sliding-window budget, then
//! the CORS allow-list, then the body cap. Only then does it reach the
//! broker.

use super::protocol::ServerMessage;
use super::rate_limit::SlidingWindowLimiter;
use super::{Broker, BrokerLimits};
use crate::core::config::{
    CONNECTION_RATE_LIMIT, CONNECTION_RATE_WINDOW, DEFAULT_BROKER_PORT, HTTP_RATE_LIMIT,
    HTTP_RATE_WINDOW, MAX_BODY_BYTES,
};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind: SocketAddr,
    /// Allowed `Origin` values. `*` allows any origin.
    pub allowed_origins: Vec<String>,
    pub http_rate_limit: usize,
    pub http_rate_window: Duration,
    pub connection_limits: BrokerLimits,
    pub max_body_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_BROKER_PORT),
            allowed_origins: vec!["*".into()],
            http_rate_limit: HTTP_RATE_LIMIT as usize,
            http_rate_window: HTTP_RATE_WINDOW,
            connection_limits: BrokerLimits {
                operations: CONNECTION_RATE_LIMIT,
                window: CONNECTION_RATE_WINDOW,
            },
            max_body_bytes: MAX_BODY_BYTES,
        }
    }
}

impl BrokerConfig {
    fn allow_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allow_any_origin()
            || self
                .allowed_origins
                .iter()
                .any(|o| o.trim_end_matches('/') == origin.trim_end_matches('/'))
    }
}

struct Shared {
    broker: Broker,
    config: BrokerConfig,
    http_limiter: Mutex<SlidingWindowLimiter<IpAddr>>,
    sos: SignalOfStop,
}

type HttpResponse = Response<Full<Bytes>>;

pub struct BrokerServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl BrokerServer {
    pub async fn bind(config: BrokerConfig, sos: SignalOfStop) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("failed to bind broker on {}", config.bind))?;
        let shared = Arc::new(Shared {
            broker: Broker::new(config.connection_limits),
            http_limiter: Mutex::new(SlidingWindowLimiter::new(
                config.http_rate_limit,
                config.http_rate_window,
            )),
            config,
            sos,
        });
        Ok(Self { listener, shared })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the stop signal fires.
    pub async fn serve(self) -> Result<()> {
        info!(event = "broker_listening", addr = %self.local_addr()?, "Signaling broker listening");
        let sos = self.shared.sos.clone();
        let mut sweep = tokio::time::interval(self.shared.config.http_rate_window);
        loop {
            tokio::select! {
                _ = sos.wait() => {
                    info!(event = "broker_shutdown", "Signaling broker shutting down");
                    return Ok(());
                }
                _ = sweep.tick() => {
                    self.shared
                        .http_limiter
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .sweep(Instant::now());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(event = "accept_failure", error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| handle(shared.clone(), peer.ip(), req));
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!(peer = %peer, error = %e, "HTTP connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle(
    shared: Arc<Shared>,
    ip: IpAddr,
    mut req: Request<Incoming>,
) -> Result<HttpResponse, Infallible> {
    let checked = shared
        .http_limiter
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .check(&ip, Instant::now());
    if let Err(retry_after) = checked {
        warn!(event = "http_rate_limited", %ip, ?retry_after, "Address over request budget");
        let mut resp = text(StatusCode::TOO_MANY_REQUESTS, "too many requests");
        resp.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(retry_after.as_secs_f64().ceil() as u64),
        );
        return Ok(resp);
    }

    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(origin) = &origin {
        if !shared.config.origin_allowed(origin) {
            debug!(%ip, %origin, "Origin not allowed");
            return Ok(text(StatusCode::FORBIDDEN, "origin not allowed"));
        }
    }

    let mut resp = route(&shared, &mut req).await;
    if let Some(origin) = origin {
        apply_cors(&shared.config, &origin, &mut resp);
    }
    Ok(resp)
}

async fn route(shared: &Arc<Shared>, req: &mut Request<Incoming>) -> HttpResponse {
    if req.method() == Method::OPTIONS {
        return empty(StatusCode::NO_CONTENT);
    }

    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > shared.config.max_body_bytes as u64) {
        return text(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
    }

    if is_websocket_upgrade(req) {
        return upgrade(shared.clone(), req);
    }

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            let mut resp = Response::new(Full::new(Bytes::from_static(br#"{"ok":true}"#)));
            resp.headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let has_token = |name: header::HeaderName, token: &str| {
        req.headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(token))
    };
    has_token(header::CONNECTION, "upgrade")
        && has_token(header::UPGRADE, "websocket")
        && req.headers().contains_key(header::SEC_WEBSOCKET_KEY)
}

fn upgrade(shared: Arc<Shared>, req: &mut Request<Incoming>) -> HttpResponse {
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return text(StatusCode::BAD_REQUEST, "missing websocket key");
    };
    let accept = derive_accept_key(key.as_bytes());
    let on_upgrade = hyper::upgrade::on(req);

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(event = "upgrade_failure", error = %e, "WebSocket upgrade failed");
                return;
            }
        };
        let ws_config = WebSocketConfig {
            max_message_size: Some(shared.config.max_body_bytes),
            max_frame_size: Some(shared.config.max_body_bytes),
            ..Default::default()
        };
        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(ws_config))
            .await;
        run_session(shared, ws).await;
    });

    let mut resp = empty(StatusCode::SWITCHING_PROTOCOLS);
    let headers = resp.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    resp
}

/// Pump one WebSocket until either side closes, then tear the connection
/// down in the broker.
async fn run_session<S>(shared: Arc<Shared>, ws: WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (conn, mut outbox) = shared.broker.connect();
    info!(event = "client_connected", conn = %conn, "Broker client connected");
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = shared.sos.wait() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outgoing = outbox.recv() => {
                let Some(msg) = outgoing else { break };
                if let Err(e) = send_json(&mut sink, &msg).await {
                    debug!(conn = %conn, error = %e, "Failed to write to client");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.broker.handle_text(&conn, &text),
                Some(Ok(Message::Binary(data))) => {
                    shared.broker.handle_text(&conn, &String::from_utf8_lossy(&data))
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %conn, error = %e, "WebSocket read failed");
                    break;
                }
            },
        }
    }

    shared.broker.teardown(&conn);
    info!(event = "client_disconnected", conn = %conn, "Broker client disconnected");
}

async fn send_json<W>(sink: &mut W, msg: &ServerMessage) -> Result<()>
where
    W: futures_util::Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

fn apply_cors(config: &BrokerConfig, origin: &str, resp: &mut HttpResponse) {
    let headers = resp.headers_mut();
    let allow = if config.allow_any_origin() {
        HeaderValue::from_static("*")
    } else {
        match HeaderValue::from_str(origin) {
            Ok(v) => v,
            Err(_) => return,
        }
    };
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
}

fn empty(status: StatusCode) -> HttpResponse {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

fn text(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_allow_list() {
        let config = BrokerConfig {
            allowed_origins: vec!["https://app.example.com/".into()],
            ..Default::default()
        };
        assert!(config.origin_allowed("https://app.example.com"));
        assert!(!config.origin_allowed("https://evil.example.com"));

        let open = BrokerConfig::default();
        assert!(open.origin_allowed("https://anything.test"));
    }
}
