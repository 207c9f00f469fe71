//! Discord gateway client.
//!
//! ```text
//! GET /gateway/bot ──► websocket ──► HELLO ──► IDENTIFY ──► READY
//!   (401 = bad token)                              │
//!                                                  ├─► heartbeat task (op 1 every interval)
//!                                                  └─► reader task (op 0 ──► GatewayEvent)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::gateway::{
    Gateway, GatewayConnection, GatewayEvent, GatewaySession, Intents, OutboundAction, ReadyInfo,
};

const GATEWAY_VERSION: &str = "10";
const EVENT_BUFFER: usize = 256;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;

/// Close codes that mean the credential or requested intents were refused.
const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
const CLOSE_INVALID_INTENTS: u16 = 4013;
const CLOSE_DISALLOWED_INTENTS: u16 = 4014;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default)]
    s: Option<i64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayBotResponse {
    url: String,
}

/// Gateway backed by Discord's REST API and websocket gateway.
pub struct DiscordGateway {
    http: reqwest::Client,
    api_base_url: String,
    connect_timeout: Duration,
}

impl DiscordGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.connect_timeout)
            .user_agent(concat!("DiscordBot (bothost, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()?;
        Ok(Self {
            http,
            api_base_url: config.api_base_url.clone(),
            connect_timeout: config.connect_timeout,
        })
    }

    async fn gateway_url(&self, credential: &SecretString) -> Result<String, GatewayError> {
        let response = self
            .http
            .get(format!("{}/gateway/bot", self.api_base_url))
            .header("Authorization", bot_authorization(credential))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::AuthenticationFailure {
                reason: format!("credential rejected (HTTP {})", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(GatewayError::Connection(format!(
                "gateway lookup failed (HTTP {})",
                status.as_u16()
            )));
        }

        let body: GatewayBotResponse = response.json().await?;
        let mut url = url::Url::parse(&body.url)
            .map_err(|e| GatewayError::Protocol(format!("invalid gateway url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("v", GATEWAY_VERSION)
            .append_pair("encoding", "json");
        Ok(url.to_string())
    }

    async fn handshake(
        &self,
        credential: &SecretString,
        intents: Intents,
    ) -> Result<GatewayConnection, GatewayError> {
        let url = self.gateway_url(credential).await?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        let hello = read_payload(&mut source).await?;
        if hello.op != OP_HELLO {
            return Err(GatewayError::Protocol(format!(
                "expected HELLO, got op {}",
                hello.op
            )));
        }
        let heartbeat_ms = hello
            .d
            .get("heartbeat_interval")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| GatewayError::Protocol("HELLO without heartbeat_interval".into()))?;

        let identify = json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": credential.expose_secret(),
                "intents": intents.0,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "bothost",
                    "device": "bothost",
                },
            },
        });
        sink.send(Message::text(identify.to_string()))
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        let sequence = Arc::new(AtomicI64::new(-1));
        let ready = loop {
            let payload = read_payload(&mut source).await?;
            if let Some(s) = payload.s {
                sequence.store(s, Ordering::SeqCst);
            }
            match (payload.op, payload.t.as_deref()) {
                (OP_DISPATCH, Some("READY")) => break parse_ready(&payload.d)?,
                (OP_INVALID_SESSION, _) => {
                    return Err(GatewayError::AuthenticationFailure {
                        reason: "session invalidated during identify".to_string(),
                    });
                }
                _ => continue,
            }
        };

        let sink = Arc::new(Mutex::new(sink));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&sink),
            Arc::clone(&sequence),
            Duration::from_millis(heartbeat_ms),
        ));
        let reader = tokio::spawn(reader_loop(
            source,
            Arc::clone(&sink),
            Arc::clone(&sequence),
            events_tx,
        ));

        let session = DiscordSession {
            http: self.http.clone(),
            api_base_url: self.api_base_url.clone(),
            credential: credential.clone(),
            sink,
            tasks: std::sync::Mutex::new(vec![heartbeat, reader]),
            closed: AtomicBool::new(false),
        };

        Ok(GatewayConnection {
            session: Arc::new(session),
            events: events_rx,
            ready,
        })
    }
}

#[async_trait]
impl Gateway for DiscordGateway {
    async fn login(
        &self,
        credential: &SecretString,
        intents: Intents,
    ) -> Result<GatewayConnection, GatewayError> {
        let timeout_ms = self.connect_timeout.as_millis() as u64;
        tokio::time::timeout(self.connect_timeout, self.handshake(credential, intents))
            .await
            .map_err(|_| GatewayError::Timeout { timeout_ms })?
    }
}

struct DiscordSession {
    http: reqwest::Client,
    api_base_url: String,
    credential: SecretString,
    sink: Arc<Mutex<WsSink>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl GatewaySession for DiscordSession {
    async fn perform(&self, action: OutboundAction) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Closed);
        }
        match action {
            OutboundAction::SendMessage { channel_id, body } => {
                let response = self
                    .http
                    .post(format!(
                        "{}/channels/{}/messages",
                        self.api_base_url,
                        urlencode_segment(&channel_id)
                    ))
                    .header("Authorization", bot_authorization(&self.credential))
                    .json(&body)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(GatewayError::Protocol(format!(
                        "send message failed (HTTP {})",
                        status.as_u16()
                    )));
                }
                Ok(())
            }
        }
    }

    async fn destroy(&self) -> Result<(), GatewayError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in &tasks {
            task.abort();
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            tracing::debug!("Gateway close frame not delivered: {}", e);
        }
        sink.close()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }
}

fn bot_authorization(credential: &SecretString) -> String {
    format!("Bot {}", credential.expose_secret())
}

fn urlencode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

fn parse_ready(d: &serde_json::Value) -> Result<ReadyInfo, GatewayError> {
    let field = |path: &[&str]| -> Option<String> {
        let mut value = d;
        for key in path {
            value = value.get(key)?;
        }
        value.as_str().map(str::to_string)
    };
    Ok(ReadyInfo {
        user_id: field(&["user", "id"])
            .ok_or_else(|| GatewayError::Protocol("READY without user id".into()))?,
        username: field(&["user", "username"]).unwrap_or_default(),
        session_id: field(&["session_id"]).unwrap_or_default(),
    })
}

fn close_error(code: Option<u16>) -> GatewayError {
    match code {
        Some(CLOSE_AUTHENTICATION_FAILED) => GatewayError::AuthenticationFailure {
            reason: "gateway closed with authentication failure".to_string(),
        },
        Some(CLOSE_INVALID_INTENTS | CLOSE_DISALLOWED_INTENTS) => {
            GatewayError::AuthenticationFailure {
                reason: "requested intents are invalid or not enabled for this bot".to_string(),
            }
        }
        Some(code) => GatewayError::Connection(format!("gateway closed with code {code}")),
        None => GatewayError::Closed,
    }
}

async fn read_payload(source: &mut WsSource) -> Result<GatewayPayload, GatewayError> {
    while let Some(message) = source.next().await {
        match message.map_err(|e| GatewayError::Connection(e.to_string()))? {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| GatewayError::Protocol(e.to_string()));
            }
            Message::Close(frame) => return Err(close_error(frame.map(|f| u16::from(f.code)))),
            _ => continue,
        }
    }
    Err(GatewayError::Closed)
}

fn heartbeat_frame(sequence: &AtomicI64) -> Message {
    let seq = sequence.load(Ordering::SeqCst);
    let d = if seq < 0 { json!(null) } else { json!(seq) };
    Message::text(json!({ "op": OP_HEARTBEAT, "d": d }).to_string())
}

async fn heartbeat_loop(sink: Arc<Mutex<WsSink>>, sequence: Arc<AtomicI64>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let frame = heartbeat_frame(&sequence);
        if let Err(e) = sink.lock().await.send(frame).await {
            tracing::warn!("Gateway heartbeat failed: {}", e);
            return;
        }
    }
}

async fn reader_loop(
    mut source: WsSource,
    sink: Arc<Mutex<WsSink>>,
    sequence: Arc<AtomicI64>,
    events: mpsc::Sender<GatewayEvent>,
) {
    loop {
        let payload = match read_payload(&mut source).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Gateway connection ended: {}", e);
                return;
            }
        };
        if let Some(s) = payload.s {
            sequence.store(s, Ordering::SeqCst);
        }
        match payload.op {
            OP_DISPATCH => {
                let Some(name) = payload.t else { continue };
                let event = GatewayEvent {
                    name,
                    payload: payload.d,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            OP_HEARTBEAT => {
                let frame = heartbeat_frame(&sequence);
                if let Err(e) = sink.lock().await.send(frame).await {
                    tracing::warn!("Gateway heartbeat reply failed: {}", e);
                    return;
                }
            }
            OP_RECONNECT | OP_INVALID_SESSION => {
                tracing::warn!(op = payload.op, "Gateway asked the session to reconnect");
                return;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ready() {
        let d = json!({
            "user": { "id": "123", "username": "greeter" },
            "session_id": "abc",
        });
        let ready = parse_ready(&d).unwrap();
        assert_eq!(ready.user_id, "123");
        assert_eq!(ready.username, "greeter");
        assert_eq!(ready.session_id, "abc");

        assert!(parse_ready(&json!({ "user": {} })).is_err());
    }

    #[test]
    fn test_close_codes() {
        assert!(matches!(
            close_error(Some(4004)),
            GatewayError::AuthenticationFailure { .. }
        ));
        assert!(matches!(
            close_error(Some(4014)),
            GatewayError::AuthenticationFailure { .. }
        ));
        assert!(matches!(close_error(Some(1000)), GatewayError::Connection(_)));
        assert!(matches!(close_error(None), GatewayError::Closed));
    }

    #[test]
    fn test_heartbeat_frame_carries_sequence() {
        let frame_json = |seq: &AtomicI64| -> serde_json::Value {
            match heartbeat_frame(seq) {
                Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        let seq = AtomicI64::new(-1);
        assert_eq!(frame_json(&seq), json!({ "op": 1, "d": null }));
        seq.store(42, Ordering::SeqCst);
        assert_eq!(frame_json(&seq), json!({ "op": 1, "d": 42 }));
    }

    #[test]
    fn test_payload_deserializes_without_optional_fields() {
        let payload: GatewayPayload =
            serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(payload.op, OP_HELLO);
        assert!(payload.s.is_none());
        assert!(payload.t.is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_lookup_is_authentication_failure() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                )
                .await;
        });

        let gateway = DiscordGateway::new(&GatewayConfig {
            api_base_url: format!("http://{addr}/api/v10"),
            connect_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
        })
        .unwrap();
        let result = gateway
            .login(&SecretString::from("bad-token"), Intents::default_client())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::AuthenticationFailure { .. })
        ));
    }
}
