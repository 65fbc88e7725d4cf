/// Persistent WebSocket session to the OneBot gateway.
///
/// A single reader loop per session routes echo-tagged frames to the caller
/// waiting on that echo and forwards every other frame to the dispatcher as
/// an event. The session is re-established after a fixed delay whenever it
/// drops; while it is down, new calls fail fast. A call that already hit a
/// transport failure keeps backing off until the session is back or its
/// attempts run out.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use jm_shared::errors::GatewayError;
use jm_shared::gateway_protocol::{auth_frame, ApiRequest, ApiResponse, InboundFrame};

use super::GatewayApi;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Exponential backoff for transport-level call failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub access_token: Option<String>,
    pub reconnect_delay: Duration,
    /// How long a single attempt waits for its response frame.
    pub response_timeout: Duration,
    pub retry: RetryPolicy,
}

impl GatewaySettings {
    pub fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

/// Handle to the gateway session. Cheap to clone; all clones share one
/// connection and one pending-call table.
#[derive(Clone)]
pub struct GatewayClient {
    settings: Arc<GatewaySettings>,
    /// Write half of the live session, `None` while disconnected.
    writer: Arc<Mutex<Option<WsSink>>>,
    /// Calls awaiting a response, keyed by echo.
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ApiResponse>>>>,
    next_echo: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
}

impl GatewayClient {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings: Arc::new(settings),
            writer: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_echo: Arc::new(AtomicU64::new(1)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shared flag mirroring the session state, for health reporting.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Keep a session alive, forwarding events into `events`, until the
    /// receiving side of `events` is dropped.
    pub async fn run(&self, events: mpsc::UnboundedSender<Value>) {
        loop {
            match self.connect().await {
                Ok(reader) => {
                    self.read_loop(reader, &events).await;
                    self.invalidate().await;
                }
                Err(e) => error!("{}", e),
            }

            if events.is_closed() {
                info!("Event consumer gone, stopping gateway connection");
                return;
            }
            info!(
                "Reconnecting to gateway in {}s...",
                self.settings.reconnect_delay.as_secs_f32()
            );
            tokio::time::sleep(self.settings.reconnect_delay).await;
        }
    }

    async fn connect(&self) -> Result<SplitStream<WsStream>, GatewayError> {
        let url = self.settings.url();
        info!("Connecting to gateway WebSocket: {}", url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::ConnectFailed(e.to_string()))?;
        if let Some(token) = &self.settings.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| GatewayError::ConnectFailed(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| GatewayError::ConnectFailed(format!("{}: {}", url, e)))?;
        let (mut writer, reader) = ws.split();

        if let Some(token) = &self.settings.access_token {
            writer
                .send(Message::Text(auth_frame(token).to_string().into()))
                .await
                .map_err(|e| GatewayError::SendFailed(e.to_string()))?;
            info!("Sent gateway auth handshake");
        }

        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        info!("Gateway WebSocket connected");
        Ok(reader)
    }

    async fn read_loop(&self, mut reader: SplitStream<WsStream>, events: &mpsc::UnboundedSender<Value>) {
        while let Some(msg) = reader.next().await {
            let text = match msg {
                Ok(Message::Text(t)) => t.to_string(),
                Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                    Ok(s) => s,
                    Err(_) => continue,
                },
                Ok(Message::Close(frame)) => {
                    warn!("Gateway closed the WebSocket: {:?}", frame);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("Gateway WebSocket error: {}", e);
                    break;
                }
            };
            self.route_frame(&text, events).await;
        }
    }

    async fn route_frame(&self, text: &str, events: &mpsc::UnboundedSender<Value>) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Response(response)) => {
                let waiter = self.pending.lock().await.remove(&response.echo);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("No pending call for echo {}", response.echo),
                }
            }
            Ok(InboundFrame::Event(event)) => {
                if events.send(event).is_err() {
                    warn!("Event channel closed, dropping gateway event");
                }
            }
            Err(e) => error!("Failed to parse gateway frame: {}", e),
        }
    }

    /// Drop the session: outbound calls fail fast and in-flight waiters are
    /// released with `ConnectionClosed`.
    async fn invalidate(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().await = None;
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            warn!("Gateway connection lost with {} call(s) in flight", pending.len());
        }
        pending.clear();
    }

    fn next_echo(&self) -> String {
        format!("jm-{}", self.next_echo.fetch_add(1, Ordering::SeqCst))
    }

    /// One send/receive exchange, without retries.
    async fn attempt(&self, action: &str, params: &Value) -> Result<ApiResponse, GatewayError> {
        let echo = self.next_echo();
        let request = ApiRequest::new(action, params.clone(), echo.clone());
        let json = request
            .to_json()
            .map_err(|e| GatewayError::InvalidResponse(format!("unserializable request: {}", e)))?;

        // Register before sending so a fast response cannot be missed.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(echo.clone(), tx);

        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => w
                    .send(Message::Text(json.into()))
                    .await
                    .map_err(|e| GatewayError::SendFailed(e.to_string())),
                None => Err(GatewayError::NotConnected),
            }
        };
        if let Err(e) = sent {
            self.pending.lock().await.remove(&echo);
            return Err(e);
        }
        debug!("Sent gateway call {} (echo {})", action, echo);

        match tokio::time::timeout(self.settings.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&echo);
                Err(GatewayError::Timeout(self.settings.response_timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl GatewayApi for GatewayClient {
    async fn request(&self, action: &str, params: Value) -> Result<ApiResponse, GatewayError> {
        let policy = self.settings.retry;
        let mut retry = 0;
        loop {
            match self.attempt(action, &params).await {
                Ok(response) => return response.into_result(),
                Err(e) if retryable(&e, retry) && retry + 1 < policy.max_attempts => {
                    let delay = policy.delay(retry);
                    warn!(
                        "Gateway call {} failed ({}), retry {}/{} in {}s",
                        action,
                        e,
                        retry + 1,
                        policy.max_attempts - 1,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Transport errors are retried. `NotConnected` only fails fast on the first
/// attempt; after a drop it means the reconnect has not landed yet.
fn retryable(err: &GatewayError, retry: u32) -> bool {
    err.is_transport() || (retry > 0 && matches!(err, GatewayError::NotConnected))
}
