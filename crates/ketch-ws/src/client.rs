//! The client connection actor.
//!
//! One spawned task owns the socket and serializes all frame handling for
//! its connection. Handles are cheap clones that talk to the task through
//! shared state and an outbound channel; correlated sends block their
//! caller, never the connection loop.
//!
//! Lifecycle:
//!
//! ```text
//! connecting --upgrade_ok--> connected
//! connecting --timeout|err--> closed
//! connected  --transport_down--> reconnecting
//! connected  --user_close--> closing --> closed
//! reconnecting --restore_ok--> connected
//! reconnecting --exhausted--> closed
//! ```

use crate::correlator::RequestCorrelator;
use crate::error::{WsError, WsResult};
use crate::heartbeat::{HeartbeatAction, HeartbeatManager, HeartbeatStats};
use crate::message::{self, classify, HeartbeatEvent, Inbound, RequestId, RpcRequest};
use crate::rate_limiter::{simple_cost, RateLimiter};
use crate::reconnect::BackoffSchedule;
use crate::recorder::{Direction, Recorder};
use crate::subscription::SubscriptionManager;
use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, StreamExt};
use ketch_core::{ClientConfig, HeartbeatConfig, LatencySummary};
use ketch_telemetry::metrics::{WS_CONNECTED, WS_RECONNECT_TOTAL, WS_STATE};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Why the connection reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// `close()` was called.
    UserClose,
    /// Every client handle was dropped.
    HandlesDropped,
    /// The reconnection budget ran out (or reconnection is disabled).
    Exhausted,
    /// The initial connect never succeeded.
    ConnectFailed,
}

/// Asynchronous delivery to the subscriber sink.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamData {
    Json(Value),
    Binary(Vec<u8>),
}

/// Result of a successful `send_message`.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The message carried no id; transport accepted the send.
    Ack,
    /// The correlated reply.
    Reply(Value),
}

/// Observability snapshot of one connection.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub id: String,
    pub state: ConnectionState,
    pub channels: Vec<String>,
    pub pending_requests: usize,
    pub reconnect_attempts: u32,
    pub heartbeat: HeartbeatStats,
    pub latency: LatencySummary,
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

enum SessionEnd {
    UserClose { reason: String },
    HandlesDropped,
    TransportDown { reason: &'static str },
}

enum ReconnectOutcome {
    Restored(WsStream),
    Stopped { cause: CloseCause, reason: String },
    Exhausted,
}

struct ClientInner {
    id: String,
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    close_cause: RwLock<Option<CloseCause>>,
    subscriptions: SubscriptionManager,
    correlator: RequestCorrelator,
    heartbeat: HeartbeatManager,
    rate_limiter: Arc<RateLimiter>,
    outbound_tx: mpsc::Sender<Outbound>,
    event_tx: mpsc::Sender<StreamData>,
    request_seq: AtomicU64,
    reconnect_attempts: AtomicU32,
    closed_notify: Notify,
}

/// Handle to one connection actor.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.inner.id).finish()
    }
}

impl Client {
    /// Connect and spawn the connection actor.
    ///
    /// Blocks until the WebSocket upgrade (and authentication, when
    /// configured) completes or `connect_timeout_ms` elapses. Stream data
    /// that is neither heartbeat traffic nor a correlated reply is
    /// delivered through `event_tx`.
    pub async fn connect(
        config: ClientConfig,
        event_tx: mpsc::Sender<StreamData>,
    ) -> WsResult<Client> {
        let limiter = RateLimiter::shared(&config.rate_limit, simple_cost());
        Self::connect_with_limiter(config, event_tx, limiter).await
    }

    /// Connect using an explicit (typically shared) rate limiter, e.g. one
    /// built with an exchange-specific cost function.
    pub async fn connect_with_limiter(
        config: ClientConfig,
        event_tx: mpsc::Sender<StreamData>,
        rate_limiter: Arc<RateLimiter>,
    ) -> WsResult<Client> {
        config.validate()?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let inner = Arc::new(ClientInner {
            id: Uuid::new_v4().to_string(),
            correlator: RequestCorrelator::new(config.latency_buffer_size),
            heartbeat: HeartbeatManager::new(config.heartbeat),
            subscriptions: SubscriptionManager::new(),
            state: RwLock::new(ConnectionState::Connecting),
            close_cause: RwLock::new(None),
            rate_limiter,
            outbound_tx,
            event_tx,
            request_seq: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            closed_notify: Notify::new(),
            config,
        });
        WS_STATE
            .with_label_values(&[ConnectionState::Connecting.as_str()])
            .inc();

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_client(inner.clone(), outbound_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Client { inner }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WsError::Disconnected),
        }
    }

    /// Connection id, unique per supervisor.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Why the terminal state was reached, once it has been.
    pub fn close_cause(&self) -> Option<CloseCause> {
        *self.inner.close_cause.read()
    }

    /// Resolve once the connection reaches its terminal state.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.inner.closed_notify.notified();
            if *self.inner.state.read() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Observability snapshot.
    pub fn get_state(&self) -> StateSnapshot {
        let inner = &self.inner;
        StateSnapshot {
            id: inner.id.clone(),
            state: *inner.state.read(),
            channels: inner.subscriptions.snapshot(),
            pending_requests: inner.correlator.pending_count(),
            reconnect_attempts: inner.reconnect_attempts.load(Ordering::Relaxed),
            heartbeat: inner.heartbeat.stats(),
            latency: inner.correlator.latency_summary(),
        }
    }

    /// Send one message, metered through the rate limiter.
    ///
    /// A message carrying an `id` blocks until its correlated reply arrives
    /// or `request_timeout_ms` elapses and resolves to
    /// [`SendOutcome::Reply`]; anything else resolves to
    /// [`SendOutcome::Ack`] once the transport accepted it. When the
    /// limiter queue is full the send fails with `RateLimited`.
    pub async fn send_message(&self, msg: Value) -> WsResult<SendOutcome> {
        let inner = &self.inner;
        match *inner.state.read() {
            ConnectionState::Connected => {}
            ConnectionState::Closing | ConnectionState::Closed => return Err(WsError::Closed),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                return Err(WsError::Disconnected)
            }
        }

        let cost = inner.rate_limiter.cost_of(&msg);
        match inner.rate_limiter.acquire(cost).await {
            Ok(()) => {}
            Err(WsError::QueueFull) => return Err(WsError::RateLimited),
            Err(e) => return Err(e),
        }

        let id = msg.get("id").and_then(RequestId::from_value);
        let text = serde_json::to_string(&msg)?;

        let Some(id) = id else {
            inner
                .outbound_tx
                .send(Outbound::Text(text))
                .await
                .map_err(|_| WsError::Closed)?;
            return Ok(SendOutcome::Ack);
        };

        let method = msg
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let request_timeout = Duration::from_millis(inner.config.request_timeout_ms);
        let waiter = inner.correlator.register(id.clone(), &method, request_timeout)?;
        debug!(%id, method = %method, "Request started");

        if inner.outbound_tx.send(Outbound::Text(text)).await.is_err() {
            inner.correlator.cancel(&id);
            return Err(WsError::Closed);
        }

        match timeout(request_timeout, waiter).await {
            Ok(Ok(result)) => result.map(SendOutcome::Reply),
            Ok(Err(_)) => Err(WsError::Disconnected),
            Err(_) => {
                inner.correlator.timeout(&id);
                Err(WsError::RequestTimeout)
            }
        }
    }

    /// Subscribe to channels, updating the tracked set per confirmed ack.
    ///
    /// Already-subscribed channels are skipped. One subscribe message is
    /// sent per channel so restoration can replay the exact sequence.
    pub async fn subscribe(&self, channels: &[&str]) -> WsResult<()> {
        for channel in channels {
            if self.inner.subscriptions.contains(channel) {
                continue;
            }
            let id = next_request_id(&self.inner);
            let req = RpcRequest::subscribe(id, channel);
            let body = self.call_checked(&req).await?;
            self.inner.subscriptions.add(channel);
            info!(
                channel,
                count = self.inner.subscriptions.len(),
                "Subscription added"
            );
            debug!(channel, reply = %body, "Subscribe acknowledged");
        }
        Ok(())
    }

    /// Unsubscribe from channels, updating the tracked set per confirmed
    /// ack.
    pub async fn unsubscribe(&self, channels: &[&str]) -> WsResult<()> {
        for channel in channels {
            if !self.inner.subscriptions.contains(channel) {
                continue;
            }
            let id = next_request_id(&self.inner);
            let req = RpcRequest::unsubscribe(id, channel);
            self.call_checked(&req).await?;
            self.inner.subscriptions.remove(channel);
            info!(
                channel,
                count = self.inner.subscriptions.len(),
                "Subscription removed"
            );
        }
        Ok(())
    }

    /// Drive `connected → closing → closed`, flushing the recorder and
    /// notifying any waiters with `Closed`.
    pub async fn close(&self, reason: &str) -> WsResult<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        let _ = self
            .inner
            .outbound_tx
            .send(Outbound::Close {
                code: CloseCode::Normal.into(),
                reason: reason.to_string(),
            })
            .await;
        self.wait_closed().await;
        Ok(())
    }

    // Correlated call that folds an error reply into WsError.
    async fn call_checked(&self, req: &RpcRequest) -> WsResult<Value> {
        let msg = serde_json::to_value(req)?;
        match self.send_message(msg).await? {
            SendOutcome::Reply(body) => match message::reply_error(&body) {
                Some(err) => Err(WsError::InvalidFrame(format!(
                    "{} rejected: {err}",
                    req.method
                ))),
                None => Ok(body),
            },
            SendOutcome::Ack => Ok(Value::Null),
        }
    }
}

fn next_request_id(inner: &ClientInner) -> RequestId {
    RequestId::Num(inner.request_seq.fetch_add(1, Ordering::Relaxed) + 1)
}

fn set_state(inner: &ClientInner, next: ConnectionState) {
    let mut state = inner.state.write();
    if *state == next {
        return;
    }
    WS_STATE.with_label_values(&[state.as_str()]).dec();
    WS_STATE.with_label_values(&[next.as_str()]).inc();
    debug!(id = %inner.id, from = state.as_str(), to = next.as_str(), "State transition");
    *state = next;
}

async fn forward_event(inner: &ClientInner, data: StreamData) {
    if inner.event_tx.send(data).await.is_err() {
        warn!(id = %inner.id, "Event receiver dropped");
    }
}

fn record_text(recorder: &Option<Recorder>, direction: Direction, payload: &str) {
    if let Some(rec) = recorder {
        rec.record(direction, "text", payload);
    }
}

async fn run_client(
    inner: Arc<ClientInner>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    ready_tx: oneshot::Sender<WsResult<()>>,
) {
    let recorder = match &inner.config.record_to {
        Some(path) => match Recorder::create(path).await {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!(id = %inner.id, path = %path.display(), error = %e, "Session recording disabled");
                None
            }
        },
        None => None,
    };

    // The initial connect does not retry; failure terminates the actor and
    // surfaces the kind to the caller.
    let mut ws = match establish(&inner, &recorder).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(id = %inner.id, url = %inner.config.url, error = %e, "Connect failed");
            finish(&inner, CloseCause::ConnectFailed, "connect_failed");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    set_state(&inner, ConnectionState::Connected);
    WS_CONNECTED.inc();
    info!(id = %inner.id, url = %inner.config.url, "Connected");

    if ready_tx.send(Ok(())).is_err() {
        warn!(id = %inner.id, "Connect caller went away, closing");
        let _ = ws.close(None).await;
        WS_CONNECTED.dec();
        finish(&inner, CloseCause::HandlesDropped, "abandoned");
        return;
    }

    let schedule = BackoffSchedule::from_config(&inner.config);

    loop {
        let end = run_session(&inner, ws, &recorder, &mut outbound_rx).await;
        WS_CONNECTED.dec();

        match end {
            SessionEnd::UserClose { reason } => {
                inner.correlator.drain(WsError::Closed);
                finish(&inner, CloseCause::UserClose, &reason);
                return;
            }
            SessionEnd::HandlesDropped => {
                inner.correlator.drain(WsError::Closed);
                finish(&inner, CloseCause::HandlesDropped, "handles_dropped");
                return;
            }
            SessionEnd::TransportDown { reason } => {
                // In-flight ids are not resumable across transport sessions.
                // When reconnection is off, a heartbeat-caused drop surfaces
                // its own kind to the drained waiters.
                let drain_error = if !inner.config.reconnect_on_error && reason == "heartbeat_timeout"
                {
                    WsError::HeartbeatTimeout
                } else {
                    WsError::Disconnected
                };
                let drained = inner.correlator.drain(drain_error);
                if drained > 0 {
                    debug!(id = %inner.id, drained, "Drained in-flight requests");
                }

                if !inner.config.reconnect_on_error {
                    info!(id = %inner.id, reason, "Reconnection disabled, closing");
                    finish(&inner, CloseCause::Exhausted, reason);
                    return;
                }

                match reconnect(&inner, &recorder, &schedule, &mut outbound_rx, reason).await {
                    ReconnectOutcome::Restored(restored) => {
                        ws = restored;
                        WS_CONNECTED.inc();
                    }
                    ReconnectOutcome::Stopped { cause, reason } => {
                        finish(&inner, cause, &reason);
                        return;
                    }
                    ReconnectOutcome::Exhausted => {
                        finish(&inner, CloseCause::Exhausted, "retries_exhausted");
                        return;
                    }
                }
            }
        }
    }
}

// Terminal teardown: drains stragglers, invokes the disconnect hook, and
// wakes `wait_closed` callers. The recorder flushes when its last handle
// drops with the actor.
fn finish(inner: &Arc<ClientInner>, cause: CloseCause, reason: &str) {
    inner.correlator.drain(WsError::Closed);
    inner.subscriptions.clear();
    inner.close_cause.write().get_or_insert(cause);
    set_state(inner, ConnectionState::Closed);
    info!(id = %inner.id, ?cause, reason, "Connection closed");

    if cause != CloseCause::ConnectFailed {
        if let Some(hook) = &inner.config.on_disconnect {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(reason)));
            if result.is_err() {
                error!(id = %inner.id, "on_disconnect callback panicked");
            }
        }
    }
    inner.closed_notify.notify_waiters();
}

/// Open the socket, perform the WebSocket upgrade, authenticate, and arm
/// server heartbeats. Used for both the initial connect and every
/// reconnection attempt.
async fn establish(inner: &Arc<ClientInner>, recorder: &Option<Recorder>) -> WsResult<WsStream> {
    let config = &inner.config;
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(WsError::from)?;
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| WsError::InvalidConfig(format!("header {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| WsError::InvalidConfig(format!("header {name:?}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    let (mut ws, _response) = match timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(WsError::Timeout),
    };

    // Authentication runs exactly once per transport session, before any
    // user traffic or restoration.
    if let Some(auth) = config.auth.clone() {
        let mut auth_req = auth();
        let id = match auth_req.get("id").and_then(RequestId::from_value) {
            Some(id) => id,
            None => {
                let id = next_request_id(inner);
                if let Some(obj) = auth_req.as_object_mut() {
                    obj.insert("id".to_string(), id.to_value());
                }
                id
            }
        };
        let text = serde_json::to_string(&auth_req)?;
        record_text(recorder, Direction::Out, &text);
        ws.send(Message::Text(text)).await?;

        let body = await_reply(inner, &mut ws, &id, recorder).await?;
        if let Some(err) = message::reply_error(&body) {
            return Err(WsError::AuthFailed(err));
        }
        debug!(id = %inner.id, "Authenticated");
    }

    // The deribit variant needs the server told to start probing.
    if let HeartbeatConfig::Deribit { interval_ms } = config.heartbeat {
        let id = next_request_id(inner);
        let req = RpcRequest::set_heartbeat(id.clone(), interval_ms / 1000);
        let text = serde_json::to_string(&req)?;
        record_text(recorder, Direction::Out, &text);
        ws.send(Message::Text(text)).await?;
        let _ = await_reply(inner, &mut ws, &id, recorder).await?;
        debug!(id = %inner.id, interval_ms, "Server heartbeats armed");
    }

    Ok(ws)
}

/// Pump frames on an unsplit stream until the reply for `want` arrives.
///
/// Used during establishment and restoration, when the session loop is not
/// running. Other traffic is handled as usual: heartbeats answered, stray
/// replies completed, events forwarded.
async fn await_reply(
    inner: &Arc<ClientInner>,
    ws: &mut WsStream,
    want: &RequestId,
    recorder: &Option<Recorder>,
) -> WsResult<Value> {
    let deadline = Instant::now() + Duration::from_millis(inner.config.request_timeout_ms);

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(WsError::RequestTimeout);
        }
        let msg = match timeout(deadline - now, ws.next()).await {
            Err(_) => return Err(WsError::RequestTimeout),
            Ok(None) => return Err(WsError::Disconnected),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                inner.heartbeat.record_activity();
                record_text(recorder, Direction::In, &text);
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(id = %inner.id, error = %e, "Discarding undecodable text frame");
                        continue;
                    }
                };
                match classify(value) {
                    Inbound::Heartbeat(HeartbeatEvent::TestRequest) => {
                        reply_test_request(inner, ws, recorder).await?;
                    }
                    Inbound::Heartbeat(HeartbeatEvent::Notify) => {}
                    Inbound::Reply { id, body } if id == *want => return Ok(body),
                    Inbound::Reply { id, body } => {
                        if !inner.correlator.complete(&id, body.clone()) {
                            forward_event(inner, StreamData::Json(body)).await;
                        }
                    }
                    Inbound::Event { payload } => {
                        forward_event(inner, StreamData::Json(payload)).await;
                    }
                }
            }
            Message::Binary(data) => {
                inner.heartbeat.record_activity();
                forward_event(inner, StreamData::Binary(data)).await;
            }
            Message::Ping(data) => {
                inner.heartbeat.record_activity();
                ws.send(Message::Pong(data)).await?;
            }
            Message::Pong(_) => {
                inner.heartbeat.record_activity();
                inner.heartbeat.record_pong();
            }
            Message::Close(_) => return Err(WsError::Disconnected),
            _ => {}
        }
    }
}

// Answers a server test request immediately, bypassing the rate limiter:
// liveness must not queue behind user traffic.
async fn reply_test_request<S>(
    inner: &Arc<ClientInner>,
    sink: &mut S,
    recorder: &Option<Recorder>,
) -> WsResult<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let req = RpcRequest::heartbeat_reply();
    let text = serde_json::to_string(&req)?;
    record_text(recorder, Direction::Out, &text);
    sink.send(Message::Text(text)).await?;
    let interval_ms = inner.heartbeat.record_test_request();
    debug!(id = %inner.id, interval_ms, "Answered heartbeat test request");
    Ok(())
}

/// One connected transport session: frame dispatch, outbound pump,
/// heartbeat ticks, and the correlator deadline sweep.
async fn run_session(
    inner: &Arc<ClientInner>,
    ws: WsStream,
    recorder: &Option<Recorder>,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    inner.heartbeat.reset();

    let hb_interval = inner.heartbeat.tick_interval();
    let hb_period = hb_interval.unwrap_or(Duration::from_secs(3600));
    let mut hb_ticker = interval_at(Instant::now() + hb_period, hb_period);
    hb_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let sweep_period =
        Duration::from_millis((inner.config.request_timeout_ms / 4).clamp(50, 1000));
    let mut sweep_ticker = interval_at(Instant::now() + sweep_period, sweep_period);
    sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    inner.heartbeat.record_activity();
                    record_text(recorder, Direction::In, &text);
                    if handle_text(inner, &text, &mut write, recorder).await.is_err() {
                        return SessionEnd::TransportDown { reason: "transport_error" };
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    inner.heartbeat.record_activity();
                    if let Some(rec) = recorder {
                        rec.record(Direction::In, "binary", format!("<{} bytes>", data.len()));
                    }
                    forward_event(inner, StreamData::Binary(data)).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    inner.heartbeat.record_activity();
                    if let Some(rec) = recorder {
                        rec.record(Direction::In, "ping", "");
                    }
                    if write.send(Message::Pong(data)).await.is_err() {
                        return SessionEnd::TransportDown { reason: "transport_error" };
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    inner.heartbeat.record_activity();
                    if let Some(rtt_ms) = inner.heartbeat.record_pong() {
                        debug!(id = %inner.id, rtt_ms, "Heartbeat pong");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1000, String::new()));
                    warn!(id = %inner.id, code, %reason, "Close frame from server");
                    if let Some(rec) = recorder {
                        rec.record(Direction::In, "close", reason);
                    }
                    return SessionEnd::TransportDown { reason: "server_close" };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(id = %inner.id, error = %e, "Transport read error");
                    return SessionEnd::TransportDown { reason: "transport_error" };
                }
                None => {
                    warn!(id = %inner.id, "Transport stream ended");
                    return SessionEnd::TransportDown { reason: "stream_ended" };
                }
            },

            out = outbound_rx.recv() => match out {
                Some(Outbound::Text(text)) => {
                    record_text(recorder, Direction::Out, &text);
                    if let Err(e) = write.send(Message::Text(text)).await {
                        error!(id = %inner.id, error = %e, "Transport write error");
                        return SessionEnd::TransportDown { reason: "transport_error" };
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    set_state(inner, ConnectionState::Closing);
                    if let Some(rec) = recorder {
                        rec.record(Direction::Out, "close", reason.clone());
                    }
                    let _ = write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        })))
                        .await;
                    return SessionEnd::UserClose { reason };
                }
                None => return SessionEnd::HandlesDropped,
            },

            _ = hb_ticker.tick(), if hb_interval.is_some() => {
                match inner.heartbeat.on_tick() {
                    HeartbeatAction::SendPing => {
                        if let Some(rec) = recorder {
                            rec.record(Direction::Out, "ping", "");
                        }
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            return SessionEnd::TransportDown { reason: "transport_error" };
                        }
                        inner.heartbeat.record_ping_sent();
                        debug!(id = %inner.id, "Heartbeat ping sent");
                    }
                    HeartbeatAction::Reconnect => {
                        error!(id = %inner.id, "Heartbeat timeout");
                        return SessionEnd::TransportDown { reason: "heartbeat_timeout" };
                    }
                    HeartbeatAction::None => {}
                }
            },

            _ = sweep_ticker.tick() => {
                let expired = inner.correlator.sweep_expired();
                if expired > 0 {
                    debug!(id = %inner.id, expired, "Expired requests swept");
                }
            }
        }
    }
}

// Inbound text dispatch: heartbeat classifier first, then the correlator,
// then the subscriber sink. Errors here are transport write failures.
async fn handle_text(
    inner: &Arc<ClientInner>,
    text: &str,
    write: &mut WsSink,
    recorder: &Option<Recorder>,
) -> WsResult<()> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(id = %inner.id, error = %e, "Discarding undecodable text frame");
            return Ok(());
        }
    };

    match classify(value) {
        Inbound::Heartbeat(HeartbeatEvent::TestRequest) => {
            reply_test_request(inner, write, recorder).await
        }
        Inbound::Heartbeat(HeartbeatEvent::Notify) => Ok(()),
        Inbound::Reply { id, body } => {
            if !inner.correlator.complete(&id, body.clone()) {
                // Late or unsolicited reply: hand it to the subscriber sink.
                forward_event(inner, StreamData::Json(body)).await;
            }
            Ok(())
        }
        Inbound::Event { payload } => {
            forward_event(inner, StreamData::Json(payload)).await;
            Ok(())
        }
    }
}

/// Backoff, re-open, re-auth, re-subscribe. Loops until restored, stopped
/// by the user, or exhausted.
async fn reconnect(
    inner: &Arc<ClientInner>,
    recorder: &Option<Recorder>,
    schedule: &BackoffSchedule,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    down_reason: &'static str,
) -> ReconnectOutcome {
    set_state(inner, ConnectionState::Reconnecting);
    let mut attempt: u32 = 0;

    loop {
        let delay = match schedule.delay(attempt) {
            Some(delay) => delay,
            None => {
                error!(id = %inner.id, attempt, "Reconnection attempts exhausted");
                return ReconnectOutcome::Exhausted;
            }
        };
        inner.reconnect_attempts.store(attempt + 1, Ordering::Relaxed);
        WS_RECONNECT_TOTAL.with_label_values(&[down_reason]).inc();
        warn!(
            id = %inner.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = down_reason,
            "Reconnecting"
        );

        // The backoff sleep stays responsive to close().
        let backoff = sleep(delay);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                out = outbound_rx.recv() => match out {
                    Some(Outbound::Close { reason, .. }) => {
                        return ReconnectOutcome::Stopped { cause: CloseCause::UserClose, reason };
                    }
                    // Sends are rejected while reconnecting; drop stragglers.
                    Some(Outbound::Text(_)) => {}
                    None => {
                        return ReconnectOutcome::Stopped {
                            cause: CloseCause::HandlesDropped,
                            reason: "handles_dropped".to_string(),
                        };
                    }
                }
            }
        }

        match establish(inner, recorder).await {
            Ok(mut ws) => {
                if inner.config.restore_subscriptions && !inner.subscriptions.is_empty() {
                    if let Err(e) = restore_subscriptions(inner, &mut ws, recorder).await {
                        warn!(id = %inner.id, error = %e, "Subscription restore failed");
                        attempt += 1;
                        continue;
                    }
                }
                set_state(inner, ConnectionState::Connected);
                inner.reconnect_attempts.store(0, Ordering::Relaxed);
                info!(id = %inner.id, "Reconnected");
                return ReconnectOutcome::Restored(ws);
            }
            Err(e) => {
                warn!(id = %inner.id, attempt, error = %e, "Reconnect attempt failed");
                attempt += 1;
            }
        }
    }
}

// Replays the subscribe sequence in insertion order, awaiting each ack so
// restoration is deterministic.
async fn restore_subscriptions(
    inner: &Arc<ClientInner>,
    ws: &mut WsStream,
    recorder: &Option<Recorder>,
) -> WsResult<()> {
    let channels = inner.subscriptions.snapshot();
    info!(id = %inner.id, count = channels.len(), "Restoring subscriptions");

    for channel in channels {
        let id = next_request_id(inner);
        let req = RpcRequest::subscribe(id.clone(), &channel);
        let text = serde_json::to_string(&req)?;
        record_text(recorder, Direction::Out, &text);
        ws.send(Message::Text(text)).await?;

        let body = await_reply(inner, ws, &id, recorder).await?;
        if let Some(err) = message::reply_error(&body) {
            warn!(id = %inner.id, channel, error = %err, "Restore subscribe rejected");
            return Err(WsError::Disconnected);
        }
        debug!(id = %inner.id, channel, "Subscription restored");
    }
    Ok(())
}
