//! Connection configuration.
//!
//! A `ClientConfig` is captured once at connect time and never mutated
//! afterwards; reconnection replays the same snapshot.

use crate::error::{CoreError, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Produces a fresh authentication request (JSON-RPC object with an `id`).
///
/// Credential material and signing stay on the caller's side; the client
/// only replays the produced request once per (re)connection and waits for
/// its correlated reply.
pub type AuthProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Invoked with a reason string when the connection reaches its terminal
/// closed state. Panics are caught and logged by the caller.
pub type DisconnectHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Heartbeat protocol variant.
///
/// Each variant owns only the knobs it needs; dispatch happens on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatConfig {
    /// Server-initiated JSON-RPC test requests (deribit style). The client
    /// arms heartbeats after connect and answers every `test_request`.
    Deribit { interval_ms: u64 },
    /// Client-initiated WebSocket ping frames; a missed pong counts as a
    /// failure.
    PingPong { interval_ms: u64 },
    /// Transport-level pings only (binance style); the client acts on
    /// close/error and never probes on its own.
    Binance { interval_ms: u64 },
    /// No liveness probing.
    Disabled,
}

impl HeartbeatConfig {
    /// Probe interval, if this variant has one.
    pub fn interval_ms(&self) -> Option<u64> {
        match self {
            Self::Deribit { interval_ms }
            | Self::PingPong { interval_ms }
            | Self::Binance { interval_ms } => Some(*interval_ms),
            Self::Disabled => None,
        }
    }

    /// Variant tag for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deribit { .. } => "deribit",
            Self::PingPong { .. } => "ping_pong",
            Self::Binance { .. } => "binance",
            Self::Disabled => "disabled",
        }
    }
}

/// Rate limiter sizing, shared by every client that names the same limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Limiter name; clients with the same name share one bucket.
    pub name: String,
    /// Maximum tokens the bucket can hold.
    pub capacity: u32,
    /// Tokens added per refill interval.
    pub refill_rate: u32,
    /// Refill interval in milliseconds.
    pub refill_interval_ms: u64,
    /// Maximum queued sends while the bucket is empty.
    pub max_queue_size: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            capacity: 50,
            refill_rate: 10,
            refill_interval_ms: 1000,
            max_queue_size: 200,
        }
    }
}

/// Connection configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// Extra headers for the upgrade request.
    pub headers: Vec<(String, String)>,
    /// Connect + upgrade deadline.
    pub connect_timeout_ms: u64,
    /// Deadline for a correlated reply.
    pub request_timeout_ms: u64,
    /// Liveness protocol.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect automatically when the transport drops.
    pub reconnect_on_error: bool,
    /// Maximum reconnection attempts before giving up.
    pub retry_count: u32,
    /// Base delay for exponential backoff.
    pub retry_delay_ms: u64,
    /// Backoff cap.
    pub max_backoff_ms: u64,
    /// Replay the subscription set after reconnecting.
    pub restore_subscriptions: bool,
    /// Bounded latency sample buffer size.
    pub latency_buffer_size: usize,
    /// Rate limiter sizing for this connection's rate domain.
    pub rate_limit: RateLimitSettings,
    /// Optional session log path.
    pub record_to: Option<PathBuf>,
    /// Optional authentication request builder, replayed on reconnect.
    pub auth: Option<AuthProvider>,
    /// Optional terminal-close callback.
    pub on_disconnect: Option<DisconnectHook>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            connect_timeout_ms: 5000,
            request_timeout_ms: 30000,
            heartbeat: HeartbeatConfig::Disabled,
            reconnect_on_error: true,
            retry_count: 3,
            retry_delay_ms: 1000,
            max_backoff_ms: 30000,
            restore_subscriptions: true,
            latency_buffer_size: 100,
            rate_limit: RateLimitSettings::default(),
            record_to: None,
            auth: None,
            on_disconnect: None,
        }
    }
}

impl ClientConfig {
    /// Validate the snapshot before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(CoreError::InvalidConfig("url is required".to_string()));
        }
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(CoreError::InvalidConfig(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.retry_delay_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "retry_delay_ms must be > 0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.retry_delay_ms {
            return Err(CoreError::InvalidConfig(
                "max_backoff_ms must be >= retry_delay_ms".to_string(),
            ));
        }
        if self.latency_buffer_size == 0 {
            return Err(CoreError::InvalidConfig(
                "latency_buffer_size must be > 0".to_string(),
            ));
        }
        if let Some(interval) = self.heartbeat.interval_ms() {
            if interval == 0 {
                return Err(CoreError::InvalidConfig(
                    "heartbeat interval_ms must be > 0".to_string(),
                ));
            }
        }
        if self.rate_limit.capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "rate_limit.capacity must be > 0".to_string(),
            ));
        }
        if self.rate_limit.refill_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "rate_limit.refill_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("headers", &self.headers.len())
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("heartbeat", &self.heartbeat)
            .field("reconnect_on_error", &self.reconnect_on_error)
            .field("retry_count", &self.retry_count)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("restore_subscriptions", &self.restore_subscriptions)
            .field("latency_buffer_size", &self.latency_buffer_size)
            .field("rate_limit", &self.rate_limit)
            .field("record_to", &self.record_to)
            .field("auth", &self.auth.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}
