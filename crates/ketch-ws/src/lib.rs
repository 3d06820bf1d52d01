//! Resilient WebSocket client for long-lived exchange connections.
//!
//! Provides robust connectivity with:
//! - Automatic reconnection with exponential backoff and state restoration
//! - Request/response correlation with per-request deadlines
//! - Heartbeat monitoring (deribit JSON-RPC, ping/pong frames, or disabled)
//! - Token-bucket rate limiting with queueing and pressure reporting
//! - Optional append-only session recording

pub mod client;
pub mod correlator;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod rate_limiter;
pub mod reconnect;
pub mod recorder;
pub mod subscription;

pub use client::{
    Client, CloseCause, ConnectionState, SendOutcome, StateSnapshot, StreamData,
};
pub use correlator::{ReplyWaiter, RequestCorrelator};
pub use error::{WsError, WsResult};
pub use heartbeat::{HeartbeatAction, HeartbeatManager, HeartbeatStats, MAX_HEARTBEAT_FAILURES};
pub use message::{classify, HeartbeatEvent, Inbound, RequestId, RpcRequest};
pub use rate_limiter::{
    binance_cost, deribit_cost, simple_cost, Consume, CostFn, PressureLevel, RateLimiter,
    RateLimiterStatus,
};
pub use reconnect::BackoffSchedule;
pub use recorder::{Direction, Recorder};
pub use subscription::SubscriptionManager;

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
