//! Core domain types for ketch WebSocket connections.
//!
//! This crate provides the fundamental types shared across the workspace:
//! - `ClientConfig`: immutable per-connection configuration
//! - `HeartbeatConfig`: liveness protocol variants
//! - `LatencyStats`: bounded request latency sampling
//! - `CoreError`: validation errors

pub mod config;
pub mod error;
pub mod latency;

pub use config::{
    AuthProvider, ClientConfig, DisconnectHook, HeartbeatConfig, RateLimitSettings,
};
pub use error::{CoreError, Result};
pub use latency::{LatencyStats, LatencySummary};
