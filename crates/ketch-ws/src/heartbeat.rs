//! Heartbeat management for WebSocket connections.
//!
//! Keeps a connection provably alive under one of the protocol variants:
//! server-initiated JSON-RPC test requests (deribit), client-initiated
//! ping/pong frames, transport-level pings only (binance), or disabled.
//! Three consecutive failures signal the client to reconnect.

use ketch_core::HeartbeatConfig;
use ketch_telemetry::metrics::{HEARTBEAT_RTT_MS, HEARTBEAT_SENT_TOTAL};
use parking_lot::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Consecutive failures that force a reconnection.
pub const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// What the client loop should do after a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing due.
    None,
    /// Emit a WebSocket ping frame.
    SendPing,
    /// Liveness lost; reconnect with `heartbeat_timeout`.
    Reconnect,
}

struct HeartbeatInner {
    /// Any inbound frame, including transport pings and pongs.
    last_activity: Instant,
    /// Last successful heartbeat exchange.
    last_heartbeat: Instant,
    last_ping_sent: Option<Instant>,
    waiting_for_pong: bool,
    failures: u32,
    last_rtt_ms: Option<u64>,
}

impl HeartbeatInner {
    fn fresh() -> Self {
        let now = Instant::now();
        Self {
            last_activity: now,
            last_heartbeat: now,
            last_ping_sent: None,
            waiting_for_pong: false,
            failures: 0,
            last_rtt_ms: None,
        }
    }
}

/// Heartbeat state machine for one connection.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    inner: RwLock<HeartbeatInner>,
}

impl HeartbeatManager {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(HeartbeatInner::fresh()),
        }
    }

    /// Variant tag for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        self.config.kind()
    }

    /// Tick cadence for the client loop, if this variant probes at all.
    ///
    /// Binance relies on transport-level pings and never ticks; disabled
    /// never ticks.
    pub fn tick_interval(&self) -> Option<Duration> {
        match self.config {
            HeartbeatConfig::Deribit { interval_ms } | HeartbeatConfig::PingPong { interval_ms } => {
                Some(Duration::from_millis(interval_ms))
            }
            HeartbeatConfig::Binance { .. } | HeartbeatConfig::Disabled => None,
        }
    }

    /// Reset all counters (called on every successful (re)connect).
    pub fn reset(&self) {
        *self.inner.write() = HeartbeatInner::fresh();
    }

    /// Record that any inbound frame arrived.
    pub fn record_activity(&self) {
        self.inner.write().last_activity = Instant::now();
    }

    /// Record an inbound server test request (deribit).
    ///
    /// Returns the interval since the previous heartbeat exchange, recorded
    /// as pong round-trip telemetry.
    pub fn record_test_request(&self) -> u64 {
        let mut inner = self.inner.write();
        let now = Instant::now();
        let interval_ms = (now - inner.last_heartbeat).as_millis() as u64;
        inner.last_heartbeat = now;
        inner.last_activity = now;
        inner.failures = 0;
        inner.last_rtt_ms = Some(interval_ms);
        HEARTBEAT_SENT_TOTAL.with_label_values(&[self.kind()]).inc();
        HEARTBEAT_RTT_MS
            .with_label_values(&[self.kind()])
            .observe(interval_ms as f64);
        debug!(rtt_ms = interval_ms, "Heartbeat test request");
        interval_ms
    }

    /// Record that a ping frame was sent.
    pub fn record_ping_sent(&self) {
        let mut inner = self.inner.write();
        inner.last_ping_sent = Some(Instant::now());
        inner.waiting_for_pong = true;
        HEARTBEAT_SENT_TOTAL.with_label_values(&[self.kind()]).inc();
    }

    /// Record an inbound pong frame. Returns the round-trip time when a
    /// ping was outstanding.
    pub fn record_pong(&self) -> Option<u64> {
        let mut inner = self.inner.write();
        let now = Instant::now();
        inner.last_activity = now;
        inner.last_heartbeat = now;
        inner.failures = 0;

        if !inner.waiting_for_pong {
            return None;
        }
        inner.waiting_for_pong = false;

        let rtt_ms = inner
            .last_ping_sent
            .map(|sent| (now - sent).as_millis() as u64)?;
        inner.last_rtt_ms = Some(rtt_ms);
        HEARTBEAT_RTT_MS
            .with_label_values(&[self.kind()])
            .observe(rtt_ms as f64);
        debug!(rtt_ms, "Heartbeat pong");
        Some(rtt_ms)
    }

    /// Advance the variant state machine by one tick.
    pub fn on_tick(&self) -> HeartbeatAction {
        let interval = match self.tick_interval() {
            Some(interval) => interval,
            None => return HeartbeatAction::None,
        };

        match self.config {
            HeartbeatConfig::PingPong { .. } => self.ping_pong_tick(interval),
            HeartbeatConfig::Deribit { .. } => self.deribit_tick(interval),
            _ => HeartbeatAction::None,
        }
    }

    fn ping_pong_tick(&self, interval: Duration) -> HeartbeatAction {
        let mut inner = self.inner.write();
        let now = Instant::now();

        // No inbound traffic of any kind for two intervals: the socket is
        // dead regardless of the failure counter.
        if now - inner.last_activity >= interval * 2 {
            warn!(
                idle_ms = (now - inner.last_activity).as_millis() as u64,
                "No inbound traffic for two heartbeat intervals"
            );
            return HeartbeatAction::Reconnect;
        }

        if inner.waiting_for_pong {
            let overdue = inner
                .last_ping_sent
                .map(|sent| now - sent >= interval)
                .unwrap_or(true);
            if overdue {
                inner.waiting_for_pong = false;
                inner.failures += 1;
                warn!(failures = inner.failures, "Heartbeat pong missed");
            } else {
                return HeartbeatAction::None;
            }
        }

        if inner.failures >= MAX_HEARTBEAT_FAILURES {
            return HeartbeatAction::Reconnect;
        }
        HeartbeatAction::SendPing
    }

    fn deribit_tick(&self, interval: Duration) -> HeartbeatAction {
        let mut inner = self.inner.write();
        let now = Instant::now();

        // Server-driven probing: a tick with no heartbeat exchange inside
        // two intervals counts as one failure.
        if now - inner.last_heartbeat >= interval * 2 {
            inner.failures += 1;
            warn!(failures = inner.failures, "No heartbeat from server");
        }

        if inner.failures >= MAX_HEARTBEAT_FAILURES {
            HeartbeatAction::Reconnect
        } else {
            HeartbeatAction::None
        }
    }

    /// Current consecutive failure count.
    pub fn failures(&self) -> u32 {
        self.inner.read().failures
    }

    /// Observability snapshot.
    pub fn stats(&self) -> HeartbeatStats {
        let inner = self.inner.read();
        let now = Instant::now();
        HeartbeatStats {
            kind: self.kind(),
            failures: inner.failures,
            waiting_for_pong: inner.waiting_for_pong,
            ms_since_last_activity: (now - inner.last_activity).as_millis() as u64,
            last_rtt_ms: inner.last_rtt_ms,
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub kind: &'static str,
    pub failures: u32,
    pub waiting_for_pong: bool,
    pub ms_since_last_activity: u64,
    pub last_rtt_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_pong(interval_ms: u64) -> HeartbeatManager {
        HeartbeatManager::new(HeartbeatConfig::PingPong { interval_ms })
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_tick_sends_ping() {
        let hb = ping_pong(1000);
        tokio::time::advance(Duration::from_millis(1000)).await;
        // One interval idle is fine; the tick asks for a probe
        assert_eq!(hb.on_tick(), HeartbeatAction::SendPing);
        assert_eq!(hb.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_resets_failures() {
        let hb = ping_pong(1000);

        hb.record_ping_sent();
        tokio::time::advance(Duration::from_millis(1100)).await;
        hb.record_activity(); // keep the idle rule quiet
        assert_eq!(hb.on_tick(), HeartbeatAction::SendPing);
        assert_eq!(hb.failures(), 1);

        hb.record_ping_sent();
        tokio::time::advance(Duration::from_millis(50)).await;
        let rtt = hb.record_pong();
        assert_eq!(rtt, Some(50));
        assert_eq!(hb.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_missed_pongs_force_reconnect() {
        let hb = ping_pong(1000);

        for expected_failures in 1..=2u32 {
            hb.record_ping_sent();
            tokio::time::advance(Duration::from_millis(1000)).await;
            hb.record_activity();
            assert_eq!(hb.on_tick(), HeartbeatAction::SendPing);
            assert_eq!(hb.failures(), expected_failures);
        }

        hb.record_ping_sent();
        tokio::time::advance(Duration::from_millis(1000)).await;
        hb.record_activity();
        assert_eq!(hb.on_tick(), HeartbeatAction::Reconnect);
        assert_eq!(hb.failures(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_pong_idle_rule_counts_any_frame() {
        let hb = ping_pong(1000);

        // Totally silent socket for two intervals: reconnect
        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(hb.on_tick(), HeartbeatAction::Reconnect);

        // Any frame (e.g. a transport ping) refreshes the activity clock
        hb.reset();
        tokio::time::advance(Duration::from_millis(1500)).await;
        hb.record_activity();
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_ne!(hb.on_tick(), HeartbeatAction::Reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deribit_failures_accumulate() {
        let hb = HeartbeatManager::new(HeartbeatConfig::Deribit { interval_ms: 1000 });

        for _ in 0..2 {
            tokio::time::advance(Duration::from_millis(2000)).await;
            assert_eq!(hb.on_tick(), HeartbeatAction::None);
        }
        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(hb.on_tick(), HeartbeatAction::Reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deribit_test_request_resets_failures() {
        let hb = HeartbeatManager::new(HeartbeatConfig::Deribit { interval_ms: 1000 });

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(hb.on_tick(), HeartbeatAction::None);
        assert_eq!(hb.failures(), 1);

        let interval = hb.record_test_request();
        assert!(interval >= 2000);
        assert_eq!(hb.failures(), 0);
    }

    #[test]
    fn test_binance_and_disabled_never_tick() {
        let binance = HeartbeatManager::new(HeartbeatConfig::Binance { interval_ms: 180000 });
        assert_eq!(binance.tick_interval(), None);
        assert_eq!(binance.on_tick(), HeartbeatAction::None);

        let disabled = HeartbeatManager::new(HeartbeatConfig::Disabled);
        assert_eq!(disabled.tick_interval(), None);
        assert_eq!(disabled.on_tick(), HeartbeatAction::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_pong_is_activity_only() {
        let hb = ping_pong(1000);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(hb.record_pong(), None);
        assert_eq!(hb.stats().ms_since_last_activity, 0);
    }
}
