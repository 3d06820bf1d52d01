//! Health-scored routing across a set of clients.
//!
//! Error counters live in a concurrent map with atomic updates; there is
//! no coordinator in the hot path. `send_balanced` walks the healthiest
//! candidates and never re-selects a connection that already failed within
//! the same call.

use crate::error::{PoolError, PoolResult};
use dashmap::DashMap;
use ketch_telemetry::metrics::POOL_FAILOVER_TOTAL;
use ketch_ws::{Client, SendOutcome, WsError};
use parking_lot::RwLock;
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Window over which an idle connection's errors stop counting against it.
const ERROR_DECAY: Duration = Duration::from_secs(60);

/// Trait for send targets the router can balance across.
///
/// Abstracting the send operation keeps the router testable without
/// sockets and open to transports other than [`Client`].
pub trait MessageSink: Send + Sync {
    /// Stable identifier used for error accounting.
    fn sink_id(&self) -> &str;

    /// Send one message.
    fn send_json(&self, msg: Value) -> BoxFuture<'_, Result<SendOutcome, WsError>>;
}

impl MessageSink for Client {
    fn sink_id(&self) -> &str {
        self.id()
    }

    fn send_json(&self, msg: Value) -> BoxFuture<'_, Result<SendOutcome, WsError>> {
        Box::pin(async move { self.send_message(msg).await })
    }
}

#[derive(Default)]
struct PoolEntry {
    errors: AtomicU32,
    last_error_at: RwLock<Option<Instant>>,
}

/// Per-connection error accounting and failover routing.
pub struct PoolRouter {
    entries: DashMap<String, PoolEntry>,
    max_attempts: u32,
}

impl PoolRouter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            entries: DashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Record a failed send against `id`.
    pub fn record_error(&self, id: &str) {
        let entry = self.entries.entry(id.to_string()).or_default();
        entry.errors.fetch_add(1, Ordering::Relaxed);
        *entry.last_error_at.write() = Some(Instant::now());
    }

    /// Reset `id` to parity with a fresh connection (called after a
    /// successful send).
    pub fn clear_errors(&self, id: &str) {
        if let Some(entry) = self.entries.get(id) {
            entry.errors.store(0, Ordering::Relaxed);
            *entry.last_error_at.write() = None;
        }
    }

    /// Current error count for `id`.
    pub fn error_count(&self, id: &str) -> u32 {
        self.entries
            .get(id)
            .map(|entry| entry.errors.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Health score in `(0, 1]`: `1 / (1 + errors)`, with the error weight
    /// decaying linearly over [`ERROR_DECAY`] since the last failure.
    pub fn health_score(&self, id: &str) -> f64 {
        let Some(entry) = self.entries.get(id) else {
            return 1.0;
        };
        let errors = entry.errors.load(Ordering::Relaxed);
        if errors == 0 {
            return 1.0;
        }
        let decay = entry
            .last_error_at
            .read()
            .map(|at| (at.elapsed().as_secs_f64() / ERROR_DECAY.as_secs_f64()).clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let effective = errors as f64 * (1.0 - decay);
        1.0 / (1.0 + effective)
    }

    /// Pick the candidate with the lowest error count, breaking ties by
    /// first-listed order.
    pub fn select_connection<'a>(
        &self,
        candidates: &[&'a dyn MessageSink],
    ) -> Option<&'a dyn MessageSink> {
        self.select_index(candidates).map(|idx| candidates[idx])
    }

    fn select_index(&self, candidates: &[&dyn MessageSink]) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (idx, sink) in candidates.iter().enumerate() {
            let errors = self.error_count(sink.sink_id());
            match best {
                Some((_, best_errors)) if errors >= best_errors => {}
                _ => best = Some((idx, errors)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Send via the healthiest connection, failing over on error.
    ///
    /// Each failed candidate is removed from the set for the remainder of
    /// the call. Gives up after `max_attempts` sends.
    pub async fn send_balanced(
        &self,
        sinks: &[&dyn MessageSink],
        msg: Value,
    ) -> PoolResult<SendOutcome> {
        let mut candidates: Vec<&dyn MessageSink> = sinks.to_vec();

        for attempt in 1..=self.max_attempts {
            let Some(idx) = self.select_index(&candidates) else {
                return Err(PoolError::NoConnections);
            };
            let pick = candidates[idx];
            let id = pick.sink_id().to_string();
            debug!(attempt, pid = %id, "Balanced send attempt");

            match pick.send_json(msg.clone()).await {
                Ok(outcome) => {
                    self.clear_errors(&id);
                    return Ok(outcome);
                }
                Err(e) => {
                    self.record_error(&id);
                    POOL_FAILOVER_TOTAL.with_label_values(&[e.kind()]).inc();
                    warn!(attempt, failed_pid = %id, reason = e.kind(), "Balanced send failover");
                    candidates.remove(idx);
                }
            }
        }

        Err(PoolError::MaxAttemptsExceeded {
            attempts: self.max_attempts,
        })
    }
}

impl Default for PoolRouter {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted sink: fails the first `fail_times` sends, then succeeds.
    struct ScriptedSink {
        id: String,
        fail_times: AtomicU32,
        sends: Mutex<Vec<Value>>,
    }

    impl ScriptedSink {
        fn new(id: &str, fail_times: u32) -> Self {
            Self {
                id: id.to_string(),
                fail_times: AtomicU32::new(fail_times),
                sends: Mutex::new(Vec::new()),
            }
        }

        fn send_count(&self) -> usize {
            self.sends.lock().len()
        }
    }

    impl MessageSink for ScriptedSink {
        fn sink_id(&self) -> &str {
            &self.id
        }

        fn send_json(&self, msg: Value) -> BoxFuture<'_, Result<SendOutcome, WsError>> {
            Box::pin(async move {
                self.sends.lock().push(msg);
                let remaining = self.fail_times.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_times.store(remaining - 1, Ordering::SeqCst);
                    Err(WsError::Disconnected)
                } else {
                    Ok(SendOutcome::Ack)
                }
            })
        }
    }

    #[test]
    fn test_select_lowest_error_count() {
        let router = PoolRouter::new(3);
        let a = ScriptedSink::new("a", 0);
        let b = ScriptedSink::new("b", 0);
        router.record_error("a");
        router.record_error("a");
        router.record_error("b");

        let candidates: Vec<&dyn MessageSink> = vec![&a, &b];
        let picked = router.select_connection(&candidates).unwrap();
        assert_eq!(picked.sink_id(), "b");
    }

    #[test]
    fn test_select_tie_breaks_first_listed() {
        let router = PoolRouter::new(3);
        let a = ScriptedSink::new("a", 0);
        let b = ScriptedSink::new("b", 0);

        let candidates: Vec<&dyn MessageSink> = vec![&a, &b];
        let picked = router.select_connection(&candidates).unwrap();
        assert_eq!(picked.sink_id(), "a");
    }

    #[test]
    fn test_clear_errors_restores_parity() {
        let router = PoolRouter::new(3);
        for _ in 0..5 {
            router.record_error("a");
        }
        assert_eq!(router.error_count("a"), 5);
        assert!(router.health_score("a") < 1.0);

        router.clear_errors("a");
        assert_eq!(router.error_count("a"), 0);
        assert_eq!(router.health_score("a"), router.health_score("never-seen"));
    }

    #[test]
    fn test_health_score_shape() {
        let router = PoolRouter::new(3);
        assert_eq!(router.health_score("fresh"), 1.0);

        router.record_error("worn");
        let one = router.health_score("worn");
        router.record_error("worn");
        let two = router.health_score("worn");
        assert!(one < 1.0);
        assert!(two < one);
    }

    #[tokio::test]
    async fn test_send_balanced_success_clears_errors() {
        let router = PoolRouter::new(3);
        let a = ScriptedSink::new("a", 0);
        router.record_error("a");

        let candidates: Vec<&dyn MessageSink> = vec![&a];
        let outcome = router
            .send_balanced(&candidates, serde_json::json!({"method": "x"}))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Ack);
        assert_eq!(router.error_count("a"), 0);
    }

    #[tokio::test]
    async fn test_send_balanced_fails_over_without_reselecting() {
        let router = PoolRouter::new(3);
        let a = ScriptedSink::new("a", 1);
        let b = ScriptedSink::new("b", 1);
        let c = ScriptedSink::new("c", 0);

        let candidates: Vec<&dyn MessageSink> = vec![&a, &b, &c];
        let outcome = router
            .send_balanced(&candidates, serde_json::json!({"method": "x"}))
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::Ack);
        // Two failovers, each failed sink tried exactly once
        assert_eq!(a.send_count(), 1);
        assert_eq!(b.send_count(), 1);
        assert_eq!(c.send_count(), 1);
        assert_eq!(router.error_count("a"), 1);
        assert_eq!(router.error_count("b"), 1);
        assert_eq!(router.error_count("c"), 0);
    }

    #[tokio::test]
    async fn test_send_balanced_gives_up_after_max_attempts() {
        let router = PoolRouter::new(2);
        let a = ScriptedSink::new("a", 10);
        let b = ScriptedSink::new("b", 10);
        let c = ScriptedSink::new("c", 10);

        let candidates: Vec<&dyn MessageSink> = vec![&a, &b, &c];
        let err = router
            .send_balanced(&candidates, serde_json::json!({"method": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::MaxAttemptsExceeded { attempts: 2 });
        assert_eq!(a.send_count() + b.send_count() + c.send_count(), 2);
    }

    #[tokio::test]
    async fn test_send_balanced_no_connections() {
        let router = PoolRouter::new(3);
        let err = router
            .send_balanced(&[], serde_json::json!({"method": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::NoConnections);
    }

    #[tokio::test]
    async fn test_send_balanced_candidates_exhausted() {
        let router = PoolRouter::new(5);
        let a = ScriptedSink::new("a", 10);
        let b = ScriptedSink::new("b", 10);

        let candidates: Vec<&dyn MessageSink> = vec![&a, &b];
        let err = router
            .send_balanced(&candidates, serde_json::json!({"method": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::NoConnections);
        assert_eq!(a.send_count(), 1);
        assert_eq!(b.send_count(), 1);
    }
}
