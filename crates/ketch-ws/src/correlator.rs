//! Request/response correlation.
//!
//! Maps in-flight request ids to waiting callers. Every registered id is
//! resolved exactly once: by a correlated reply, by its deadline, or by a
//! drain when the connection drops or closes. Entries whose waiters were
//! abandoned are reclaimed by the periodic deadline sweep.

use crate::error::{WsError, WsResult};
use crate::message::RequestId;
use ketch_core::{LatencyStats, LatencySummary};
use ketch_telemetry::metrics::{REQUEST_DURATION_MS, REQUEST_TIMEOUT_TOTAL};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

/// Receiving half handed to the caller awaiting a reply.
pub type ReplyWaiter = oneshot::Receiver<WsResult<Value>>;

struct PendingRequest {
    method: String,
    started_at: Instant,
    deadline: Instant,
    waiter: oneshot::Sender<WsResult<Value>>,
}

/// Table of in-flight correlated requests.
pub struct RequestCorrelator {
    inner: Mutex<CorrelatorInner>,
}

struct CorrelatorInner {
    pending: HashMap<RequestId, PendingRequest>,
    latency: LatencyStats,
}

impl RequestCorrelator {
    /// Create a correlator whose latency buffer holds `latency_buffer_size`
    /// samples.
    pub fn new(latency_buffer_size: usize) -> Self {
        Self {
            inner: Mutex::new(CorrelatorInner {
                pending: HashMap::new(),
                latency: LatencyStats::new(latency_buffer_size),
            }),
        }
    }

    /// Register an in-flight request and hand back its waiter.
    ///
    /// Fails with `DuplicateId` when the id is already in flight.
    pub fn register(
        &self,
        id: RequestId,
        method: &str,
        timeout: Duration,
    ) -> WsResult<ReplyWaiter> {
        let mut inner = self.inner.lock();
        if inner.pending.contains_key(&id) {
            return Err(WsError::DuplicateId(id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        inner.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                started_at: now,
                deadline: now + timeout,
                waiter: tx,
            },
        );
        trace!(%id, method, "Request registered");
        Ok(rx)
    }

    /// Complete an in-flight request with its reply.
    ///
    /// Records the round-trip latency. Returns false (and does nothing) for
    /// unknown ids, which covers late replies after timeout or drain.
    pub fn complete(&self, id: &RequestId, reply: Value) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.pending.remove(id);
            if let Some(pending) = &entry {
                let duration_ms = pending.started_at.elapsed().as_millis() as u64;
                inner.latency.record(duration_ms);
                REQUEST_DURATION_MS
                    .with_label_values(&[&pending.method])
                    .observe(duration_ms as f64);
                debug!(%id, method = %pending.method, duration_ms, "Request completed");
            }
            entry
        };

        match entry {
            Some(pending) => {
                // A dropped receiver means the caller went away; the entry
                // is already removed, so delivery failure is harmless.
                let _ = pending.waiter.send(Ok(reply));
                true
            }
            None => {
                trace!(%id, "Late reply for unknown request id");
                false
            }
        }
    }

    /// Time out one in-flight request.
    pub fn timeout(&self, id: &RequestId) -> bool {
        let entry = self.inner.lock().pending.remove(id);
        match entry {
            Some(pending) => {
                REQUEST_TIMEOUT_TOTAL
                    .with_label_values(&[&pending.method])
                    .inc();
                debug!(%id, method = %pending.method, "Request timed out");
                let _ = pending.waiter.send(Err(WsError::RequestTimeout));
                true
            }
            None => false,
        }
    }

    /// Remove an entry without notifying its waiter.
    ///
    /// Used when the send itself failed after registration; the caller
    /// already holds the error.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.inner.lock().pending.remove(id).is_some()
    }

    /// Remove every entry whose deadline has passed, notifying its waiter.
    ///
    /// Returns the number of reclaimed entries.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(RequestId, PendingRequest)> = {
            let mut inner = self.inner.lock();
            let ids: Vec<RequestId> = inner
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (id, pending) in expired {
            REQUEST_TIMEOUT_TOTAL
                .with_label_values(&[&pending.method])
                .inc();
            debug!(%id, method = %pending.method, "Request expired in sweep");
            let _ = pending.waiter.send(Err(WsError::RequestTimeout));
        }
        count
    }

    /// Fail every in-flight request with `reason` and empty the table.
    ///
    /// Used on reconnection (`Disconnected`) and close (`Closed`).
    pub fn drain(&self, reason: WsError) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> =
            self.inner.lock().pending.drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            debug!(%id, method = %pending.method, %reason, "Request drained");
            let _ = pending.waiter.send(Err(reason.clone()));
        }
        count
    }

    /// Number of in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Snapshot of the latency buffer.
    pub fn latency_summary(&self) -> LatencySummary {
        self.inner.lock().latency.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn correlator() -> RequestCorrelator {
        RequestCorrelator::new(16)
    }

    #[tokio::test]
    async fn test_register_complete_delivers_once() {
        let c = correlator();
        let rx = c
            .register(RequestId::Num(1), "public/test", Duration::from_secs(5))
            .unwrap();

        assert!(c.complete(&RequestId::Num(1), json!({"result": "ok"})));
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply["result"], "ok");

        // Exactly-once: second completion is a no-op
        assert!(!c.complete(&RequestId::Num(1), json!({"result": "again"})));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let c = correlator();
        let _rx = c
            .register(RequestId::Num(1), "a", Duration::from_secs(5))
            .unwrap();
        let err = c
            .register(RequestId::Num(1), "b", Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err, WsError::DuplicateId("1".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_notifies_waiter() {
        let c = correlator();
        let rx = c
            .register(RequestId::Num(7), "x", Duration::from_millis(100))
            .unwrap();
        assert!(c.timeout(&RequestId::Num(7)));
        assert_eq!(rx.await.unwrap().unwrap_err(), WsError::RequestTimeout);
        assert_eq!(c.pending_count(), 0);

        // Unknown id after removal
        assert!(!c.timeout(&RequestId::Num(7)));
    }

    #[tokio::test]
    async fn test_late_reply_is_noop() {
        let c = correlator();
        assert!(!c.complete(&RequestId::Num(99), json!({"result": 1})));
        // Latency buffer untouched by unknown completions
        assert_eq!(c.latency_summary().count, 0);
    }

    #[tokio::test]
    async fn test_drain_fails_all_waiters() {
        let c = correlator();
        let rx1 = c
            .register(RequestId::Num(1), "a", Duration::from_secs(5))
            .unwrap();
        let rx2 = c
            .register(RequestId::Text("b".to_string()), "b", Duration::from_secs(5))
            .unwrap();

        assert_eq!(c.drain(WsError::Disconnected), 2);
        assert_eq!(rx1.await.unwrap().unwrap_err(), WsError::Disconnected);
        assert_eq!(rx2.await.unwrap().unwrap_err(), WsError::Disconnected);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reclaims_expired_entries() {
        let c = correlator();
        let _abandoned = c
            .register(RequestId::Num(1), "a", Duration::from_millis(100))
            .unwrap();
        let _fresh = c
            .register(RequestId::Num(2), "b", Duration::from_secs(60))
            .unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(c.sweep_expired(), 1);
        assert_eq!(c.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_records_latency() {
        let c = correlator();
        let _rx = c
            .register(RequestId::Num(1), "public/test", Duration::from_secs(5))
            .unwrap();
        c.complete(&RequestId::Num(1), json!({"result": "ok"}));
        assert_eq!(c.latency_summary().count, 1);
    }
}
