//! Token-bucket rate limiting with queueing and pressure reporting.
//!
//! Limiters are shared by name: every client that targets the same rate
//! domain meters its sends through one bucket. Refill is lazy (any
//! operation first advances the bucket to the current interval boundary);
//! a background tick additionally drains queued sends in FIFO order.

use crate::error::{WsError, WsResult};
use dashmap::DashMap;
use ketch_core::RateLimitSettings;
use ketch_telemetry::metrics::{
    RATE_PRESSURE_LEVEL, RATE_QUEUE_FULL_TOTAL, RATE_QUEUE_SIZE, RATE_TOKENS,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Maps a request to the number of tokens it consumes.
pub type CostFn = Arc<dyn Fn(&Value) -> u32 + Send + Sync>;

/// Flat cost: every request consumes one token.
pub fn simple_cost() -> CostFn {
    Arc::new(|_| 1)
}

/// Deribit method weights.
pub fn deribit_cost() -> CostFn {
    Arc::new(|msg| {
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
        if method.starts_with("public/") {
            1
        } else if method == "private/buy" || method == "private/sell" {
            15
        } else if method.starts_with("private/get_") {
            5
        } else if method.starts_with("private/set_") {
            10
        } else {
            1
        }
    })
}

/// Binance-style parametric weights: per-method costs with a default.
pub fn binance_cost(weights: HashMap<String, u32>, default_weight: u32) -> CostFn {
    Arc::new(move |msg| {
        msg.get("method")
            .and_then(Value::as_str)
            .and_then(|m| weights.get(m).copied())
            .unwrap_or(default_weight)
    })
}

/// Discretized queue fill, used to signal backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    None,
    Low,
    Medium,
    High,
}

impl PressureLevel {
    /// Level for a queue fill ratio.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 0.75 {
            Self::High
        } else if ratio >= 0.50 {
            Self::Medium
        } else if ratio >= 0.25 {
            Self::Low
        } else {
            Self::None
        }
    }

    /// Suggested caller delay for this level.
    pub fn suggested_delay_ms(&self, refill_interval_ms: u64) -> u64 {
        match self {
            Self::None => 0,
            Self::Low => refill_interval_ms,
            Self::Medium => 2 * refill_interval_ms,
            Self::High => 4 * refill_interval_ms,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    fn as_gauge(&self) -> i64 {
        match self {
            Self::None => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

/// Outcome of a consume attempt.
pub enum Consume {
    /// Tokens were available; the send may proceed now.
    Ready { tokens_left: u32 },
    /// The send was queued; await the grant before proceeding.
    Queued { position: usize, grant: QueueGrant },
    /// The queue is at capacity.
    QueueFull,
}

/// Resolves when a queued send is served by the refill tick.
pub struct QueueGrant(oneshot::Receiver<()>);

impl QueueGrant {
    /// Wait until the queued tokens are granted.
    pub async fn granted(self) -> WsResult<()> {
        self.0.await.map_err(|_| WsError::Disconnected)
    }
}

/// Point-in-time limiter status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStatus {
    pub tokens: u32,
    pub queue_size: usize,
    pub pressure: PressureLevel,
    pub suggested_delay_ms: u64,
}

struct QueuedSend {
    cost: u32,
    waiter: oneshot::Sender<()>,
}

struct BucketState {
    tokens: u32,
    last_refill: Instant,
    queue: VecDeque<QueuedSend>,
    pressure: PressureLevel,
}

/// Shared token-bucket rate limiter.
pub struct RateLimiter {
    name: String,
    capacity: u32,
    refill_rate: u32,
    refill_interval: Duration,
    max_queue_size: usize,
    cost_fn: CostFn,
    state: Mutex<BucketState>,
}

static SHARED: Lazy<DashMap<String, Arc<RateLimiter>>> = Lazy::new(DashMap::new);

impl RateLimiter {
    /// Create a standalone limiter. Most callers want [`RateLimiter::shared`].
    pub fn new(settings: &RateLimitSettings, cost_fn: CostFn) -> Arc<Self> {
        Arc::new(Self {
            name: settings.name.clone(),
            capacity: settings.capacity,
            refill_rate: settings.refill_rate,
            refill_interval: Duration::from_millis(settings.refill_interval_ms),
            max_queue_size: settings.max_queue_size,
            cost_fn,
            state: Mutex::new(BucketState {
                tokens: settings.capacity,
                last_refill: Instant::now(),
                queue: VecDeque::new(),
                pressure: PressureLevel::None,
            }),
        })
    }

    /// Look up or create the limiter registered under `settings.name`.
    ///
    /// The first caller fixes the sizing and cost function and starts the
    /// refill task; later callers share the existing instance. Must be
    /// called from within a tokio runtime.
    pub fn shared(settings: &RateLimitSettings, cost_fn: CostFn) -> Arc<Self> {
        SHARED
            .entry(settings.name.clone())
            .or_insert_with(|| {
                let limiter = Self::new(settings, cost_fn);
                limiter.start();
                limiter
            })
            .clone()
    }

    /// Spawn the refill/drain task. It stops when the limiter is dropped.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<RateLimiter> = Arc::downgrade(self);
        let interval = self.refill_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(limiter) => limiter.tick(),
                    None => break,
                }
            }
        });
    }

    /// Limiter name (rate domain).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token cost of a request under this limiter's cost function.
    pub fn cost_of(&self, msg: &Value) -> u32 {
        (self.cost_fn)(msg)
    }

    /// Try to consume `cost` tokens, queueing the send when the bucket is
    /// short. Performs a lazy refill first.
    pub fn consume(&self, cost: u32) -> Consume {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);

        if state.tokens >= cost && state.queue.is_empty() {
            state.tokens -= cost;
            RATE_TOKENS.with_label_values(&[&self.name]).set(state.tokens as i64);
            trace!(
                name = %self.name,
                tokens_remaining = state.tokens,
                cost,
                "Rate limiter consume"
            );
            return Consume::Ready {
                tokens_left: state.tokens,
            };
        }

        if state.queue.len() >= self.max_queue_size {
            RATE_QUEUE_FULL_TOTAL.with_label_values(&[&self.name]).inc();
            warn!(
                name = %self.name,
                queue_size = state.queue.len(),
                "Rate limiter queue full"
            );
            return Consume::QueueFull;
        }

        let (tx, rx) = oneshot::channel();
        state.queue.push_back(QueuedSend { cost, waiter: tx });
        let position = state.queue.len();
        RATE_QUEUE_SIZE
            .with_label_values(&[&self.name])
            .set(position as i64);
        debug!(
            name = %self.name,
            queue_size = position,
            cost,
            "Rate limiter send queued"
        );
        self.update_pressure_locked(&mut state);
        Consume::Queued {
            position,
            grant: QueueGrant(rx),
        }
    }

    /// Consume `cost` tokens, waiting in the queue if necessary.
    ///
    /// Fails with `QueueFull` when the queue is at capacity.
    pub async fn acquire(&self, cost: u32) -> WsResult<()> {
        match self.consume(cost) {
            Consume::Ready { .. } => Ok(()),
            Consume::Queued { grant, .. } => grant.granted().await,
            Consume::QueueFull => Err(WsError::QueueFull),
        }
    }

    /// Refill the bucket and drain queued sends while tokens suffice.
    ///
    /// Called by the background task each interval; also callable directly
    /// (tests, embedding without a runtime task).
    pub fn tick(&self) {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);

        while state
            .queue
            .front()
            .is_some_and(|front| state.tokens >= front.cost)
        {
            let Some(send) = state.queue.pop_front() else {
                break;
            };
            state.tokens -= send.cost;
            if send.waiter.send(()).is_err() {
                // Caller abandoned its queued send; the tokens were never
                // used for a transmission, so return them.
                state.tokens = (state.tokens + send.cost).min(self.capacity);
            }
        }

        RATE_TOKENS.with_label_values(&[&self.name]).set(state.tokens as i64);
        RATE_QUEUE_SIZE
            .with_label_values(&[&self.name])
            .set(state.queue.len() as i64);
        self.update_pressure_locked(&mut state);
    }

    /// Current status after a lazy refill.
    pub fn status(&self) -> RateLimiterStatus {
        let mut state = self.state.lock();
        self.refill_locked(&mut state);
        let pressure = Self::pressure_of(state.queue.len(), self.max_queue_size);
        RateLimiterStatus {
            tokens: state.tokens,
            queue_size: state.queue.len(),
            pressure,
            suggested_delay_ms: pressure.suggested_delay_ms(self.refill_interval.as_millis() as u64),
        }
    }

    /// Drop all queued sends and restore a full bucket.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
        self.update_pressure_locked(&mut state);
    }

    fn pressure_of(queue_size: usize, max_queue_size: usize) -> PressureLevel {
        if max_queue_size == 0 {
            return PressureLevel::None;
        }
        PressureLevel::from_ratio(queue_size as f64 / max_queue_size as f64)
    }

    // Advances tokens to the last full interval boundary. Idempotent when
    // called repeatedly within one interval.
    fn refill_locked(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        let interval_ms = self.refill_interval.as_millis().max(1);
        let intervals = (elapsed.as_millis() / interval_ms) as u64;
        if intervals == 0 {
            return;
        }

        let tokens_before = state.tokens;
        let added = intervals.saturating_mul(self.refill_rate as u64);
        state.tokens = (state.tokens as u64 + added).min(self.capacity as u64) as u32;
        state.last_refill += self.refill_interval * intervals as u32;

        if state.tokens != tokens_before {
            trace!(
                name = %self.name,
                tokens_before,
                tokens_after = state.tokens,
                refill_rate = self.refill_rate,
                "Rate limiter refill"
            );
        }
    }

    // Emits pressure telemetry only on level transitions.
    fn update_pressure_locked(&self, state: &mut BucketState) {
        let level = Self::pressure_of(state.queue.len(), self.max_queue_size);
        if level != state.pressure {
            let previous = state.pressure;
            state.pressure = level;
            RATE_PRESSURE_LEVEL
                .with_label_values(&[&self.name])
                .set(level.as_gauge());
            info!(
                name = %self.name,
                queue_size = state.queue.len(),
                ratio = state.queue.len() as f64 / self.max_queue_size.max(1) as f64,
                level = level.as_str(),
                previous_level = previous.as_str(),
                "Rate limiter pressure changed"
            );
        }
    }
}
