//! Prometheus metrics and structured logging for ketch.
//!
//! Provides the observability surface of the workspace:
//! - Prometheus metric families for every client telemetry event
//! - Structured JSON logging with tracing

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
