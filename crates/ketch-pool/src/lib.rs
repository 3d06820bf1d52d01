//! Connection pooling and supervision for ketch clients.
//!
//! Provides the multi-connection layer on top of `ketch-ws`:
//! - `ConnectionRegistry`: shared id → client table
//! - `PoolRouter`: health-scored selection with failover sends
//! - `ClientSupervisor`: dynamic supervision with a restart budget

pub mod error;
pub mod registry;
pub mod router;
pub mod supervisor;

pub use error::{PoolError, PoolResult};
pub use registry::ConnectionRegistry;
pub use router::{BoxFuture, MessageSink, PoolRouter};
pub use supervisor::{ClientSupervisor, LifecycleHook, StartOptions, SupervisorConfig};
