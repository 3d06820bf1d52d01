//! Pool and supervision error types.

use ketch_ws::WsError;
use thiserror::Error;

/// Pool error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("No connections available")]
    NoConnections,

    #[error("Max attempts exceeded after {attempts} sends")]
    MaxAttemptsExceeded { attempts: u32 },

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Supervisor is shut down")]
    SupervisorShutdown,

    #[error(transparent)]
    Client(#[from] WsError),
}

pub type PoolResult<T> = Result<T, PoolError>;
