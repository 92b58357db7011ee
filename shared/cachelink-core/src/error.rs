//! Error types shared across the cachelink workspace.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CachelinkError>;

/// The error kinds the routing core can raise.
#[derive(Error, Debug)]
pub enum CachelinkError {
    /// Malformed server record, unknown hash/distribution name, weight 0
    /// under a non-ketama distribution. Fatal at init; fatal to a reload
    /// but never tears down the currently running pools.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Hostname resolution failed. Fatal at init; transient during a
    /// retry probe (the server simply stays dead).
    #[error("failed to resolve address: {0}")]
    ResolveFailed(String),

    /// All servers ejected, or the selected server is dead and
    /// `auto_eject_hosts` is set. Surfaced per-request.
    #[error("no server available for key")]
    NoServerAvailable,

    /// Establishing a backend connection failed.
    #[error("failed to connect to server {0}")]
    ConnectFailed(String),

    /// A request exceeded the pool's configured timeout.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// A read/write on an established connection failed.
    #[error("transport error on server {0}: {1}")]
    TransportError(String, String),

    /// The pool is draining (`OLD_DRAINING`) or not yet active
    /// (`NEW_WAIT_FOR_OLD`) and cannot serve the request.
    #[error("pool unavailable: {0}")]
    PoolUnavailable(String),
}

impl CachelinkError {
    /// Stable machine-readable tag, used in logs/metrics labels. There is
    /// deliberately no HTTP `status_code()` counterpart here (unlike the
    /// teacher's `BrivasError`) — cachelink errors surface as a
    /// protocol-level server-error line to the client, not an HTTP
    /// response, so only the log/metric tag is kept.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "CONFIG_INVALID",
            Self::ResolveFailed(_) => "RESOLVE_FAILED",
            Self::NoServerAvailable => "NO_SERVER_AVAILABLE",
            Self::ConnectFailed(_) => "CONNECT_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::TransportError(..) => "TRANSPORT_ERROR",
            Self::PoolUnavailable(_) => "POOL_UNAVAILABLE",
        }
    }
}

impl From<std::io::Error> for CachelinkError {
    fn from(err: std::io::Error) -> Self {
        CachelinkError::TransportError("io".to_string(), err.to_string())
    }
}
