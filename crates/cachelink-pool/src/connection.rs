//! The narrow contract the routing core needs from the connection layer:
//! opening a non-blocking socket and knowing whether an established one is
//! usable. Raw socket I/O, protocol framing, and
//! request/response queueing all live on the other side of this boundary —
//! `cachelink-proxy` implements it against real tokio TCP sockets; this
//! crate's own tests implement it against an in-memory mock (see `mock`).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use cachelink_core::Result;

/// A boxed, `Send` future — the shape `ServerTransport::connect` returns.
/// Defined locally instead of pulling in `futures` for one alias.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens connections to backend servers. Implemented once per protocol
/// (tokio TCP/UNIX for the real proxy, an in-memory fake for tests).
pub trait ServerTransport: Send + Sync + 'static {
    type Conn: ServerConnection;

    /// Establishes a non-blocking connection to `addr`. The core awaits this
    /// directly; "non-blocking" means it never blocks the executor thread,
    /// not that it returns synchronously — suspension points the core
    /// observes, not initiates.
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, Result<Self::Conn>>;
}

/// One established connection to a backend server.
pub trait ServerConnection: Send + 'static {
    /// True once the connection has faulted (timeout, reset, protocol
    /// error) and must be skipped by round-robin selection / dropped by the
    /// next connection-queue cleanup.
    fn is_errored(&self) -> bool;

    /// Closes the connection. Called on ejection and on pool disconnect;
    /// idempotent.
    fn close(&mut self);
}

/// A live client connection accepted on a pool's listener. The core tracks
/// only enough to decide drain completion: whether it is still open.
/// Everything else (framing, request queue) is the proxy's concern.
pub trait ClientConnection: Send + 'static {
    fn is_open(&self) -> bool;
}

/// Points at one connection slot chosen by `ServerPool::server_pool_conn`:
/// which server, and which of that server's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnHandle {
    pub server_index: usize,
    pub conn_index: usize,
}

/// The outcome of resolving a key to a connection via
/// `ServerPool::server_pool_conn`: either a usable connection or a
/// well-typed "unavailable" result. Never blocks on network beyond the
/// async connect itself.
#[derive(Debug)]
pub enum Dispatch {
    ToServer(ConnHandle),
    Unavailable(cachelink_core::CachelinkError),
}

/// In-memory test transport and connection, used by this crate's own unit
/// and integration tests to drive the ejection/retry and hot-reload
/// scenarios (S1-S6) without opening real sockets.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// A connection that is permanently healthy unless explicitly poisoned.
    pub struct MockConn {
        errored: Arc<AtomicBool>,
    }

    impl MockConn {
        pub fn poison(&self) {
            self.errored.store(true, Ordering::SeqCst);
        }
    }

    impl ServerConnection for MockConn {
        fn is_errored(&self) -> bool {
            self.errored.load(Ordering::SeqCst)
        }

        fn close(&mut self) {
            self.errored.store(true, Ordering::SeqCst);
        }
    }

    /// A transport whose connect behavior is scripted per-address: it can
    /// be told (via `fail_next`) to fail the next N connect attempts to a
    /// given address, which is what grounds the ejection/retry-probe tests.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        connect_attempts: Arc<AtomicU32>,
        fail_remaining: Arc<AtomicU32>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// The next `n` `connect()` calls (to any address) fail.
        pub fn fail_next(&self, n: u32) {
            self.fail_remaining.store(n, Ordering::SeqCst);
        }

        pub fn connect_attempts(&self) -> u32 {
            self.connect_attempts.load(Ordering::SeqCst)
        }
    }

    impl ServerTransport for MockTransport {
        type Conn = MockConn;

        fn connect(&self, _addr: SocketAddr) -> BoxFuture<'_, Result<Self::Conn>> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n > 0 {
                        Some(n - 1)
                    } else {
                        None
                    }
                })
                .is_ok();
            Box::pin(async move {
                if should_fail {
                    Err(cachelink_core::CachelinkError::ConnectFailed(
                        "mock connect failure".to_string(),
                    ))
                } else {
                    Ok(MockConn {
                        errored: Arc::new(AtomicBool::new(false)),
                    })
                }
            })
        }
    }
}
