//! One backend server: its address, weight, connection fanout, and the
//! failure/ejection/retry state machine.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::connection::{ServerConnection, ServerTransport};

/// Represents one backend endpoint. `next_retry_micros == 0` means "not
/// ejected"; a nonzero value is the absolute microsecond timestamp at which
/// a retry probe becomes eligible.
pub struct Server<C> {
    pub index: usize,
    pub name: String,
    pub addr: SocketAddr,
    pub weight: u32,

    ejected: AtomicBool,
    next_retry_micros: AtomicU64,
    failure_count: AtomicU32,
    probe_in_flight: AtomicBool,

    connections: Mutex<Vec<C>>,
    conn_count: AtomicUsize,
    rr_cursor: AtomicUsize,
}

impl<C: ServerConnection> Server<C> {
    pub fn new(index: usize, name: String, addr: SocketAddr, weight: u32) -> Self {
        Self {
            index,
            name,
            addr,
            weight,
            ejected: AtomicBool::new(false),
            next_retry_micros: AtomicU64::new(0),
            failure_count: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
            conn_count: AtomicUsize::new(0),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    /// Spec §3 invariant, verbatim: live iff never ejected, or the retry
    /// deadline has passed. Used by the continuum builder to decide
    /// ketama-point generation / modula dead-slot marking at rebuild time —
    /// the finer-grained "exactly one probe" gating (§4.2, property 5) is a
    /// separate mechanism, see `try_claim_probe`.
    pub fn is_live(&self, now_micros: u64) -> bool {
        let next_retry = self.next_retry_micros.load(Ordering::Acquire);
        next_retry == 0 || now_micros >= next_retry
    }

    pub fn is_ejected(&self) -> bool {
        self.ejected.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn next_retry_micros(&self) -> u64 {
        self.next_retry_micros.load(Ordering::Acquire)
    }

    /// Sync snapshot of the live connection count, maintained alongside the
    /// lock-guarded queue so traversal can read it without an async hop —
    /// `fold`-style visitors are plain synchronous callbacks.
    pub fn connection_count(&self) -> usize {
        self.conn_count.load(Ordering::Acquire)
    }

    /// A completed request exchange without error: reset the failure
    /// counter and clear ejection.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        self.next_retry_micros.store(0, Ordering::Release);
        self.ejected.store(false, Ordering::Release);
    }

    /// A transport error or timeout. Returns `true` if this failure just
    /// crossed the limit and ejected the server.
    pub async fn record_failure(
        &self,
        now_micros: u64,
        failure_limit: u32,
        auto_eject: bool,
        retry_timeout_micros: u64,
    ) -> bool {
        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if auto_eject && count >= failure_limit && !self.ejected.swap(true, Ordering::AcqRel) {
            self.next_retry_micros
                .store(now_micros + retry_timeout_micros, Ordering::Release);
            self.close_all().await;
            true
        } else {
            false
        }
    }

    /// Claims the single retry-probe slot for this ejection window. Returns
    /// `true` if the caller won the race and should perform the probe
    /// connection now; a losing caller must fail the request immediately
    /// without touching the network.
    pub fn try_claim_probe(&self) -> bool {
        !self.probe_in_flight.swap(true, Ordering::AcqRel)
    }

    pub fn release_probe(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// The probe connection failed: re-arm the retry timer linearly (not
    /// exponentially) and stay ejected. `failure_count` is left untouched —
    /// ejection already happened; this is a retry, not a fresh failure run.
    pub fn retry_after_probe_failure(&self, now_micros: u64, retry_timeout_micros: u64) {
        self.next_retry_micros
            .store(now_micros + retry_timeout_micros, Ordering::Release);
    }

    pub async fn close_all(&self) {
        let mut conns = self.connections.lock().await;
        for conn in conns.iter_mut() {
            conn.close();
        }
        conns.clear();
        self.conn_count.store(0, Ordering::Release);
    }

    /// Selects a usable connection for this server: if under cap, opens a
    /// new one; otherwise round-robins
    /// over the existing queue, skipping errored connections. Returns the
    /// index into this server's connection queue.
    pub async fn acquire_conn<T>(&self, transport: &T, cap: usize) -> cachelink_core::Result<usize>
    where
        T: ServerTransport<Conn = C>,
    {
        enum Decision {
            UseExisting(usize),
            NeedNew,
        }

        let decision = {
            let mut conns = self.connections.lock().await;
            conns.retain(|c| !c.is_errored());
            self.conn_count.store(conns.len(), Ordering::Release);
            if conns.len() < cap {
                Decision::NeedNew
            } else if let Some(idx) = self.pick_round_robin(&conns) {
                Decision::UseExisting(idx)
            } else {
                return Err(cachelink_core::CachelinkError::ConnectFailed(format!(
                    "{}: all {} connections errored",
                    self.name,
                    conns.len()
                )));
            }
        };

        match decision {
            Decision::UseExisting(idx) => Ok(idx),
            Decision::NeedNew => {
                let conn = transport.connect(self.addr).await?;
                let mut conns = self.connections.lock().await;
                conns.push(conn);
                self.conn_count.store(conns.len(), Ordering::Release);
                Ok(conns.len() - 1)
            }
        }
    }

    pub async fn with_connection<R>(&self, idx: usize, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        let mut conns = self.connections.lock().await;
        conns.get_mut(idx).map(f)
    }

    /// Like `with_connection`, but `f` returns a future that is awaited
    /// while the connection's slot is held — used by the proxy to forward
    /// a request/response exchange over the chosen connection without a
    /// second lookup. The connection queue lock (a `tokio::sync::Mutex`,
    /// not `parking_lot`, precisely so it can be held across this await)
    /// is held for the duration, which is fine at the scale of one
    /// in-flight exchange per slot; it is not meant for anything that
    /// blocks indefinitely.
    pub async fn with_connection_async<R, Fut>(
        &self,
        idx: usize,
        f: impl FnOnce(&mut C) -> Fut,
    ) -> Option<R>
    where
        Fut: std::future::Future<Output = R>,
    {
        let mut conns = self.connections.lock().await;
        let conn = conns.get_mut(idx)?;
        Some(f(conn).await)
    }

    fn pick_round_robin(&self, conns: &[C]) -> Option<usize> {
        if conns.is_empty() {
            return None;
        }
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % conns.len();
        (0..conns.len())
            .map(|offset| (start + offset) % conns.len())
            .find(|&i| !conns[i].is_errored())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockTransport;

    fn addr() -> SocketAddr {
        "127.0.0.1:11211".parse().unwrap()
    }

    #[tokio::test]
    async fn live_iff_not_ejected_or_retry_elapsed() {
        let s: Server<crate::connection::mock::MockConn> =
            Server::new(0, "s".into(), addr(), 1);
        assert!(s.is_live(1_000));
        s.record_failure(1_000, 1, true, 30_000_000).await;
        assert!(!s.is_live(1_000));
        assert!(s.is_live(1_000 + 30_000_000));
    }

    #[tokio::test]
    async fn ejection_requires_crossing_the_limit() {
        let s: Server<crate::connection::mock::MockConn> =
            Server::new(0, "s".into(), addr(), 1);
        assert!(!s.record_failure(0, 2, true, 1_000).await);
        assert!(s.record_failure(0, 2, true, 1_000).await);
        assert!(s.is_ejected());
    }

    #[tokio::test]
    async fn no_auto_eject_never_ejects() {
        let s: Server<crate::connection::mock::MockConn> =
            Server::new(0, "s".into(), addr(), 1);
        for _ in 0..10 {
            assert!(!s.record_failure(0, 2, false, 1_000).await);
        }
        assert!(!s.is_ejected());
    }

    #[tokio::test]
    async fn acquire_conn_creates_until_cap_then_round_robins() {
        let s: Server<crate::connection::mock::MockConn> =
            Server::new(0, "s".into(), addr(), 1);
        let transport = MockTransport::new();

        let a = s.acquire_conn(&transport, 2).await.unwrap();
        let b = s.acquire_conn(&transport, 2).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(s.connection_count(), 2);

        let c = s.acquire_conn(&transport, 2).await.unwrap();
        assert!(c == a || c == b);
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn only_one_probe_claim_succeeds_at_a_time() {
        let s: Server<crate::connection::mock::MockConn> =
            Server::new(0, "s".into(), addr(), 1);
        assert!(s.try_claim_probe());
        assert!(!s.try_claim_probe());
        s.release_probe();
        assert!(s.try_claim_probe());
    }
}
