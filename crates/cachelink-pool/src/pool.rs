//! One listening endpoint plus its backend fleet: servers, continuum,
//! caps, and the hot-reload state this pool carries.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use cachelink_core::{CachelinkError, PoolRecord, Result};
use cachelink_dist::{Continuum, ContinuumServer};
use parking_lot::Mutex;

use crate::connection::{ConnHandle, Dispatch, ServerTransport};
use crate::registry::ReloadState;
use crate::server::Server;

/// How often the continuum is rebuilt purely on a timer, independent of any
/// ejection/retry-success event (spec §3's `next_rebuild` attribute; spec
/// §4.1 rebuild trigger (c)). This re-evaluates every server's `is_live`
/// against the current clock, catching the case where a server's
/// `next_retry` deadline has quietly passed with no request having hashed
/// to it to drive a probe. Twemproxy's own source wasn't available to pin
/// its exact interval (see DESIGN.md), so this is a reasonable fixed
/// default rather than a recovered constant.
pub const REBUILD_INTERVAL_MICROS: u64 = 10_000_000;

/// One pool: a proxy listener (tracked only as "open or not" — the actual
/// socket lives in `cachelink-proxy`), its server array, its continuum, and
/// its reload state.
pub struct ServerPool<T: ServerTransport> {
    pub index: usize,
    pub name: String,
    pub listen: SocketAddr,
    record: PoolRecord,
    transport: T,
    servers: Vec<Arc<Server<T::Conn>>>,
    continuum: ArcSwap<Continuum>,
    nlive_server: AtomicUsize,
    rebuild_pending: AtomicBool,
    /// Absolute microsecond deadline at which the next timer-driven rebuild
    /// is due (spec §3/§4.1 trigger (c)), refreshed every time a rebuild —
    /// timer-driven or event-driven — actually runs.
    next_rebuild_micros: AtomicU64,
    listener_open: AtomicBool,
    client_conn_count: AtomicUsize,
    reload_state: Mutex<ReloadState>,
    counterpart: Mutex<Option<Weak<ServerPool<T>>>>,
    /// Set once an `OldDraining` pool has fully drained and its counterpart
    /// has taken over. The reload-state enum has no terminal "gone" value
    /// among its five states; this flag is what
    /// `PoolsRegistry::finish_replacement` uses to decide it no longer
    /// blocks convergence, while `reload_state()` still reports the last
    /// real state for inspection/logging.
    freed: AtomicBool,
}

impl<T: ServerTransport> ServerPool<T> {
    /// Builds a pool from a parsed config record, resolving each server's
    /// `host:port` and running the first continuum build.
    /// `now_micros` is the caller-supplied clock reading (see crate docs on
    /// why time is threaded explicitly rather than read internally).
    pub fn try_new(
        index: usize,
        record: PoolRecord,
        transport: T,
        now_micros: u64,
    ) -> Result<Arc<Self>> {
        let mut servers = Vec::with_capacity(record.servers.len());
        for (i, rec) in record.servers.iter().enumerate() {
            let addr = resolve_one(&rec.host, rec.port)?;
            servers.push(Arc::new(Server::new(i, rec.display_name(), addr, rec.weight)));
        }

        let listen = record.listen;
        let pool = Arc::new(Self {
            index,
            name: record.name.clone(),
            listen,
            record,
            transport,
            servers,
            continuum: ArcSwap::from_pointee(Continuum::build(
                &[],
                cachelink_core::DistributionKind::Ketama,
                cachelink_core::HashKind::Fnv1a64,
            )),
            nlive_server: AtomicUsize::new(0),
            rebuild_pending: AtomicBool::new(false),
            next_rebuild_micros: AtomicU64::new(0),
            listener_open: AtomicBool::new(true),
            client_conn_count: AtomicUsize::new(0),
            reload_state: Mutex::new(ReloadState::OldAndActive),
            counterpart: Mutex::new(None),
            freed: AtomicBool::new(false),
        });
        pool.rebuild_now(now_micros);
        Ok(pool)
    }

    pub fn record(&self) -> &PoolRecord {
        &self.record
    }

    pub fn servers(&self) -> &[Arc<Server<T::Conn>>] {
        &self.servers
    }

    pub fn nlive_server(&self) -> usize {
        self.nlive_server.load(Ordering::Acquire)
    }

    pub fn ncontinuum(&self) -> usize {
        self.continuum.load().ncontinuum()
    }

    pub fn nserver_continuum(&self) -> usize {
        self.continuum.load().nserver_continuum()
    }

    fn rebuild_now(&self, now_micros: u64) {
        let snapshot: Vec<ContinuumServer> = self
            .servers
            .iter()
            .map(|s| ContinuumServer {
                index: s.index,
                name: s.name.clone(),
                weight: s.weight,
                live: s.is_live(now_micros),
            })
            .collect();
        let live = snapshot.iter().filter(|s| s.live).count();
        let continuum = Continuum::build(&snapshot, self.record.distribution, self.record.hash);
        self.nlive_server.store(live, Ordering::Release);
        self.continuum.store(Arc::new(continuum));
        self.rebuild_pending.store(false, Ordering::Release);
        self.next_rebuild_micros
            .store(now_micros + REBUILD_INTERVAL_MICROS, Ordering::Release);
    }

    /// Idempotent rebuild trigger: a probe success racing an
    /// already-scheduled rebuild just finds the flag already set and does
    /// nothing extra.
    pub fn schedule_rebuild(&self, now_micros: u64) {
        if self.rebuild_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rebuild_now(now_micros);
    }

    pub fn next_rebuild_micros(&self) -> u64 {
        self.next_rebuild_micros.load(Ordering::Acquire)
    }

    /// Rebuild trigger (c) of spec §4.1: fires a rebuild once `next_rebuild`
    /// has passed, independent of any ejection/retry event. Meant to be
    /// polled periodically by the caller (`cachelink-proxy` drives this from
    /// the same timer its hot-reload poller already runs on); a no-op when
    /// the deadline hasn't arrived yet.
    pub fn rebuild_if_due(&self, now_micros: u64) {
        if now_micros >= self.next_rebuild_micros.load(Ordering::Acquire) {
            self.schedule_rebuild(now_micros);
        }
    }

    /// Pure lookup exposed for tests: which server would own `key`,
    /// without opening any connection. Returns
    /// `None` if the key maps to an ejected server under
    /// `auto_eject_hosts`, or if there is no live server at all.
    pub fn server_pool_idx(&self, key: &[u8]) -> Option<usize> {
        let tagged = self.apply_hash_tag(key);
        let continuum = self.continuum.load();
        let idx = continuum.query(&tagged)?;
        let server = &self.servers[idx];
        if self.record.auto_eject_hosts && server.is_ejected() {
            return None;
        }
        Some(idx)
    }

    fn apply_hash_tag<'a>(&self, key: &'a [u8]) -> std::borrow::Cow<'a, [u8]> {
        match &self.record.hash_tag {
            Some(tag) => std::borrow::Cow::Borrowed(tag.apply(key)),
            None => std::borrow::Cow::Borrowed(key),
        }
    }

    /// Key -> connection pipeline: hash-tag, hash, continuum lookup,
    /// resolve to a server, then select/open a connection. Applies failure
    /// accounting and the single-probe-per-ejection-window rule along the
    /// way. Still routes in `OldToShutdown` — that state only means
    /// "about to stop accepting new clients" (spec §4.4); requests already
    /// in flight on an old pool must keep being served until
    /// `finish_replacement` actually closes its listener and advances it to
    /// `OldDraining` (spec §7 scopes `PoolUnavailable` to `OldDraining`/
    /// `NewWaitForOld` only).
    pub async fn server_pool_conn(&self, key: &[u8], now_micros: u64) -> Dispatch {
        if !matches!(
            self.reload_state(),
            ReloadState::OldAndActive | ReloadState::OldToShutdown | ReloadState::New
        ) {
            return Dispatch::Unavailable(CachelinkError::PoolUnavailable(self.name.clone()));
        }

        let tagged = self.apply_hash_tag(key).into_owned();
        let continuum = self.continuum.load_full();
        let Some(idx) = continuum.query(&tagged) else {
            return Dispatch::Unavailable(CachelinkError::NoServerAvailable);
        };
        let server = Arc::clone(&self.servers[idx]);

        if server.is_ejected() {
            if now_micros < server.next_retry_micros() {
                return Dispatch::Unavailable(CachelinkError::NoServerAvailable);
            }
            if !server.try_claim_probe() {
                return Dispatch::Unavailable(CachelinkError::NoServerAvailable);
            }
            let result = server
                .acquire_conn(&self.transport, self.record.server_connections as usize)
                .await;
            server.release_probe();
            return match result {
                Ok(conn_index) => {
                    server.record_success();
                    self.schedule_rebuild(now_micros);
                    Dispatch::ToServer(ConnHandle {
                        server_index: idx,
                        conn_index,
                    })
                }
                Err(_) => {
                    server.retry_after_probe_failure(
                        now_micros,
                        self.record.server_retry_timeout_ms * 1_000,
                    );
                    Dispatch::Unavailable(CachelinkError::NoServerAvailable)
                }
            };
        }

        match server
            .acquire_conn(&self.transport, self.record.server_connections as usize)
            .await
        {
            Ok(conn_index) => Dispatch::ToServer(ConnHandle {
                server_index: idx,
                conn_index,
            }),
            Err(e) => {
                self.report_failure(idx, now_micros);
                Dispatch::Unavailable(e)
            }
        }
    }

    /// Called by the connection layer when a completed exchange on
    /// `server_index` succeeded.
    pub fn report_success(&self, server_index: usize) {
        self.servers[server_index].record_success();
    }

    /// Called by the connection layer on a transport error or timeout.
    /// May eject the server and schedule a rebuild.
    pub fn report_failure(&self, server_index: usize, now_micros: u64) {
        let server = &self.servers[server_index];
        let became_dead = server.record_failure(
            now_micros,
            self.record.server_failure_limit,
            self.record.auto_eject_hosts,
            self.record.server_retry_timeout_ms * 1_000,
        );
        if became_dead {
            tracing::warn!(pool = %self.name, server = %server.name, "server ejected");
            self.schedule_rebuild(now_micros);
        }
    }

    /// Opens one connection per server up to `server_connections` at pool
    /// start. Errors are logged and do not abort startup.
    pub async fn preconnect(&self, now_micros: u64) {
        if !self.record.preconnect {
            return;
        }
        for server in &self.servers {
            if !server.is_live(now_micros) {
                continue;
            }
            for _ in 0..self.record.server_connections {
                if let Err(e) = server
                    .acquire_conn(&self.transport, self.record.server_connections as usize)
                    .await
                {
                    tracing::warn!(pool = %self.name, server = %server.name, error = %e, "preconnect failed");
                }
            }
        }
    }

    /// Closes all server connections, leaving the pool object intact (used
    /// while draining during reload).
    pub async fn disconnect(&self) {
        for server in &self.servers {
            server.close_all().await;
        }
    }

    pub fn register_client(&self) {
        self.client_conn_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn deregister_client(&self) {
        self.client_conn_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn client_conn_count(&self) -> usize {
        self.client_conn_count.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.listener_open.load(Ordering::Acquire)
            && matches!(
                self.reload_state(),
                ReloadState::OldAndActive | ReloadState::OldToShutdown | ReloadState::New
            )
    }

    pub fn close_listener(&self) {
        self.listener_open.store(false, Ordering::Release);
    }

    pub fn reload_state(&self) -> ReloadState {
        *self.reload_state.lock()
    }

    pub fn set_reload_state(&self, state: ReloadState) {
        *self.reload_state.lock() = state;
    }

    pub fn counterpart(&self) -> Option<Arc<ServerPool<T>>> {
        self.counterpart.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_counterpart(&self, counterpart: Option<Weak<ServerPool<T>>>) {
        *self.counterpart.lock() = counterpart;
    }

    pub fn clear_counterpart(&self) {
        *self.counterpart.lock() = None;
    }

    /// Whether this (old) pool has fully drained and handed off to its
    /// counterpart — see the `freed` field doc for why this isn't folded
    /// into `reload_state`.
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    /// Whether this pool's listening endpoint is identical to `other`'s —
    /// pools that differ here may swap listeners immediately on reload;
    /// identical ones require a drain.
    pub fn same_endpoint(&self, other: &ServerPool<T>) -> bool {
        self.listen == other.listen
    }
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| CachelinkError::ResolveFailed(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| CachelinkError::ResolveFailed(format!("{host}:{port}: no addresses")))
}
