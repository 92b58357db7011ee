//! The proxy's service implementation: builds pools from config, runs one
//! accept loop per pool, forwards client request lines to the chosen
//! backend connection, and drives the hot-reload state machine (spec §4.3,
//! §4.4, §6). This is `cachelink-proxy`'s half of the split the routing
//! core (`cachelink-pool`) describes in §1: sockets, framing, and the
//! accept loop live here; continuum lookup, health/ejection, and the
//! reload protocol live in the core crate this module calls into.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::BytesMut;
use cachelink_core::{CachelinkError, CachelinkService, ConfigFile, HealthStatus, ReadinessStatus, Result};
use cachelink_pool::{ClientConnection, ConnHandle, Dispatch, PoolsRegistry, ReloadState, ServerPool};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::framing;
use crate::transport::{TcpClientConn, TcpTransport};

/// Microsecond clock reading the routing core threads through explicitly
/// (spec §3: `next_retry` is an absolute microsecond timestamp) rather than
/// reading internally, so ejection/retry logic stays deterministic under
/// test.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// One (old, new) registry pair under drain, plus which newly-active new
/// pools already have an accept loop running — a pool only needs one loop
/// spawned for its whole lifetime, whether that happens immediately (no
/// counterpart, or differing endpoint) or later when its counterpart
/// finishes draining (spec §4.4).
struct DrainEntry {
    old: Arc<PoolsRegistry<TcpTransport>>,
    new: Arc<PoolsRegistry<TcpTransport>>,
    started: Vec<AtomicBool>,
}

struct Inner {
    registry: Arc<PoolsRegistry<TcpTransport>>,
    draining: Vec<DrainEntry>,
}

/// The proxy microservice: owns the current pools registry, any in-flight
/// reloads, and the accept loops spawned for each active pool.
pub struct CachelinkProxyService {
    config_path: PathBuf,
    reload_poll: Duration,
    health_addr: SocketAddr,
    inner: Arc<Mutex<Inner>>,
    start_time: std::time::Instant,
}

impl CachelinkProxyService {
    pub async fn new(config_path: PathBuf, reload_poll: Duration, health_addr: SocketAddr) -> Result<Self> {
        let config = ConfigFile::load_from_path(&config_path)?;
        let registry = Arc::new(build_registry(&config)?);
        for pool in registry.pools() {
            pool.preconnect(now_micros()).await;
        }

        Ok(Self {
            config_path,
            reload_poll,
            health_addr,
            inner: Arc::new(Mutex::new(Inner {
                registry,
                draining: Vec::new(),
            })),
            start_time: std::time::Instant::now(),
        })
    }

    fn current_registry(&self) -> Arc<PoolsRegistry<TcpTransport>> {
        Arc::clone(&self.inner.lock().unwrap().registry)
    }

    /// Periodically polls every in-flight reload's `finish_replacement`,
    /// spawning accept loops for new pools the moment they reach `New`, and
    /// dropping converged (old, new) pairs once the old side is fully
    /// freed and no new pool is left waiting (spec §4.4). Runs for the
    /// lifetime of the service; driven directly from `start()` rather than
    /// as its own spawned task, since it only ever needs `&self`.
    ///
    /// Also doubles as the timer for rebuild trigger (c) of spec §4.1: every
    /// tick, every pool this service currently knows about — active or still
    /// draining from an earlier reload — gets a chance to rebuild its
    /// continuum if its `next_rebuild` deadline has passed.
    async fn run_reload_poller(&self) {
        let mut ticker = tokio::time::interval(self.reload_poll);
        loop {
            ticker.tick().await;
            let now = now_micros();

            for pool in self.current_registry().pools() {
                pool.rebuild_if_due(now);
            }

            // Take the pending entries out from under the lock so the
            // `.await`s inside `finish_replacement` never hold it.
            let pending: Vec<DrainEntry> = {
                let mut inner = self.inner.lock().unwrap();
                std::mem::take(&mut inner.draining)
            };

            for entry in &pending {
                for pool in entry.old.pools().iter().chain(entry.new.pools()) {
                    pool.rebuild_if_due(now);
                }
            }

            let mut still_draining = Vec::with_capacity(pending.len());
            for entry in pending {
                let converged = entry.old.finish_replacement(&entry.new).await;
                for (i, pool) in entry.new.pools().iter().enumerate() {
                    if pool.reload_state() == ReloadState::New && !entry.started[i].swap(true, Ordering::AcqRel) {
                        tokio::spawn(accept_loop(Arc::clone(pool)));
                    }
                }
                if converged {
                    info!("reload converged, old pool generation fully freed");
                } else {
                    still_draining.push(entry);
                }
            }

            self.inner.lock().unwrap().draining.extend(still_draining);
        }
    }
}

fn build_registry(config: &ConfigFile) -> Result<PoolsRegistry<TcpTransport>> {
    let now = now_micros();
    let mut pools = Vec::with_capacity(config.pools.len());
    for (i, record) in config.pools.iter().enumerate() {
        pools.push(ServerPool::try_new(
            i,
            record.clone(),
            TcpTransport::for_pool(record),
            now,
        )?);
    }
    Ok(PoolsRegistry::new(pools))
}

#[async_trait]
impl CachelinkService for CachelinkProxyService {
    fn service_id(&self) -> &'static str {
        "cachelink-proxy"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let registry = self.current_registry();
        let dependencies = registry
            .pools()
            .iter()
            .map(|pool| cachelink_core::DependencyStatus {
                name: pool.name.clone(),
                available: pool.nlive_server() > 0,
                latency_ms: None,
            })
            .collect::<Vec<_>>();
        let ready = dependencies.iter().all(|d| d.available);
        ReadinessStatus { ready, dependencies }
    }

    async fn reload(&self) -> Result<()> {
        info!(path = %self.config_path.display(), "reloading config");
        let config = ConfigFile::load_from_path(&self.config_path)?;
        let new_registry = Arc::new(build_registry(&config)?);

        let (old_registry, started) = {
            let inner = self.inner.lock().unwrap();
            let old = Arc::clone(&inner.registry);
            old.kick_replacement(&new_registry);
            let started: Vec<AtomicBool> = new_registry
                .pools()
                .iter()
                .map(|_| AtomicBool::new(false))
                .collect();
            (old, started)
        };

        // Pools born straight into `New` (no counterpart, or differing
        // endpoint per spec §4.4) can start accepting immediately.
        for (i, pool) in new_registry.pools().iter().enumerate() {
            if pool.reload_state() == ReloadState::New {
                pool.preconnect(now_micros()).await;
                started[i].store(true, Ordering::Release);
                tokio::spawn(accept_loop(Arc::clone(pool)));
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.registry = Arc::clone(&new_registry);
        inner.draining.push(DrainEntry {
            old: old_registry,
            new: new_registry,
            started,
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("shutting down cachelink-proxy");
        let registry = self.current_registry();
        for pool in registry.pools() {
            pool.close_listener();
            pool.set_reload_state(ReloadState::OldDraining);
            pool.disconnect().await;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let registry = self.current_registry();
        for pool in registry.pools() {
            tokio::spawn(accept_loop(Arc::clone(pool)));
        }

        let health_state = HealthState {
            inner: Arc::clone(&self.inner),
            service_id: self.service_id(),
            version: self.version(),
            start_time: self.start_time,
        };
        tokio::spawn(serve_health(self.health_addr, health_state));

        // Runs forever, driving hot-reload convergence; `MicroserviceRuntime`
        // holds this future until a shutdown signal arrives.
        self.run_reload_poller().await;
        Ok(())
    }
}

/// State backing the `/health` and `/ready` axum routes (spec §2's "easy
/// pieces" — out of the routing core's scope, but every cachelink binary
/// exposes the same surface per the teacher's `BrivasService` convention).
/// Holds its own `Arc` to the pools state rather than `&CachelinkProxyService`
/// so the routes satisfy axum's `'static` handler bound.
#[derive(Clone)]
struct HealthState {
    inner: Arc<Mutex<Inner>>,
    service_id: &'static str,
    version: &'static str,
    start_time: std::time::Instant,
}

async fn serve_health(addr: SocketAddr, state: HealthState) {
    let app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .with_state(state);

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "health/ready surface listening");
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "health server exited");
            }
        }
        Err(e) => warn!(%addr, error = %e, "failed to bind health listener"),
    }
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<HealthState>,
) -> axum::Json<HealthStatus> {
    axum::Json(HealthStatus {
        healthy: true,
        service_id: state.service_id.to_string(),
        version: state.version.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn ready_handler(
    axum::extract::State(state): axum::extract::State<HealthState>,
) -> axum::Json<ReadinessStatus> {
    let registry = Arc::clone(&state.inner.lock().unwrap().registry);
    let dependencies = registry
        .pools()
        .iter()
        .map(|pool| cachelink_core::DependencyStatus {
            name: pool.name.clone(),
            available: pool.nlive_server() > 0,
            latency_ms: None,
        })
        .collect::<Vec<_>>();
    let ready = dependencies.iter().all(|d| d.available);
    axum::Json(ReadinessStatus { ready, dependencies })
}

/// Binds `pool`'s listen address and accepts client connections until the
/// pool stops accepting (spec §4.4: a drained/shut-down pool's listener
/// closes first). Checked on a timer rather than blocking forever in
/// `accept()` so the loop notices the transition promptly and releases the
/// port for a same-endpoint counterpart to rebind (spec §4.4's "safely swap
/// listeners" case).
async fn accept_loop(pool: Arc<ServerPool<TcpTransport>>) {
    let listener = match TcpListener::bind(pool.listen).await {
        Ok(l) => l,
        Err(e) => {
            warn!(pool = %pool.name, error = %e, "failed to bind listener");
            return;
        }
    };
    info!(pool = %pool.name, addr = %pool.listen, "pool accepting connections");

    let mut poll_closed = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut socket, peer)) => {
                        let cap = pool.record().client_connections as usize;
                        if cap != 0 && pool.client_conn_count() >= cap {
                            debug!(pool = %pool.name, peer = %peer, cap, "client cap reached, rejecting connection");
                            let reply = error_line(&pool, &CachelinkError::PoolUnavailable(pool.name.clone()));
                            let _ = framing::write_line(&mut socket, &reply).await;
                            continue;
                        }
                        pool.register_client();
                        let pool = Arc::clone(&pool);
                        tokio::spawn(async move {
                            handle_client(pool.clone(), socket, peer).await;
                            pool.deregister_client();
                        });
                    }
                    Err(e) => warn!(pool = %pool.name, error = %e, "accept error"),
                }
            }
            _ = poll_closed.tick() => {
                if !pool.is_accepting() {
                    debug!(pool = %pool.name, "listener closing, draining existing clients");
                    break;
                }
            }
        }
    }
}

/// Reads request lines from one client connection, routes each to its
/// backend server, and relays the response line back (spec §2's data flow:
/// client -> pool -> hash-tagged key -> continuum -> server -> connection).
async fn handle_client(pool: Arc<ServerPool<TcpTransport>>, mut socket: TcpStream, peer: SocketAddr) {
    let client_conn = TcpClientConn::new();
    let mut buf = BytesMut::new();
    loop {
        let line = match framing::read_line(&mut socket, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(pool = %pool.name, peer = %peer, error = %e, "client read error");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }

        let reply = match framing::extract_key(&line) {
            Some(key) => dispatch_request(&pool, key, &line).await,
            None => error_line(&pool, &CachelinkError::NoServerAvailable),
        };

        if let Err(e) = framing::write_line(&mut socket, &reply).await {
            debug!(pool = %pool.name, peer = %peer, error = %e, "client write error");
            break;
        }
    }
    client_conn.mark_closed();
    debug_assert!(!client_conn.is_open());
}

/// Resolves `key` to a connection and forwards `line`, applying the
/// pool's timeout and failure accounting (spec §5, §7).
async fn dispatch_request(pool: &ServerPool<TcpTransport>, key: &[u8], line: &[u8]) -> Vec<u8> {
    let now = now_micros();
    match pool.server_pool_conn(key, now).await {
        Dispatch::Unavailable(err) => error_line(pool, &err),
        Dispatch::ToServer(handle) => match forward(pool, handle, line).await {
            Ok(response) => response,
            Err(err) => error_line(pool, &err),
        },
    }
}

async fn forward(pool: &ServerPool<TcpTransport>, handle: ConnHandle, line: &[u8]) -> Result<Vec<u8>> {
    let timeout = Duration::from_millis(pool.record().timeout_ms);
    let server = &pool.servers()[handle.server_index];

    let outcome = tokio::time::timeout(
        timeout,
        server.with_connection_async(handle.conn_index, |conn| async move {
            framing::write_line(&mut conn.stream, line).await?;
            let mut resp_buf = BytesMut::new();
            let resp = framing::read_line(&mut conn.stream, &mut resp_buf).await?;
            resp.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "backend closed connection")
            })
        }),
    )
    .await;

    match outcome {
        Err(_elapsed) => {
            mark_errored(pool, handle).await;
            pool.report_failure(handle.server_index, now_micros());
            Err(CachelinkError::Timeout(pool.record().timeout_ms))
        }
        Ok(None) => {
            // Connection slot vanished (e.g. retired by a concurrent
            // cleanup pass) — treat like a transport error.
            pool.report_failure(handle.server_index, now_micros());
            Err(CachelinkError::TransportError(
                server.name.clone(),
                "connection slot no longer present".to_string(),
            ))
        }
        Ok(Some(Err(io_err))) => {
            mark_errored(pool, handle).await;
            pool.report_failure(handle.server_index, now_micros());
            Err(CachelinkError::TransportError(server.name.clone(), io_err.to_string()))
        }
        Ok(Some(Ok(line))) => {
            pool.report_success(handle.server_index);
            Ok(line.to_vec())
        }
    }
}

async fn mark_errored(pool: &ServerPool<TcpTransport>, handle: ConnHandle) {
    let server = &pool.servers()[handle.server_index];
    server
        .with_connection(handle.conn_index, |conn| conn.mark_errored())
        .await;
}

/// Renders a `CachelinkError` as a protocol-appropriate error line: a
/// memcached `SERVER_ERROR` line, or a RESP/inline `-ERR` line for a
/// `redis: true` pool (spec §7).
fn error_line(pool: &ServerPool<TcpTransport>, err: &CachelinkError) -> Vec<u8> {
    if pool.record().redis {
        format!("-ERR {err}").into_bytes()
    } else {
        format!("SERVER_ERROR {err}").into_bytes()
    }
}
