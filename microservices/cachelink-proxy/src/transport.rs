//! The real tokio-TCP `ServerTransport`/`ServerConnection`/`ClientConnection`
//! implementations cachelink-pool's core is generic over (spec §4.2
//! Connection layer contract). Nothing here is cache-protocol aware beyond
//! the one exception spec §1's Non-goals carve back in: forwarding an
//! opaque password (and optional db index) to Redis right after connect.
//! Otherwise this is plain socket plumbing, the same layer the teacher's
//! `smpp.rs` wraps around its PDU framing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cachelink_core::{CachelinkError, PoolRecord, Result};
use cachelink_pool::connection::{BoxFuture, ClientConnection, ServerConnection, ServerTransport};
use tokio::net::TcpStream;

use crate::framing;

/// Opens real TCP connections to backend cache servers. Carries the one
/// piece of per-pool state a connection needs at connect time: whether to
/// speak Redis's post-connect handshake (`AUTH`/`SELECT`), the forwarded
/// password, and the db index.
#[derive(Clone, Default)]
pub struct TcpTransport {
    redis: bool,
    redis_auth: Option<String>,
    redis_db: u32,
}

impl TcpTransport {
    pub fn for_pool(record: &PoolRecord) -> Self {
        Self {
            redis: record.redis,
            redis_auth: record.redis_auth.clone(),
            redis_db: record.redis_db,
        }
    }
}

impl ServerTransport for TcpTransport {
    type Conn = TcpServerConn;

    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, Result<Self::Conn>> {
        Box::pin(async move {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| CachelinkError::ConnectFailed(format!("{addr}: {e}")))?;
            stream
                .set_nodelay(true)
                .map_err(|e| CachelinkError::ConnectFailed(format!("{addr}: {e}")))?;

            if self.redis {
                if let Some(password) = &self.redis_auth {
                    redis_handshake_line(&mut stream, format!("AUTH {password}").as_bytes(), addr).await?;
                }
                if self.redis_db != 0 {
                    redis_handshake_line(
                        &mut stream,
                        format!("SELECT {}", self.redis_db).as_bytes(),
                        addr,
                    )
                    .await?;
                }
            }

            Ok(TcpServerConn {
                stream,
                errored: false,
            })
        })
    }
}

/// Sends one inline Redis command and consumes its one-line reply, failing
/// the connect on a `-ERR` reply or a transport error. Only used for the
/// `AUTH`/`SELECT` handshake; ordinary request forwarding never goes
/// through here.
async fn redis_handshake_line(stream: &mut TcpStream, command: &[u8], addr: SocketAddr) -> Result<()> {
    framing::write_line(stream, command)
        .await
        .map_err(|e| CachelinkError::ConnectFailed(format!("{addr}: redis handshake write: {e}")))?;
    let mut buf = bytes::BytesMut::new();
    let reply = framing::read_line(stream, &mut buf)
        .await
        .map_err(|e| CachelinkError::ConnectFailed(format!("{addr}: redis handshake read: {e}")))?
        .ok_or_else(|| CachelinkError::ConnectFailed(format!("{addr}: redis handshake: connection closed")))?;
    if reply.starts_with(b"-") {
        return Err(CachelinkError::ConnectFailed(format!(
            "{addr}: redis handshake rejected: {}",
            String::from_utf8_lossy(&reply)
        )));
    }
    Ok(())
}

/// One backend connection. `errored` is sticky: once a read/write fails the
/// connection is dead and `cachelink-pool` retires it on the next cleanup
/// pass rather than reusing it.
pub struct TcpServerConn {
    pub stream: TcpStream,
    errored: bool,
}

impl TcpServerConn {
    pub fn mark_errored(&mut self) {
        self.errored = true;
    }
}

impl ServerConnection for TcpServerConn {
    fn is_errored(&self) -> bool {
        self.errored
    }

    fn close(&mut self) {
        self.errored = true;
    }
}

/// A client connection accepted on a pool's listener. `cachelink-pool` only
/// ever asks whether it's still open (spec §4.4 drain-completion check);
/// the socket itself, and all request/response framing, stay local to the
/// accept loop that owns it.
#[derive(Clone, Default)]
pub struct TcpClientConn {
    open: Arc<AtomicBool>,
}

impl TcpClientConn {
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl ClientConnection for TcpClientConn {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
