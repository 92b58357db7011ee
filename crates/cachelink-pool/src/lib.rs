//! cachelink-pool — the routing core: servers, pools, hot reload, and
//! traversal. Generic over the connection layer so this crate never
//! touches a real socket; `cachelink-proxy` supplies the
//! tokio-TCP `ServerTransport`, this crate's own tests supply the in-memory
//! `mock` one (see `connection::mock`).

pub mod connection;
pub mod pool;
pub mod registry;
pub mod server;
pub mod traversal;

pub use connection::{ClientConnection, ConnHandle, Dispatch, ServerConnection, ServerTransport};
pub use pool::ServerPool;
pub use registry::{PoolsRegistry, ReloadState};
pub use server::Server;
pub use traversal::{traverse, Visitor};
