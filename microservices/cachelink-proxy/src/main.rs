//! cachelink-proxy — routing and distribution core for a sharded
//! memcached/Redis backend (spec §1). Wires the config loader, the
//! `cachelink-pool` routing core, and the `cachelink-dist` continuum
//! builder into a running proxy: one accept loop per pool, SIGHUP-driven
//! hot reload, and a `/health`+`/ready` surface, following the same
//! bootstrap shape (`CachelinkService` + `MicroserviceRuntime`) every
//! binary in this workspace uses.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cachelink_core::{MicroserviceRuntime, Result};
use clap::Parser;
use tracing::info;

mod framing;
mod service;
mod transport;

use service::CachelinkProxyService;

/// A sharded-cache proxy: routes each client request to the backend server
/// its key hashes to, per a YAML pool config.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML pool configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "cachelink.yaml")]
    config: PathBuf,

    /// Address the `/health` and `/ready` HTTP surface binds to.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:8080")]
    health_addr: SocketAddr,

    /// How often to poll in-flight hot-reloads for drain completion.
    #[arg(long, value_name = "MS", default_value_t = 250)]
    reload_poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cachelink_proxy=info".parse().unwrap()),
        )
        .json()
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "starting cachelink-proxy");

    let service = Arc::new(
        CachelinkProxyService::new(
            args.config,
            Duration::from_millis(args.reload_poll_ms),
            args.health_addr,
        )
        .await?,
    );

    MicroserviceRuntime::run(service).await
}
