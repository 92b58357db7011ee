//! Microservice bootstrap: health/readiness types, the service trait every
//! cachelink binary implements, and the signal-driven runtime loop that
//! drives start/reload/shutdown.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use crate::error::Result;

/// Health status for liveness probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Readiness status for readiness probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
    pub latency_ms: Option<u64>,
}

/// Standard trait every cachelink binary implements: service identity,
/// health/readiness probes, and a lifecycle. Adds a `reload` hook for the
/// hot-reload operational surface: a config-reload trigger that supplies a
/// new parsed pool list, distinct from graceful shutdown.
#[async_trait]
pub trait CachelinkService: Send + Sync + 'static {
    /// Service identifier, e.g. "cachelink-proxy".
    fn service_id(&self) -> &'static str;

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Is the service alive?
    async fn health(&self) -> HealthStatus;

    /// Are all dependencies (listeners, pools) available?
    async fn ready(&self) -> ReadinessStatus;

    /// Re-read configuration and kick off hot-reload (`kick_replacement`).
    async fn reload(&self) -> Result<()>;

    /// Graceful shutdown: stop accepting, drain, free pools.
    async fn shutdown(&self) -> Result<()>;

    /// Start the service's listeners / servers.
    async fn start(&self) -> Result<()>;
}

/// Standard microservice runtime bootstrap: starts the service, then blocks
/// on OS signals, dispatching `SIGHUP` to `reload` and `SIGTERM`/Ctrl-C to
/// `shutdown`.
pub struct MicroserviceRuntime {
    start_time: std::time::Instant,
}

enum ControlSignal {
    Reload,
    Shutdown,
}

impl MicroserviceRuntime {
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }

    /// Run a microservice with standard lifecycle management.
    pub async fn run<S: CachelinkService>(service: Arc<S>) -> Result<()> {
        let runtime = Self::new();

        info!(
            service_id = service.service_id(),
            version = service.version(),
            "Starting microservice"
        );

        let service_clone = service.clone();
        let service_handle = tokio::spawn(async move {
            if let Err(e) = service_clone.start().await {
                tracing::error!("Service error: {}", e);
            }
        });

        loop {
            match Self::wait_for_signal().await {
                ControlSignal::Reload => {
                    info!("Reload signal received");
                    if let Err(e) = service.reload().await {
                        warn!("Error during reload: {}", e);
                    }
                }
                ControlSignal::Shutdown => {
                    info!("Shutdown signal received, gracefully stopping...");
                    break;
                }
            }
        }

        if let Err(e) = service.shutdown().await {
            warn!("Error during shutdown: {}", e);
        }

        service_handle.abort();

        info!(
            uptime_seconds = runtime.start_time.elapsed().as_secs(),
            "Microservice stopped"
        );

        Ok(())
    }

    async fn wait_for_signal() -> ControlSignal {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        };

        #[cfg(unix)]
        {
            let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to listen for SIGTERM");
            let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
                .expect("failed to listen for SIGHUP");

            tokio::select! {
                _ = ctrl_c => ControlSignal::Shutdown,
                _ = terminate.recv() => ControlSignal::Shutdown,
                _ = hangup.recv() => ControlSignal::Reload,
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await;
            ControlSignal::Shutdown
        }
    }
}

impl Default for MicroserviceRuntime {
    fn default() -> Self {
        Self::new()
    }
}
