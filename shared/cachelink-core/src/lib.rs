//! cachelink-core — shared domain types and service infrastructure.
//!
//! This crate provides:
//! - The `CachelinkError` taxonomy
//! - The pool config-file schema and YAML loader
//! - The standard service trait and signal-driven runtime every
//!   cachelink binary bootstraps from

pub mod config;
pub mod error;
pub mod service;

pub use config::{ConfigFile, DistributionKind, HashKind, HashTag, PoolRecord, ServerRecord};
pub use error::{CachelinkError, Result};
pub use service::{
    CachelinkService, DependencyStatus, HealthStatus, MicroserviceRuntime, ReadinessStatus,
};
