//! cachelink-dist — the distribution (continuum) layer.
//!
//! Builds and queries the key-hash -> server-index mapping for one pool
//! (spec §4.1). This crate knows nothing about connections, servers, or
//! pools; it operates on a bare `&[ContinuumServer]` slice and produces an
//! immutable `Continuum` value that the pool layer holds behind an
//! `arc_swap::ArcSwap` (see `cachelink-pool`).

pub mod continuum;
pub mod hash;

pub use continuum::{Continuum, ContinuumEntry, ContinuumServer};
pub use hash::hash as hash_key;
