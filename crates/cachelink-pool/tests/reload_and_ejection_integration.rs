//! End-to-end scenarios spanning `ServerPool` and `PoolsRegistry` together,
//! exercised only through the crate's public API (no `cfg(test)` internals) —
//! the same separation the teacher keeps between unit tests living beside
//! the code and a top-level `tests/` integration suite.

use std::sync::Arc;

use cachelink_core::{DistributionKind, HashKind, HashTag, PoolRecord, ServerRecord};
use cachelink_pool::connection::mock::MockTransport;
use cachelink_pool::{Dispatch, PoolsRegistry, ReloadState, ServerPool};

fn pool_record(name: &str, port: u16, servers: Vec<(&str, u32)>, distribution: DistributionKind) -> PoolRecord {
    PoolRecord {
        name: name.into(),
        listen: format!("127.0.0.1:{port}").parse().unwrap(),
        distribution,
        hash: HashKind::Fnv1a64,
        hash_tag: HashTag::parse("{}").unwrap(),
        timeout_ms: 400,
        backlog: 512,
        client_connections: 0,
        server_connections: 1,
        server_retry_timeout_ms: 30_000,
        server_failure_limit: 2,
        auto_eject_hosts: true,
        preconnect: false,
        redis: false,
        redis_auth: None,
        redis_db: 0,
        servers: servers
            .into_iter()
            .map(|(name, weight)| ServerRecord {
                host: "127.0.0.1".into(),
                port: 11211,
                weight,
                name: Some(name.into()),
            })
            .collect(),
    }
}

/// S1 — ketama determinism: a key keeps resolving to the same live server
/// across repeated lookups, and killing an unrelated server doesn't move it.
#[tokio::test]
async fn s1_ketama_determinism_survives_an_unrelated_ejection() {
    let rec = pool_record("app_cache", 22121, vec![("a", 1), ("b", 1), ("c", 1)], DistributionKind::Ketama);
    let pool = ServerPool::try_new(0, rec, MockTransport::new(), 0).unwrap();

    let first = pool.server_pool_idx(b"user:42").unwrap();
    let second = pool.server_pool_idx(b"user:42").unwrap();
    assert_eq!(first, second);

    // Eject whichever server "user:42" did NOT land on.
    let victim = (first + 1) % 3;
    pool.report_failure(victim, 0);
    pool.report_failure(victim, 0);

    let after = pool.server_pool_idx(b"user:42");
    assert_eq!(after, Some(first), "unrelated ejection must not move an already-resolved key");
}

/// S2 — hash tag: two keys sharing a `{user42}` tag co-locate; an untagged
/// key is free to land elsewhere.
#[test]
fn s2_hash_tag_colocates_tagged_keys() {
    let rec = pool_record("app_cache", 22122, vec![("a", 1), ("b", 1), ("c", 1)], DistributionKind::Ketama);
    let pool = ServerPool::try_new(0, rec, MockTransport::new(), 0).unwrap();

    let profile = pool.server_pool_idx(b"{user42}.profile").unwrap();
    let sessions = pool.server_pool_idx(b"{user42}.sessions").unwrap();
    assert_eq!(profile, sessions);

    // "orphan" hashes independently of the tag extraction (it has no braces
    // at all, so the full key is used) — just confirm it resolves cleanly.
    assert!(pool.server_pool_idx(b"orphan").is_some());
}

/// S3 — ejection and retry: two consecutive failures eject a server; before
/// `next_retry` it's excluded from lookups, and a single probe at/after the
/// deadline restores it.
#[tokio::test]
async fn s3_ejection_then_timed_retry_restores_the_server() {
    let rec = pool_record("app_cache", 22123, vec![("a", 1), ("b", 1)], DistributionKind::Ketama);
    let transport = MockTransport::new();
    let pool = ServerPool::try_new(0, rec, transport.clone(), 0).unwrap();

    let key = (0..1000u32)
        .map(|i| format!("k{i}"))
        .find(|k| pool.server_pool_idx(k.as_bytes()) == Some(0))
        .expect("some key maps to server 0");

    transport.fail_next(2);
    assert!(matches!(pool.server_pool_conn(key.as_bytes(), 0).await, Dispatch::Unavailable(_)));
    assert!(matches!(pool.server_pool_conn(key.as_bytes(), 1).await, Dispatch::Unavailable(_)));
    assert!(pool.servers()[0].is_ejected());

    // Still ejected just before the deadline: no dispatch to server 0.
    let retry_at = pool.servers()[0].next_retry_micros();
    assert_eq!(pool.server_pool_idx(key.as_bytes()), None);

    // At the deadline, exactly one probe is made and it succeeds.
    let dispatch = pool.server_pool_conn(key.as_bytes(), retry_at).await;
    assert!(matches!(dispatch, Dispatch::ToServer(_)));
    assert!(!pool.servers()[0].is_ejected());
}

/// S4 — modulo distribution: selected index is always `hash % nserver`,
/// sampled over many keys stays within tolerance of uniform.
#[test]
fn s4_modula_distributes_near_uniform() {
    let rec = pool_record(
        "app_cache",
        22124,
        vec![("a", 1), ("b", 1), ("c", 1), ("d", 1)],
        DistributionKind::Modula,
    );
    let pool = ServerPool::try_new(0, rec, MockTransport::new(), 0).unwrap();

    let mut counts = [0u32; 4];
    for i in 0..2000u32 {
        let idx = pool.server_pool_idx(format!("k{i}").as_bytes()).unwrap();
        counts[idx] += 1;
    }
    for count in counts {
        let frac = count as f64 / 2000.0;
        assert!((frac - 0.25).abs() < 0.05, "frac={frac}");
    }
}

/// S5 — hot reload, endpoint unchanged: drain blocks the cutover until the
/// last client connection closes, then the new pool takes over.
#[tokio::test]
async fn s5_reload_same_endpoint_cuts_over_after_drain() {
    let old = ServerPool::try_new(
        0,
        pool_record("P", 22125, vec![("a", 1), ("b", 1)], DistributionKind::Ketama),
        MockTransport::new(),
        0,
    )
    .unwrap();
    let new = ServerPool::try_new(
        0,
        pool_record("P", 22125, vec![("a", 1), ("b", 1), ("c", 1)], DistributionKind::Ketama),
        MockTransport::new(),
        0,
    )
    .unwrap();

    let old_registry = PoolsRegistry::new(vec![Arc::clone(&old)]);
    let new_registry = PoolsRegistry::new(vec![Arc::clone(&new)]);

    old_registry.kick_replacement(&new_registry);
    assert_eq!(old.reload_state(), ReloadState::OldToShutdown);
    assert_eq!(new.reload_state(), ReloadState::NewWaitForOld);

    old.register_client();
    assert!(!old_registry.finish_replacement(&new_registry).await);
    assert_eq!(old.reload_state(), ReloadState::OldDraining);
    assert!(!old.is_accepting());

    old.deregister_client();
    assert!(old_registry.finish_replacement(&new_registry).await);
    assert_eq!(new.reload_state(), ReloadState::New);
    assert!(old.is_freed());
}

/// S6 — hot reload, disjoint names: old `{A, B}`, new `{B, C}` converges
/// with `A` freed, `B` handed off via drain, `C` started fresh.
#[tokio::test]
async fn s6_reload_disjoint_pool_names_converges() {
    let a = ServerPool::try_new(0, pool_record("A", 22126, vec![("a", 1)], DistributionKind::Ketama), MockTransport::new(), 0).unwrap();
    let b_old = ServerPool::try_new(1, pool_record("B", 22127, vec![("b", 1)], DistributionKind::Ketama), MockTransport::new(), 0).unwrap();
    let b_new = ServerPool::try_new(0, pool_record("B", 22127, vec![("b", 1), ("b2", 1)], DistributionKind::Ketama), MockTransport::new(), 0).unwrap();
    let c = ServerPool::try_new(1, pool_record("C", 22128, vec![("c", 1)], DistributionKind::Ketama), MockTransport::new(), 0).unwrap();

    let old_registry = PoolsRegistry::new(vec![Arc::clone(&a), Arc::clone(&b_old)]);
    let new_registry = PoolsRegistry::new(vec![Arc::clone(&b_new), Arc::clone(&c)]);

    old_registry.kick_replacement(&new_registry);
    assert!(old_registry.finish_replacement(&new_registry).await);

    assert!(a.is_freed());
    assert!(b_old.is_freed());
    assert_eq!(b_new.reload_state(), ReloadState::New);
    assert_eq!(c.reload_state(), ReloadState::New);
}
