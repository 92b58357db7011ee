//! Folding traversal over a registry: pools in registry order, servers in
//! pool-array order, server-connections before client-connections within a
//! pool. Exposed as separate visitor capabilities rather than a single
//! erased-pointer callback — stats, logging, and shutdown each only care
//! about a subset of element kinds.
//!
//! Client connections themselves are real sockets owned by the proxy's
//! accept loop, not this crate; `visit_client_connections` is handed the
//! pool's live count (the same one the hot-reload drain check uses) rather
//! than per-connection objects. A caller that needs to act on each open
//! client socket (e.g. to close them on shutdown) keeps its own registry
//! keyed by pool name and drives that from `visit_pool`.

use crate::connection::ServerTransport;
use crate::pool::ServerPool;
use crate::registry::PoolsRegistry;
use crate::server::Server;

/// Visitor capabilities for a registry traversal. All methods default to a
/// no-op, so implementors only override the element kinds they care about.
pub trait Visitor<T: ServerTransport> {
    fn visit_pool(&mut self, _pool: &ServerPool<T>) {}
    fn visit_server(&mut self, _pool: &ServerPool<T>, _server: &Server<T::Conn>) {}
    fn visit_server_connection(
        &mut self,
        _pool: &ServerPool<T>,
        _server: &Server<T::Conn>,
        _conn_index: usize,
    ) {
    }
    fn visit_client_connections(&mut self, _pool: &ServerPool<T>, _count: usize) {}
}

/// Runs `visitor` over every pool, server, and connection in `registry`, in
/// a deterministic order.
pub fn traverse<T: ServerTransport>(registry: &PoolsRegistry<T>, visitor: &mut impl Visitor<T>) {
    for pool in registry.pools() {
        visitor.visit_pool(pool);
        for server in pool.servers() {
            visitor.visit_server(pool, server);
            for conn_index in 0..server.connection_count() {
                visitor.visit_server_connection(pool, server, conn_index);
            }
        }
        visitor.visit_client_connections(pool, pool.client_conn_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockTransport;
    use cachelink_core::{DistributionKind, HashKind, PoolRecord, ServerRecord};
    use std::sync::Arc;

    fn record(name: &str, n_servers: usize) -> PoolRecord {
        PoolRecord {
            name: name.into(),
            listen: "127.0.0.1:22121".parse().unwrap(),
            distribution: DistributionKind::Ketama,
            hash: HashKind::Fnv1a64,
            hash_tag: None,
            timeout_ms: 400,
            backlog: 512,
            client_connections: 0,
            server_connections: 2,
            server_retry_timeout_ms: 30_000,
            server_failure_limit: 2,
            auto_eject_hosts: true,
            preconnect: false,
            redis: false,
            redis_auth: None,
            redis_db: 0,
            servers: (0..n_servers)
                .map(|i| ServerRecord {
                    host: "127.0.0.1".into(),
                    port: 11211 + i as u16,
                    weight: 1,
                    name: None,
                })
                .collect(),
        }
    }

    #[derive(Default)]
    struct Counts {
        pools: usize,
        servers: usize,
        server_connections: usize,
        client_connection_tallies: Vec<usize>,
    }

    impl<T: ServerTransport> Visitor<T> for Counts {
        fn visit_pool(&mut self, _pool: &ServerPool<T>) {
            self.pools += 1;
        }

        fn visit_server(&mut self, _pool: &ServerPool<T>, _server: &Server<T::Conn>) {
            self.servers += 1;
        }

        fn visit_server_connection(
            &mut self,
            _pool: &ServerPool<T>,
            _server: &Server<T::Conn>,
            _conn_index: usize,
        ) {
            self.server_connections += 1;
        }

        fn visit_client_connections(&mut self, _pool: &ServerPool<T>, count: usize) {
            self.client_connection_tallies.push(count);
        }
    }

    #[tokio::test]
    async fn visits_every_pool_server_and_connection_in_order() {
        let transport = MockTransport::new();
        let p1 = ServerPool::try_new(0, record("p1", 2), transport.clone(), 0).unwrap();
        let p2 = ServerPool::try_new(1, record("p2", 1), transport.clone(), 0).unwrap();

        // Open one connection on each server of p1 by dispatching a key to each.
        for key in [b"a" as &[u8], b"b"] {
            if let Some(idx) = p1.server_pool_idx(key) {
                let _ = p1.server_pool_conn(key, 0).await;
                let _ = idx;
            }
        }
        p2.register_client();
        p2.register_client();

        let registry = PoolsRegistry::new(vec![Arc::clone(&p1), Arc::clone(&p2)]);

        let mut counts = Counts::default();
        traverse(&registry, &mut counts);

        assert_eq!(counts.pools, 2);
        assert_eq!(counts.servers, 3); // 2 servers in p1 + 1 in p2
        assert_eq!(counts.client_connection_tallies, vec![0, 2]);
    }
}
