//! Pools registry and hot-reload protocol.
//!
//! A reload replaces the entire registry: the caller builds a brand new
//! `PoolsRegistry` from freshly parsed config, calls `kick_replacement` to
//! pair it against the currently running one, then polls
//! `finish_replacement` until it returns `true` — at which point every pool
//! is in a terminal state and the old registry can simply be dropped.

use std::sync::Arc;

use crate::connection::ServerTransport;
use crate::pool::ServerPool;

/// Per-pool reload state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    /// Steady state: accepts clients, routes traffic.
    OldAndActive,
    /// Matched to a new pool; about to stop accepting.
    OldToShutdown,
    /// Listener closed; existing client connections still draining.
    OldDraining,
    /// New pool; listener not yet bound, waiting for counterpart to drain.
    NewWaitForOld,
    /// New pool fully active; counterpart link cleared.
    New,
}

/// An ordered list of pools. Traversal follows this order, so callers must
/// preserve config file order when constructing it.
pub struct PoolsRegistry<T: ServerTransport> {
    pools: Vec<Arc<ServerPool<T>>>,
}

impl<T: ServerTransport> PoolsRegistry<T> {
    pub fn new(pools: Vec<Arc<ServerPool<T>>>) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &[Arc<ServerPool<T>>] {
        &self.pools
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Arc<ServerPool<T>>> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Pairs `self` (the currently running, "old" registry) against `new`
    /// by pool name, links counterparts, and sets both sides' initial
    /// reload state. A new pool with no counterpart is born directly into
    /// `NewWaitForOld` and is advanced to `New` on the next
    /// `finish_replacement` poll without ever waiting on a drain. A
    /// counterpart pair whose listening endpoint differs can safely swap
    /// listeners immediately: the new pool goes straight to `New` with no
    /// cross-link, rather than waiting on the old pool's client connections
    /// to drain — only same-endpoint pairs (which must hand off one shared
    /// listener) are linked and made to wait.
    pub fn kick_replacement(&self, new: &PoolsRegistry<T>) {
        for old in &self.pools {
            old.set_reload_state(ReloadState::OldToShutdown);
        }
        for new_pool in &new.pools {
            new_pool.set_reload_state(ReloadState::NewWaitForOld);
        }
        for old in &self.pools {
            let Some(counterpart) = new.find_by_name(&old.name) else {
                continue;
            };
            if old.same_endpoint(counterpart) {
                old.set_counterpart(Some(Arc::downgrade(counterpart)));
                counterpart.set_counterpart(Some(Arc::downgrade(old)));
            } else {
                counterpart.set_reload_state(ReloadState::New);
            }
        }
    }

    /// Advances both registries one step. Closes listeners on
    /// newly-`OldToShutdown` pools, and once an `OldDraining` pool has zero
    /// remaining client connections, promotes its counterpart to `New`
    /// (taking over the listener if the endpoint is shared), clears both
    /// cross-links, and marks itself freed. A pool with no counterpart at
    /// all (a disjoint-name reload) drains and is freed the same way, just
    /// without a promotion step. Both the
    /// shutdown-to-draining transition and the drained-and-freed check run
    /// in the same pass, so a pool with no clients converges in one call
    /// instead of needing a poll per step. Returns `true` exactly when
    /// every old pool is freed and no new pool remains `NewWaitForOld` — at
    /// that point the caller drops `self` (the old registry) and keeps
    /// `new` as the current one.
    pub async fn finish_replacement(&self, new: &PoolsRegistry<T>) -> bool {
        for old in &self.pools {
            if old.reload_state() == ReloadState::OldToShutdown {
                old.close_listener();
                old.set_reload_state(ReloadState::OldDraining);
            }
            if old.reload_state() == ReloadState::OldDraining
                && !old.is_freed()
                && old.client_conn_count() == 0
            {
                if let Some(counterpart) = old.counterpart() {
                    counterpart.set_reload_state(ReloadState::New);
                    counterpart.clear_counterpart();
                }
                old.clear_counterpart();
                old.disconnect().await;
                old.mark_freed();
            }
        }

        for new_pool in &new.pools {
            if new_pool.reload_state() == ReloadState::NewWaitForOld && new_pool.counterpart().is_none() {
                new_pool.set_reload_state(ReloadState::New);
            }
        }

        let old_done = self.pools.iter().all(|p| p.is_freed());
        let new_done = new
            .pools
            .iter()
            .all(|p| p.reload_state() != ReloadState::NewWaitForOld);
        old_done && new_done
    }
}
