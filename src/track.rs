use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Process-wide registry of live client connections, indexed by id and by the
/// virtual host each connection is charged to.
///
/// Both indices are mutated under one lock, so at any point an id is present
/// in the flat map iff it is present in exactly one per-host set. Closing a
/// connection cancels its token; the connection task tears both sockets down
/// and removes itself on the way out.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    next_id: AtomicU64,
    inner: Mutex<Indices>,
}

#[derive(Debug, Default)]
struct Indices {
    by_id: HashMap<u64, Tracked>,
    by_host: HashMap<String, HashSet<u64>>,
}

#[derive(Debug)]
struct Tracked {
    host: String,
    closer: CancellationToken,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection under `host` and returns its id. Cancelling
    /// `closer` closes the connection.
    pub fn add(&self, host: &str, closer: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("poisoned");
        inner.by_id.insert(
            id,
            Tracked {
                host: host.to_string(),
                closer,
            },
        );
        inner.by_host.entry(host.to_string()).or_default().insert(id);
        debug!(id, %host, total = inner.by_id.len(), "tracking connection");
        id
    }

    /// Drops a connection from both indices. Safe to call more than once.
    pub fn remove(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().expect("poisoned");
        let Some(tracked) = inner.by_id.remove(&id) else {
            return false;
        };
        if let Some(ids) = inner.by_host.get_mut(&tracked.host) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_host.remove(&tracked.host);
            }
        }
        debug!(id, host = %tracked.host, total = inner.by_id.len(), "untracking connection");
        true
    }

    /// Initiates close on every connection charged to `host`; returns how
    /// many were signalled.
    pub fn close_host(&self, host: &str) -> usize {
        let inner = self.inner.lock().expect("poisoned");
        let Some(ids) = inner.by_host.get(host) else {
            return 0;
        };
        let mut closed = 0;
        for id in ids {
            if let Some(tracked) = inner.by_id.get(id) {
                tracked.closer.cancel();
                closed += 1;
            }
        }
        debug!(%host, closed, "closing connections for host");
        closed
    }

    /// Initiates close on every tracked connection; returns how many were
    /// signalled.
    pub fn close_all(&self) -> usize {
        let inner = self.inner.lock().expect("poisoned");
        for tracked in inner.by_id.values() {
            tracked.closer.cancel();
        }
        let closed = inner.by_id.len();
        debug!(closed, "closing all connections");
        closed
    }

    /// Number of live tracked connections.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live connections charged to `host`.
    pub fn count_for_host(&self, host: &str) -> usize {
        self.inner
            .lock()
            .expect("poisoned")
            .by_host
            .get(host)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock().expect("poisoned");
        let mut from_hosts = HashSet::new();
        for (host, ids) in &inner.by_host {
            assert!(!ids.is_empty(), "empty id set left behind for {host}");
            for id in ids {
                assert!(from_hosts.insert(*id), "id {id} charged to two hosts");
                assert_eq!(
                    inner.by_id.get(id).map(|t| t.host.as_str()),
                    Some(host.as_str())
                );
            }
        }
        assert_eq!(from_hosts.len(), inner.by_id.len());
    }
}
