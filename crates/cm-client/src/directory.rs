//! Shared directory of CM endpoints.
//!
//! Replaces wholesale whenever the CM pushes a refreshed list. Readers take
//! immutable snapshots, so an in-flight iteration is never invalidated by a
//! swap.

use cm_common::Endpoint;
use rand::seq::SliceRandom;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Built-in bootstrap list, used until the CM pushes a fresh one.
const BOOTSTRAP: &[(&str, u16)] = &[
    ("162.254.196.40", 27017),
    ("162.254.196.41", 27018),
    ("162.254.196.42", 27017),
    ("162.254.196.43", 27021),
    ("155.133.248.38", 27017),
    ("155.133.248.39", 27018),
    ("155.133.248.40", 27019),
    ("185.25.180.14", 27018),
    ("185.25.180.15", 27017),
    ("208.78.164.9", 27018),
    ("208.78.164.10", 27017),
    ("208.78.164.11", 27019),
];

/// Shared, swap-on-update CM server list.
#[derive(Debug)]
pub struct ServerDirectory {
    inner: RwLock<Arc<Vec<Endpoint>>>,
}

impl Default for ServerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerDirectory {
    /// Creates a directory seeded with the built-in bootstrap list.
    pub fn new() -> Self {
        Self::with_servers(
            BOOTSTRAP
                .iter()
                .map(|&(host, port)| Endpoint::new(host, port))
                .collect(),
        )
    }

    /// Creates a directory from an explicit server list.
    pub fn with_servers(servers: Vec<Endpoint>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(servers)),
        }
    }

    /// Returns an immutable snapshot of the current list.
    pub fn snapshot(&self) -> Arc<Vec<Endpoint>> {
        self.inner.read().expect("server list lock poisoned").clone()
    }

    /// Replaces the list wholesale. An empty list is ignored so the client
    /// never loses its last known servers.
    pub fn update(&self, servers: Vec<Endpoint>) {
        if servers.is_empty() {
            debug!("ignoring empty server list update");
            return;
        }
        *self.inner.write().expect("server list lock poisoned") = Arc::new(servers);
    }

    /// Picks a random endpoint from the current list.
    pub fn pick(&self) -> Option<Endpoint> {
        self.snapshot().choose(&mut rand::thread_rng()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_list_is_nonempty() {
        let directory = ServerDirectory::new();
        assert!(!directory.snapshot().is_empty());
        assert!(directory.pick().is_some());
    }

    #[test]
    fn update_replaces_the_list_wholesale() {
        let directory = ServerDirectory::new();
        let fresh = vec![Endpoint::new("10.0.0.1", 27017)];
        directory.update(fresh.clone());
        assert_eq!(*directory.snapshot(), fresh);
    }

    #[test]
    fn snapshots_survive_an_update() {
        let directory = ServerDirectory::with_servers(vec![Endpoint::new("10.0.0.1", 27017)]);
        let before = directory.snapshot();
        directory.update(vec![Endpoint::new("10.0.0.2", 27018)]);
        assert_eq!(before[0].host, "10.0.0.1");
        assert_eq!(directory.snapshot()[0].host, "10.0.0.2");
    }

    #[test]
    fn empty_update_is_ignored() {
        let directory = ServerDirectory::with_servers(vec![Endpoint::new("10.0.0.1", 27017)]);
        directory.update(Vec::new());
        assert_eq!(directory.snapshot().len(), 1);
    }

    #[test]
    fn pick_returns_a_listed_endpoint() {
        let servers = vec![
            Endpoint::new("10.0.0.1", 27017),
            Endpoint::new("10.0.0.2", 27018),
        ];
        let directory = ServerDirectory::with_servers(servers.clone());
        for _ in 0..16 {
            let picked = directory.pick().unwrap();
            assert!(servers.contains(&picked));
        }
    }
}
