//! Registry of live upgraded sockets
//!
//! Membership is a set keyed by socket id. `track` on a tracked id and
//! `release` on a released id are both no-ops, so teardown paths can call
//! them without coordinating.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type SocketId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Client,
    Backend,
}

#[derive(Debug, Clone)]
pub struct TrackedSocket {
    pub role: SocketRole,
    pub backend: String,
    pub peer: Option<SocketAddr>,
    pub opened_at: Instant,
}

#[derive(Debug, Default)]
pub struct SocketRegistry {
    next_id: AtomicU64,
    sockets: DashMap<SocketId, TrackedSocket>,
}

impl SocketRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve an id for a socket about to be tracked
    pub fn allocate_id(&self) -> SocketId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add a socket; returns false if the id was already tracked
    pub fn track(&self, id: SocketId, socket: TrackedSocket) -> bool {
        match self.sockets.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(socket);
                true
            }
        }
    }

    /// Remove a socket; returns whether anything was removed
    pub fn release(&self, id: SocketId) -> bool {
        self.sockets.remove(&id).is_some()
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.sockets.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Live sockets attached to one backend
    pub fn count_for(&self, backend: &str) -> usize {
        self.sockets.iter().filter(|s| s.backend == backend).count()
    }

    /// Track a socket for the lifetime of the returned lease
    pub fn lease(self: &Arc<Self>, role: SocketRole, backend: &str, peer: Option<SocketAddr>) -> SocketLease {
        let id = self.allocate_id();
        self.track(
            id,
            TrackedSocket {
                role,
                backend: backend.to_string(),
                peer,
                opened_at: Instant::now(),
            },
        );
        SocketLease {
            registry: Arc::clone(self),
            id,
        }
    }
}

/// Releases its socket when dropped
#[derive(Debug)]
pub struct SocketLease {
    registry: Arc<SocketRegistry>,
    id: SocketId,
}

impl SocketLease {
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Release early; the later drop is then a no-op
    pub fn release(&self) -> bool {
        self.registry.release(self.id)
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket(role: SocketRole, backend: &str) -> TrackedSocket {
        TrackedSocket {
            role,
            backend: backend.to_string(),
            peer: None,
            opened_at: Instant::now(),
        }
    }

    #[test]
    fn test_track_is_idempotent() {
        let registry = SocketRegistry::new();
        let id = registry.allocate_id();

        assert!(registry.track(id, socket(SocketRole::Client, "admin")));
        assert!(!registry.track(id, socket(SocketRole::Client, "admin")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = SocketRegistry::new();
        let id = registry.allocate_id();
        registry.track(id, socket(SocketRole::Backend, "enroll"));

        assert!(registry.release(id));
        assert!(!registry.release(id));
        assert!(!registry.release(id + 100));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SocketRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let registry = SocketRegistry::new();
        let client = registry.lease(SocketRole::Client, "admin", None);
        let backend = registry.lease(SocketRole::Backend, "admin", None);
        let other = registry.lease(SocketRole::Client, "enroll", None);

        assert_eq!(registry.count_for("admin"), 2);
        assert_eq!(registry.count_for("enroll"), 1);

        assert!(client.release());
        assert!(!registry.contains(client.id()));
        drop(client);
        drop(backend);
        assert_eq!(registry.count_for("admin"), 0);
        assert!(registry.contains(other.id()));
        drop(other);
        assert!(registry.is_empty());
    }
}
