//! ConnectionRegistry: the single source of truth for which sessions are
//! currently connected.
//!
//! The accept path registers a session once its upgrade completes, the
//! connection task unregisters it when it ends, and the send path looks it up.
//! Every operation takes one short critical section on a `std::sync::Mutex`;
//! the lock is never held across an `.await` or any socket call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::SessionId;

/// Anything that can report whether its underlying transport is still open.
#[cfg_attr(test, mockall::automock)]
pub trait LiveTransport: Send + Sync {
    fn is_open(&self) -> bool;
}

impl<T: LiveTransport + ?Sized> LiveTransport for Arc<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Maps session ids to live connection handles.
///
/// `H` is cheap to clone (an `Arc` or a channel sender) so lookups hand out
/// copies instead of holding the lock.
#[derive(Debug)]
pub struct ConnectionRegistry<H> {
    entries: Mutex<HashMap<SessionId, H>>,
}

impl<H> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<H: Clone> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `id`; last writer wins.  Returns
    /// the handle that was replaced, if any.
    pub fn register(&self, id: SessionId, handle: H) -> Option<H> {
        self.lock().insert(id, handle)
    }

    /// Removes the entry for `id`.  Absent ids are not an error.
    pub fn unregister(&self, id: &SessionId) -> Option<H> {
        self.lock().remove(id)
    }

    /// Removes the entry for `id` only if `matches` accepts the stored handle.
    ///
    /// A connection task uses this on exit so it cannot evict a newer
    /// connection that reused its peer address.
    pub fn unregister_if(&self, id: &SessionId, matches: impl FnOnce(&H) -> bool) -> Option<H> {
        let mut entries = self.lock();
        if entries.get(id).is_some_and(matches) {
            entries.remove(id)
        } else {
            None
        }
    }

    pub fn lookup(&self, id: &SessionId) -> Option<H> {
        self.lock().get(id).cloned()
    }

    /// Empties the registry and returns the evicted handles so the caller can
    /// close them outside the lock.
    pub fn clear_all(&self) -> Vec<H> {
        self.lock().drain().map(|(_, handle)| handle).collect()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Currently registered ids, sorted.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is simply taken over.
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, H>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<H: Clone + LiveTransport> ConnectionRegistry<H> {
    /// `true` iff `id` is registered and its transport reports itself open.
    pub fn is_active(&self, id: &SessionId) -> bool {
        self.lookup(id).is_some_and(|handle| handle.is_open())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(open: bool) -> Arc<MockLiveTransport> {
        let mut mock = MockLiveTransport::new();
        mock.expect_is_open().return_const(open);
        Arc::new(mock)
    }

    fn id(s: &str) -> SessionId {
        SessionId::from(s)
    }

    #[test]
    fn test_register_then_lookup() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        assert_eq!(registry.register(id("a:1"), 7), None);
        assert_eq!(registry.lookup(&id("a:1")), Some(7));
        assert_eq!(registry.lookup(&id("b:2")), None);
    }

    #[test]
    fn test_register_overwrites_last_writer_wins() {
        let registry = ConnectionRegistry::new();
        registry.register(id("a:1"), 1);
        assert_eq!(registry.register(id("a:1"), 2), Some(1));
        assert_eq!(registry.lookup(&id("a:1")), Some(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        assert_eq!(registry.unregister(&id("ghost:0")), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_if_spares_newer_handle() {
        let registry = ConnectionRegistry::new();
        registry.register(id("a:1"), 2u32);

        // The task that owned handle 1 exits after handle 2 took the key.
        assert_eq!(registry.unregister_if(&id("a:1"), |h| *h == 1), None);
        assert!(registry.contains(&id("a:1")));

        assert_eq!(registry.unregister_if(&id("a:1"), |h| *h == 2), Some(2));
        assert!(!registry.contains(&id("a:1")));
    }

    #[test]
    fn test_clear_all_returns_every_handle() {
        let registry = ConnectionRegistry::new();
        registry.register(id("a:1"), 1);
        registry.register(id("b:2"), 2);

        let mut evicted = registry.clear_all();
        evicted.sort();

        assert_eq!(evicted, vec![1, 2]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_sorted() {
        let registry = ConnectionRegistry::new();
        registry.register(id("c:3"), ());
        registry.register(id("a:1"), ());
        registry.register(id("b:2"), ());
        assert_eq!(registry.ids(), vec![id("a:1"), id("b:2"), id("c:3")]);
    }

    #[test]
    fn test_is_active_requires_open_transport() {
        let registry = ConnectionRegistry::new();
        registry.register(id("open:1"), transport(true));
        registry.register(id("closed:2"), transport(false));

        assert!(registry.is_active(&id("open:1")));
        assert!(!registry.is_active(&id("closed:2")));
        assert!(!registry.is_active(&id("missing:3")));
    }

    #[test]
    fn test_concurrent_registration_from_many_threads() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|n| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.register(SessionId::new(format!("10.0.0.1:{}", 40000 + n)), n);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 16);
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.register(id("a:1"), 1);

        let poisoner = Arc::clone(&registry);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("poison the registry lock");
        })
        .join();

        assert_eq!(registry.lookup(&id("a:1")), Some(1));
        registry.register(id("b:2"), 2);
        assert_eq!(registry.len(), 2);
    }
}
