//! The listener registry.
//!
//! Maps registration handles to where their events should go. Mutations
//! take the write lock; lookups from event threads share the read lock.

use super::payload::{EventClass, EventPayload};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque handle returned to the host for one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    /// Rebuild a handle from its numeric form
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric form of the handle
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Where finished payloads go
pub trait ListenerSink: Send + Sync {
    /// Take ownership of one payload for `handle`
    fn deliver(&self, handle: ListenerHandle, payload: EventPayload);
}

/// One live registration
#[derive(Clone)]
pub struct Registration {
    /// Event class
    pub class: EventClass,
    /// Native callback id, once the native library has assigned one
    pub callback_id: Option<i32>,
    /// Delivery target
    pub sink: Arc<dyn ListenerSink>,
}

/// Registry of live listeners
pub struct ListenerRegistry {
    entries: RwLock<HashMap<ListenerHandle, Registration>>,
    next_handle: AtomicU64,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Add a registration and allocate its handle
    pub fn insert(&self, class: EventClass, sink: Arc<dyn ListenerSink>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries.write().insert(
            handle,
            Registration {
                class,
                callback_id: None,
                sink,
            },
        );
        handle
    }

    /// Record the native callback id of a registration
    pub fn set_callback_id(&self, handle: ListenerHandle, callback_id: i32) -> bool {
        match self.entries.write().get_mut(&handle) {
            Some(entry) => {
                entry.callback_id = Some(callback_id);
                true
            }
            None => false,
        }
    }

    /// Remove a registration
    pub fn remove(&self, handle: ListenerHandle) -> Option<Registration> {
        self.entries.write().remove(&handle)
    }

    /// Remove every registration
    pub fn drain(&self) -> Vec<(ListenerHandle, Registration)> {
        self.entries.write().drain().collect()
    }

    /// Delivery target of a live registration
    pub fn sink(&self, handle: ListenerHandle) -> Option<Arc<dyn ListenerSink>> {
        self.entries.read().get(&handle).map(|e| Arc::clone(&e.sink))
    }

    /// Whether `handle` is registered
    pub fn contains(&self, handle: ListenerHandle) -> bool {
        self.entries.read().contains_key(&handle)
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Discard;

    impl ListenerSink for Discard {
        fn deliver(&self, _handle: ListenerHandle, _payload: EventPayload) {}
    }

    #[test]
    fn test_handles_are_unique() {
        let registry = ListenerRegistry::new();
        let a = registry.insert(EventClass::Device, Arc::new(Discard));
        let b = registry.insert(EventClass::Device, Arc::new(Discard));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_stops_lookup() {
        let registry = ListenerRegistry::new();
        let handle = registry.insert(EventClass::Sensor, Arc::new(Discard));
        assert!(registry.set_callback_id(handle, 4));

        let removed = registry.remove(handle).unwrap();
        assert_eq!(removed.class, EventClass::Sensor);
        assert_eq!(removed.callback_id, Some(4));
        assert!(registry.sink(handle).is_none());
        assert!(!registry.set_callback_id(handle, 5));
        assert!(registry.remove(handle).is_none());
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = ListenerRegistry::new();
        registry.insert(EventClass::Raw, Arc::new(Discard));
        registry.insert(EventClass::Device, Arc::new(Discard));
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(ListenerHandle::from_raw(3).to_string(), "listener-3");
    }

    #[test]
    fn test_concurrent_lookups() {
        let registry = Arc::new(ListenerRegistry::new());
        let handle = registry.insert(EventClass::Raw, Arc::new(Discard));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || (0..1000).all(|_| registry.contains(handle)))
            })
            .collect();
        for reader in readers {
            assert!(reader.join().unwrap());
        }
    }
}
