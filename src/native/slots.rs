//! Context pointers handed to the native library.
//!
//! Each registration boxes its `Arc<dyn EventSink>` and gives the library a
//! raw pointer to the box. The box is freed once the library has confirmed
//! the unregistration; telldus-core waits for a callback that is already
//! running before `tdUnregisterCallback` returns.

use super::EventSink;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::sync::Arc;
use tracing::{debug, warn};

struct Slot {
    callback_id: i32,
    context: *mut Arc<dyn EventSink>,
}

// SAFETY: the slot only carries the pointer; the pointee is Send + Sync
unsafe impl Send for Slot {}

impl Slot {
    /// # Safety
    ///
    /// The library must no longer be able to call back with `context`.
    unsafe fn free(self) {
        // SAFETY: the box was created by `ContextSlots::register` and the
        // slot was removed from the list, so this runs once
        drop(unsafe { Box::from_raw(self.context) });
    }
}

/// Boxed event contexts owned on behalf of the library
#[cfg_attr(not(feature = "telldus-core"), allow(dead_code))]
pub(crate) struct ContextSlots {
    slots: Mutex<Vec<Slot>>,
}

#[cfg_attr(not(feature = "telldus-core"), allow(dead_code))]
impl ContextSlots {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Box `sink` and pass its pointer to `register`, which returns the
    /// library's callback id
    pub(crate) fn register(
        &self,
        sink: Arc<dyn EventSink>,
        register: impl FnOnce(*mut c_void) -> i32,
    ) -> i32 {
        let context = Box::into_raw(Box::new(sink));
        let callback_id = register(context.cast());
        debug!(callback_id, "Registered native callback");
        self.slots.lock().push(Slot {
            callback_id,
            context,
        });
        callback_id
    }

    /// Run `unregister` for `callback_id`, then free its context
    pub(crate) fn unregister(&self, callback_id: i32, unregister: impl FnOnce(i32) -> i32) -> i32 {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .iter()
                .position(|s| s.callback_id == callback_id)
                .map(|index| slots.swap_remove(index))
        };

        let result = unregister(callback_id);
        match slot {
            // SAFETY: `unregister` has returned, so no event can reach it
            Some(slot) => unsafe { slot.free() },
            None => warn!(callback_id, "Unregistering a callback with no context"),
        }
        result
    }

    /// Unregister and free every context
    pub(crate) fn clear(&self, mut unregister: impl FnMut(i32) -> i32) {
        let slots: Vec<Slot> = self.slots.lock().drain(..).collect();
        for slot in slots {
            unregister(slot.callback_id);
            // SAFETY: unregistered just above
            unsafe { slot.free() };
        }
    }

    /// Contexts currently allocated
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl EventSink for Quiet {}

    #[test]
    fn test_unregister_frees_context() {
        let slots = ContextSlots::new();
        let sink: Arc<dyn EventSink> = Arc::new(Quiet);

        let mut next = 0;
        for _ in 0..3 {
            slots.register(Arc::clone(&sink), |_| {
                next += 1;
                next
            });
        }
        assert_eq!(slots.len(), 3);
        assert_eq!(Arc::strong_count(&sink), 4);

        let mut unregistered = Vec::new();
        let result = slots.unregister(2, |id| {
            unregistered.push(id);
            0
        });
        assert_eq!(result, 0);
        assert_eq!(unregistered, vec![2]);
        assert_eq!(slots.len(), 2);
        assert_eq!(Arc::strong_count(&sink), 3);
    }

    #[test]
    fn test_repeated_add_remove_does_not_grow() {
        let slots = ContextSlots::new();
        let sink: Arc<dyn EventSink> = Arc::new(Quiet);

        for id in 1..=100 {
            slots.register(Arc::clone(&sink), |_| id);
            slots.unregister(id, |_| 0);
        }
        assert_eq!(slots.len(), 0);
        assert_eq!(Arc::strong_count(&sink), 1);
    }

    #[test]
    fn test_unknown_callback_still_unregisters() {
        let slots = ContextSlots::new();
        let sink: Arc<dyn EventSink> = Arc::new(Quiet);
        slots.register(Arc::clone(&sink), |_| 7);

        let mut called = false;
        let result = slots.unregister(9, |_| {
            called = true;
            -3
        });
        assert_eq!(result, -3);
        assert!(called);
        assert_eq!(slots.len(), 1);
        assert_eq!(Arc::strong_count(&sink), 2);
    }

    #[test]
    fn test_clear_frees_everything() {
        let slots = ContextSlots::new();
        let sink: Arc<dyn EventSink> = Arc::new(Quiet);
        slots.register(Arc::clone(&sink), |_| 1);
        slots.register(Arc::clone(&sink), |_| 2);

        let mut unregistered = Vec::new();
        slots.clear(|id| {
            unregistered.push(id);
            0
        });
        unregistered.sort_unstable();
        assert_eq!(unregistered, vec![1, 2]);
        assert_eq!(slots.len(), 0);
        assert_eq!(Arc::strong_count(&sink), 1);
    }
}
