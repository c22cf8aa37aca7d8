//! Relaying native events to listeners.
//!
//! Each registration gets its own [`EventContext`], handed to the native
//! library as the callback context. The context copies the event on the
//! native thread, finishes device events on a blocking worker, and hands the
//! result to the registration's [`ListenerSink`] if the registration is still
//! live at that point.

use super::payload::{DeviceEvent, EventClass, EventPayload, RawFrame, SensorEvent};
use super::registry::{ListenerHandle, ListenerRegistry, ListenerSink};
use crate::error::{BridgeError, Result};
use crate::metrics::BridgeMetrics;
use crate::native::{codes, EventSink, NativeLibrary, RawDeviceEvent, RawFrameEvent, RawSensorEvent};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

struct Shared {
    native: Arc<dyn NativeLibrary>,
    registry: ListenerRegistry,
    runtime: Handle,
    permits: Arc<Semaphore>,
    metrics: Arc<BridgeMetrics>,
}

impl Shared {
    fn deliver(&self, handle: ListenerHandle, payload: EventPayload) {
        match self.registry.sink(handle) {
            Some(sink) => sink.deliver(handle, payload),
            None => {
                debug!(%handle, "Listener gone, dropping event");
                self.metrics.record_event_dropped();
            }
        }
    }
}

/// Per-registration callback context given to the native library
struct EventContext {
    handle: ListenerHandle,
    class: EventClass,
    shared: Weak<Shared>,
}

impl EventContext {
    fn relay(&self, payload: EventPayload) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.metrics.record_event_received();

        if payload.class() != self.class {
            warn!(
                handle = %self.handle,
                expected = %self.class,
                got = %payload.class(),
                "Event of the wrong class"
            );
            shared.metrics.record_event_dropped();
            return;
        }
        if !shared.registry.contains(self.handle) {
            debug!(handle = %self.handle, "Event for unregistered listener");
            shared.metrics.record_event_dropped();
            return;
        }

        if !payload.needs_finishing() {
            shared.deliver(self.handle, payload);
            return;
        }

        let handle = self.handle;
        let runtime = shared.runtime.clone();
        runtime.spawn(finish_and_deliver(shared, handle, payload));
    }
}

impl EventSink for EventContext {
    fn device_event(&self, event: RawDeviceEvent<'_>) {
        self.relay(EventPayload::Device(DeviceEvent::copy_from(&event)));
    }

    fn sensor_event(&self, event: RawSensorEvent<'_>) {
        self.relay(EventPayload::Sensor(SensorEvent::copy_from(&event)));
    }

    fn raw_device_event(&self, event: RawFrameEvent<'_>) {
        self.relay(EventPayload::Raw(RawFrame::copy_from(&event)));
    }
}

async fn finish_and_deliver(
    shared: Arc<Shared>,
    handle: ListenerHandle,
    mut payload: EventPayload,
) {
    let permit = match Arc::clone(&shared.permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            debug!(%handle, "Event workers closed, dropping event");
            shared.metrics.record_event_dropped();
            return;
        }
    };

    let native = Arc::clone(&shared.native);
    let finished = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        payload.finish(native.as_ref());
        payload
    })
    .await;

    match finished {
        Ok(payload) => shared.deliver(handle, payload),
        Err(e) => {
            error!(%handle, "Event finishing did not complete: {}", e);
            shared.metrics.record_event_dropped();
        }
    }
}

/// Registers listeners with the native library and relays their events
pub struct EventBridge {
    shared: Arc<Shared>,
}

impl EventBridge {
    /// Create an event bridge finishing at most `event_workers` events at once
    pub fn new(
        native: Arc<dyn NativeLibrary>,
        runtime: Handle,
        event_workers: usize,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                native,
                registry: ListenerRegistry::new(),
                runtime,
                permits: Arc::new(Semaphore::new(event_workers.max(1))),
                metrics,
            }),
        }
    }

    /// Register for one event class; events for the new handle go to `sink`
    #[instrument(skip(self, sink))]
    pub fn register(&self, class: EventClass, sink: Arc<dyn ListenerSink>) -> ListenerHandle {
        let handle = self.shared.registry.insert(class, sink);
        let context: Arc<dyn EventSink> = Arc::new(EventContext {
            handle,
            class,
            shared: Arc::downgrade(&self.shared),
        });

        let native = &self.shared.native;
        let callback_id = match class {
            EventClass::Device => native.register_device_event(context),
            EventClass::Sensor => native.register_sensor_event(context),
            EventClass::Raw => native.register_raw_device_event(context),
        };
        self.shared.registry.set_callback_id(handle, callback_id);

        info!(%handle, callback_id, "Registered listener");
        handle
    }

    /// Stop delivery to `handle` and unregister it natively.
    ///
    /// Events already in flight for the handle are dropped.
    #[instrument(skip(self))]
    pub fn unregister(&self, handle: ListenerHandle) -> Result<()> {
        let registration = self
            .shared
            .registry
            .remove(handle)
            .ok_or(BridgeError::ListenerNotFound(handle.as_u64()))?;

        if let Some(callback_id) = registration.callback_id {
            self.unregister_native(handle, callback_id);
        }
        info!(%handle, "Unregistered listener");
        Ok(())
    }

    /// Unregister every listener and stop finishing events
    pub fn close(&self) {
        for (handle, registration) in self.shared.registry.drain() {
            if let Some(callback_id) = registration.callback_id {
                self.unregister_native(handle, callback_id);
            }
        }
        self.shared.permits.close();
    }

    /// Live registrations
    pub fn registry(&self) -> &ListenerRegistry {
        &self.shared.registry
    }

    fn unregister_native(&self, handle: ListenerHandle, callback_id: i32) {
        let code = self.shared.native.unregister_callback(callback_id);
        if code != codes::SUCCESS {
            warn!(%handle, callback_id, code, "Native unregister failed");
        }
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.close();
    }
}
