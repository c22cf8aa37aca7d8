//! Native events: owned payloads, the listener registry and the bridge that
//! moves events from native threads to listeners.

pub mod bridge;
pub mod payload;
pub mod registry;

pub use bridge::EventBridge;
pub use payload::{DeviceEvent, EventClass, EventPayload, RawFrame, SensorEvent};
pub use registry::{ListenerHandle, ListenerRegistry, ListenerSink, Registration};
