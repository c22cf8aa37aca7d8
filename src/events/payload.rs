//! Owned event payloads.
//!
//! A payload is built inside the native callback from borrowed native
//! buffers. Every text field is copied at construction, so the payload can
//! outlive the callback and cross threads freely.

use crate::device::{parse_level, DeviceStatus};
use crate::native::{methods, NativeLibrary, RawDeviceEvent, RawFrameEvent, RawSensorEvent};
use crate::value::HostValue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ffi::CStr;

/// Event classes a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventClass {
    /// Device state changes
    Device,
    /// Sensor readings
    Sensor,
    /// Raw protocol frames
    Raw,
}

impl std::fmt::Display for EventClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventClass::Device => write!(f, "device"),
            EventClass::Sensor => write!(f, "sensor"),
            EventClass::Raw => write!(f, "raw"),
        }
    }
}

fn copy_text(s: &CStr) -> String {
    s.to_string_lossy().into_owned()
}

/// A device changed state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    /// Device id
    pub device_id: i32,
    /// Method the native library reported
    pub method: i32,
    /// Method data as reported
    pub data: String,
    /// Last-command status, filled by [`DeviceEvent::finish`]
    pub status: Option<DeviceStatus>,
}

impl DeviceEvent {
    /// Copy a native device event
    pub fn copy_from(raw: &RawDeviceEvent<'_>) -> Self {
        Self {
            device_id: raw.device_id,
            method: raw.method,
            data: copy_text(raw.data),
            status: None,
        }
    }

    /// Look up the device's last-command status. May block.
    pub fn finish(&mut self, native: &dyn NativeLibrary) {
        self.status = Some(DeviceStatus::query(native, self.device_id));
    }

    /// The finished status, or one derived from the reported method
    pub fn status(&self) -> DeviceStatus {
        self.status.unwrap_or_else(|| {
            let level = if self.method == methods::DIM {
                parse_level(&self.data)
            } else {
                0
            };
            DeviceStatus::from_last_command(self.method, level)
        })
    }
}

/// A sensor reported a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorEvent {
    /// Sensor id
    pub sensor_id: i32,
    /// Protocol name
    pub protocol: String,
    /// Model name
    pub model: String,
    /// Value type code
    pub data_type: i32,
    /// Reading as text
    pub value: String,
    /// Unix timestamp in seconds
    pub timestamp: i32,
}

impl SensorEvent {
    /// Copy a native sensor event
    pub fn copy_from(raw: &RawSensorEvent<'_>) -> Self {
        Self {
            sensor_id: raw.sensor_id,
            protocol: copy_text(raw.protocol),
            model: copy_text(raw.model),
            data_type: raw.data_type,
            value: copy_text(raw.value),
            timestamp: raw.timestamp,
        }
    }

    /// When the reading was taken
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0)
    }
}

/// A raw protocol frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    /// Controller that received the frame
    pub controller_id: i32,
    /// Frame text
    pub data: String,
}

impl RawFrame {
    /// Copy a native raw frame event
    pub fn copy_from(raw: &RawFrameEvent<'_>) -> Self {
        Self {
            controller_id: raw.controller_id,
            data: copy_text(raw.data),
        }
    }
}

/// One event, owned
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "class", rename_all = "camelCase")]
pub enum EventPayload {
    /// Device state change
    Device(DeviceEvent),
    /// Sensor reading
    Sensor(SensorEvent),
    /// Raw frame
    Raw(RawFrame),
}

impl EventPayload {
    /// Event class of the payload
    pub fn class(&self) -> EventClass {
        match self {
            EventPayload::Device(_) => EventClass::Device,
            EventPayload::Sensor(_) => EventClass::Sensor,
            EventPayload::Raw(_) => EventClass::Raw,
        }
    }

    /// Whether finishing the payload calls back into the native library
    pub fn needs_finishing(&self) -> bool {
        matches!(self, EventPayload::Device(DeviceEvent { status: None, .. }))
    }

    /// Complete the payload with data only the native library has
    pub fn finish(&mut self, native: &dyn NativeLibrary) {
        if let EventPayload::Device(event) = self {
            event.finish(native);
        }
    }

    /// Positional listener arguments
    pub fn to_host_args(&self) -> Vec<HostValue> {
        match self {
            EventPayload::Device(event) => {
                vec![event.device_id.into(), event.status().to_host_value()]
            }
            EventPayload::Sensor(event) => vec![
                event.sensor_id.into(),
                event.model.as_str().into(),
                event.protocol.as_str().into(),
                event.data_type.into(),
                event.value.as_str().into(),
                event.timestamp.into(),
            ],
            EventPayload::Raw(frame) => {
                vec![frame.controller_id.into(), frame.data.as_str().into()]
            }
        }
    }
}
