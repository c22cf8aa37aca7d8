//! Device records and the decoders that name native codes.

use crate::native::{device_types, methods, take_string, NativeLibrary};
use crate::value::HostValue;
use serde::Serialize;

/// Status name used when the last command is not one the bridge reports.
///
/// The misspelling is what existing host code compares against.
pub const UNKNOWN_STATUS: &str = "UNNKOWN";

/// Device class name used for unrecognised type codes
pub const UNKNOWN_TYPE: &str = "UNKNOWN";

/// Method bits in the order they are reported
const METHOD_NAMES: [(i32, &str); 9] = [
    (methods::TURNON, "TURNON"),
    (methods::TURNOFF, "TURNOFF"),
    (methods::BELL, "BELL"),
    (methods::TOGGLE, "TOGGLE"),
    (methods::DIM, "DIM"),
    (methods::UP, "UP"),
    (methods::DOWN, "DOWN"),
    (methods::STOP, "STOP"),
    (methods::LEARN, "LEARN"),
];

/// Name every method bit set in `mask`
pub fn decode_methods(mask: i32) -> Vec<&'static str> {
    METHOD_NAMES
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Name a device type code
pub fn decode_device_type(device_type: i32) -> &'static str {
    match device_type {
        device_types::DEVICE => "DEVICE",
        device_types::GROUP => "GROUP",
        device_types::SCENE => "SCENE",
        _ => UNKNOWN_TYPE,
    }
}

/// Parse a dim level the way `atoi` would: leading digits, else zero
pub fn parse_level(value: &str) -> i32 {
    let value = value.trim_start();
    let (sign, digits) = match value.as_bytes().first() {
        Some(b'-') => (-1i64, &value[1..]),
        Some(b'+') => (1, &value[1..]),
        _ => (1, value),
    };
    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| {
            (acc * 10 + i64::from(d - b'0')).min(i64::from(i32::MAX) + 1)
        });
    (sign * magnitude).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Last-command status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    /// `ON`, `OFF`, `DIM` or the unknown marker
    pub name: &'static str,
    /// Dim level, present only for `DIM`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
}

impl DeviceStatus {
    /// Build a status from a last-sent command and its value
    pub fn from_last_command(command: i32, level: i32) -> Self {
        match command {
            methods::TURNON => Self { name: "ON", level: None },
            methods::TURNOFF => Self { name: "OFF", level: None },
            methods::DIM => Self { name: "DIM", level: Some(level) },
            _ => Self { name: UNKNOWN_STATUS, level: None },
        }
    }

    /// Query a device's status from the native library
    pub fn query(native: &dyn NativeLibrary, device_id: i32) -> Self {
        let command = native.last_sent_command(device_id, methods::SUPPORTED_METHODS);
        let level = if command == methods::DIM {
            parse_level(&take_string(native.last_sent_value(device_id)))
        } else {
            0
        };
        Self::from_last_command(command, level)
    }

    /// Convert to a host object
    pub fn to_host_value(&self) -> HostValue {
        let mut entries = vec![("name", HostValue::from(self.name))];
        if let Some(level) = self.level {
            entries.push(("level", level.into()));
        }
        HostValue::object(entries)
    }
}

/// One configured device, with every native string already copied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// Device id
    pub id: i32,
    /// Configured name
    pub name: String,
    /// Model string
    pub model: String,
    /// Protocol string
    pub protocol: String,
    /// Device class name
    #[serde(rename = "type")]
    pub device_type: &'static str,
    /// Supported method names
    pub methods: Vec<&'static str>,
    /// Last-command status
    pub status: DeviceStatus,
}

impl DeviceRecord {
    /// Read one device by id
    pub fn read(native: &dyn NativeLibrary, id: i32) -> Self {
        Self {
            id,
            name: take_string(native.name(id)),
            model: take_string(native.model(id)),
            protocol: take_string(native.protocol(id)),
            device_type: decode_device_type(native.device_type(id)),
            methods: decode_methods(native.methods(id, methods::SUPPORTED_METHODS)),
            status: DeviceStatus::query(native, id),
        }
    }

    /// Convert to a host object
    pub fn to_host_value(&self) -> HostValue {
        HostValue::object([
            ("name", HostValue::from(self.name.as_str())),
            ("id", self.id.into()),
            (
                "methods",
                HostValue::Array(self.methods.iter().map(|m| HostValue::from(*m)).collect()),
            ),
            ("model", self.model.as_str().into()),
            ("protocol", self.protocol.as_str().into()),
            ("type", self.device_type.into()),
            ("status", self.status.to_host_value()),
        ])
    }
}

/// Read every configured device in native index order.
///
/// A negative device count (a native error code) reads as no devices.
pub fn list_devices(native: &dyn NativeLibrary) -> Vec<DeviceRecord> {
    let count = native.number_of_devices().max(0);
    (0..count)
        .map(|index| DeviceRecord::read(native, native.device_id(index)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::InMemoryNative;

    #[test]
    fn test_decode_methods_order() {
        let mask = methods::LEARN | methods::DIM | methods::TURNON | methods::EXECUTE;
        assert_eq!(decode_methods(mask), vec!["TURNON", "DIM", "LEARN"]);
        assert!(decode_methods(0).is_empty());
        assert_eq!(decode_methods(methods::SUPPORTED_METHODS).len(), 9);
    }

    #[test]
    fn test_decode_device_type() {
        assert_eq!(decode_device_type(device_types::DEVICE), "DEVICE");
        assert_eq!(decode_device_type(device_types::GROUP), "GROUP");
        assert_eq!(decode_device_type(device_types::SCENE), "SCENE");
        assert_eq!(decode_device_type(42), "UNKNOWN");
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("128"), 128);
        assert_eq!(parse_level("  42abc"), 42);
        assert_eq!(parse_level("-7"), -7);
        assert_eq!(parse_level(""), 0);
        assert_eq!(parse_level("dim"), 0);
        assert_eq!(parse_level("99999999999"), i32::MAX);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(DeviceStatus::from_last_command(methods::TURNON, 0).name, "ON");
        assert_eq!(DeviceStatus::from_last_command(methods::TURNOFF, 0).name, "OFF");
        assert_eq!(
            DeviceStatus::from_last_command(methods::DIM, 77),
            DeviceStatus { name: "DIM", level: Some(77) }
        );
        assert_eq!(
            DeviceStatus::from_last_command(methods::BELL, 0).name,
            UNKNOWN_STATUS
        );
    }

    #[test]
    fn test_status_host_value_has_level_only_for_dim() {
        let on = DeviceStatus::from_last_command(methods::TURNON, 0).to_host_value();
        assert!(on.get("level").is_none());

        let dim = DeviceStatus::from_last_command(methods::DIM, 10).to_host_value();
        assert_eq!(dim.get("level").and_then(HostValue::as_i64), Some(10));
    }

    #[test]
    fn test_list_devices_in_index_order_and_releases() {
        let native = InMemoryNative::new();
        native.seed_device("Hall", "arctech", "codeswitch", methods::TURNON, device_types::DEVICE);
        native.seed_device(
            "Lights",
            "group",
            "",
            methods::TURNON | methods::TURNOFF,
            device_types::GROUP,
        );
        native.seed_device("Night", "scene", "", methods::EXECUTE, device_types::SCENE);

        let devices = list_devices(&native);
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Hall", "Lights", "Night"]);
        assert_eq!(devices[1].device_type, "GROUP");
        assert_eq!(devices[2].device_type, "SCENE");
        assert_eq!(devices[0].methods, vec!["TURNON"]);

        assert_eq!(native.ledger().outstanding(), 0);
        assert_eq!(native.ledger().invalid_releases(), 0);
        assert!(native.ledger().issued() >= 9);
    }

    #[test]
    fn test_record_host_value_keys() {
        let native = InMemoryNative::new();
        let id = native.seed_device(
            "Lamp",
            "arctech",
            "selflearning",
            methods::TURNON,
            device_types::DEVICE,
        );

        let value = DeviceRecord::read(&native, id).to_host_value();
        let keys: Vec<_> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["name", "id", "methods", "model", "protocol", "type", "status"]);
        assert_eq!(value.get("name").and_then(HostValue::as_str), Some("Lamp"));
        assert_eq!(value.get("id").and_then(HostValue::as_i64), Some(id as i64));
    }

    #[test]
    fn test_dim_status_reads_last_value() {
        let native = InMemoryNative::new();
        let id = native.seed_device(
            "Dimmer",
            "arctech",
            "selflearning-dimmer",
            methods::DIM,
            device_types::DEVICE,
        );
        native.dim(id, 128);

        let record = DeviceRecord::read(&native, id);
        assert_eq!(record.status, DeviceStatus { name: "DIM", level: Some(128) });
        assert_eq!(native.ledger().outstanding(), 0);
    }
}
