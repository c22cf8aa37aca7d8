//! Converting filled descriptors into host values.

use crate::descriptor::{NativeResult, WorkDescriptor};
use crate::device::DeviceRecord;
use crate::error::{BridgeError, Result};
use crate::native::take_string;
use crate::operation::ResultKind;
use crate::value::HostValue;
use tracing::error;

/// Convert a filled descriptor into the host value for its result kind.
///
/// Consumes the descriptor, so a native string in the result slot is copied
/// and released here and nowhere else.
pub fn marshal(descriptor: WorkDescriptor) -> Result<HostValue> {
    let declared = descriptor.result_kind();
    let (operation, result) = descriptor.into_parts();
    let opcode = operation.opcode();
    let result = result.ok_or(BridgeError::NotExecuted(opcode))?;

    match (declared, result) {
        (ResultKind::Integer, NativeResult::Integer(n)) => Ok(n.into()),
        (ResultKind::Boolean | ResultKind::SyntheticBoolean, NativeResult::Boolean(b)) => {
            Ok(b.into())
        }
        (ResultKind::Text, NativeResult::Text(s)) => Ok(take_string(s).into()),
        (ResultKind::DeviceList, NativeResult::Devices(devices)) => Ok(HostValue::Array(
            devices.iter().map(DeviceRecord::to_host_value).collect(),
        )),
        (declared, found) => {
            let found = found.kind_name();
            error!(
                opcode,
                declared = declared.name(),
                found,
                "Result slot does not match operation"
            );
            Err(BridgeError::ResultKindMismatch {
                opcode,
                declared: declared.name(),
                found,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{InMemoryNative, NativeLibrary};
    use crate::operation::Operation;

    fn filled(operation: Operation, result: NativeResult) -> WorkDescriptor {
        let mut descriptor = WorkDescriptor::new(operation);
        descriptor.complete(result);
        descriptor
    }

    #[test]
    fn test_text_result_released_once() {
        let native = InMemoryNative::new();
        let id = native.add_device();
        native.set_name(id, "Porch");

        let descriptor = filled(
            Operation::GetName { device_id: id },
            NativeResult::Text(native.name(id)),
        );
        assert_eq!(native.ledger().outstanding(), 1);

        assert_eq!(marshal(descriptor).unwrap(), HostValue::from("Porch"));
        assert_eq!(native.ledger().outstanding(), 0);
        assert_eq!(native.ledger().released(), 1);
        assert_eq!(native.ledger().invalid_releases(), 0);
    }

    #[test]
    fn test_null_text_is_empty_string() {
        let descriptor = filled(Operation::GetModel { device_id: 1 }, NativeResult::Text(None));
        assert_eq!(marshal(descriptor).unwrap(), HostValue::from(""));
    }

    #[test]
    fn test_unexecuted_descriptor() {
        let err = marshal(WorkDescriptor::new(Operation::DeviceCount)).unwrap_err();
        assert!(matches!(err, BridgeError::NotExecuted(17)));
    }

    #[test]
    fn test_mismatch_is_an_error_and_still_releases() {
        let native = InMemoryNative::new();
        let id = native.add_device();

        let descriptor = filled(
            Operation::TurnOn { device_id: id },
            NativeResult::Text(native.name(id)),
        );
        let err = marshal(descriptor).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ResultKindMismatch { opcode: 0, declared: "integer", found: "string" }
        ));
        assert_eq!(native.ledger().outstanding(), 0);
    }

    #[test]
    fn test_synthetic_boolean() {
        let descriptor = filled(Operation::Close, NativeResult::Boolean(true));
        assert_eq!(marshal(descriptor).unwrap(), HostValue::Bool(true));
    }
}
