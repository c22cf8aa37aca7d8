//! Work descriptors.
//!
//! A [`WorkDescriptor`] is one operation plus its result slot. It is
//! move-only: the control thread builds it, a worker takes it by value and
//! fills the slot, and the control thread takes it back to marshal it. At no
//! point can two threads hold it.

use crate::device::DeviceRecord;
use crate::native::NativeString;
use crate::operation::{Operation, ResultKind};

/// A filled result slot
#[derive(Debug)]
pub enum NativeResult {
    /// Integer result, often a native result code
    Integer(i32),
    /// Boolean result
    Boolean(bool),
    /// Native-owned string; released when the result is consumed or dropped
    Text(Option<NativeString>),
    /// Device records, in native index order
    Devices(Vec<DeviceRecord>),
}

impl NativeResult {
    /// Kind name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            NativeResult::Integer(_) => "integer",
            NativeResult::Boolean(_) => "boolean",
            NativeResult::Text(_) => "string",
            NativeResult::Devices(_) => "record-list",
        }
    }

    /// Whether this result can fill a slot of `kind`
    pub fn fits(&self, kind: ResultKind) -> bool {
        matches!(
            (kind, self),
            (ResultKind::Integer, NativeResult::Integer(_))
                | (ResultKind::Boolean, NativeResult::Boolean(_))
                | (ResultKind::SyntheticBoolean, NativeResult::Boolean(_))
                | (ResultKind::Text, NativeResult::Text(_))
                | (ResultKind::DeviceList, NativeResult::Devices(_))
        )
    }
}

/// One unit of work handed between threads
#[derive(Debug)]
pub struct WorkDescriptor {
    operation: Operation,
    result: Option<NativeResult>,
}

impl WorkDescriptor {
    /// Create a descriptor with an empty result slot
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            result: None,
        }
    }

    /// The requested operation
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Opcode of the requested operation
    pub fn opcode(&self) -> i32 {
        self.operation.opcode()
    }

    /// Declared result kind
    pub fn result_kind(&self) -> ResultKind {
        self.operation.result_kind()
    }

    /// Whether the result slot has been filled
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    /// The filled result slot, if any
    pub fn result(&self) -> Option<&NativeResult> {
        self.result.as_ref()
    }

    /// Fill the result slot, replacing (and releasing) anything already there
    pub(crate) fn complete(&mut self, result: NativeResult) {
        self.result = Some(result);
    }

    /// Split into the operation and its result
    pub fn into_parts(self) -> (Operation, Option<NativeResult>) {
        (self.operation, self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_descriptor_is_empty() {
        let descriptor = WorkDescriptor::new(Operation::DeviceCount);
        assert!(!descriptor.is_complete());
        assert_eq!(descriptor.opcode(), 17);
        assert_eq!(descriptor.result_kind(), ResultKind::Integer);
    }

    #[test]
    fn test_result_fits_kind() {
        assert!(NativeResult::Integer(0).fits(ResultKind::Integer));
        assert!(NativeResult::Boolean(true).fits(ResultKind::SyntheticBoolean));
        assert!(NativeResult::Text(None).fits(ResultKind::Text));
        assert!(!NativeResult::Integer(0).fits(ResultKind::Text));
        assert!(!NativeResult::Devices(Vec::new()).fits(ResultKind::Boolean));
    }

    #[test]
    fn test_descriptor_crosses_threads() {
        let mut descriptor = WorkDescriptor::new(Operation::Init);
        descriptor = std::thread::spawn(move || {
            descriptor.complete(NativeResult::Boolean(true));
            descriptor
        })
        .join()
        .unwrap();
        assert!(descriptor.is_complete());
    }
}
