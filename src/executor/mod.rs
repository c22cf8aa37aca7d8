//! Executing work descriptors against the native library.
//!
//! [`dispatch`] is the one place an [`Operation`] turns into native calls.
//! The [`SyncExecutor`] runs it on the caller's thread; the
//! [`AsyncExecutor`] runs it on a bounded pool of blocking workers and hands
//! the filled descriptor to a completion callback. [`marshal`] converts a
//! filled descriptor into a host value.

pub mod marshal;
pub mod pool;

pub use marshal::marshal;
pub use pool::AsyncExecutor;

use crate::descriptor::{NativeResult, WorkDescriptor};
use crate::device::list_devices;
use crate::error::Result;
use crate::metrics::{BridgeMetrics, CallTimer};
use crate::native::NativeLibrary;
use crate::operation::{CallArgs, Operation};
use crate::value::HostValue;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Run one operation against the native library.
///
/// Blocks for as long as the native call does. Native result codes are
/// returned as-is; nothing here fails.
pub fn dispatch(native: &dyn NativeLibrary, operation: &Operation) -> NativeResult {
    use NativeResult::{Boolean, Devices, Integer, Text};

    match operation {
        Operation::TurnOn { device_id } => Integer(native.turn_on(*device_id)),
        Operation::TurnOff { device_id } => Integer(native.turn_off(*device_id)),
        Operation::Dim { device_id, level } => Integer(native.dim(*device_id, *level)),
        Operation::Learn { device_id } => Integer(native.learn(*device_id)),
        Operation::AddDevice => Integer(native.add_device()),
        Operation::SetName { device_id, name } => Boolean(native.set_name(*device_id, name)),
        Operation::GetName { device_id } => Text(native.name(*device_id)),
        Operation::SetProtocol {
            device_id,
            protocol,
        } => Boolean(native.set_protocol(*device_id, protocol)),
        Operation::GetProtocol { device_id } => Text(native.protocol(*device_id)),
        Operation::SetModel { device_id, model } => Boolean(native.set_model(*device_id, model)),
        Operation::GetModel { device_id } => Text(native.model(*device_id)),
        Operation::GetDeviceType { device_id } => Integer(native.device_type(*device_id)),
        Operation::RemoveDevice { device_id } => Boolean(native.remove_device(*device_id)),
        Operation::UnregisterCallback { callback_id } => {
            Integer(native.unregister_callback(*callback_id))
        }
        Operation::GetErrorString { error_code } => Text(native.error_string(*error_code)),
        Operation::Init => {
            native.init();
            Boolean(true)
        }
        Operation::Close => {
            native.close();
            Boolean(true)
        }
        Operation::DeviceCount => Integer(native.number_of_devices()),
        Operation::Stop { device_id } => Integer(native.stop(*device_id)),
        Operation::Bell { device_id } => Integer(native.bell(*device_id)),
        Operation::DeviceIdForIndex { index } => Integer(native.device_id(*index)),
        Operation::GetDeviceParameter {
            device_id,
            name,
            default,
        } => Text(native.device_parameter(*device_id, name, default)),
        Operation::SetDeviceParameter {
            device_id,
            name,
            value,
        } => Boolean(native.set_device_parameter(*device_id, name, value)),
        Operation::Execute { device_id } => Integer(native.execute(*device_id)),
        Operation::Up { device_id } => Integer(native.up(*device_id)),
        Operation::Down { device_id } => Integer(native.down(*device_id)),
        Operation::ListDevices => Devices(list_devices(native)),
    }
}

/// Fill a descriptor's result slot, timing the native call
pub fn execute(
    native: &dyn NativeLibrary,
    descriptor: &mut WorkDescriptor,
    metrics: &BridgeMetrics,
) {
    let timer = CallTimer::start(descriptor.operation().native_name());
    let result = dispatch(native, descriptor.operation());
    timer.finish(metrics);
    descriptor.complete(result);
}

/// Runs operations on the calling thread
#[derive(Clone)]
pub struct SyncExecutor {
    native: Arc<dyn NativeLibrary>,
    metrics: Arc<BridgeMetrics>,
}

impl SyncExecutor {
    /// Create a synchronous executor
    pub fn new(native: Arc<dyn NativeLibrary>, metrics: Arc<BridgeMetrics>) -> Self {
        Self { native, metrics }
    }

    /// Execute a descriptor in place and hand it back filled
    #[instrument(skip(self, descriptor), fields(opcode = descriptor.opcode()))]
    pub fn execute(&self, mut descriptor: WorkDescriptor) -> WorkDescriptor {
        execute(self.native.as_ref(), &mut descriptor, &self.metrics);
        self.metrics.record_sync_call();
        debug!("Synchronous call complete");
        descriptor
    }

    /// Decode, execute and marshal one host call
    pub fn call(&self, args: CallArgs) -> Result<HostValue> {
        let operation = Operation::decode(args)?;
        marshal(self.execute(WorkDescriptor::new(operation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{codes, device_types, methods, InMemoryNative};

    fn setup() -> (Arc<InMemoryNative>, SyncExecutor) {
        let native = Arc::new(InMemoryNative::new());
        let executor = SyncExecutor::new(native.clone(), Arc::new(BridgeMetrics::new()));
        (native, executor)
    }

    #[test]
    fn test_set_then_get_name() {
        let (native, executor) = setup();
        let id =
            native.seed_device("", "arctech", "codeswitch", methods::TURNON, device_types::DEVICE);

        let set = executor.call(CallArgs::new(5, id, 0, "Lamp", "")).unwrap();
        assert_eq!(set, HostValue::Bool(true));

        let get = executor.call(CallArgs::numeric(6, id, 0)).unwrap();
        assert_eq!(get, HostValue::from("Lamp"));
        assert_eq!(native.ledger().outstanding(), 0);
    }

    #[test]
    fn test_native_codes_pass_through() {
        let (native, executor) = setup();
        let id = native.seed_device("Bell", "arctech", "bell", methods::BELL, device_types::DEVICE);

        assert_eq!(
            executor.call(CallArgs::numeric(19, id, 0)).unwrap(),
            HostValue::from(codes::SUCCESS)
        );
        assert_eq!(
            executor.call(CallArgs::numeric(0, id, 0)).unwrap(),
            HostValue::from(codes::ERROR_METHOD_NOT_SUPPORTED)
        );
        assert_eq!(
            executor.call(CallArgs::numeric(0, 999, 0)).unwrap(),
            HostValue::from(codes::ERROR_DEVICE_NOT_FOUND)
        );
    }

    #[test]
    fn test_init_and_close_are_synthetic_true() {
        let (native, executor) = setup();
        assert_eq!(executor.call(CallArgs::numeric(15, 0, 0)).unwrap(), HostValue::Bool(true));
        assert!(native.is_initialized());
        assert_eq!(executor.call(CallArgs::numeric(16, 0, 0)).unwrap(), HostValue::Bool(true));
        assert!(!native.is_initialized());
    }

    #[test]
    fn test_device_parameters() {
        let (native, executor) = setup();
        let id = native.add_device();

        assert_eq!(
            executor.call(CallArgs::new(21, id, 0, "house", "A")).unwrap(),
            HostValue::from("A")
        );
        assert_eq!(
            executor.call(CallArgs::new(22, id, 0, "house", "B")).unwrap(),
            HostValue::Bool(true)
        );
        assert_eq!(
            executor.call(CallArgs::new(21, id, 0, "house", "A")).unwrap(),
            HostValue::from("B")
        );
    }

    #[test]
    fn test_dispatch_records_native_call() {
        let (native, executor) = setup();
        executor.call(CallArgs::numeric(17, 0, 0)).unwrap();
        assert_eq!(native.calls_to("tdGetNumberOfDevices").len(), 1);
        assert_eq!(executor.metrics.snapshot().sync_calls, 1);
    }

    #[test]
    fn test_invalid_call_never_reaches_native() {
        let (native, executor) = setup();
        assert!(executor.call(CallArgs::numeric(99, 0, 0)).is_err());
        assert!(native.calls().is_empty());
    }
}
