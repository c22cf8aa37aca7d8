//! FFI binding to the system `libtelldus-core`.
//!
//! Event callbacks are registered with a C trampoline per event class. The
//! `context` pointer handed to the library is a boxed `Arc<dyn EventSink>`
//! owned by [`ContextSlots`] and freed when the callback is unregistered.

use super::slots::ContextSlots;
use super::{
    EventSink, NativeLibrary, NativeString, RawDeviceEvent, RawFrameEvent, RawSensorEvent,
    StringRelease,
};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

type DeviceEventFn = extern "system" fn(c_int, c_int, *const c_char, c_int, *mut c_void);
type SensorEventFn = extern "system" fn(
    *const c_char,
    *const c_char,
    c_int,
    c_int,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
);
type RawDeviceEventFn = extern "system" fn(*const c_char, c_int, c_int, *mut c_void);

#[link(name = "telldus-core")]
extern "system" {
    fn tdInit();
    fn tdClose();
    fn tdReleaseString(the_string: *mut c_char);

    fn tdRegisterDeviceEvent(event_function: DeviceEventFn, context: *mut c_void) -> c_int;
    fn tdRegisterSensorEvent(event_function: SensorEventFn, context: *mut c_void) -> c_int;
    fn tdRegisterRawDeviceEvent(event_function: RawDeviceEventFn, context: *mut c_void) -> c_int;
    fn tdUnregisterCallback(callback_id: c_int) -> c_int;

    fn tdTurnOn(device_id: c_int) -> c_int;
    fn tdTurnOff(device_id: c_int) -> c_int;
    fn tdBell(device_id: c_int) -> c_int;
    fn tdDim(device_id: c_int, level: u8) -> c_int;
    fn tdExecute(device_id: c_int) -> c_int;
    fn tdUp(device_id: c_int) -> c_int;
    fn tdDown(device_id: c_int) -> c_int;
    fn tdStop(device_id: c_int) -> c_int;
    fn tdLearn(device_id: c_int) -> c_int;
    fn tdMethods(device_id: c_int, methods_supported: c_int) -> c_int;
    fn tdLastSentCommand(device_id: c_int, methods_supported: c_int) -> c_int;
    fn tdLastSentValue(device_id: c_int) -> *mut c_char;

    fn tdGetNumberOfDevices() -> c_int;
    fn tdGetDeviceId(device_index: c_int) -> c_int;
    fn tdGetDeviceType(device_id: c_int) -> c_int;
    fn tdGetErrorString(error_no: c_int) -> *mut c_char;

    fn tdGetName(device_id: c_int) -> *mut c_char;
    fn tdSetName(device_id: c_int, new_name: *const c_char) -> bool;
    fn tdGetProtocol(device_id: c_int) -> *mut c_char;
    fn tdSetProtocol(device_id: c_int, protocol: *const c_char) -> bool;
    fn tdGetModel(device_id: c_int) -> *mut c_char;
    fn tdSetModel(device_id: c_int, model: *const c_char) -> bool;
    fn tdGetDeviceParameter(
        device_id: c_int,
        name: *const c_char,
        default_value: *const c_char,
    ) -> *mut c_char;
    fn tdSetDeviceParameter(device_id: c_int, name: *const c_char, value: *const c_char) -> bool;

    fn tdAddDevice() -> c_int;
    fn tdRemoveDevice(device_id: c_int) -> bool;
}

struct TelldusRelease;

impl StringRelease for TelldusRelease {
    unsafe fn release(&self, ptr: *mut c_char) {
        // SAFETY: caller guarantees ptr came from telldus-core and is live
        unsafe { tdReleaseString(ptr) }
    }
}

/// Binding to the system telldus-core library
pub struct TelldusCore {
    release: Arc<dyn StringRelease>,
    slots: ContextSlots,
}

impl Default for TelldusCore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelldusCore {
    /// Create the binding; call [`NativeLibrary::init`] before use
    pub fn new() -> Self {
        Self {
            release: Arc::new(TelldusRelease),
            slots: ContextSlots::new(),
        }
    }

    fn owned(&self, ptr: *mut c_char) -> Option<NativeString> {
        // SAFETY: every string-returning td* function hands ownership to us
        unsafe { NativeString::from_raw(ptr, Arc::clone(&self.release)) }
    }

}

impl Drop for TelldusCore {
    fn drop(&mut self) {
        self.slots
            .clear(|callback_id| unsafe { tdUnregisterCallback(callback_id) });
    }
}

fn c_arg(text: &str) -> CString {
    CString::new(text).unwrap_or_default()
}

/// # Safety
///
/// `ptr` must be null or a NUL-terminated string valid for `'a`.
unsafe fn borrowed<'a>(ptr: *const c_char) -> &'a CStr {
    if ptr.is_null() {
        Default::default()
    } else {
        // SAFETY: upheld by the caller
        unsafe { CStr::from_ptr(ptr) }
    }
}

/// # Safety
///
/// `context` must be a pointer produced by `TelldusCore::register`.
unsafe fn sink<'a>(context: *mut c_void) -> Option<&'a Arc<dyn EventSink>> {
    // SAFETY: upheld by the caller
    unsafe { context.cast::<Arc<dyn EventSink>>().as_ref() }
}

fn guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(event = what, "Event sink panicked on the native thread");
    }
}

extern "system" fn device_event_trampoline(
    device_id: c_int,
    method: c_int,
    data: *const c_char,
    callback_id: c_int,
    context: *mut c_void,
) {
    guarded("device", || {
        // SAFETY: the library passes back the context we registered and a
        // data string valid for the duration of this call
        if let Some(sink) = unsafe { sink(context) } {
            sink.device_event(RawDeviceEvent {
                device_id,
                method,
                data: unsafe { borrowed(data) },
                callback_id,
            });
        }
    });
}

#[allow(clippy::too_many_arguments)]
extern "system" fn sensor_event_trampoline(
    protocol: *const c_char,
    model: *const c_char,
    sensor_id: c_int,
    data_type: c_int,
    value: *const c_char,
    timestamp: c_int,
    callback_id: c_int,
    context: *mut c_void,
) {
    guarded("sensor", || {
        // SAFETY: as for device events
        if let Some(sink) = unsafe { sink(context) } {
            sink.sensor_event(RawSensorEvent {
                protocol: unsafe { borrowed(protocol) },
                model: unsafe { borrowed(model) },
                sensor_id,
                data_type,
                value: unsafe { borrowed(value) },
                timestamp,
                callback_id,
            });
        }
    });
}

extern "system" fn raw_device_event_trampoline(
    data: *const c_char,
    controller_id: c_int,
    callback_id: c_int,
    context: *mut c_void,
) {
    guarded("raw", || {
        // SAFETY: as for device events
        if let Some(sink) = unsafe { sink(context) } {
            sink.raw_device_event(RawFrameEvent {
                data: unsafe { borrowed(data) },
                controller_id,
                callback_id,
            });
        }
    });
}

// SAFETY (all blocks below): plain calls into telldus-core with integer
// arguments or NUL-terminated strings that outlive the call.
impl NativeLibrary for TelldusCore {
    fn init(&self) {
        unsafe { tdInit() }
    }

    fn close(&self) {
        unsafe { tdClose() }
    }

    fn turn_on(&self, device_id: i32) -> i32 {
        unsafe { tdTurnOn(device_id) }
    }

    fn turn_off(&self, device_id: i32) -> i32 {
        unsafe { tdTurnOff(device_id) }
    }

    fn bell(&self, device_id: i32) -> i32 {
        unsafe { tdBell(device_id) }
    }

    fn dim(&self, device_id: i32, level: u8) -> i32 {
        unsafe { tdDim(device_id, level) }
    }

    fn execute(&self, device_id: i32) -> i32 {
        unsafe { tdExecute(device_id) }
    }

    fn up(&self, device_id: i32) -> i32 {
        unsafe { tdUp(device_id) }
    }

    fn down(&self, device_id: i32) -> i32 {
        unsafe { tdDown(device_id) }
    }

    fn stop(&self, device_id: i32) -> i32 {
        unsafe { tdStop(device_id) }
    }

    fn learn(&self, device_id: i32) -> i32 {
        unsafe { tdLearn(device_id) }
    }

    fn methods(&self, device_id: i32, methods_supported: i32) -> i32 {
        unsafe { tdMethods(device_id, methods_supported) }
    }

    fn last_sent_command(&self, device_id: i32, methods_supported: i32) -> i32 {
        unsafe { tdLastSentCommand(device_id, methods_supported) }
    }

    fn last_sent_value(&self, device_id: i32) -> Option<NativeString> {
        self.owned(unsafe { tdLastSentValue(device_id) })
    }

    fn number_of_devices(&self) -> i32 {
        unsafe { tdGetNumberOfDevices() }
    }

    fn device_id(&self, device_index: i32) -> i32 {
        unsafe { tdGetDeviceId(device_index) }
    }

    fn device_type(&self, device_id: i32) -> i32 {
        unsafe { tdGetDeviceType(device_id) }
    }

    fn error_string(&self, error_code: i32) -> Option<NativeString> {
        self.owned(unsafe { tdGetErrorString(error_code) })
    }

    fn name(&self, device_id: i32) -> Option<NativeString> {
        self.owned(unsafe { tdGetName(device_id) })
    }

    fn set_name(&self, device_id: i32, name: &str) -> bool {
        let name = c_arg(name);
        unsafe { tdSetName(device_id, name.as_ptr()) }
    }

    fn protocol(&self, device_id: i32) -> Option<NativeString> {
        self.owned(unsafe { tdGetProtocol(device_id) })
    }

    fn set_protocol(&self, device_id: i32, protocol: &str) -> bool {
        let protocol = c_arg(protocol);
        unsafe { tdSetProtocol(device_id, protocol.as_ptr()) }
    }

    fn model(&self, device_id: i32) -> Option<NativeString> {
        self.owned(unsafe { tdGetModel(device_id) })
    }

    fn set_model(&self, device_id: i32, model: &str) -> bool {
        let model = c_arg(model);
        unsafe { tdSetModel(device_id, model.as_ptr()) }
    }

    fn device_parameter(&self, device_id: i32, name: &str, default: &str) -> Option<NativeString> {
        let name = c_arg(name);
        let default = c_arg(default);
        self.owned(unsafe { tdGetDeviceParameter(device_id, name.as_ptr(), default.as_ptr()) })
    }

    fn set_device_parameter(&self, device_id: i32, name: &str, value: &str) -> bool {
        let name = c_arg(name);
        let value = c_arg(value);
        unsafe { tdSetDeviceParameter(device_id, name.as_ptr(), value.as_ptr()) }
    }

    fn add_device(&self) -> i32 {
        unsafe { tdAddDevice() }
    }

    fn remove_device(&self, device_id: i32) -> bool {
        unsafe { tdRemoveDevice(device_id) }
    }

    fn register_device_event(&self, sink: Arc<dyn EventSink>) -> i32 {
        self.slots.register(sink, |context| unsafe {
            tdRegisterDeviceEvent(device_event_trampoline, context)
        })
    }

    fn register_sensor_event(&self, sink: Arc<dyn EventSink>) -> i32 {
        self.slots.register(sink, |context| unsafe {
            tdRegisterSensorEvent(sensor_event_trampoline, context)
        })
    }

    fn register_raw_device_event(&self, sink: Arc<dyn EventSink>) -> i32 {
        self.slots.register(sink, |context| unsafe {
            tdRegisterRawDeviceEvent(raw_device_event_trampoline, context)
        })
    }

    fn unregister_callback(&self, callback_id: i32) -> i32 {
        self.slots
            .unregister(callback_id, |callback_id| unsafe { tdUnregisterCallback(callback_id) })
    }
}
