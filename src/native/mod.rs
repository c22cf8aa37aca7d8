//! The native control library seam.
//!
//! Everything the bridge needs from telldus-core goes through the
//! [`NativeLibrary`] trait. Strings the library allocates come back as
//! [`NativeString`] values that release themselves exactly once, and events
//! arrive at an [`EventSink`] as borrowed views that cannot outlive the
//! native callback.

pub mod memory;
mod slots;
#[cfg(feature = "telldus-core")]
pub mod telldus;

pub use memory::InMemoryNative;
#[cfg(feature = "telldus-core")]
pub use telldus::TelldusCore;

use std::ffi::{c_char, CStr};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Device method bits (`TELLSTICK_*`)
pub mod methods {
    /// Turn on
    pub const TURNON: i32 = 1;
    /// Turn off
    pub const TURNOFF: i32 = 2;
    /// Bell
    pub const BELL: i32 = 4;
    /// Toggle
    pub const TOGGLE: i32 = 8;
    /// Dim
    pub const DIM: i32 = 16;
    /// Learn
    pub const LEARN: i32 = 32;
    /// Execute (scenes)
    pub const EXECUTE: i32 = 64;
    /// Up
    pub const UP: i32 = 128;
    /// Down
    pub const DOWN: i32 = 256;
    /// Stop
    pub const STOP: i32 = 512;

    /// Every method the bridge knows how to report
    pub const SUPPORTED_METHODS: i32 =
        TURNON | TURNOFF | BELL | TOGGLE | DIM | LEARN | EXECUTE | UP | DOWN | STOP;
}

/// Device types (`TELLSTICK_TYPE_*`)
pub mod device_types {
    /// Plain device
    pub const DEVICE: i32 = 1;
    /// Group of devices
    pub const GROUP: i32 = 2;
    /// Scene
    pub const SCENE: i32 = 3;
}

/// Sensor value types
pub mod sensor_types {
    /// Temperature
    pub const TEMPERATURE: i32 = 1;
    /// Humidity
    pub const HUMIDITY: i32 = 2;
    /// Rain rate
    pub const RAINRATE: i32 = 4;
    /// Rain total
    pub const RAINTOTAL: i32 = 8;
    /// Wind direction
    pub const WINDDIRECTION: i32 = 16;
    /// Wind average
    pub const WINDAVERAGE: i32 = 32;
    /// Wind gust
    pub const WINDGUST: i32 = 64;
}

/// Result codes returned by the native library
pub mod codes {
    /// Success
    pub const SUCCESS: i32 = 0;
    /// No TellStick found
    pub const ERROR_NOT_FOUND: i32 = -1;
    /// Permission denied
    pub const ERROR_PERMISSION_DENIED: i32 = -2;
    /// Device not found
    pub const ERROR_DEVICE_NOT_FOUND: i32 = -3;
    /// Method not supported by the device
    pub const ERROR_METHOD_NOT_SUPPORTED: i32 = -4;
    /// Error communicating with the TellStick
    pub const ERROR_COMMUNICATION: i32 = -5;
    /// Could not connect to the service
    pub const ERROR_CONNECTING_SERVICE: i32 = -6;
    /// Unknown response from the service
    pub const ERROR_UNKNOWN_RESPONSE: i32 = -7;
    /// Syntax error
    pub const ERROR_SYNTAX: i32 = -8;
    /// Broken pipe
    pub const ERROR_BROKEN_PIPE: i32 = -9;
    /// Error communicating with the service
    pub const ERROR_COMMUNICATING_SERVICE: i32 = -10;
    /// Syntax error in the configuration file
    pub const ERROR_CONFIG_SYNTAX: i32 = -11;
    /// Unknown error
    pub const ERROR_UNKNOWN: i32 = -99;
}

/// Release hook of the library that allocated a [`NativeString`]
pub trait StringRelease: Send + Sync {
    /// Hand a buffer back to the library.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this library and not yet released.
    unsafe fn release(&self, ptr: *mut c_char);
}

/// A string buffer owned by the native library.
///
/// The buffer is released when the value is dropped, so every path
/// (including early returns and panics) releases it exactly once.
pub struct NativeString {
    ptr: NonNull<c_char>,
    owner: Arc<dyn StringRelease>,
}

// SAFETY: the buffer is exclusively owned by this value and telldus-core
// allows tdReleaseString from any thread.
unsafe impl Send for NativeString {}

impl NativeString {
    /// Take ownership of a buffer returned by the native library.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a NUL-terminated buffer allocated by `owner`
    /// that nobody else will release.
    pub unsafe fn from_raw(ptr: *mut c_char, owner: Arc<dyn StringRelease>) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, owner })
    }

    /// Borrow the buffer
    pub fn as_c_str(&self) -> &CStr {
        // SAFETY: from_raw's contract guarantees a live NUL-terminated buffer
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }
    }

    /// Copy the contents out, replacing invalid UTF-8
    pub fn to_string_lossy(&self) -> String {
        self.as_c_str().to_string_lossy().into_owned()
    }

    /// Copy the contents out and release the buffer
    pub fn into_string(self) -> String {
        self.to_string_lossy()
    }
}

impl Drop for NativeString {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `owner` and is released only here
        unsafe { self.owner.release(self.ptr.as_ptr()) }
    }
}

impl fmt::Debug for NativeString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeString").field(&self.as_c_str()).finish()
    }
}

/// Copy an optional native string, treating null as empty
pub fn take_string(s: Option<NativeString>) -> String {
    s.map(NativeString::into_string).unwrap_or_default()
}

/// Device state change as delivered by the native library
#[derive(Debug, Clone, Copy)]
pub struct RawDeviceEvent<'a> {
    /// Device that changed
    pub device_id: i32,
    /// Method that was executed
    pub method: i32,
    /// Method data (e.g. dim level), native-owned
    pub data: &'a CStr,
    /// Registration token
    pub callback_id: i32,
}

/// Sensor reading as delivered by the native library
#[derive(Debug, Clone, Copy)]
pub struct RawSensorEvent<'a> {
    /// Sensor protocol, native-owned
    pub protocol: &'a CStr,
    /// Sensor model, native-owned
    pub model: &'a CStr,
    /// Sensor id
    pub sensor_id: i32,
    /// Value type (see [`sensor_types`])
    pub data_type: i32,
    /// Reading, native-owned
    pub value: &'a CStr,
    /// Unix timestamp in seconds
    pub timestamp: i32,
    /// Registration token
    pub callback_id: i32,
}

/// Raw protocol frame as delivered by the native library
#[derive(Debug, Clone, Copy)]
pub struct RawFrameEvent<'a> {
    /// Frame text, native-owned
    pub data: &'a CStr,
    /// Controller that received the frame
    pub controller_id: i32,
    /// Registration token
    pub callback_id: i32,
}

/// Receiver of native events.
///
/// Called synchronously on a thread owned by the native library. The
/// borrowed fields are only valid for the duration of the call.
pub trait EventSink: Send + Sync {
    /// A device changed state
    fn device_event(&self, _event: RawDeviceEvent<'_>) {}

    /// A sensor reported a value
    fn sensor_event(&self, _event: RawSensorEvent<'_>) {}

    /// A raw frame was received
    fn raw_device_event(&self, _event: RawFrameEvent<'_>) {}
}

/// The blocking telldus-core API.
///
/// Every method may block on serial or radio I/O.
pub trait NativeLibrary: Send + Sync + 'static {
    /// `tdInit`
    fn init(&self);
    /// `tdClose`
    fn close(&self);

    /// `tdTurnOn`
    fn turn_on(&self, device_id: i32) -> i32;
    /// `tdTurnOff`
    fn turn_off(&self, device_id: i32) -> i32;
    /// `tdBell`
    fn bell(&self, device_id: i32) -> i32;
    /// `tdDim`
    fn dim(&self, device_id: i32, level: u8) -> i32;
    /// `tdExecute`
    fn execute(&self, device_id: i32) -> i32;
    /// `tdUp`
    fn up(&self, device_id: i32) -> i32;
    /// `tdDown`
    fn down(&self, device_id: i32) -> i32;
    /// `tdStop`
    fn stop(&self, device_id: i32) -> i32;
    /// `tdLearn`
    fn learn(&self, device_id: i32) -> i32;

    /// `tdMethods`
    fn methods(&self, device_id: i32, methods_supported: i32) -> i32;
    /// `tdLastSentCommand`
    fn last_sent_command(&self, device_id: i32, methods_supported: i32) -> i32;
    /// `tdLastSentValue`
    fn last_sent_value(&self, device_id: i32) -> Option<NativeString>;

    /// `tdGetNumberOfDevices`
    fn number_of_devices(&self) -> i32;
    /// `tdGetDeviceId`
    fn device_id(&self, device_index: i32) -> i32;
    /// `tdGetDeviceType`
    fn device_type(&self, device_id: i32) -> i32;
    /// `tdGetErrorString`
    fn error_string(&self, error_code: i32) -> Option<NativeString>;

    /// `tdGetName`
    fn name(&self, device_id: i32) -> Option<NativeString>;
    /// `tdSetName`
    fn set_name(&self, device_id: i32, name: &str) -> bool;
    /// `tdGetProtocol`
    fn protocol(&self, device_id: i32) -> Option<NativeString>;
    /// `tdSetProtocol`
    fn set_protocol(&self, device_id: i32, protocol: &str) -> bool;
    /// `tdGetModel`
    fn model(&self, device_id: i32) -> Option<NativeString>;
    /// `tdSetModel`
    fn set_model(&self, device_id: i32, model: &str) -> bool;
    /// `tdGetDeviceParameter`
    fn device_parameter(&self, device_id: i32, name: &str, default: &str)
        -> Option<NativeString>;
    /// `tdSetDeviceParameter`
    fn set_device_parameter(&self, device_id: i32, name: &str, value: &str) -> bool;

    /// `tdAddDevice`
    fn add_device(&self) -> i32;
    /// `tdRemoveDevice`
    fn remove_device(&self, device_id: i32) -> bool;

    /// `tdRegisterDeviceEvent`; returns the callback id
    fn register_device_event(&self, sink: Arc<dyn EventSink>) -> i32;
    /// `tdRegisterSensorEvent`; returns the callback id
    fn register_sensor_event(&self, sink: Arc<dyn EventSink>) -> i32;
    /// `tdRegisterRawDeviceEvent`; returns the callback id
    fn register_raw_device_event(&self, sink: Arc<dyn EventSink>) -> i32;
    /// `tdUnregisterCallback`
    fn unregister_callback(&self, callback_id: i32) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRelease {
        released: AtomicUsize,
    }

    impl StringRelease for CountingRelease {
        unsafe fn release(&self, ptr: *mut c_char) {
            drop(unsafe { CString::from_raw(ptr) });
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_null_is_none() {
        let owner = Arc::new(CountingRelease::default());
        let s = unsafe { NativeString::from_raw(std::ptr::null_mut(), owner.clone()) };
        assert!(s.is_none());
        assert_eq!(take_string(s), "");
        assert_eq!(owner.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_into_string_releases_once() {
        let owner = Arc::new(CountingRelease::default());
        let raw = CString::new("Lamp").unwrap().into_raw();
        let s = unsafe { NativeString::from_raw(raw, owner.clone()) }.unwrap();

        assert_eq!(s.to_string_lossy(), "Lamp");
        assert_eq!(owner.released.load(Ordering::SeqCst), 0);
        assert_eq!(s.into_string(), "Lamp");
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_on_other_thread() {
        let owner = Arc::new(CountingRelease::default());
        let raw = CString::new("moved").unwrap().into_raw();
        let s = unsafe { NativeString::from_raw(raw, owner.clone()) }.unwrap();

        std::thread::spawn(move || drop(s)).join().unwrap();
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_supported_methods_mask() {
        assert_eq!(methods::SUPPORTED_METHODS, 1023);
    }
}
