//! In-process implementation of the native library.
//!
//! Keeps a device table in memory, hands out heap strings through the same
//! release contract as telldus-core and raises events from a thread it owns.
//! The release ledger and call log make ownership mistakes observable.

use super::{
    codes, device_types, methods, EventSink, NativeLibrary, NativeString, RawDeviceEvent,
    RawFrameEvent, RawSensorEvent, StringRelease,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::warn;

/// Name of the thread events are raised on
pub const EVENT_THREAD_NAME: &str = "telldus-native-events";

/// Counts strings handed out and released
#[derive(Default)]
pub struct ReleaseLedger {
    issued: AtomicUsize,
    released: AtomicUsize,
    invalid_releases: AtomicUsize,
    live: Mutex<HashSet<usize>>,
}

impl ReleaseLedger {
    fn issue(self: &Arc<Self>, text: &str) -> Option<NativeString> {
        let c = CString::new(text.replace('\0', "")).unwrap_or_default();
        let ptr = c.into_raw();
        self.live.lock().insert(ptr as usize);
        self.issued.fetch_add(1, Ordering::SeqCst);
        let owner: Arc<dyn StringRelease> = Arc::clone(self) as Arc<dyn StringRelease>;
        // SAFETY: ptr was just allocated by CString and is tracked as live
        unsafe { NativeString::from_raw(ptr, owner) }
    }

    /// Strings handed out so far
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    /// Strings released so far
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Releases of pointers that were not live (double release or foreign)
    pub fn invalid_releases(&self) -> usize {
        self.invalid_releases.load(Ordering::SeqCst)
    }

    /// Strings handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }
}

impl StringRelease for ReleaseLedger {
    unsafe fn release(&self, ptr: *mut c_char) {
        if !self.live.lock().remove(&(ptr as usize)) {
            self.invalid_releases.fetch_add(1, Ordering::SeqCst);
            warn!("release of a string that is not live");
            return;
        }
        // SAFETY: the pointer came from CString::into_raw and was live
        drop(unsafe { CString::from_raw(ptr) });
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// One recorded call into the library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCall {
    /// Native function name
    pub function: &'static str,
    /// Thread the call ran on
    pub thread: ThreadId,
}

#[derive(Debug, Clone)]
struct MemDevice {
    id: i32,
    name: String,
    protocol: String,
    model: String,
    device_type: i32,
    methods: i32,
    last_command: i32,
    last_value: String,
    parameters: HashMap<String, String>,
}

impl MemDevice {
    fn new(id: i32) -> Self {
        Self {
            id,
            name: String::new(),
            protocol: String::new(),
            model: String::new(),
            device_type: device_types::DEVICE,
            methods: methods::TURNON | methods::TURNOFF,
            last_command: methods::TURNOFF,
            last_value: String::new(),
            parameters: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SinkClass {
    Device,
    Sensor,
    Raw,
}

#[derive(Default)]
struct State {
    devices: Vec<MemDevice>,
    next_device_id: i32,
    sinks: HashMap<i32, (SinkClass, Arc<dyn EventSink>)>,
    next_callback_id: i32,
    initialized: bool,
}

/// In-memory native library
pub struct InMemoryNative {
    state: Mutex<State>,
    ledger: Arc<ReleaseLedger>,
    calls: Mutex<Vec<NativeCall>>,
    faults: Mutex<HashSet<&'static str>>,
}

impl Default for InMemoryNative {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNative {
    /// Create an empty library
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_device_id: 1,
                next_callback_id: 1,
                ..State::default()
            }),
            ledger: Arc::new(ReleaseLedger::default()),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(HashSet::new()),
        }
    }

    /// Make every later call to `function` panic after it is recorded
    pub fn panic_on(&self, function: &'static str) {
        self.faults.lock().insert(function);
    }

    /// Add a configured device and return its id
    pub fn seed_device(
        &self,
        name: &str,
        protocol: &str,
        model: &str,
        methods: i32,
        device_type: i32,
    ) -> i32 {
        let mut state = self.state.lock();
        let id = state.next_device_id;
        state.next_device_id += 1;
        let mut device = MemDevice::new(id);
        device.name = name.to_string();
        device.protocol = protocol.to_string();
        device.model = model.to_string();
        device.methods = methods;
        device.device_type = device_type;
        state.devices.push(device);
        id
    }

    /// String release ledger
    pub fn ledger(&self) -> &ReleaseLedger {
        &self.ledger
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().clone()
    }

    /// Calls to one native function
    pub fn calls_to(&self, function: &str) -> Vec<NativeCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.function == function)
            .cloned()
            .collect()
    }

    /// Whether `tdInit` has been called more recently than `tdClose`
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Number of registered event callbacks
    pub fn registered_callbacks(&self) -> usize {
        self.state.lock().sinks.len()
    }

    /// Raise a device event on the library's event thread.
    ///
    /// Records `method` as the device's last command first, as the real
    /// library does before notifying listeners.
    pub fn emit_device_event(&self, device_id: i32, method: i32, data: &str) {
        {
            let mut state = self.state.lock();
            if let Some(device) = state.devices.iter_mut().find(|d| d.id == device_id) {
                device.last_command = method;
                if method == methods::DIM {
                    device.last_value = data.to_string();
                }
            }
        }
        let sinks = self.sinks_of(SinkClass::Device);
        let mut data = nul_terminated(data);
        on_event_thread(|| {
            for (callback_id, sink) in &sinks {
                sink.device_event(RawDeviceEvent {
                    device_id,
                    method,
                    data: as_c_str(&data),
                    callback_id: *callback_id,
                });
            }
            scribble(&mut data);
        });
    }

    /// Raise a sensor event on the library's event thread.
    ///
    /// The text buffers are overwritten as soon as the sinks return.
    pub fn emit_sensor_event(
        &self,
        protocol: &str,
        model: &str,
        sensor_id: i32,
        data_type: i32,
        value: &str,
        timestamp: i32,
    ) {
        let sinks = self.sinks_of(SinkClass::Sensor);
        let mut protocol = nul_terminated(protocol);
        let mut model = nul_terminated(model);
        let mut value = nul_terminated(value);
        on_event_thread(|| {
            for (callback_id, sink) in &sinks {
                sink.sensor_event(RawSensorEvent {
                    protocol: as_c_str(&protocol),
                    model: as_c_str(&model),
                    sensor_id,
                    data_type,
                    value: as_c_str(&value),
                    timestamp,
                    callback_id: *callback_id,
                });
            }
            scribble(&mut protocol);
            scribble(&mut model);
            scribble(&mut value);
        });
    }

    /// Raise a raw frame event on the library's event thread
    pub fn emit_raw_event(&self, data: &str, controller_id: i32) {
        let sinks = self.sinks_of(SinkClass::Raw);
        let mut data = nul_terminated(data);
        on_event_thread(|| {
            for (callback_id, sink) in &sinks {
                sink.raw_device_event(RawFrameEvent {
                    data: as_c_str(&data),
                    controller_id,
                    callback_id: *callback_id,
                });
            }
            scribble(&mut data);
        });
    }

    fn sinks_of(&self, class: SinkClass) -> Vec<(i32, Arc<dyn EventSink>)> {
        let state = self.state.lock();
        let mut sinks: Vec<_> = state
            .sinks
            .iter()
            .filter(|(_, (c, _))| *c == class)
            .map(|(id, (_, sink))| (*id, Arc::clone(sink)))
            .collect();
        sinks.sort_by_key(|(id, _)| *id);
        sinks
    }

    fn record(&self, function: &'static str) {
        self.calls.lock().push(NativeCall {
            function,
            thread: thread::current().id(),
        });
        if self.faults.lock().contains(function) {
            panic!("{} aborted", function);
        }
    }

    fn with_device<T>(&self, device_id: i32, f: impl FnOnce(&mut MemDevice) -> T) -> Option<T> {
        let mut state = self.state.lock();
        state.devices.iter_mut().find(|d| d.id == device_id).map(f)
    }

    fn command(&self, function: &'static str, device_id: i32, method: i32) -> i32 {
        self.record(function);
        self.with_device(device_id, |d| {
            if d.methods & method == 0 {
                return codes::ERROR_METHOD_NOT_SUPPORTED;
            }
            if method != methods::LEARN {
                d.last_command = method;
            }
            codes::SUCCESS
        })
        .unwrap_or(codes::ERROR_DEVICE_NOT_FOUND)
    }

    fn register(&self, function: &'static str, class: SinkClass, sink: Arc<dyn EventSink>) -> i32 {
        self.record(function);
        let mut state = self.state.lock();
        let id = state.next_callback_id;
        state.next_callback_id += 1;
        state.sinks.insert(id, (class, sink));
        id
    }
}

fn nul_terminated(text: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = text.bytes().filter(|b| *b != 0).collect();
    bytes.push(0);
    bytes
}

fn as_c_str(bytes: &[u8]) -> &CStr {
    CStr::from_bytes_until_nul(bytes).unwrap_or_default()
}

fn scribble(bytes: &mut [u8]) {
    let len = bytes.len().saturating_sub(1);
    bytes[..len].fill(b'#');
}

fn on_event_thread<F: FnOnce() + Send>(f: F) {
    thread::scope(|scope| {
        let spawned = thread::Builder::new()
            .name(EVENT_THREAD_NAME.to_string())
            .spawn_scoped(scope, f);
        if let Err(e) = spawned {
            warn!("Failed to spawn native event thread: {}", e);
        }
    });
}

impl NativeLibrary for InMemoryNative {
    fn init(&self) {
        self.record("tdInit");
        self.state.lock().initialized = true;
    }

    fn close(&self) {
        self.record("tdClose");
        self.state.lock().initialized = false;
    }

    fn turn_on(&self, device_id: i32) -> i32 {
        self.command("tdTurnOn", device_id, methods::TURNON)
    }

    fn turn_off(&self, device_id: i32) -> i32 {
        self.command("tdTurnOff", device_id, methods::TURNOFF)
    }

    fn bell(&self, device_id: i32) -> i32 {
        self.command("tdBell", device_id, methods::BELL)
    }

    fn dim(&self, device_id: i32, level: u8) -> i32 {
        let result = self.command("tdDim", device_id, methods::DIM);
        if result == codes::SUCCESS {
            self.with_device(device_id, |d| d.last_value = level.to_string());
        }
        result
    }

    fn execute(&self, device_id: i32) -> i32 {
        self.command("tdExecute", device_id, methods::EXECUTE)
    }

    fn up(&self, device_id: i32) -> i32 {
        self.command("tdUp", device_id, methods::UP)
    }

    fn down(&self, device_id: i32) -> i32 {
        self.command("tdDown", device_id, methods::DOWN)
    }

    fn stop(&self, device_id: i32) -> i32 {
        self.command("tdStop", device_id, methods::STOP)
    }

    fn learn(&self, device_id: i32) -> i32 {
        self.command("tdLearn", device_id, methods::LEARN)
    }

    fn methods(&self, device_id: i32, methods_supported: i32) -> i32 {
        self.record("tdMethods");
        self.with_device(device_id, |d| d.methods & methods_supported)
            .unwrap_or(0)
    }

    fn last_sent_command(&self, device_id: i32, methods_supported: i32) -> i32 {
        self.record("tdLastSentCommand");
        self.with_device(device_id, |d| d.last_command & methods_supported)
            .unwrap_or(0)
    }

    fn last_sent_value(&self, device_id: i32) -> Option<NativeString> {
        self.record("tdLastSentValue");
        let value = self
            .with_device(device_id, |d| d.last_value.clone())
            .unwrap_or_default();
        self.ledger.issue(&value)
    }

    fn number_of_devices(&self) -> i32 {
        self.record("tdGetNumberOfDevices");
        self.state.lock().devices.len() as i32
    }

    fn device_id(&self, device_index: i32) -> i32 {
        self.record("tdGetDeviceId");
        let state = self.state.lock();
        usize::try_from(device_index)
            .ok()
            .and_then(|i| state.devices.get(i))
            .map(|d| d.id)
            .unwrap_or(codes::ERROR_DEVICE_NOT_FOUND)
    }

    fn device_type(&self, device_id: i32) -> i32 {
        self.record("tdGetDeviceType");
        self.with_device(device_id, |d| d.device_type)
            .unwrap_or(codes::ERROR_DEVICE_NOT_FOUND)
    }

    fn error_string(&self, error_code: i32) -> Option<NativeString> {
        self.record("tdGetErrorString");
        let text = match error_code {
            codes::SUCCESS => "Success",
            codes::ERROR_NOT_FOUND => "TellStick not found",
            codes::ERROR_PERMISSION_DENIED => "Permission denied",
            codes::ERROR_DEVICE_NOT_FOUND => "Device not found",
            codes::ERROR_METHOD_NOT_SUPPORTED => {
                "The method you tried to use is not supported by the device"
            }
            codes::ERROR_COMMUNICATION => "An error occurred while communicating with TellStick",
            codes::ERROR_CONNECTING_SERVICE => "Could not connect to the Telldus Service",
            codes::ERROR_UNKNOWN_RESPONSE => "Received an unknown response",
            codes::ERROR_SYNTAX => "Syntax error",
            codes::ERROR_BROKEN_PIPE => "Broken pipe",
            codes::ERROR_COMMUNICATING_SERVICE => {
                "An error occurred while communicating with the Telldus Service"
            }
            codes::ERROR_CONFIG_SYNTAX => "Syntax error in the configuration file",
            _ => "Unknown error",
        };
        self.ledger.issue(text)
    }

    fn name(&self, device_id: i32) -> Option<NativeString> {
        self.record("tdGetName");
        let name = self.with_device(device_id, |d| d.name.clone()).unwrap_or_default();
        self.ledger.issue(&name)
    }

    fn set_name(&self, device_id: i32, name: &str) -> bool {
        self.record("tdSetName");
        self.with_device(device_id, |d| d.name = name.to_string()).is_some()
    }

    fn protocol(&self, device_id: i32) -> Option<NativeString> {
        self.record("tdGetProtocol");
        let protocol = self
            .with_device(device_id, |d| d.protocol.clone())
            .unwrap_or_default();
        self.ledger.issue(&protocol)
    }

    fn set_protocol(&self, device_id: i32, protocol: &str) -> bool {
        self.record("tdSetProtocol");
        self.with_device(device_id, |d| d.protocol = protocol.to_string())
            .is_some()
    }

    fn model(&self, device_id: i32) -> Option<NativeString> {
        self.record("tdGetModel");
        let model = self.with_device(device_id, |d| d.model.clone()).unwrap_or_default();
        self.ledger.issue(&model)
    }

    fn set_model(&self, device_id: i32, model: &str) -> bool {
        self.record("tdSetModel");
        self.with_device(device_id, |d| d.model = model.to_string()).is_some()
    }

    fn device_parameter(&self, device_id: i32, name: &str, default: &str) -> Option<NativeString> {
        self.record("tdGetDeviceParameter");
        let value = self
            .with_device(device_id, |d| d.parameters.get(name).cloned())
            .flatten()
            .unwrap_or_else(|| default.to_string());
        self.ledger.issue(&value)
    }

    fn set_device_parameter(&self, device_id: i32, name: &str, value: &str) -> bool {
        self.record("tdSetDeviceParameter");
        self.with_device(device_id, |d| {
            d.parameters.insert(name.to_string(), value.to_string());
        })
        .is_some()
    }

    fn add_device(&self) -> i32 {
        self.record("tdAddDevice");
        let mut state = self.state.lock();
        let id = state.next_device_id;
        state.next_device_id += 1;
        state.devices.push(MemDevice::new(id));
        id
    }

    fn remove_device(&self, device_id: i32) -> bool {
        self.record("tdRemoveDevice");
        let mut state = self.state.lock();
        let before = state.devices.len();
        state.devices.retain(|d| d.id != device_id);
        state.devices.len() != before
    }

    fn register_device_event(&self, sink: Arc<dyn EventSink>) -> i32 {
        self.register("tdRegisterDeviceEvent", SinkClass::Device, sink)
    }

    fn register_sensor_event(&self, sink: Arc<dyn EventSink>) -> i32 {
        self.register("tdRegisterSensorEvent", SinkClass::Sensor, sink)
    }

    fn register_raw_device_event(&self, sink: Arc<dyn EventSink>) -> i32 {
        self.register("tdRegisterRawDeviceEvent", SinkClass::Raw, sink)
    }

    fn unregister_callback(&self, callback_id: i32) -> i32 {
        self.record("tdUnregisterCallback");
        match self.state.lock().sinks.remove(&callback_id) {
            Some(_) => codes::SUCCESS,
            None => codes::ERROR_NOT_FOUND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::take_string;

    #[test]
    fn test_device_commands() {
        let native = InMemoryNative::new();
        let id = native.seed_device(
            "Lamp",
            "arctech",
            "selflearning-dimmer",
            methods::TURNON | methods::TURNOFF | methods::DIM,
            device_types::DEVICE,
        );

        assert_eq!(native.turn_on(id), codes::SUCCESS);
        assert_eq!(
            native.last_sent_command(id, methods::SUPPORTED_METHODS),
            methods::TURNON
        );
        assert_eq!(native.bell(id), codes::ERROR_METHOD_NOT_SUPPORTED);
        assert_eq!(native.turn_on(999), codes::ERROR_DEVICE_NOT_FOUND);

        assert_eq!(native.dim(id, 42), codes::SUCCESS);
        assert_eq!(take_string(native.last_sent_value(id)), "42");
    }

    #[test]
    fn test_strings_are_tracked() {
        let native = InMemoryNative::new();
        let id = native.seed_device("Lamp", "arctech", "codeswitch", methods::TURNON, 1);

        let name = native.name(id);
        assert_eq!(native.ledger().outstanding(), 1);
        assert_eq!(take_string(name), "Lamp");
        assert_eq!(native.ledger().issued(), 1);
        assert_eq!(native.ledger().released(), 1);
        assert_eq!(native.ledger().outstanding(), 0);
        assert_eq!(native.ledger().invalid_releases(), 0);
    }

    #[test]
    fn test_device_parameter_default() {
        let native = InMemoryNative::new();
        let id = native.add_device();

        assert_eq!(take_string(native.device_parameter(id, "house", "A")), "A");
        assert!(native.set_device_parameter(id, "house", "B"));
        assert_eq!(take_string(native.device_parameter(id, "house", "A")), "B");
    }

    #[test]
    fn test_index_to_id_mapping() {
        let native = InMemoryNative::new();
        let a = native.add_device();
        let b = native.add_device();
        assert!(native.remove_device(a));

        assert_eq!(native.number_of_devices(), 1);
        assert_eq!(native.device_id(0), b);
        assert_eq!(native.device_id(1), codes::ERROR_DEVICE_NOT_FOUND);
    }

    struct Recorder(Mutex<Vec<(String, String)>>);

    impl EventSink for Recorder {
        fn sensor_event(&self, event: RawSensorEvent<'_>) {
            let name = thread::current().name().unwrap_or_default().to_string();
            let value = event.value.to_string_lossy().into_owned();
            self.0.lock().push((name, value));
        }
    }

    #[test]
    fn test_events_raised_on_event_thread() {
        let native = InMemoryNative::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let id = native.register_sensor_event(recorder.clone());

        native.emit_sensor_event("x10", "temp", 7, 1, "21.5", 1000);
        assert_eq!(
            recorder.0.lock().as_slice(),
            &[(EVENT_THREAD_NAME.to_string(), "21.5".to_string())]
        );

        assert_eq!(native.unregister_callback(id), codes::SUCCESS);
        native.emit_sensor_event("x10", "temp", 7, 1, "22.0", 1001);
        assert_eq!(recorder.0.lock().len(), 1);
        assert_eq!(native.unregister_callback(id), codes::ERROR_NOT_FOUND);
    }
}
