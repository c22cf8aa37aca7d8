//! N-API bindings for Node.js.
//!
//! Node's main thread is the control thread. Completions and events reach it
//! through thread-safe functions, so marshaling and every JS callback run
//! there; native calls and device status lookups run on the bridge's own
//! tokio runtime.

use crate::config::BridgeConfig;
use crate::descriptor::WorkDescriptor;
use crate::error::BridgeError;
use crate::events::{EventBridge, EventClass, EventPayload, ListenerHandle, ListenerSink};
use crate::executor::{marshal, AsyncExecutor, SyncExecutor};
use crate::metrics::BridgeMetrics;
use crate::native::NativeLibrary;
use crate::operation::{CallArgs, Operation};
use crate::value::HostValue;
use napi::bindgen_prelude::*;
use napi::threadsafe_function::{
    ErrorStrategy, ThreadSafeCallContext, ThreadsafeFunction, ThreadsafeFunctionCallMode,
};
use napi::{Env, JsFunction, JsUnknown};
use napi_derive::napi;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{debug, info};

/// Returned by `AsyncCaller` once the call is queued
pub const ASYNC_ACK: &str = "Running asynchronous process initializer";

impl From<BridgeError> for napi::Error {
    fn from(err: BridgeError) -> Self {
        let status = match err {
            BridgeError::InvalidArgument { .. } | BridgeError::UnknownOpcode(_) => {
                Status::InvalidArg
            }
            _ => Status::GenericFailure,
        };
        napi::Error::new(status, err.to_host_error().to_string())
    }
}

/// JavaScript-friendly configuration
#[napi(object)]
pub struct JsBridgeConfig {
    /// Maximum concurrent native calls
    pub worker_threads: Option<u32>,
    /// Maximum concurrent device status lookups for events
    pub event_workers: Option<u32>,
    /// `tracing` filter used by `init`
    pub log_filter: Option<String>,
    /// Log the bridge at debug level
    pub debug: Option<bool>,
}

impl From<JsBridgeConfig> for BridgeConfig {
    fn from(js: JsBridgeConfig) -> Self {
        let mut config = BridgeConfig::default();
        if let Some(threads) = js.worker_threads {
            config = config.with_worker_threads(threads as usize);
        }
        if let Some(workers) = js.event_workers {
            config = config.with_event_workers(workers as usize);
        }
        if let Some(filter) = js.log_filter {
            config = config.with_log_filter(filter);
        }
        if let Some(debug) = js.debug {
            config = config.with_debug(debug);
        }
        config
    }
}

struct NodeBridge {
    // Owns the threads the executors spawn onto
    _runtime: tokio::runtime::Runtime,
    sync: SyncExecutor,
    pool: AsyncExecutor,
    events: EventBridge,
    metrics: Arc<BridgeMetrics>,
}

impl NodeBridge {
    fn new(config: BridgeConfig) -> crate::Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_threads + config.event_workers)
            .thread_name("telldus-bridge")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let native = native_library();
        let metrics = Arc::new(BridgeMetrics::new());
        info!(worker_threads = config.worker_threads, "Starting Node.js bridge");

        Ok(Self {
            sync: SyncExecutor::new(Arc::clone(&native), Arc::clone(&metrics)),
            pool: AsyncExecutor::new(
                Arc::clone(&native),
                handle.clone(),
                config.worker_threads,
                Arc::clone(&metrics),
            ),
            events: EventBridge::new(native, handle, config.event_workers, Arc::clone(&metrics)),
            metrics,
            _runtime: runtime,
        })
    }
}

#[cfg(feature = "telldus-core")]
fn native_library() -> Arc<dyn NativeLibrary> {
    Arc::new(crate::native::TelldusCore::new())
}

#[cfg(not(feature = "telldus-core"))]
fn native_library() -> Arc<dyn NativeLibrary> {
    Arc::new(crate::native::InMemoryNative::new())
}

static BRIDGE: OnceCell<NodeBridge> = OnceCell::new();

fn bridge() -> Result<&'static NodeBridge> {
    BRIDGE
        .get_or_try_init(|| NodeBridge::new(BridgeConfig::default()))
        .map_err(napi::Error::from)
}

fn call_args(
    opcode: f64,
    device_ref: f64,
    numeric_arg: f64,
    string_arg_1: String,
    string_arg_2: String,
) -> crate::Result<CallArgs> {
    CallArgs::from_host(&[
        HostValue::Number(opcode),
        HostValue::Number(device_ref),
        HostValue::Number(numeric_arg),
        HostValue::String(string_arg_1),
        HostValue::String(string_arg_2),
    ])
}

/// Forwards finished events to a JS listener on the main thread
struct JsListener {
    callback: ThreadsafeFunction<EventPayload, ErrorStrategy::Fatal>,
}

impl ListenerSink for JsListener {
    fn deliver(&self, handle: ListenerHandle, payload: EventPayload) {
        debug!(%handle, "Queueing event for JS");
        self.callback
            .call(payload, ThreadsafeFunctionCallMode::NonBlocking);
    }
}

fn add_listener(class: EventClass, callback: JsFunction) -> Result<i64> {
    let bridge = bridge()?;
    let metrics = Arc::clone(&bridge.metrics);
    let callback: ThreadsafeFunction<EventPayload, ErrorStrategy::Fatal> = callback
        .create_threadsafe_function(0, move |ctx: ThreadSafeCallContext<EventPayload>| {
            metrics.record_event_delivered();
            ctx.value
                .to_host_args()
                .iter()
                .map(|arg| ctx.env.to_js_value(arg))
                .collect::<Result<Vec<JsUnknown>>>()
        })?;

    let handle = bridge
        .events
        .register(class, Arc::new(JsListener { callback }));
    Ok(handle.as_u64() as i64)
}

/// Initialize logging and start the bridge with `config`
#[napi]
pub fn init(config: Option<JsBridgeConfig>) {
    let config = config.map(BridgeConfig::from).unwrap_or_default();
    crate::init_logging(&config.log_directives());
    // First caller decides the configuration
    if let Err(e) = BRIDGE.get_or_try_init(|| NodeBridge::new(config)) {
        tracing::error!("Failed to start bridge: {}", e);
    }
}

/// Queue a call; `callback(value, opcode)` runs when it completes
#[napi(js_name = "AsyncCaller")]
pub fn async_caller(
    opcode: f64,
    device_ref: f64,
    numeric_arg: f64,
    string_arg_1: String,
    string_arg_2: String,
    callback: JsFunction,
) -> Result<String> {
    let bridge = bridge()?;
    let operation = Operation::decode(call_args(
        opcode,
        device_ref,
        numeric_arg,
        string_arg_1,
        string_arg_2,
    )?)?;

    let opcode = operation.opcode();
    let metrics = Arc::clone(&bridge.metrics);
    let completion: ThreadsafeFunction<crate::Result<WorkDescriptor>, ErrorStrategy::Fatal> =
        callback.create_threadsafe_function(
            0,
            move |ctx: ThreadSafeCallContext<crate::Result<WorkDescriptor>>| {
                metrics.record_completed();
                // A lost call still completes, with an Error in place of the value
                let value = match ctx.value.and_then(marshal) {
                    Ok(value) => ctx.env.to_js_value(&value)?,
                    Err(e) => ctx.env.create_error(napi::Error::from(e))?.into_unknown(),
                };
                Ok(vec![value, ctx.env.create_int32(opcode)?.into_unknown()])
            },
        )?;

    bridge
        .pool
        .submit(WorkDescriptor::new(operation), move |finished| {
            completion.call(finished, ThreadsafeFunctionCallMode::NonBlocking);
        })?;

    Ok(ASYNC_ACK.to_string())
}

/// Run a call on the main thread and return its value
#[napi(js_name = "SyncCaller")]
pub fn sync_caller(
    env: Env,
    opcode: f64,
    device_ref: f64,
    numeric_arg: f64,
    string_arg_1: String,
    string_arg_2: String,
) -> Result<JsUnknown> {
    let bridge = bridge()?;
    let value = bridge.sync.call(call_args(
        opcode,
        device_ref,
        numeric_arg,
        string_arg_1,
        string_arg_2,
    )?)?;
    env.to_js_value(&value)
}

/// `callback(deviceId, {name, level?})` on every device state change
#[napi(js_name = "addDeviceEventListener")]
pub fn add_device_event_listener(callback: JsFunction) -> Result<i64> {
    add_listener(EventClass::Device, callback)
}

/// `callback(sensorId, model, protocol, dataType, value, timestamp)` on every reading
#[napi(js_name = "addSensorEventListener")]
pub fn add_sensor_event_listener(callback: JsFunction) -> Result<i64> {
    add_listener(EventClass::Sensor, callback)
}

/// `callback(controllerId, data)` on every raw frame
#[napi(js_name = "addRawDeviceEventListener")]
pub fn add_raw_device_event_listener(callback: JsFunction) -> Result<i64> {
    add_listener(EventClass::Raw, callback)
}

/// Stop a listener returned by one of the `add*EventListener` functions
#[napi(js_name = "removeEventListener")]
pub fn remove_event_listener(handle: i64) -> Result<()> {
    let handle = u64::try_from(handle)
        .map_err(|_| napi::Error::new(Status::InvalidArg, format!("Invalid listener {}", handle)))?;
    bridge()?
        .events
        .unregister(ListenerHandle::from_raw(handle))?;
    Ok(())
}

/// Get Prometheus metrics
#[napi(js_name = "getPrometheusMetrics")]
pub fn get_prometheus_metrics() -> Result<String> {
    Ok(bridge()?.metrics.to_prometheus())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_conversion() {
        let js_config = JsBridgeConfig {
            worker_threads: Some(8),
            event_workers: None,
            log_filter: Some("telldus_bridge=debug".to_string()),
            debug: Some(true),
        };

        let config: BridgeConfig = js_config.into();
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.event_workers, crate::config::DEFAULT_EVENT_WORKERS);
        assert_eq!(config.log_filter, "telldus_bridge=debug");
        assert!(config.debug);
    }

    #[test]
    fn test_call_args_validation() {
        assert!(call_args(6.0, 1.0, 0.0, String::new(), String::new()).is_ok());
        assert!(call_args(6.5, 1.0, 0.0, String::new(), String::new()).is_err());
    }

    #[test]
    fn test_error_status() {
        let err: napi::Error = BridgeError::UnknownOpcode(99).into();
        assert_eq!(err.status, Status::InvalidArg);
        assert!(err.reason.contains("UNKNOWN_OPCODE"));
    }
}
