//! The control thread.
//!
//! Host callbacks run only here. Workers and the event bridge never call
//! them; they send [`ControlMessage`]s over an unbounded channel and the
//! thread that owns the [`Bridge`] pumps that channel with
//! [`Bridge::dispatch_pending`] or [`Bridge::dispatch_next`]. Callbacks are
//! therefore free to be `!Send`.

use crate::config::BridgeConfig;
use crate::descriptor::WorkDescriptor;
use crate::error::{BridgeError, CallbackError, Result};
use crate::events::{EventBridge, EventClass, EventPayload, ListenerHandle, ListenerSink};
use crate::executor::{marshal, AsyncExecutor, SyncExecutor};
use crate::metrics::{BridgeMetrics, BridgeStats};
use crate::native::NativeLibrary;
use crate::operation::{CallArgs, Operation};
use crate::value::HostValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// What a host callback returns; an `Err` is the callback raising
pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Completion = Box<dyn FnOnce(Result<HostValue>, i32) -> CallbackResult>;
type Listener = Box<dyn FnMut(&[HostValue]) -> CallbackResult>;
type UnhandledHook = Box<dyn FnMut(CallbackError)>;

/// Identifies one asynchronous call until its completion runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    /// Numeric form of the ticket
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Work handed back to the control thread
#[derive(Debug)]
pub enum ControlMessage {
    /// A worker finished a descriptor
    Completed {
        /// Call the descriptor belongs to
        ticket: Ticket,
        /// The filled descriptor
        descriptor: WorkDescriptor,
    },
    /// A worker lost the descriptor
    Failed {
        /// Call the descriptor belonged to
        ticket: Ticket,
        /// What went wrong
        error: BridgeError,
    },
    /// An event is ready for a listener
    Event {
        /// Listener the event is for
        handle: ListenerHandle,
        /// The finished payload
        payload: EventPayload,
    },
}

/// Sending half of the control channel
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlSender {
    /// Hand a finished descriptor back; false if the control thread is gone
    pub fn complete(&self, ticket: Ticket, descriptor: WorkDescriptor) -> bool {
        self.tx
            .send(ControlMessage::Completed { ticket, descriptor })
            .is_ok()
    }

    /// Report that a call will never produce a descriptor
    pub fn fail(&self, ticket: Ticket, error: BridgeError) -> bool {
        self.tx.send(ControlMessage::Failed { ticket, error }).is_ok()
    }
}

impl ListenerSink for ControlSender {
    fn deliver(&self, handle: ListenerHandle, payload: EventPayload) {
        if self.tx.send(ControlMessage::Event { handle, payload }).is_err() {
            debug!(%handle, "Control thread gone, dropping event");
        }
    }
}

/// The bridge as seen from the control thread
pub struct Bridge {
    config: BridgeConfig,
    metrics: Arc<BridgeMetrics>,
    sync: SyncExecutor,
    pool: AsyncExecutor,
    events: EventBridge,
    sender: ControlSender,
    receiver: mpsc::UnboundedReceiver<ControlMessage>,
    completions: HashMap<Ticket, (i32, Completion)>,
    listeners: HashMap<ListenerHandle, Listener>,
    next_ticket: u64,
    on_unhandled: UnhandledHook,
    shut_down: bool,
}

impl Bridge {
    /// Create a bridge over `native`, running blocking work on `runtime`
    pub fn new(
        native: Arc<dyn NativeLibrary>,
        config: BridgeConfig,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            worker_threads = config.worker_threads,
            event_workers = config.event_workers,
            "Creating bridge"
        );

        let metrics = Arc::new(BridgeMetrics::new());
        let (tx, receiver) = mpsc::unbounded_channel();

        Ok(Self {
            sync: SyncExecutor::new(Arc::clone(&native), Arc::clone(&metrics)),
            pool: AsyncExecutor::new(
                Arc::clone(&native),
                runtime.clone(),
                config.worker_threads,
                Arc::clone(&metrics),
            ),
            events: EventBridge::new(native, runtime, config.event_workers, Arc::clone(&metrics)),
            sender: ControlSender { tx },
            receiver,
            completions: HashMap::new(),
            listeners: HashMap::new(),
            next_ticket: 1,
            on_unhandled: Box::new(|err| error!("Unhandled callback error: {}", err)),
            shut_down: false,
            metrics,
            config,
        })
    }

    /// Replace the hook that receives errors raised by host callbacks
    pub fn on_unhandled_error(&mut self, hook: impl FnMut(CallbackError) + 'static) {
        self.on_unhandled = Box::new(hook);
    }

    /// Run one call on this thread and return its value
    #[instrument(skip(self, args), fields(opcode = args.opcode))]
    pub fn call_sync(&self, args: CallArgs) -> Result<HostValue> {
        self.ensure_running()?;
        self.sync.call(args)
    }

    /// [`Bridge::call_sync`] with unvalidated host values
    pub fn call_sync_values(&self, args: &[HostValue]) -> Result<HostValue> {
        self.call_sync(CallArgs::from_host(args)?)
    }

    /// Queue a call; `on_complete` later runs on this thread with
    /// `(result, opcode)`.
    ///
    /// Argument errors are returned here and nothing is queued.
    #[instrument(skip(self, args, on_complete), fields(opcode = args.opcode))]
    pub fn call_async<F>(&mut self, args: CallArgs, on_complete: F) -> Result<Ticket>
    where
        F: FnOnce(Result<HostValue>, i32) -> CallbackResult + 'static,
    {
        self.ensure_running()?;
        let operation = Operation::decode(args)?;
        let opcode = operation.opcode();

        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        let sender = self.sender.clone();
        self.pool.submit(WorkDescriptor::new(operation), move |finished| {
            let delivered = match finished {
                Ok(descriptor) => sender.complete(ticket, descriptor),
                Err(e) => sender.fail(ticket, e),
            };
            if !delivered {
                debug!(%ticket, "Control thread gone, dropping completion");
            }
        })?;
        self.completions.insert(ticket, (opcode, Box::new(on_complete)));

        debug!(%ticket, "Submitted");
        Ok(ticket)
    }

    /// [`Bridge::call_async`] with unvalidated host values
    pub fn call_async_values<F>(&mut self, args: &[HostValue], on_complete: F) -> Result<Ticket>
    where
        F: FnOnce(Result<HostValue>, i32) -> CallbackResult + 'static,
    {
        self.call_async(CallArgs::from_host(args)?, on_complete)
    }

    /// Listen for device state changes: `(device_id, {name, level?})`
    pub fn register_device_listener(
        &mut self,
        callback: impl FnMut(&[HostValue]) -> CallbackResult + 'static,
    ) -> Result<ListenerHandle> {
        self.register(EventClass::Device, Box::new(callback))
    }

    /// Listen for sensor readings:
    /// `(sensor_id, model, protocol, data_type, value, timestamp)`
    pub fn register_sensor_listener(
        &mut self,
        callback: impl FnMut(&[HostValue]) -> CallbackResult + 'static,
    ) -> Result<ListenerHandle> {
        self.register(EventClass::Sensor, Box::new(callback))
    }

    /// Listen for raw frames: `(controller_id, data)`
    pub fn register_raw_listener(
        &mut self,
        callback: impl FnMut(&[HostValue]) -> CallbackResult + 'static,
    ) -> Result<ListenerHandle> {
        self.register(EventClass::Raw, Box::new(callback))
    }

    fn register(&mut self, class: EventClass, callback: Listener) -> Result<ListenerHandle> {
        self.ensure_running()?;
        let handle = self.events.register(class, Arc::new(self.sender.clone()));
        self.listeners.insert(handle, callback);
        Ok(handle)
    }

    /// Stop a listener. No event raised after this returns reaches it.
    pub fn unregister(&mut self, handle: ListenerHandle) -> Result<()> {
        self.listeners.remove(&handle);
        self.events.unregister(handle)
    }

    /// Run every message already queued without waiting; returns how many ran
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.receiver.try_recv() {
            self.handle_message(message);
            handled += 1;
        }
        handled
    }

    /// Wait for the next message and run it
    pub async fn dispatch_next(&mut self) -> Result<()> {
        match self.receiver.recv().await {
            Some(message) => {
                self.handle_message(message);
                Ok(())
            }
            None => Err(BridgeError::ChannelClosed("Control channel closed".into())),
        }
    }

    /// Keep dispatching until every submitted call has completed
    pub async fn complete_pending_calls(&mut self) -> Result<()> {
        while !self.completions.is_empty() {
            self.dispatch_next().await?;
        }
        Ok(())
    }

    fn handle_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Completed { ticket, descriptor } => {
                let opcode = descriptor.opcode();
                let result = marshal(descriptor);
                let Some((_, completion)) = self.completions.remove(&ticket) else {
                    debug!(%ticket, "No completion registered, dropping result");
                    return;
                };
                self.metrics.record_completed();
                if let Err(e) = completion(result, opcode) {
                    self.report(CallbackError::new(ticket.to_string(), e.to_string()));
                }
            }
            ControlMessage::Failed { ticket, error } => {
                let Some((opcode, completion)) = self.completions.remove(&ticket) else {
                    debug!(%ticket, "No completion registered, dropping failure");
                    return;
                };
                warn!(%ticket, opcode, "Call failed: {}", error);
                self.metrics.record_completed();
                if let Err(e) = completion(Err(error), opcode) {
                    self.report(CallbackError::new(ticket.to_string(), e.to_string()));
                }
            }
            ControlMessage::Event { handle, payload } => {
                let Some(listener) = self.listeners.get_mut(&handle) else {
                    debug!(%handle, "Listener gone, dropping event");
                    self.metrics.record_event_dropped();
                    return;
                };
                self.metrics.record_event_delivered();
                let args = payload.to_host_args();
                if let Err(e) = listener(&args) {
                    self.report(CallbackError::new(handle.to_string(), e.to_string()));
                }
            }
        }
    }

    fn report(&mut self, err: CallbackError) {
        warn!(listener = %err.listener, "Host callback raised: {}", err.message);
        self.metrics.record_callback_failure();
        (self.on_unhandled)(err);
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(BridgeError::Shutdown("Bridge is shut down".into()));
        }
        Ok(())
    }

    /// Calls submitted whose completion has not run yet
    pub fn pending_calls(&self) -> usize {
        self.completions.len()
    }

    /// Live listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Active configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    /// Snapshot of the metrics
    pub fn stats(&self) -> BridgeStats {
        self.metrics.snapshot()
    }

    /// Stop the bridge.
    ///
    /// Listeners are unregistered and queued work is dropped. Completions
    /// still pending run once with a shut-down error.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!(pending = self.completions.len(), "Shutting down bridge");

        self.pool.shutdown();
        self.events.close();
        self.listeners.clear();

        let mut pending: Vec<_> = self.completions.drain().collect();
        pending.sort_unstable_by_key(|(ticket, _)| *ticket);
        for (ticket, (opcode, completion)) in pending {
            let err = BridgeError::Shutdown("Bridge shut down before the call completed".into());
            if let Err(e) = completion(Err(err), opcode) {
                self.report(CallbackError::new(ticket.to_string(), e.to_string()));
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{device_types, methods, InMemoryNative};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn bridge() -> (Arc<InMemoryNative>, Bridge) {
        let native = Arc::new(InMemoryNative::new());
        let bridge =
            Bridge::new(native.clone(), BridgeConfig::default(), Handle::current()).unwrap();
        (native, bridge)
    }

    #[tokio::test]
    async fn test_async_completion_on_control_thread() {
        let (native, mut bridge) = bridge();
        let id = native.seed_device(
            "Lamp",
            "arctech",
            "codeswitch",
            methods::TURNON,
            device_types::DEVICE,
        );
        let control = std::thread::current().id();
        let seen = Rc::new(RefCell::new(None));

        let sink = seen.clone();
        bridge
            .call_async(CallArgs::numeric(6, id, 0), move |result, opcode| {
                *sink.borrow_mut() = Some((result.unwrap(), opcode, std::thread::current().id()));
                Ok(())
            })
            .unwrap();
        assert_eq!(bridge.pending_calls(), 1);

        bridge.complete_pending_calls().await.unwrap();
        let (value, opcode, thread) = seen.borrow_mut().take().unwrap();
        assert_eq!(value, HostValue::from("Lamp"));
        assert_eq!(opcode, 6);
        assert_eq!(thread, control);

        let native_thread = native.calls_to("tdGetName")[0].thread;
        assert_ne!(native_thread, control);
        assert_eq!(native.ledger().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_argument_errors_are_synchronous() {
        let (native, mut bridge) = bridge();
        let err = bridge
            .call_async(CallArgs::numeric(42, 1, 0), |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownOpcode(42)));
        assert_eq!(bridge.pending_calls(), 0);
        assert!(native.calls().is_empty());

        let err = bridge
            .call_sync_values(&[HostValue::from(6), HostValue::from("1")])
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_failing_completion_goes_to_hook() {
        let (native, mut bridge) = bridge();
        let id = native.add_device();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        bridge.on_unhandled_error(move |err| sink.borrow_mut().push(err));

        let ticket = bridge
            .call_async(CallArgs::numeric(1, id, 0), |_, _| Err("completion exploded".into()))
            .unwrap();
        bridge.complete_pending_calls().await.unwrap();

        let errors = errors.borrow();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].listener, ticket.to_string());
        assert!(errors[0].message.contains("exploded"));
        assert_eq!(bridge.stats().callback_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_native_call_completes_with_error() {
        let (native, mut bridge) = bridge();
        let id = native.add_device();
        native.panic_on("tdGetName");
        let seen = Rc::new(RefCell::new(None));

        let sink = seen.clone();
        bridge
            .call_async(CallArgs::numeric(6, id, 0), move |result, opcode| {
                *sink.borrow_mut() = Some((result, opcode));
                Ok(())
            })
            .unwrap();
        bridge.complete_pending_calls().await.unwrap();

        let (result, opcode) = seen.borrow_mut().take().unwrap();
        assert!(matches!(result, Err(BridgeError::NativeCallFailed { opcode: 6, .. })));
        assert_eq!(opcode, 6);
        assert_eq!(bridge.pending_calls(), 0);
        assert_eq!(bridge.stats().calls_completed, 1);
    }

    #[tokio::test]
    async fn test_events_reach_listener_on_control_thread() {
        let (native, mut bridge) = bridge();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        bridge
            .register_raw_listener(move |args| {
                sink.borrow_mut().push(args.to_vec());
                Ok(())
            })
            .unwrap();

        native.emit_raw_event("class:command;protocol:arctech;", 2);
        bridge.dispatch_next().await.unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![vec![HostValue::from(2), HostValue::from("class:command;protocol:arctech;")]]
        );
    }

    #[tokio::test]
    async fn test_queued_event_dropped_after_unregister() {
        let (native, mut bridge) = bridge();
        let calls = Rc::new(RefCell::new(0));
        let sink = calls.clone();
        let handle = bridge
            .register_sensor_listener(move |_| {
                *sink.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();

        native.emit_sensor_event("x10", "temp", 7, 1, "21.5", 1000);
        bridge.unregister(handle).unwrap();
        assert_eq!(bridge.dispatch_pending(), 1);

        assert_eq!(*calls.borrow(), 0);
        assert_eq!(bridge.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_rejects_new_calls() {
        let (native, mut bridge) = bridge();
        let id = native.add_device();
        let outcome = Rc::new(RefCell::new(Vec::new()));
        for opcode in [6, 0] {
            let sink = outcome.clone();
            bridge
                .call_async(CallArgs::numeric(opcode, id, 0), move |result, opcode| {
                    let shut_down = matches!(result, Err(BridgeError::Shutdown(_)));
                    sink.borrow_mut().push((shut_down, opcode));
                    Ok(())
                })
                .unwrap();
        }

        bridge.shutdown();
        assert_eq!(*outcome.borrow(), vec![(true, 6), (true, 0)]);
        assert_eq!(bridge.pending_calls(), 0);
        assert!(matches!(
            bridge.call_sync(CallArgs::numeric(17, 0, 0)),
            Err(BridgeError::Shutdown(_))
        ));
        assert_eq!(native.registered_callbacks(), 0);
    }
}
