//! Bounded pool of blocking workers.
//!
//! Native calls block on serial and radio I/O, so they run on tokio's
//! blocking threads. A semaphore caps how many run at once; everything past
//! the cap waits for a permit in submission order.

use super::execute;
use crate::descriptor::WorkDescriptor;
use crate::error::{BridgeError, Result};
use crate::metrics::BridgeMetrics;
use crate::native::NativeLibrary;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// Runs descriptors off the control thread
pub struct AsyncExecutor {
    native: Arc<dyn NativeLibrary>,
    runtime: Handle,
    permits: Arc<Semaphore>,
    workers: usize,
    in_flight: Arc<AtomicUsize>,
    shutdown: AtomicBool,
    metrics: Arc<BridgeMetrics>,
}

impl AsyncExecutor {
    /// Create a pool running at most `workers` native calls at once
    pub fn new(
        native: Arc<dyn NativeLibrary>,
        runtime: Handle,
        workers: usize,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let workers = workers.max(1);
        info!(workers, "Creating worker pool");

        Self {
            native,
            runtime,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown: AtomicBool::new(false),
            metrics,
        }
    }

    /// Queue a descriptor; `on_complete` receives it filled, on a worker thread.
    ///
    /// Returns immediately. If the native call panics the descriptor is lost
    /// and `on_complete` gets [`BridgeError::NativeCallFailed`] instead. Work
    /// still queued when the pool shuts down is dropped without calling
    /// `on_complete`.
    #[instrument(skip(self, descriptor, on_complete), fields(opcode = descriptor.opcode()))]
    pub fn submit<F>(&self, mut descriptor: WorkDescriptor, on_complete: F) -> Result<()>
    where
        F: FnOnce(Result<WorkDescriptor>) + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(BridgeError::Shutdown("Worker pool is shut down".into()));
        }

        let opcode = descriptor.opcode();
        let native = Arc::clone(&self.native);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);

        in_flight.fetch_add(1, Ordering::AcqRel);
        self.metrics.record_submitted();
        debug!("Queued work");

        self.runtime.spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(opcode, "Worker pool closed before dispatch, dropping work");
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };

            let worker = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                execute(native.as_ref(), &mut descriptor, &metrics);
                descriptor
            });

            let finished = worker.await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
            match finished {
                Ok(descriptor) => {
                    debug!(opcode, "Work complete");
                    on_complete(Ok(descriptor));
                }
                Err(e) => {
                    error!(opcode, "Native call did not finish: {}", e);
                    on_complete(Err(BridgeError::NativeCallFailed {
                        opcode,
                        message: e.to_string(),
                    }));
                }
            }
        });

        Ok(())
    }

    /// Run a descriptor on the pool and wait for it
    pub async fn run(&self, descriptor: WorkDescriptor) -> Result<WorkDescriptor> {
        let (tx, rx) = oneshot::channel();
        self.submit(descriptor, move |done| {
            let _ = tx.send(done);
        })?;
        rx.await
            .map_err(|_| BridgeError::ChannelClosed("Worker dropped the descriptor".into()))?
    }

    /// Maximum concurrent native calls
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Descriptors submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether the pool has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work; queued work is dropped, running calls finish
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(in_flight = self.in_flight(), "Shutting down worker pool");
        self.permits.close();
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::marshal;
    use crate::native::{InMemoryNative, NativeLibrary};
    use crate::operation::Operation;
    use crate::value::HostValue;

    fn pool(workers: usize) -> (Arc<InMemoryNative>, AsyncExecutor) {
        let native = Arc::new(InMemoryNative::new());
        let executor = AsyncExecutor::new(
            native.clone(),
            Handle::current(),
            workers,
            Arc::new(BridgeMetrics::new()),
        );
        (native, executor)
    }

    #[tokio::test]
    async fn test_run_off_caller_thread() {
        let (native, executor) = pool(2);
        let id = native.add_device();
        native.set_name(id, "Garage");

        let done = executor
            .run(WorkDescriptor::new(Operation::GetName { device_id: id }))
            .await
            .unwrap();
        assert!(done.is_complete());
        assert_eq!(marshal(done).unwrap(), HostValue::from("Garage"));

        let calls = native.calls_to("tdGetName");
        assert_eq!(calls.len(), 1);
        assert_ne!(calls[0].thread, std::thread::current().id());
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_single_worker_completes_everything() {
        let (native, executor) = pool(1);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..5 {
            let tx = tx.clone();
            executor
                    .submit(WorkDescriptor::new(Operation::AddDevice), move |done| {
                    let _ = tx.send(done.unwrap());
                })
                .unwrap();
        }
        drop(tx);

        let mut ids = Vec::new();
        while let Some(done) = rx.recv().await {
            ids.push(marshal(done).unwrap().as_i64().unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(native.calls_to("tdAddDevice").len(), 5);
    }

    #[tokio::test]
    async fn test_descriptor_hands_off_between_threads() {
        let (native, executor) = pool(2);
        let id = native.add_device();
        let submitter = std::thread::current().id();
        let (tx, rx) = oneshot::channel();

        executor
            .submit(WorkDescriptor::new(Operation::TurnOn { device_id: id }), move |done| {
                let _ = tx.send((done, std::thread::current().id()));
            })
            .unwrap();

        let (done, returned_on) = rx.await.unwrap();
        let done = done.unwrap();
        assert_eq!(done.operation(), &Operation::TurnOn { device_id: id });
        assert!(done.is_complete());

        // Executed on a blocking worker, handed back to the runtime thread
        let worker = native.calls_to("tdTurnOn")[0].thread;
        assert_ne!(worker, submitter);
        assert_ne!(returned_on, worker);
        assert_eq!(returned_on, submitter);
    }

    #[tokio::test]
    async fn test_panicking_call_still_completes() {
        let (native, executor) = pool(1);
        let id = native.add_device();
        native.panic_on("tdTurnOn");

        let err = executor
            .run(WorkDescriptor::new(Operation::TurnOn { device_id: id }))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NativeCallFailed { opcode: 0, .. }));
        assert_eq!(executor.in_flight(), 0);

        // The permit is returned, so the pool keeps working
        let done = executor
            .run(WorkDescriptor::new(Operation::GetName { device_id: id }))
            .await
            .unwrap();
        assert!(done.is_complete());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let (_native, executor) = pool(1);
        executor.shutdown();
        assert!(executor.is_shutdown());

        let err = executor
            .submit(WorkDescriptor::new(Operation::Init), |_| {})
            .unwrap_err();
        assert!(matches!(err, BridgeError::Shutdown(_)));
    }

    #[tokio::test]
    async fn test_zero_workers_clamped() {
        let (_native, executor) = pool(0);
        assert_eq!(executor.workers(), 1);
    }
}
