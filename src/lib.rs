//! # Telldus Bridge
//!
//! Non-blocking access to the blocking telldus-core API from a single-threaded,
//! event-driven host runtime.
//!
//! ## Architecture
//!
//! ```text
//! Host control thread (Bridge / Node.js)
//!     │  CallArgs ──► Operation ──► WorkDescriptor
//!     ▼
//! Worker pool (tokio blocking threads)
//!     │  telldus-core call, result slot filled
//!     ▼
//! Control channel ──► marshal ──► completion callback
//!
//! telldus-core event thread
//!     │  EventContext copies the event
//!     ▼
//! Event worker (device status lookup) ──► control channel ──► listener
//! ```
//!
//! Host callbacks only ever run on the control thread. Work descriptors and
//! event payloads are moved between threads, never shared.

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod events;
pub mod executor;
pub mod metrics;
pub mod native;
#[cfg(feature = "node")]
pub mod node;
pub mod operation;
pub mod value;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use control::{Bridge, CallbackResult, ControlMessage, ControlSender, Ticket};
pub use descriptor::{NativeResult, WorkDescriptor};
pub use device::{DeviceRecord, DeviceStatus};
pub use error::{BridgeError, CallbackError, ErrorCode, HostError, Result};
pub use events::{EventBridge, EventClass, EventPayload, ListenerHandle};
pub use executor::{marshal, AsyncExecutor, SyncExecutor};
pub use metrics::{BridgeMetrics, BridgeStats};
pub use native::{InMemoryNative, NativeLibrary, NativeString};
pub use operation::{CallArgs, Operation, ResultKind};
pub use value::{HostObject, HostValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a `tracing` subscriber.
///
/// `RUST_LOG` wins over `filter` when set. Returns false if a subscriber was
/// already installed.
pub fn init_logging(filter: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
