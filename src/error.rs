//! Error types for the bridge.
//!
//! This module defines error codes, the host-facing error record, and the
//! main error type used throughout the bridge. Failures reported by the
//! native library itself are not errors here: they travel as the library's
//! own sentinel result codes (see [`crate::native::codes`]).

use serde::{Deserialize, Serialize};

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Host passed a value of the wrong kind or out of range
    InvalidArgument,
    /// Opcode is not in the operation table
    UnknownOpcode,
    /// Result slot does not match the operation's declared kind (bug)
    ResultKindMismatch,
    /// The native call aborted on its worker
    NativeCallFailed,
    /// The bridge has been shut down
    Shutdown,
    /// A channel between threads closed unexpectedly
    ChannelClosed,
    /// Listener handle is not registered
    ListenerNotFound,
    /// Invalid configuration
    InvalidConfig,
    /// Internal bridge error (bug)
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            ErrorCode::UnknownOpcode => write!(f, "UNKNOWN_OPCODE"),
            ErrorCode::ResultKindMismatch => write!(f, "RESULT_KIND_MISMATCH"),
            ErrorCode::NativeCallFailed => write!(f, "NATIVE_CALL_FAILED"),
            ErrorCode::Shutdown => write!(f, "SHUTDOWN"),
            ErrorCode::ChannelClosed => write!(f, "CHANNEL_CLOSED"),
            ErrorCode::ListenerNotFound => write!(f, "LISTENER_NOT_FOUND"),
            ErrorCode::InvalidConfig => write!(f, "INVALID_CONFIG"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// Error record handed to the host runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostError {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,
}

impl HostError {
    /// Create a new host error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for HostError {}

/// Error raised by a host callback while the bridge re-enters host code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener {listener} failed: {message}")]
pub struct CallbackError {
    /// Listener handle or completion ticket the callback belonged to
    pub listener: String,
    /// What the callback raised
    pub message: String,
}

impl CallbackError {
    /// Create a new callback error
    pub fn new(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            message: message.into(),
        }
    }
}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Host input has the wrong kind, count or range
    #[error("Invalid argument at position {position}: expected {expected}, got {found}")]
    InvalidArgument {
        /// Zero-based argument position
        position: usize,
        /// What was expected
        expected: &'static str,
        /// What was received
        found: String,
    },

    /// Opcode not in the operation table
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(i64),

    /// Result slot does not match the declared result kind
    #[error("Result kind mismatch for opcode {opcode}: declared {declared}, found {found}")]
    ResultKindMismatch {
        /// Opcode of the descriptor
        opcode: i32,
        /// Kind declared by the operation table
        declared: &'static str,
        /// Kind found in the result slot
        found: &'static str,
    },

    /// Descriptor was marshaled before it was executed
    #[error("Descriptor for opcode {0} has not been executed")]
    NotExecuted(i32),

    /// Listener handle unknown
    #[error("Listener not found: {0}")]
    ListenerNotFound(u64),

    /// The native call panicked or was cancelled on its worker
    #[error("Native call for opcode {opcode} failed: {message}")]
    NativeCallFailed {
        /// Opcode of the descriptor
        opcode: i32,
        /// Why the worker gave up
        message: String,
    },

    /// Bridge or worker pool has been shut down
    #[error("Shut down: {0}")]
    Shutdown(String),

    /// Cross-thread channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Build an invalid-argument error
    pub fn invalid_argument(
        position: usize,
        expected: &'static str,
        found: impl Into<String>,
    ) -> Self {
        BridgeError::InvalidArgument {
            position,
            expected,
            found: found.into(),
        }
    }

    /// Error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            BridgeError::UnknownOpcode(_) => ErrorCode::UnknownOpcode,
            BridgeError::ResultKindMismatch { .. } => ErrorCode::ResultKindMismatch,
            BridgeError::NotExecuted(_) => ErrorCode::InternalError,
            BridgeError::ListenerNotFound(_) => ErrorCode::ListenerNotFound,
            BridgeError::NativeCallFailed { .. } => ErrorCode::NativeCallFailed,
            BridgeError::Shutdown(_) => ErrorCode::Shutdown,
            BridgeError::ChannelClosed(_) => ErrorCode::ChannelClosed,
            BridgeError::Config(_) => ErrorCode::InvalidConfig,
            BridgeError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Convert to a HostError for returning to the host runtime
    pub fn to_host_error(&self) -> HostError {
        HostError::new(self.code(), self.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
