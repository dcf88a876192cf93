//! Error types for PVA driver operations

use thiserror::Error;

/// Result type alias for PVA operations
pub type Result<T> = std::result::Result<T, PvaError>;

/// Errors that can occur during PVA operations
#[derive(Debug, Error)]
pub enum PvaError {
    /// Caller passed a value that can never be valid
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Malformed input data (command stream, executable image)
    #[error("Invalid format: {reason}")]
    InvalidFormat {
        /// What was wrong
        reason: String,
    },

    /// A bounded pool or table is full
    #[error("Out of resources: {resource}")]
    OutOfResources {
        /// Which pool or table
        resource: String,
    },

    /// A ring is full; retry once firmware has consumed entries
    #[error("Resource busy: {resource}")]
    ResourceBusy {
        /// Which ring
        resource: String,
    },

    /// Unknown resource or context id
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Firmware did not respond in time
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Device is aborted or recovering; nothing firmware writes is trusted
    #[error("Firmware aborted")]
    FirmwareAborted,

    /// Host memory or IOVA space exhausted
    #[error("Out of memory: {reason}")]
    OutOfMemory {
        /// What could not be allocated
        reason: String,
    },

    /// A firmware-written field is out of range
    #[error("Firmware protocol violation: {reason}")]
    ProtocolViolation {
        /// Which field and value
        reason: String,
    },

    /// Operation not legal in the current device state
    #[error("Device in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// I/O error from the host OS
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl PvaError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid format error
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            reason: reason.into(),
        }
    }

    /// Create an out of resources error
    pub fn out_of_resources(resource: impl Into<String>) -> Self {
        Self::OutOfResources {
            resource: resource.into(),
        }
    }

    /// Create a resource busy error
    pub fn resource_busy(resource: impl Into<String>) -> Self {
        Self::ResourceBusy {
            resource: resource.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a timeout error
    #[allow(clippy::cast_possible_truncation)] // u64 milliseconds is ~584 million years
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create an out of memory error
    pub fn out_of_memory(reason: impl Into<String>) -> Self {
        Self::OutOfMemory {
            reason: reason.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Whether the caller may retry after releasing resources or waiting.
    ///
    /// Validation errors are the caller's bug and an aborted device stays
    /// aborted until it is reinitialised, so neither is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfResources { .. } | Self::ResourceBusy { .. } | Self::Timeout { .. }
        )
    }
}
