//! Error types for VPU executable handling

use pva_driver::PvaError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for executable operations
pub type Result<T> = std::result::Result<T, VpuError>;

/// Errors that can occur while parsing or loading an executable
#[derive(Debug, Error)]
pub enum VpuError {
    /// Image is structurally broken
    #[error("Invalid executable image: {reason}")]
    InvalidFormat {
        /// What is wrong
        reason: String,
    },

    /// Image is well formed but not usable on this chip
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What is wrong
        reason: String,
    },

    /// File not found or cannot be read
    #[error("Executable not found: {path}")]
    FileNotFound {
        /// Path that was attempted
        path: PathBuf,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Device memory or resource table error
    #[error(transparent)]
    Driver(#[from] PvaError),
}

impl VpuError {
    /// Create a format error
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}
