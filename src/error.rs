//! Error types for port management operations.
//!
//! This module defines errors for:
//! - Local proxy lifecycle (binding the global port, duplicate proxies)
//! - Global port allocation
//! - Manager handle operations after the reconciliation loop has exited

use thiserror::Error;

/// Errors from port management operations.
#[derive(Debug, Error)]
pub enum PortsError {
    /// Failed to listen on a global port.
    #[error("Failed to listen on global port {port}: {source}")]
    ListenFailed {
        /// The port we tried to listen on.
        port: u16,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No free port left in the global allocation range.
    #[error("Global port range {bottom}-{top} exhausted")]
    GlobalPortsExhausted {
        /// Top of the allocation range (inclusive).
        top: u16,
        /// Bottom of the allocation range (inclusive).
        bottom: u16,
    },

    /// The manager's reconciliation loop is no longer running.
    #[error("Port manager is not running")]
    ManagerClosed,

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for port management operations.
pub type PortsResult<T> = Result<T, PortsError>;
