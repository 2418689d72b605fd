//! Error types for traffic control operations.

use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while modelling, persisting, or projecting
/// traffic control state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input: bad handle string, bad bandwidth, empty device
    /// name, CIDR parse failure, priority out of range, and similar.
    #[error("{0}")]
    Validation(String),

    /// An operation would break a domain invariant (duplicate handle,
    /// missing parent, ceil below rate, ...).
    #[error("{0}")]
    Invariant(String),

    /// A delete or query addressed an entity that does not exist. The
    /// message always carries the full locator.
    #[error("{0}")]
    NotFound(String),

    /// Event store version mismatch. Recoverable: reload the aggregate
    /// and retry.
    #[error("concurrency conflict on {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The event stream that was contended.
        aggregate_id: String,
        /// Version the writer expected.
        expected: u64,
        /// Version actually found in the store.
        actual: u64,
    },

    /// The kernel rejected an rtnetlink operation.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// A netlink message or attribute was shorter than its header claims.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Invalid netlink message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Interface could not be resolved to an index.
    #[error("interface not found: {name}")]
    InterfaceNotFound {
        /// The interface name that was not found.
        name: String,
    },

    /// Caller-requested cancellation observed at an event boundary.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error from socket or store operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Event payload (de)serialization error.
    #[error("event serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persistent store failure.
    #[cfg(feature = "sqlite")]
    #[error("event store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl Error {
    /// Create a kernel error from a (negative) errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Add operation context to a kernel error. Other errors are
    /// returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Check whether this is a "not found" condition (domain-level or
    /// kernel ENOENT/ENODEV).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::InterfaceNotFound { .. } => true,
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                matches!(*errno, 2 | 19) // ENOENT, ENODEV
            }
            _ => false,
        }
    }

    /// Check whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Check whether the kernel reported "already exists" (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => *errno == 17,
            _ => false,
        }
    }

    /// Check whether the kernel denied permission (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                matches!(*errno, 1 | 13)
            }
            _ => false,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
