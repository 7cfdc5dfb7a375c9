//! Error types for the zone manager.

use thiserror::Error;

/// Result type alias for zone manager operations.
pub type ZbdResult<T> = Result<T, ZbdError>;

/// Error variants for zone manager operations.
#[derive(Debug, Error)]
pub enum ZbdError {
    /// Wraps standard I/O errors reported by the backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device has no capacity for the requested operation.
    #[error("no space: {reason}")]
    NoSpace {
        /// Description of what ran out.
        reason: String,
    },

    /// The backing device cannot be driven by this manager.
    #[error("not supported: {reason}")]
    NotSupported {
        /// Description of the unsupported condition.
        reason: String,
    },

    /// A caller-supplied argument violated a precondition.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the violated precondition.
        reason: String,
    },

    /// An internal invariant was violated.
    #[error("corruption: {reason}")]
    Corruption {
        /// Description of the violated invariant.
        reason: String,
    },
}

impl ZbdError {
    /// Builds a `NoSpace` error.
    pub fn no_space(reason: impl Into<String>) -> Self {
        ZbdError::NoSpace {
            reason: reason.into(),
        }
    }

    /// Builds a `NotSupported` error.
    pub fn not_supported(reason: impl Into<String>) -> Self {
        ZbdError::NotSupported {
            reason: reason.into(),
        }
    }

    /// Builds an `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        ZbdError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Builds a `Corruption` error.
    pub fn corruption(reason: impl Into<String>) -> Self {
        ZbdError::Corruption {
            reason: reason.into(),
        }
    }
}

// The deferred-error latch stores an error and hands copies to every
// subsequent allocation, so the type must be clonable. `std::io::Error` is
// not `Clone`; clone it by kind and message.
impl Clone for ZbdError {
    fn clone(&self) -> Self {
        match self {
            ZbdError::Io(e) => {
                ZbdError::Io(std::io::Error::new(e.kind(), e.to_string()))
            }
            ZbdError::NoSpace { reason } => ZbdError::NoSpace {
                reason: reason.clone(),
            },
            ZbdError::NotSupported { reason } => ZbdError::NotSupported {
                reason: reason.clone(),
            },
            ZbdError::InvalidArgument { reason } => ZbdError::InvalidArgument {
                reason: reason.clone(),
            },
            ZbdError::Corruption { reason } => ZbdError::Corruption {
                reason: reason.clone(),
            },
        }
    }
}
