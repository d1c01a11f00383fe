//! Error types for worklet hosting.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use worklet_host::{Result, WorkletHost};
//!
//! async fn example(host: &WorkletHost) -> Result<()> {
//!     host.ipc().write(b"hello".to_vec()).await?;
//!     let reply = host.push(b"ping".to_vec()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Construction | [`Error::Construction`], [`Error::ResourceNotFound`], [`Error::Decode`] |
//! | Lifecycle | [`Error::InvalidState`], [`Error::Terminated`] |
//! | Channel | [`Error::ConcurrentAccess`], [`Error::ChannelClosed`], [`Error::Protocol`] |
//! | Request | [`Error::Cancelled`] |
//! | Defect | [`Error::InvariantViolation`] |
//! | External | [`Error::Io`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::path::PathBuf;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::encoding::TextEncoding;
use crate::identifiers::RequestId;
use crate::transport::Direction;
use crate::worklet::LifecycleState;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Construction Errors
    // ========================================================================
    /// Worklet construction failed.
    ///
    /// Returned when the engine rejects the configuration or the runtime
    /// thread cannot be started. Never retried automatically.
    #[error("Construction failed: {message}")]
    Construction {
        /// Description of the construction failure.
        message: String,
    },

    /// Script resource could not be resolved.
    ///
    /// Returned when a resource locator matches no file in any searched root.
    #[error("Resource not found: {name} (searched {searched:?})")]
    ResourceNotFound {
        /// File name that was looked up.
        name: String,
        /// Roots that were searched.
        searched: Vec<PathBuf>,
    },

    /// Text could not be decoded or encoded with the stated encoding.
    #[error("Invalid {encoding} text: {message}")]
    Decode {
        /// Encoding that failed.
        encoding: TextEncoding,
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Operation is not valid in the current lifecycle state.
    ///
    /// The host state is left unchanged.
    #[error("Cannot {operation} a worklet in state {state}")]
    InvalidState {
        /// Name of the rejected operation.
        operation: &'static str,
        /// State the worklet was in.
        state: LifecycleState,
    },

    /// The worklet has been terminated.
    ///
    /// Permanent for the handle that returned it.
    #[error("Worklet terminated")]
    Terminated,

    // ========================================================================
    // Channel Errors
    // ========================================================================
    /// A second waiter was registered while one is outstanding.
    ///
    /// Indicates caller misuse: each direction allows one suspended caller.
    #[error("Concurrent {direction} on a channel with a pending waiter")]
    ConcurrentAccess {
        /// Direction that already had a waiter.
        direction: Direction,
    },

    /// The channel was closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// Malformed control message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// The caller abandoned a push before its reply arrived.
    #[error("Request {request_id} cancelled")]
    Cancelled {
        /// The abandoned request.
        request_id: RequestId,
    },

    // ========================================================================
    // Defects
    // ========================================================================
    /// Internal invariant broken (double resolution of a waiter or request).
    ///
    /// Represents a defect in this crate, not a recoverable user error.
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        /// Description of the broken invariant.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a construction error.
    #[inline]
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction {
            message: message.into(),
        }
    }

    /// Creates a resource not found error.
    #[inline]
    pub fn resource_not_found(name: impl Into<String>, searched: Vec<PathBuf>) -> Self {
        Self::ResourceNotFound {
            name: name.into(),
            searched,
        }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(encoding: TextEncoding, message: impl Into<String>) -> Self {
        Self::Decode {
            encoding,
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(operation: &'static str, state: LifecycleState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Creates a concurrent access error.
    #[inline]
    pub fn concurrent_access(direction: Direction) -> Self {
        Self::ConcurrentAccess { direction }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a cancelled error.
    #[inline]
    pub fn cancelled(request_id: RequestId) -> Self {
        Self::Cancelled { request_id }
    }

    /// Creates an invariant violation error.
    #[inline]
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the channel or worklet behind the handle is gone.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Terminated)
    }

    /// Returns `true` if this error came from a failed construction attempt.
    #[inline]
    #[must_use]
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::Construction { .. } | Self::ResourceNotFound { .. } | Self::Decode { .. }
        )
    }

    /// Returns `true` if the caller used the API incorrectly.
    #[inline]
    #[must_use]
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentAccess { .. } | Self::InvalidState { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
