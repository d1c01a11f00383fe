//! Message transport between a host and its worklet.
//!
//! Every worklet has two duplex channels. The primary channel carries opaque
//! application messages; the control conduit carries push/reply envelopes.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐                           ┌───────────────────┐
//! │  Host (any task)  │                           │  Runtime thread   │
//! │                   │    ReadinessChannel       │                   │
//! │  Ipc              │◄─────────────────────────►│  Ipc              │
//! │                   │     primary channel       │                   │
//! │  RequestChannel   │◄─────────────────────────►│  PushReceiver     │
//! │                   │     control conduit       │                   │
//! └───────────────────┘                           └───────────────────┘
//! ```
//!
//! # Layers
//!
//! 1. [`ReadinessChannel`] - non-blocking endpoints with readiness callbacks
//! 2. [`Ipc`] - `async` read/write with one waiter per direction
//! 3. [`RequestChannel`] - correlated push/reply over an [`Ipc`]
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `readiness` | Bounded endpoint pairs with readiness callbacks |
//! | `ipc` | Async bridge over one endpoint |
//! | `requests` | Push/reply correlation and runtime-side receiver |

// ============================================================================
// Submodules
// ============================================================================

/// Bounded endpoint pairs with readiness callbacks.
pub mod readiness;

/// Async bridge over one endpoint.
pub mod ipc;

/// Push/reply correlation.
pub mod requests;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// Re-exports
// ============================================================================

pub use ipc::Ipc;
pub use readiness::{
    DEFAULT_CHANNEL_CAPACITY, Endpoint, ReadinessCallback, ReadinessChannel, TryRead, TryWrite,
};
pub use requests::{IncomingPush, MessageHandler, PushReceiver, RequestChannel};

// ============================================================================
// Direction
// ============================================================================

/// Direction of a channel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Inbound: `read`.
    Read,
    /// Outbound: `write`.
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}
