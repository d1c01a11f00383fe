//! Control conduit protocol.
//!
//! The control conduit carries JSON envelopes correlating each push with
//! exactly one reply.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `push` | Host → Runtime | Request with a fresh id |
//! | `reply` | Runtime → Host | Answer carrying the push's id |
//! | `abandon` | Host → Runtime | Caller stopped waiting |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | Envelope type and wire encoding |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope type and wire encoding.
pub mod envelope;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::Envelope;
