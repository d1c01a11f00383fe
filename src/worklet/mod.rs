//! Worklet hosting and lifecycle management.
//!
//! This module provides the [`WorkletHost`] and everything needed to
//! construct one.
//!
//! # Lifecycle
//!
//! | State | Script polled | Channels open |
//! |-------|---------------|---------------|
//! | `Created` | No | Yes |
//! | `Running` | Yes | Yes |
//! | `Suspended` | No (after linger) | Yes |
//! | `Terminated` | No | No |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | Fluent construction |
//! | `configuration` | Resource limits |
//! | `host` | Lifecycle control and channel ownership |
//! | `runtime` | Engine seam and runtime thread |
//! | `source` | Script sources and resolution |
//! | `state` | Lifecycle states |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent construction.
pub mod builder;

/// Resource limits.
pub mod configuration;

/// Lifecycle control and channel ownership.
pub mod host;

/// Engine seam and runtime thread.
pub mod runtime;

/// Script sources and resolution.
pub mod source;

/// Lifecycle states.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::WorkletBuilder;
pub use configuration::Configuration;
pub use host::{TERMINATE_JOIN_TIMEOUT, WorkletHost};
pub use runtime::{Engine, ScriptFuture, ScriptResult, WorkletEnv};
pub use source::{ResourceLocator, Script, ScriptSource};
pub use state::LifecycleState;
