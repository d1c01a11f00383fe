//! Worklet Host - Embeddable script worklets with async IPC.
//!
//! This library hosts a sandboxed script runtime ("worklet") on its own
//! thread and gives the embedding application control over its lifecycle
//! and the channels used to talk to it.
//!
//! # Architecture
//!
//! The host follows an owner-runtime model:
//!
//! - **Host (any task)**: Controls the lifecycle, reads/writes messages,
//!   pushes requests
//! - **Runtime (dedicated thread)**: Drives the script supplied by an
//!   [`Engine`] on a current-thread tokio runtime
//!
//! Key design principles:
//!
//! - Each [`WorkletHost`] owns: runtime thread + primary channel + control
//!   conduit
//! - The native transport is readiness-callback driven; [`Ipc`] adapts it to
//!   `async` with one outstanding waiter per direction
//! - Push/reply is correlated by [`RequestId`] and resolved exactly once
//! - Lifecycle transitions are serialized per host and published on a watch
//!   channel
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use worklet_host::{Result, Script, WorkletEnv, WorkletHost};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // An engine that answers every push with its payload
//!     let host = WorkletHost::builder()
//!         .engine(|_: Script, mut env: WorkletEnv| async move {
//!             while let Some(push) = env.pushes().next().await {
//!                 let payload = push.payload().to_vec();
//!                 push.reply(payload).await.map_err(|e| e.to_string())?;
//!             }
//!             Ok::<(), String>(())
//!         })
//!         .code("echo.js", "/* echo */")
//!         .memory_limit(16 * 1024 * 1024)
//!         .create()
//!         .await?;
//!
//!     let reply = host.push(b"ping".to_vec()).await?;
//!     assert_eq!(reply, b"ping");
//!
//!     host.suspend(Duration::from_millis(50)).await?;
//!     host.resume().await?;
//!     host.terminate().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`encoding`] | Text encodings for text convenience operations |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`notification`] | Notification rendering through a worklet |
//! | [`protocol`] | Control conduit envelopes |
//! | [`transport`] | Readiness channels, async IPC, push/reply |
//! | [`worklet`] | Host, builder, engine seam, lifecycle |

// ============================================================================
// Modules
// ============================================================================

/// Text encodings.
pub mod encoding;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing worklet and request ids.
pub mod identifiers;

/// Notification rendering through a worklet.
pub mod notification;

/// Control conduit envelopes.
///
/// Internal wire format for push/reply correlation.
pub mod protocol;

/// Message transport between host and runtime.
///
/// - [`ReadinessChannel`] - Callback-driven endpoint pairs
/// - [`Ipc`] - Async read/write bridge
/// - [`RequestChannel`] - Correlated push/reply
pub mod transport;

/// Worklet hosting and lifecycle.
///
/// Use [`WorkletHost::builder()`] to configure and start a worklet.
pub mod worklet;

// ============================================================================
// Re-exports
// ============================================================================

// Encoding
pub use encoding::TextEncoding;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{RequestId, WorkletId};

// Notification types
pub use notification::{
    NotificationContent, NotificationDelegate, NotificationRequest, NotificationService,
    PassThrough,
};

// Transport types
pub use transport::{
    DEFAULT_CHANNEL_CAPACITY, Direction, Endpoint, IncomingPush, Ipc, PushReceiver,
    ReadinessChannel, RequestChannel,
};

// Worklet types
pub use worklet::{
    Configuration, Engine, LifecycleState, ResourceLocator, Script, ScriptFuture, ScriptResult,
    ScriptSource, TERMINATE_JOIN_TIMEOUT, WorkletBuilder, WorkletEnv, WorkletHost,
};
