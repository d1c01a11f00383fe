//! Runtime execution context.
//!
//! Each worklet runs on its own OS thread driving a current-thread tokio
//! runtime. The script itself is supplied by an [`Engine`] as a local
//! future; the thread polls it only while the worklet is running.
//!
//! # Thread Loop
//!
//! ```text
//! ┌──────────────── worklet-xxxxxxxx ────────────────┐
//! │  select! (biased)                                │
//! │    shutdown token  ──► exit                      │
//! │    control command ──► suspend / resume          │
//! │    script future   ──► completion logged         │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Suspension keeps polling the script for the linger window, acknowledges
//! the host, then stops polling until resumed or shut down. Tasks the script
//! spawns onto the thread's runtime are not parked.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::WorkletId;
use crate::transport::{Ipc, PushReceiver};

use super::{Configuration, LifecycleState, Script};

// ============================================================================
// Types
// ============================================================================

/// Outcome of a script. Errors are reported as text.
pub type ScriptResult = std::result::Result<(), String>;

/// A running script, polled on the runtime thread.
pub type ScriptFuture = LocalBoxFuture<'static, ScriptResult>;

// ============================================================================
// Engine
// ============================================================================

/// Script engine seam.
///
/// The engine turns a [`Script`] into a future that is polled on the
/// worklet's runtime thread. Closures of the form
/// `Fn(Script, WorkletEnv) -> impl Future<Output = ScriptResult>`
/// implement this trait.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use worklet_host::{Engine, Script, WorkletEnv};
///
/// let engine: Arc<dyn Engine> = Arc::new(|_script: Script, env: WorkletEnv| async move {
///     let ipc = env.ipc();
///     while let Ok(Some(message)) = ipc.read().await {
///         ipc.write(message).await.map_err(|e| e.to_string())?;
///     }
///     Ok::<(), String>(())
/// });
/// ```
pub trait Engine: Send + Sync + 'static {
    /// Checks a configuration before the runtime thread is started.
    ///
    /// # Errors
    ///
    /// Returns a description of why the configuration is rejected.
    fn validate(&self, configuration: &Configuration) -> ScriptResult {
        let _ = configuration;
        Ok(())
    }

    /// Starts the script.
    ///
    /// Called on the runtime thread, inside its tokio runtime.
    fn run(&self, script: Script, env: WorkletEnv) -> ScriptFuture;
}

impl<F, Fut> Engine for F
where
    F: Fn(Script, WorkletEnv) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ScriptResult> + 'static,
{
    fn run(&self, script: Script, env: WorkletEnv) -> ScriptFuture {
        self(script, env).boxed_local()
    }
}

// ============================================================================
// WorkletEnv
// ============================================================================

/// The script's view of its host.
pub struct WorkletEnv {
    id: WorkletId,
    ipc: Ipc,
    pushes: PushReceiver,
    lifecycle: watch::Receiver<LifecycleState>,
    shutdown: CancellationToken,
}

impl fmt::Debug for WorkletEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkletEnv")
            .field("id", &self.id)
            .field("lifecycle", &*self.lifecycle.borrow())
            .finish_non_exhaustive()
    }
}

impl WorkletEnv {
    /// Returns the worklet id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> WorkletId {
        self.id
    }

    /// Returns the runtime end of the primary channel.
    #[inline]
    #[must_use]
    pub fn ipc(&self) -> Ipc {
        self.ipc.clone()
    }

    /// Returns the receiver of host pushes.
    #[inline]
    pub fn pushes(&mut self) -> &mut PushReceiver {
        &mut self.pushes
    }

    /// Returns a receiver of lifecycle notifications.
    ///
    /// Observes [`LifecycleState::Suspended`] when a linger window starts and
    /// [`LifecycleState::Running`] on resume.
    #[must_use]
    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.clone()
    }

    /// Returns a token cancelled when the worklet is terminated.
    #[must_use]
    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

// ============================================================================
// Control
// ============================================================================

/// Commands from the host to the runtime thread.
#[derive(Debug)]
pub(crate) enum Control {
    /// Drain for `linger`, stop polling the script, then acknowledge.
    Suspend {
        linger: Duration,
        ack: oneshot::Sender<()>,
    },
    /// Resume polling the script, then acknowledge.
    Resume { ack: oneshot::Sender<()> },
}

/// Whether the thread loop keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

// ============================================================================
// Spawning
// ============================================================================

/// Everything the runtime thread needs.
pub(crate) struct RuntimeSpec {
    pub id: WorkletId,
    pub engine: Arc<dyn Engine>,
    pub script: Script,
    /// Runtime end of the primary channel.
    pub ipc: Ipc,
    /// Runtime end of the control conduit.
    pub control_ipc: Ipc,
    pub commands: mpsc::UnboundedReceiver<Control>,
    pub shutdown: CancellationToken,
}

/// Starts the runtime thread and waits until its tokio runtime is up.
///
/// # Errors
///
/// Returns [`Error::Construction`] if the thread or its runtime cannot be
/// created.
pub(crate) async fn spawn_runtime(spec: RuntimeSpec) -> Result<JoinHandle<()>> {
    let id = spec.id;
    let (started_tx, started_rx) = oneshot::channel::<std::result::Result<(), String>>();

    let handle = thread::Builder::new()
        .name(format!("worklet-{}", id.short()))
        .spawn(move || {
            debug!(worklet = %id, "Runtime thread started");

            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = started_tx.send(Err(e.to_string()));
                    return;
                }
            };

            let _ = started_tx.send(Ok(()));
            runtime.block_on(async move { Worker::start(spec).run().await });
            runtime.shutdown_background();

            debug!(worklet = %id, "Runtime thread exiting");
        })
        .map_err(|e| Error::construction(format!("Cannot spawn runtime thread: {e}")))?;

    match started_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(message)) => Err(Error::construction(format!(
            "Cannot build worklet runtime: {message}"
        ))),
        Err(_) => Err(Error::construction("Runtime thread exited during startup")),
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Runtime thread state.
struct Worker {
    id: WorkletId,
    script: ScriptFuture,
    finished: bool,
    commands: mpsc::UnboundedReceiver<Control>,
    lifecycle: watch::Sender<LifecycleState>,
    shutdown: CancellationToken,
    /// Runtime channel ends, closed when the thread exits.
    channels: [Ipc; 2],
}

impl Worker {
    /// Hands the script its environment and creates its future.
    fn start(spec: RuntimeSpec) -> Self {
        let (lifecycle, lifecycle_rx) = watch::channel(LifecycleState::Running);

        let env = WorkletEnv {
            id: spec.id,
            ipc: spec.ipc.clone(),
            pushes: PushReceiver::new(spec.control_ipc.clone()),
            lifecycle: lifecycle_rx,
            shutdown: spec.shutdown.clone(),
        };
        let script = spec.engine.run(spec.script, env);

        Self {
            id: spec.id,
            script,
            finished: false,
            commands: spec.commands,
            lifecycle,
            shutdown: spec.shutdown,
            channels: [spec.ipc, spec.control_ipc],
        }
    }

    async fn run(mut self) {
        loop {
            let flow = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => Flow::Shutdown,

                command = self.commands.recv() => self.handle(command).await,

                result = &mut self.script, if !self.finished => {
                    self.finish(result);
                    Flow::Continue
                }
            };

            if flow == Flow::Shutdown {
                break;
            }
        }

        for channel in &self.channels {
            channel.close();
        }
        debug!(worklet = %self.id, "Worker finished");
    }

    async fn handle(&mut self, command: Option<Control>) -> Flow {
        match command {
            Some(Control::Suspend { linger, ack }) => self.suspend(linger, ack).await,
            Some(Control::Resume { ack }) => {
                let _ = ack.send(());
                Flow::Continue
            }
            None => {
                debug!(worklet = %self.id, "Control channel closed");
                Flow::Shutdown
            }
        }
    }

    fn finish(&mut self, result: ScriptResult) {
        self.finished = true;
        match result {
            Ok(()) => info!(worklet = %self.id, "Script completed"),
            Err(e) => warn!(worklet = %self.id, error = %e, "Script failed"),
        }
    }

    /// Lingers, acknowledges, then parks until resumed.
    async fn suspend(&mut self, linger: Duration, ack: oneshot::Sender<()>) -> Flow {
        self.lifecycle.send_replace(LifecycleState::Suspended);

        if self.linger(linger).await == Flow::Shutdown {
            return Flow::Shutdown;
        }

        let _ = ack.send(());
        debug!(worklet = %self.id, "Script parked");

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return Flow::Shutdown,

                command = self.commands.recv() => match command {
                    Some(Control::Resume { ack }) => {
                        self.lifecycle.send_replace(LifecycleState::Running);
                        let _ = ack.send(());
                        debug!(worklet = %self.id, "Script resumed");
                        return Flow::Continue;
                    }
                    Some(Control::Suspend { ack, .. }) => {
                        let _ = ack.send(());
                    }
                    None => return Flow::Shutdown,
                },
            }
        }
    }

    /// Keeps driving the script until `linger` elapses.
    async fn linger(&mut self, linger: Duration) -> Flow {
        let deadline = tokio::time::sleep(linger);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return Flow::Shutdown,

                () = &mut deadline => return Flow::Continue,

                result = &mut self.script, if !self.finished => self.finish(result),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
