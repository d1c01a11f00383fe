//! Worklet host: lifecycle control and channel ownership.
//!
//! A [`WorkletHost`] owns one runtime thread, its lifecycle state, and the
//! host ends of the primary channel and the control conduit.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use worklet_host::{Configuration, Script, ScriptSource, WorkletEnv, WorkletHost};
//!
//! # tokio_test::block_on(async {
//! let echo = |_: Script, mut env: WorkletEnv| async move {
//!     while let Some(push) = env.pushes().next().await {
//!         let payload = push.payload().to_vec();
//!         push.reply(payload).await.map_err(|e| e.to_string())?;
//!     }
//!     Ok::<(), String>(())
//! };
//!
//! let host = WorkletHost::create(
//!     Arc::new(echo),
//!     ScriptSource::code("echo.js", "/* echo */"),
//!     vec![],
//!     Configuration::new(),
//! )
//! .await?;
//!
//! assert_eq!(host.push(b"ping".to_vec()).await?, b"ping");
//!
//! host.suspend(Duration::from_millis(10)).await?;
//! host.resume().await?;
//! host.terminate().await;
//! # Ok::<(), worklet_host::Error>(())
//! # }).unwrap();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoding::TextEncoding;
use crate::error::{Error, Result};
use crate::identifiers::WorkletId;
use crate::transport::{DEFAULT_CHANNEL_CAPACITY, Ipc, ReadinessChannel, RequestChannel};

use super::builder::WorkletBuilder;
use super::runtime::{Control, Engine, RuntimeSpec, spawn_runtime};
use super::{Configuration, LifecycleState, Script, ScriptSource};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on waiting for the runtime thread to exit in `terminate()`.
pub const TERMINATE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// HostInner
// ============================================================================

struct HostInner {
    id: WorkletId,
    filename: String,
    arguments: Vec<String>,
    configuration: Configuration,

    /// Serializes lifecycle transitions.
    control: AsyncMutex<LifecycleState>,
    /// Publishes the state after each transition.
    state: watch::Sender<LifecycleState>,

    /// Commands to the runtime thread.
    commands: mpsc::UnboundedSender<Control>,
    /// Cancelled first thing in `terminate()`.
    shutdown: CancellationToken,
    /// Runtime thread, taken when joined.
    thread: Mutex<Option<JoinHandle<()>>>,

    /// Host end of the primary channel.
    ipc: Ipc,
    /// Push/reply over the control conduit.
    requests: RequestChannel,
    /// Control messages from the script that are not replies.
    messages: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

impl HostInner {
    fn publish(&self, state: LifecycleState) {
        self.state.send_replace(state);
    }

    /// Moves `state` to `next` and publishes it.
    ///
    /// Transitions outside the lifecycle table are a defect and leave the
    /// state unchanged.
    fn transition(&self, state: &mut LifecycleState, next: LifecycleState) {
        if !state.can_transition_to(next) {
            error!(worklet = %self.id, from = %*state, to = %next, "Illegal lifecycle transition");
            debug_assert!(false, "illegal lifecycle transition {state} -> {next}");
            return;
        }
        *state = next;
        self.publish(next);
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        if *self.state.borrow() == LifecycleState::Terminated {
            return;
        }

        debug!(worklet = %self.id, "Host dropped without terminate, tearing down");
        self.shutdown.cancel();
        self.ipc.shutdown();
        self.requests.shutdown();

        // The thread exits on its own once it observes the cancellation.
        if let Some(thread) = self.thread.lock().take()
            && thread.is_finished()
        {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// WorkletHost
// ============================================================================

/// Handle to one running worklet.
///
/// Cloning yields another handle to the same worklet. The worklet is torn
/// down by [`WorkletHost::terminate`] or when the last handle is dropped.
///
/// # Thread Safety
///
/// `WorkletHost` is `Send + Sync`. Lifecycle operations may be called from
/// any task and are serialized per worklet.
#[derive(Clone)]
pub struct WorkletHost {
    inner: Arc<HostInner>,
}

impl fmt::Debug for WorkletHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkletHost")
            .field("id", &self.inner.id)
            .field("filename", &self.inner.filename)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// WorkletHost - Construction
// ============================================================================

impl WorkletHost {
    /// Creates a builder for a worklet.
    #[inline]
    #[must_use]
    pub fn builder() -> WorkletBuilder {
        WorkletBuilder::new()
    }

    /// Loads the script, starts the runtime thread, and runs the script.
    ///
    /// Resource locators without a bundle are resolved against the current
    /// directory; use [`WorkletHost::builder`] for other search paths.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceNotFound`] if a resource cannot be found
    /// - [`Error::Decode`] if inline text is not valid in its encoding
    /// - [`Error::Construction`] if the engine rejects the configuration or
    ///   the runtime thread cannot be started
    pub async fn create(
        engine: Arc<dyn Engine>,
        source: ScriptSource,
        arguments: Vec<String>,
        configuration: Configuration,
    ) -> Result<Self> {
        let search_paths: Vec<PathBuf> = std::env::current_dir().into_iter().collect();
        Self::launch(engine, source, arguments, configuration, &search_paths).await
    }

    pub(crate) async fn launch(
        engine: Arc<dyn Engine>,
        source: ScriptSource,
        arguments: Vec<String>,
        configuration: Configuration,
        search_paths: &[PathBuf],
    ) -> Result<Self> {
        let (filename, source) = source.load(search_paths)?;

        engine.validate(&configuration).map_err(|message| {
            Error::construction(format!("Engine rejected configuration: {message}"))
        })?;

        let id = WorkletId::generate();
        let (host_end, runtime_end) = ReadinessChannel::pair(DEFAULT_CHANNEL_CAPACITY);
        let (control_host, control_runtime) = ReadinessChannel::pair(DEFAULT_CHANNEL_CAPACITY);

        let ipc = Ipc::new(host_end);
        let requests = RequestChannel::new(Ipc::new(control_host));
        let messages = forward_messages(id, &requests);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (state, _) = watch::channel(LifecycleState::Created);

        let script = Script {
            filename: filename.clone(),
            source,
            arguments: arguments.clone(),
            configuration: configuration.clone(),
        };

        let spawned = spawn_runtime(RuntimeSpec {
            id,
            engine,
            script,
            ipc: Ipc::new(runtime_end),
            control_ipc: Ipc::new(control_runtime),
            commands: commands_rx,
            shutdown: shutdown.clone(),
        })
        .await;

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                ipc.shutdown();
                requests.shutdown();
                return Err(e);
            }
        };

        let mut inner = HostInner {
            id,
            filename,
            arguments,
            configuration,
            control: AsyncMutex::new(LifecycleState::Created),
            state,
            commands,
            shutdown,
            thread: Mutex::new(Some(thread)),
            ipc,
            requests,
            messages: AsyncMutex::new(messages),
        };
        let mut initial = LifecycleState::Created;
        inner.transition(&mut initial, LifecycleState::Running);
        *inner.control.get_mut() = initial;

        info!(
            worklet = %id,
            filename = %inner.filename,
            memory_limit = inner.configuration.memory_limit,
            "Worklet started"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

/// Routes unsolicited control messages into a bounded queue.
///
/// The queue ends once the handler is cleared on terminate.
fn forward_messages(id: WorkletId, requests: &RequestChannel) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    requests.set_message_handler(Box::new(move |message| {
        if let Err(e) = tx.try_send(message) {
            warn!(worklet = %id, error = %e, "Control message dropped");
        }
    }));
    rx
}

// ============================================================================
// WorkletHost - Lifecycle
// ============================================================================

impl WorkletHost {
    /// Suspends the worklet.
    ///
    /// The script is notified and keeps running for `linger` so in-flight
    /// traffic can drain, then it is no longer polled. Returns once the
    /// runtime has quiesced. No-op when already suspended or terminated; a
    /// concurrent [`WorkletHost::terminate`] cuts the linger window short.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminated`] if the runtime thread has exited.
    pub async fn suspend(&self, linger: Duration) -> Result<()> {
        let mut state = self.inner.control.lock().await;
        match *state {
            LifecycleState::Running => {}
            LifecycleState::Suspended | LifecycleState::Terminated => return Ok(()),
            LifecycleState::Created => {
                return Err(Error::invalid_state("suspend", LifecycleState::Created));
            }
        }

        let (ack, acked) = oneshot::channel();
        self.send_control(Control::Suspend { linger, ack })?;
        debug!(worklet = %self.inner.id, linger_ms = linger.as_millis(), "Suspending");

        tokio::select! {
            biased;

            () = self.inner.shutdown.cancelled() => {
                debug!(worklet = %self.inner.id, "Suspend interrupted by terminate");
                return Ok(());
            }

            acked = acked => acked.map_err(|_| Error::Terminated)?,
        }

        self.inner.transition(&mut *state, LifecycleState::Suspended);
        info!(worklet = %self.inner.id, "Worklet suspended");
        Ok(())
    }

    /// Resumes a suspended worklet. No-op when running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the worklet is terminated.
    pub async fn resume(&self) -> Result<()> {
        let mut state = self.inner.control.lock().await;
        match *state {
            LifecycleState::Suspended => {}
            LifecycleState::Running => return Ok(()),
            other => return Err(Error::invalid_state("resume", other)),
        }

        let (ack, acked) = oneshot::channel();
        self.send_control(Control::Resume { ack })?;

        tokio::select! {
            biased;

            () = self.inner.shutdown.cancelled() => {
                return Err(Error::invalid_state("resume", LifecycleState::Terminated));
            }

            acked = acked => acked.map_err(|_| Error::Terminated)?,
        }

        self.inner.transition(&mut *state, LifecycleState::Running);
        info!(worklet = %self.inner.id, "Worklet resumed");
        Ok(())
    }

    /// Terminates the worklet.
    ///
    /// Interrupts the runtime, fails every pending channel operation and
    /// push with [`Error::Terminated`], and joins the runtime thread (waiting
    /// at most [`TERMINATE_JOIN_TIMEOUT`]). Idempotent; a second call returns
    /// once the first has completed.
    pub async fn terminate(&self) {
        self.inner.shutdown.cancel();

        let mut state = self.inner.control.lock().await;
        if *state == LifecycleState::Terminated {
            return;
        }

        debug!(worklet = %self.inner.id, from = %*state, "Terminating");
        self.inner.ipc.shutdown();
        self.inner.requests.shutdown();
        self.inner.requests.clear_message_handler();

        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread {
            self.join(thread).await;
        }

        self.inner.transition(&mut *state, LifecycleState::Terminated);
        info!(worklet = %self.inner.id, "Worklet terminated");
    }

    async fn join(&self, thread: JoinHandle<()>) {
        let joined = tokio::task::spawn_blocking(move || thread.join());

        match timeout(TERMINATE_JOIN_TIMEOUT, joined).await {
            Ok(Ok(Ok(()))) => debug!(worklet = %self.inner.id, "Runtime thread joined"),
            Ok(Ok(Err(_))) => warn!(worklet = %self.inner.id, "Runtime thread panicked"),
            Ok(Err(e)) => warn!(worklet = %self.inner.id, error = %e, "Join task failed"),
            Err(_) => warn!(
                worklet = %self.inner.id,
                timeout_ms = TERMINATE_JOIN_TIMEOUT.as_millis(),
                "Runtime thread still running, detaching"
            ),
        }
    }

    fn send_control(&self, command: Control) -> Result<()> {
        self.inner.commands.send(command).map_err(|_| {
            warn!(worklet = %self.inner.id, "Runtime thread gone");
            Error::Terminated
        })
    }
}

// ============================================================================
// WorkletHost - Messaging
// ============================================================================

impl WorkletHost {
    /// Returns the host end of the primary channel.
    #[inline]
    #[must_use]
    pub fn ipc(&self) -> &Ipc {
        &self.inner.ipc
    }

    /// Returns the push/reply channel.
    #[inline]
    #[must_use]
    pub fn requests(&self) -> &RequestChannel {
        &self.inner.requests
    }

    /// Receives the next control message the script sent outside of a reply.
    ///
    /// Messages are queued up to [`DEFAULT_CHANNEL_CAPACITY`]; beyond that
    /// they are dropped with a warning. Returns `None` after termination once
    /// the queue is drained.
    pub async fn recv_message(&self) -> Option<Vec<u8>> {
        self.inner.messages.lock().await.recv().await
    }

    /// Pushes `payload` to the script and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] if the conduit closes first
    /// - [`Error::Terminated`] if the worklet terminates first
    pub async fn push(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.inner.requests.push(payload).await
    }

    /// Pushes text and decodes the reply, both with `encoding`.
    ///
    /// # Errors
    ///
    /// Same as [`WorkletHost::push`], plus [`Error::Decode`] for
    /// unmappable text.
    pub async fn push_text(&self, text: &str, encoding: TextEncoding) -> Result<String> {
        self.inner.requests.push_text(text, encoding).await
    }

    /// Pushes `payload` and waits for the reply or cancellation.
    ///
    /// # Errors
    ///
    /// Same as [`WorkletHost::push`], plus [`Error::Cancelled`].
    pub async fn push_with_cancellation(
        &self,
        payload: Vec<u8>,
        cancellation: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.inner
            .requests
            .push_with_cancellation(payload, cancellation)
            .await
    }
}

// ============================================================================
// WorkletHost - Accessors
// ============================================================================

impl WorkletHost {
    /// Returns the worklet id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> WorkletId {
        self.inner.id
    }

    /// Returns the current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Returns a receiver notified after every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Returns the host's copy of the configuration.
    #[inline]
    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    /// Returns the script arguments.
    #[inline]
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.inner.arguments
    }

    /// Returns the script filename.
    #[inline]
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.inner.filename
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::worklet::WorkletEnv;

    fn idle() -> Arc<dyn Engine> {
        Arc::new(|_: Script, env: WorkletEnv| async move {
            env.shutdown().cancelled().await;
            Ok::<(), String>(())
        })
    }

    async fn host() -> WorkletHost {
        WorkletHost::create(
            idle(),
            ScriptSource::code("idle.js", ""),
            vec!["--flag".to_string()],
            Configuration::new().with_memory_limit(1 << 20),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_runs() {
        let host = host().await;
        assert_eq!(host.state(), LifecycleState::Running);
        assert_eq!(host.filename(), "idle.js");
        assert_eq!(host.arguments(), ["--flag"]);
        assert_eq!(host.configuration().memory_limit, 1 << 20);
        host.terminate().await;
    }

    #[tokio::test]
    async fn test_suspend_twice_is_noop() {
        let host = host().await;
        host.suspend(Duration::ZERO).await.unwrap();
        host.suspend(Duration::ZERO).await.unwrap();
        assert_eq!(host.state(), LifecycleState::Suspended);
        host.terminate().await;
    }

    #[tokio::test]
    async fn test_resume_when_running_is_noop() {
        let host = host().await;
        host.resume().await.unwrap();
        assert_eq!(host.state(), LifecycleState::Running);
        host.terminate().await;
    }

    #[tokio::test]
    async fn test_resume_after_terminate_is_invalid() {
        let host = host().await;
        host.terminate().await;
        let err = host.resume().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                operation: "resume",
                state: LifecycleState::Terminated
            }
        ));
    }

    #[tokio::test]
    async fn test_subscribe_observes_transitions() {
        let host = host().await;
        let mut states = host.subscribe();
        assert_eq!(*states.borrow_and_update(), LifecycleState::Running);

        host.suspend(Duration::ZERO).await.unwrap();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), LifecycleState::Suspended);

        host.terminate().await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_published_transitions_follow_lifecycle_table() {
        let host = host().await;
        let mut states = host.subscribe();
        let mut seen = vec![*states.borrow_and_update()];

        host.suspend(Duration::ZERO).await.unwrap();
        seen.push(*states.borrow_and_update());
        host.resume().await.unwrap();
        seen.push(*states.borrow_and_update());
        host.terminate().await;
        seen.push(*states.borrow_and_update());

        assert_eq!(
            seen,
            [
                LifecycleState::Running,
                LifecycleState::Suspended,
                LifecycleState::Running,
                LifecycleState::Terminated
            ]
        );
        assert!(seen.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[tokio::test]
    async fn test_engine_rejection_is_construction_error() {
        struct Strict;

        impl Engine for Strict {
            fn validate(&self, configuration: &Configuration) -> crate::worklet::ScriptResult {
                if configuration.is_unlimited() {
                    return Err("memory limit required".to_string());
                }
                Ok(())
            }

            fn run(&self, _: Script, _: WorkletEnv) -> crate::worklet::ScriptFuture {
                Box::pin(async { Ok::<(), String>(()) })
            }
        }

        let err = WorkletHost::create(
            Arc::new(Strict),
            ScriptSource::code("strict.js", ""),
            vec![],
            Configuration::new(),
        )
        .await
        .unwrap_err();

        assert!(err.is_construction_error());
        assert!(err.to_string().contains("memory limit required"));
    }
}
