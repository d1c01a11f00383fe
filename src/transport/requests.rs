//! Correlated push/reply over the control conduit.
//!
//! The host side ([`RequestChannel`]) sends `push` envelopes and waits for
//! the `reply` with the same id. The runtime side ([`PushReceiver`]) yields
//! each push as an [`IncomingPush`] that is answered exactly once.
//!
//! # Demultiplexing
//!
//! A [`RequestChannel`] spawns one tokio task that reads the conduit in a
//! loop and handles:
//!
//! - Replies, routed to their pending request by id
//! - Replies for unknown or stale ids, dropped with a warning
//! - Everything else, handed to the message handler
//! - End of stream, failing every pending request
//!
//! # Outcomes
//!
//! Each push resolves exactly once with the reply payload,
//! [`Error::ChannelClosed`], [`Error::Terminated`], or
//! [`Error::Cancelled`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::encoding::TextEncoding;
use crate::error::{Error, Result};
use crate::identifiers::{RequestId, RequestIdAllocator};
use crate::protocol::Envelope;

use super::Ipc;

// ============================================================================
// Types
// ============================================================================

type PushOutcome = Result<Vec<u8>>;

/// Handler for inbound control messages that are not replies.
///
/// Receives the raw message bytes.
pub type MessageHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Why the channel stopped accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closure {
    ChannelClosed,
    Terminated,
}

impl Closure {
    fn error(self) -> Error {
        match self {
            Self::ChannelClosed => Error::ChannelClosed,
            Self::Terminated => Error::Terminated,
        }
    }
}

// ============================================================================
// PendingRequest
// ============================================================================

/// Single-assignment result slot.
struct ResultSlot {
    tx: Option<oneshot::Sender<PushOutcome>>,
}

impl ResultSlot {
    /// Resolves the slot.
    ///
    /// A second fill is a defect and reports [`Error::InvariantViolation`].
    fn fill(&mut self, id: RequestId, outcome: PushOutcome) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            error!(%id, "Request resolved twice");
            debug_assert!(false, "request {id} resolved twice");
            return Err(Error::invariant_violation(format!(
                "request {id} resolved twice"
            )));
        };

        // Receiver gone means the caller stopped waiting.
        let _ = tx.send(outcome);
        Ok(())
    }
}

/// An in-flight push awaiting its reply.
struct PendingRequest {
    id: RequestId,
    slot: ResultSlot,
}

impl PendingRequest {
    fn resolve(mut self, outcome: PushOutcome) {
        let _ = self.slot.fill(self.id, outcome);
    }
}

/// Pending requests plus the closure marker, guarded together.
#[derive(Default)]
struct PendingState {
    requests: FxHashMap<RequestId, PendingRequest>,
    closed: Option<Closure>,
}

// ============================================================================
// Inner
// ============================================================================

struct Inner {
    /// Host end of the control conduit.
    ipc: Ipc,
    /// Correlation id source.
    ids: RequestIdAllocator,
    /// In-flight requests.
    pending: Mutex<PendingState>,
    /// Serializes envelope writes so concurrent pushes share the one write
    /// waiter.
    write_lock: AsyncMutex<()>,
    /// Handler for non-reply messages.
    handler: Mutex<Option<MessageHandler>>,
}

impl Inner {
    fn register(&self, id: RequestId) -> Result<oneshot::Receiver<PushOutcome>> {
        let mut pending = self.pending.lock();
        if let Some(closure) = pending.closed {
            return Err(closure.error());
        }

        let (tx, rx) = oneshot::channel();
        pending.requests.insert(
            id,
            PendingRequest {
                id,
                slot: ResultSlot { tx: Some(tx) },
            },
        );
        Ok(rx)
    }

    fn remove(&self, id: RequestId) -> Option<PendingRequest> {
        self.pending.lock().requests.remove(&id)
    }

    /// Writes `envelope`, raising `started` once the write may have
    /// enqueued it.
    async fn send(&self, envelope: &Envelope, started: &AtomicBool) -> Result<()> {
        let bytes = envelope.encode()?;
        let _write = self.write_lock.lock().await;
        started.store(true, Ordering::Release);
        self.ipc.write(bytes).await
    }

    /// Tells the runtime a push is no longer awaited.
    fn send_abandon(&self, id: RequestId) {
        let sent = Envelope::Abandon { id }
            .encode()
            .and_then(|bytes| self.ipc.try_write(&bytes));

        match sent {
            Ok(true) => trace!(%id, "Abandon sent"),
            Ok(false) => debug!(%id, "Abandon skipped, conduit busy"),
            Err(e) => debug!(%id, error = %e, "Abandon not sent"),
        }
    }

    fn route(&self, bytes: Vec<u8>) {
        if let Ok(Envelope::Reply { id, payload }) = Envelope::decode(&bytes) {
            match self.remove(id) {
                Some(request) => {
                    trace!(%id, len = payload.len(), "Reply routed");
                    request.resolve(Ok(payload));
                }
                None => warn!(%id, "Reply for unknown or stale request dropped"),
            }
            return;
        }

        let handler = self.handler.lock();
        match handler.as_ref() {
            Some(handler) => handler(bytes),
            None => warn!(len = bytes.len(), "Unsolicited control message dropped"),
        }
    }

    /// Fails every pending request. The first closure reason sticks.
    fn fail_pending(&self, closure: Closure) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.closed.get_or_insert(closure);
            pending.requests.drain().map(|(_, request)| request).collect()
        };

        let count = drained.len();
        for request in drained {
            request.resolve(Err(closure.error()));
        }

        if count > 0 {
            debug!(count, ?closure, "Failed pending requests");
        }
    }

    async fn run_demux(self: Arc<Self>) {
        let closure = loop {
            match self.ipc.read().await {
                Ok(Some(bytes)) => self.route(bytes),
                Ok(None) => break Closure::ChannelClosed,
                Err(Error::Terminated) => break Closure::Terminated,
                Err(e) => {
                    warn!(error = %e, "Control conduit read failed");
                    break Closure::ChannelClosed;
                }
            }
        };

        self.fail_pending(closure);
        debug!(?closure, "Request demultiplexer stopped");
    }
}

// ============================================================================
// RequestGuard
// ============================================================================

/// Purges a request's entry if its caller stops waiting.
struct RequestGuard<'a> {
    inner: &'a Inner,
    id: RequestId,
    /// Raised once the push may have been queued.
    sent: &'a AtomicBool,
    armed: bool,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.remove(self.id).is_some() {
            trace!(id = %self.id, "Dropped push purged");
            if self.sent.load(Ordering::Acquire) {
                self.inner.send_abandon(self.id);
            }
        }
    }
}

// ============================================================================
// RequestChannel
// ============================================================================

/// Host side of the push/reply protocol.
///
/// Cloning yields another handle to the same channel.
///
/// # Thread Safety
///
/// `RequestChannel` is `Send + Sync`. Concurrent pushes are independent
/// requests keyed by id; only their envelope writes are serialized.
#[derive(Clone)]
pub struct RequestChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestChannel")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl RequestChannel {
    /// Creates a channel over the host end of a control conduit.
    ///
    /// Spawns the demultiplexer task, so must be called within a tokio
    /// runtime.
    #[must_use]
    pub fn new(ipc: Ipc) -> Self {
        let inner = Arc::new(Inner {
            ipc,
            ids: RequestIdAllocator::new(),
            pending: Mutex::new(PendingState::default()),
            write_lock: AsyncMutex::new(()),
            handler: Mutex::new(None),
        });

        tokio::spawn(Arc::clone(&inner).run_demux());

        Self { inner }
    }

    /// Sets the handler for inbound messages that are not replies.
    ///
    /// Without a handler such messages are logged and dropped.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.inner.handler.lock() = Some(handler);
    }

    /// Clears the message handler.
    pub fn clear_message_handler(&self) {
        *self.inner.handler.lock() = None;
    }

    /// Pushes `payload` and waits for the reply.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] if the conduit closes first
    /// - [`Error::Terminated`] if the host terminates first
    pub async fn push(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.push_with_cancellation(payload, &CancellationToken::new())
            .await
    }

    /// Pushes text and decodes the reply, both with `encoding`.
    ///
    /// # Errors
    ///
    /// Same as [`RequestChannel::push`], plus [`Error::Decode`] for
    /// unmappable text in either direction.
    pub async fn push_text(&self, text: &str, encoding: TextEncoding) -> Result<String> {
        let reply = self.push(encoding.encode(text)?).await?;
        encoding.decode(&reply)
    }

    /// Pushes `payload` and waits for the reply or cancellation.
    ///
    /// On cancellation the request is withdrawn and the runtime receives a
    /// best-effort `abandon`. A reply that was already routed wins over a
    /// later cancellation.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancellation` fires first
    /// - [`Error::ChannelClosed`] if the conduit closes first
    /// - [`Error::Terminated`] if the host terminates first
    pub async fn push_with_cancellation(
        &self,
        payload: Vec<u8>,
        cancellation: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let inner = &*self.inner;
        let id = inner.ids.next();
        let mut rx = inner.register(id)?;
        let started = AtomicBool::new(false);
        let mut guard = RequestGuard {
            inner,
            id,
            sent: &started,
            armed: true,
        };

        let envelope = Envelope::Push { id, payload };
        let sent = tokio::select! {
            biased;
            () = cancellation.cancelled() => None,
            sent = inner.send(&envelope, &started) => Some(sent),
        };

        match sent {
            // A write cut short may already have queued the push.
            None => return self.cancel(&mut guard, rx).await,
            Some(Err(e)) => {
                guard.armed = false;
                inner.remove(id);
                return Err(e);
            }
            Some(Ok(())) => {
                trace!(%id, "Push sent");
            }
        }

        tokio::select! {
            biased;
            outcome = &mut rx => {
                guard.armed = false;
                outcome.unwrap_or_else(|_| Err(Error::ChannelClosed))
            }
            () = cancellation.cancelled() => self.cancel(&mut guard, rx).await,
        }
    }

    /// Withdraws a request after its caller cancelled.
    async fn cancel(
        &self,
        guard: &mut RequestGuard<'_>,
        rx: oneshot::Receiver<PushOutcome>,
    ) -> Result<Vec<u8>> {
        guard.armed = false;

        if self.inner.remove(guard.id).is_some() {
            debug!(id = %guard.id, "Push cancelled");
            if guard.sent.load(Ordering::Acquire) {
                self.inner.send_abandon(guard.id);
            }
            return Err(Error::cancelled(guard.id));
        }

        // Already resolved by the demultiplexer.
        rx.await.unwrap_or_else(|_| Err(Error::ChannelClosed))
    }

    /// Returns the number of requests awaiting a reply.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().requests.len()
    }

    /// Stops the channel on host termination.
    ///
    /// Every pending and later push fails with [`Error::Terminated`].
    pub(crate) fn shutdown(&self) {
        self.inner.ipc.shutdown();
        self.inner.fail_pending(Closure::Terminated);
    }
}

// ============================================================================
// PushReceiver
// ============================================================================

/// Tracks abandonment tokens of unanswered pushes.
type AbandonMap = Arc<Mutex<FxHashMap<RequestId, CancellationToken>>>;

/// Runtime side of the push/reply protocol.
///
/// Abandon envelopes are processed while [`PushReceiver::next`] is polled.
pub struct PushReceiver {
    ipc: Ipc,
    write_lock: Arc<AsyncMutex<()>>,
    unanswered: AbandonMap,
}

impl fmt::Debug for PushReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushReceiver")
            .field("unanswered", &self.unanswered.lock().len())
            .finish_non_exhaustive()
    }
}

impl PushReceiver {
    /// Creates a receiver over the runtime end of a control conduit.
    #[must_use]
    pub fn new(ipc: Ipc) -> Self {
        Self {
            ipc,
            write_lock: Arc::new(AsyncMutex::new(())),
            unanswered: Arc::default(),
        }
    }

    /// Sends a raw message to the host.
    ///
    /// The host hands messages that are not replies to its message handler;
    /// for a worklet that is [`WorkletHost::recv_message`]. Bytes that decode
    /// as a reply envelope are routed as a reply instead.
    ///
    /// [`WorkletHost::recv_message`]: crate::WorkletHost::recv_message
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] if the conduit is closed
    /// - [`Error::Terminated`] if the host has terminated
    pub async fn send(&self, message: Vec<u8>) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.ipc.write(message).await
    }

    /// Waits for the next push.
    ///
    /// Returns `None` once the conduit is closed.
    pub async fn next(&mut self) -> Option<IncomingPush> {
        loop {
            let bytes = match self.ipc.read().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return None,
                Err(e) => {
                    debug!(error = %e, "Push receiver stopped");
                    return None;
                }
            };

            match Envelope::decode(&bytes) {
                Ok(Envelope::Push { id, payload }) => {
                    let abandoned = CancellationToken::new();
                    self.unanswered.lock().insert(id, abandoned.clone());
                    trace!(%id, len = payload.len(), "Push received");

                    return Some(IncomingPush {
                        id,
                        payload,
                        abandoned,
                        ipc: self.ipc.clone(),
                        write_lock: Arc::clone(&self.write_lock),
                        unanswered: Arc::clone(&self.unanswered),
                    });
                }
                Ok(Envelope::Abandon { id }) => {
                    if let Some(token) = self.unanswered.lock().remove(&id) {
                        debug!(%id, "Push abandoned by host");
                        token.cancel();
                    }
                }
                Ok(other) => warn!(kind = other.kind(), id = %other.id(), "Unexpected envelope"),
                Err(e) => warn!(error = %e, "Malformed control message dropped"),
            }
        }
    }
}

// ============================================================================
// IncomingPush
// ============================================================================

/// A push awaiting its reply.
pub struct IncomingPush {
    id: RequestId,
    payload: Vec<u8>,
    abandoned: CancellationToken,
    ipc: Ipc,
    write_lock: Arc<AsyncMutex<()>>,
    unanswered: AbandonMap,
}

impl fmt::Debug for IncomingPush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingPush")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl IncomingPush {
    /// Returns the correlation id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns the request body.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns a token cancelled when the host abandons this push.
    #[must_use]
    pub fn abandoned(&self) -> CancellationToken {
        self.abandoned.clone()
    }

    /// Sends the reply.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] if the conduit is closed
    /// - [`Error::Terminated`] if the host has terminated
    pub async fn reply(self, payload: Vec<u8>) -> Result<()> {
        self.release();

        let bytes = Envelope::Reply {
            id: self.id,
            payload,
        }
        .encode()?;

        let _write = self.write_lock.lock().await;
        self.ipc.write(bytes).await
    }
}

impl IncomingPush {
    /// Forgets the abandonment token; later abandons are ignored.
    fn release(&self) {
        self.unanswered.lock().remove(&self.id);
    }
}

impl Drop for IncomingPush {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Tests
// ============================================================================
