//! Async bridge over a readiness endpoint.
//!
//! [`Ipc`] turns the callback-driven [`Endpoint`] into `async fn read()` and
//! `async fn write()`. Each direction admits exactly one suspended caller at
//! a time; a second concurrent caller fails with
//! [`Error::ConcurrentAccess`] instead of queueing.
//!
//! # Waiting
//!
//! 1. Attempt the operation without blocking; return if it completes.
//! 2. Otherwise store a waiter in the direction's slot and register a
//!    readiness callback on the endpoint.
//! 3. Each notification retries the operation under the slot lock. Success
//!    or closure takes the waiter out of the slot, clears the callback, then
//!    resolves the waiter. A spurious notification leaves it registered.
//!
//! The slot lock is always taken before the endpoint lock, and endpoint
//! notifications are fired only after the slot lock is released.
//!
//! # End of Stream
//!
//! | Situation | `read()` | `write()` |
//! |-----------|----------|-----------|
//! | Local [`Ipc::close`] | `Ok(None)` | `Err(ChannelClosed)` |
//! | Peer closed, queue drained | `Ok(None)` | `Err(ChannelClosed)` |
//! | Host terminated | `Err(Terminated)` | `Err(Terminated)` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::encoding::TextEncoding;
use crate::error::{Error, Result};

use super::Direction;
use super::readiness::{Endpoint, ReadinessCallback, TryRead, TryWrite};

// ============================================================================
// Types
// ============================================================================

type ReadOutcome = Result<Option<Vec<u8>>>;
type WriteOutcome = Result<()>;

/// A suspended caller.
struct Waiter<P, T> {
    /// Identifies the caller that registered this waiter.
    ticket: u64,
    /// Operation data (the message for writes).
    payload: P,
    /// Resolves the caller.
    tx: oneshot::Sender<T>,
}

/// Single-occupancy waiter slot for one direction.
struct WaiterSlot<P, T> {
    next_ticket: u64,
    waiter: Option<Waiter<P, T>>,
}

impl<P, T> WaiterSlot<P, T> {
    const fn new() -> Self {
        Self {
            next_ticket: 0,
            waiter: None,
        }
    }

    #[inline]
    fn is_pending(&self) -> bool {
        self.waiter.is_some()
    }

    /// Stores a new waiter. The caller has checked the slot is empty.
    fn register(&mut self, payload: P) -> (u64, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.waiter = Some(Waiter {
            ticket,
            payload,
            tx,
        });
        (ticket, rx)
    }

    #[inline]
    fn take(&mut self) -> Option<Waiter<P, T>> {
        self.waiter.take()
    }

    /// Removes the waiter only if it still belongs to `ticket`.
    fn take_ticket(&mut self, ticket: u64) -> Option<Waiter<P, T>> {
        if self.waiter.as_ref().is_some_and(|w| w.ticket == ticket) {
            self.waiter.take()
        } else {
            None
        }
    }
}

// ============================================================================
// Shared
// ============================================================================

/// State shared by every clone of one [`Ipc`].
struct Shared {
    endpoint: Endpoint,
    reader: Mutex<WaiterSlot<(), ReadOutcome>>,
    writer: Mutex<WaiterSlot<Vec<u8>, WriteOutcome>>,
    terminated: AtomicBool,
}

impl Shared {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn check_terminated(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::Terminated);
        }
        Ok(())
    }

    /// Outcome of a read on a closed channel.
    fn end_of_stream(&self) -> ReadOutcome {
        if self.is_terminated() {
            Err(Error::Terminated)
        } else {
            Ok(None)
        }
    }

    /// Error for a write on a closed channel.
    fn closed_error(&self) -> Error {
        if self.is_terminated() {
            Error::Terminated
        } else {
            Error::ChannelClosed
        }
    }

    fn on_readable(&self) {
        let mut reader = self.reader.lock();
        if !reader.is_pending() {
            return;
        }

        let (attempt, notifications) = self.endpoint.try_read_deferred();
        let outcome = match attempt {
            TryRead::Data(message) => Ok(Some(message)),
            TryRead::Closed => self.end_of_stream(),
            TryRead::Empty => {
                trace!("Spurious readable notification");
                return;
            }
        };

        let waiter = reader.take();
        self.endpoint.set_readable(None);
        drop(reader);
        notifications.fire();

        if let Some(waiter) = waiter {
            self.deliver_read(waiter.tx, outcome);
        }
    }

    fn on_writable(&self) {
        let mut writer = self.writer.lock();
        let Some(waiter) = writer.waiter.as_ref() else {
            return;
        };

        let (attempt, notifications) = self.endpoint.try_write_deferred(&waiter.payload);
        let outcome = match attempt {
            TryWrite::Written => Ok(()),
            TryWrite::Closed => Err(self.closed_error()),
            TryWrite::Full => {
                trace!("Spurious writable notification");
                return;
            }
        };

        let waiter = writer.take();
        self.endpoint.set_writable(None);
        drop(writer);
        notifications.fire();

        if let Some(waiter) = waiter {
            let _ = waiter.tx.send(outcome);
        }
    }

    /// Hands a read outcome to its waiter, requeueing data nobody received.
    fn deliver_read(&self, tx: oneshot::Sender<ReadOutcome>, outcome: ReadOutcome) {
        if let Err(Ok(Some(message))) = tx.send(outcome) {
            trace!(len = message.len(), "Reader gone, requeueing message");
            self.endpoint.unread(message).fire();
        }
    }

    /// Resolves both waiters and closes the endpoint.
    fn close_with(&self, read: impl FnOnce() -> ReadOutcome, write: impl FnOnce() -> Error) {
        let reader = self.reader.lock().take();
        let writer = self.writer.lock().take();

        self.endpoint.close();

        if let Some(waiter) = reader {
            let _ = waiter.tx.send(read());
        }
        if let Some(waiter) = writer {
            let _ = waiter.tx.send(Err(write()));
        }
    }
}

// ============================================================================
// Pending Operations
// ============================================================================

/// A registered read, cleaned up if the caller stops waiting.
struct PendingRead<'a> {
    shared: &'a Shared,
    ticket: u64,
    rx: Option<oneshot::Receiver<ReadOutcome>>,
}

impl PendingRead<'_> {
    async fn wait(&mut self) -> ReadOutcome {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::invariant_violation("read waiter polled after completion"));
        };
        let outcome = rx.await;
        self.rx = None;
        outcome.unwrap_or_else(|_| Err(self.shared.closed_error()))
    }
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };

        {
            let mut reader = self.shared.reader.lock();
            if reader.take_ticket(self.ticket).is_some() {
                self.shared.endpoint.set_readable(None);
                trace!("Abandoned read waiter cleared");
                return;
            }
        }

        // Resolved but never observed.
        if let Ok(Ok(Some(message))) = rx.try_recv() {
            trace!(len = message.len(), "Requeueing message of abandoned read");
            self.shared.endpoint.unread(message).fire();
        }
    }
}

/// A registered write, withdrawn if the caller stops waiting.
struct PendingWrite<'a> {
    shared: &'a Shared,
    ticket: u64,
    rx: Option<oneshot::Receiver<WriteOutcome>>,
}

impl PendingWrite<'_> {
    async fn wait(&mut self) -> WriteOutcome {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::invariant_violation("write waiter polled after completion"));
        };
        let outcome = rx.await;
        self.rx = None;
        outcome.unwrap_or_else(|_| Err(self.shared.closed_error()))
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if self.rx.take().is_none() {
            return;
        }

        let mut writer = self.shared.writer.lock();
        if writer.take_ticket(self.ticket).is_some() {
            self.shared.endpoint.set_writable(None);
            trace!("Abandoned write waiter cleared");
        }
    }
}

// ============================================================================
// Ipc
// ============================================================================

/// Async message channel over one [`Endpoint`].
///
/// Cloning yields another handle to the same bridge and waiter slots.
///
/// # Example
///
/// ```
/// use worklet_host::transport::{Ipc, ReadinessChannel};
///
/// # tokio_test::block_on(async {
/// let (a, b) = ReadinessChannel::pair(8);
/// let (a, b) = (Ipc::new(a), Ipc::new(b));
///
/// a.write(vec![1, 2]).await?;
/// assert_eq!(b.read().await?, Some(vec![1, 2]));
///
/// a.close();
/// assert_eq!(b.read().await?, None);
/// # Ok::<(), worklet_host::Error>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct Ipc {
    shared: Arc<Shared>,
}

impl fmt::Debug for Ipc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ipc")
            .field("endpoint", &self.shared.endpoint)
            .field("terminated", &self.shared.is_terminated())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Ipc - Construction
// ============================================================================

impl Ipc {
    /// Wraps an endpoint.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                reader: Mutex::new(WaiterSlot::new()),
                writer: Mutex::new(WaiterSlot::new()),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    fn readable_callback(&self) -> ReadinessCallback {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Arc::new(move |_| {
            if let Some(shared) = shared.upgrade() {
                shared.on_readable();
            }
        })
    }

    fn writable_callback(&self) -> ReadinessCallback {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Arc::new(move |_| {
            if let Some(shared) = shared.upgrade() {
                shared.on_writable();
            }
        })
    }
}

// ============================================================================
// Ipc - Byte Operations
// ============================================================================

impl Ipc {
    /// Reads the next message.
    ///
    /// Returns `Ok(None)` at end of stream.
    ///
    /// # Errors
    ///
    /// - [`Error::ConcurrentAccess`] if another read is already waiting
    /// - [`Error::Terminated`] if the host has terminated
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        self.shared.check_terminated()?;

        let (ticket, rx) = {
            let mut reader = self.shared.reader.lock();
            if reader.is_pending() {
                return Err(Error::concurrent_access(Direction::Read));
            }

            let (attempt, notifications) = self.shared.endpoint.try_read_deferred();
            let immediate = match attempt {
                TryRead::Data(message) => Some(Ok(Some(message))),
                TryRead::Closed => Some(self.shared.end_of_stream()),
                TryRead::Empty => None,
            };

            if let Some(outcome) = immediate {
                drop(reader);
                notifications.fire();
                return outcome;
            }

            reader.register(())
        };

        trace!("Read waiting for data");
        let mut pending = PendingRead {
            shared: &self.shared,
            ticket,
            rx: Some(rx),
        };
        self.shared
            .endpoint
            .set_readable(Some(self.readable_callback()));
        pending.wait().await
    }

    /// Writes one message, waiting while the peer's queue is full.
    ///
    /// # Errors
    ///
    /// - [`Error::ConcurrentAccess`] if another write is already waiting
    /// - [`Error::ChannelClosed`] if the channel is closed
    /// - [`Error::Terminated`] if the host has terminated
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.shared.check_terminated()?;

        let (ticket, rx) = {
            let mut writer = self.shared.writer.lock();
            if writer.is_pending() {
                return Err(Error::concurrent_access(Direction::Write));
            }

            let (attempt, notifications) = self.shared.endpoint.try_write_deferred(&data);
            let immediate = match attempt {
                TryWrite::Written => Some(Ok(())),
                TryWrite::Closed => Some(Err(self.shared.closed_error())),
                TryWrite::Full => None,
            };

            if let Some(outcome) = immediate {
                drop(writer);
                notifications.fire();
                return outcome;
            }

            writer.register(data)
        };

        trace!("Write waiting for capacity");
        let mut pending = PendingWrite {
            shared: &self.shared,
            ticket,
            rx: Some(rx),
        };
        self.shared
            .endpoint
            .set_writable(Some(self.writable_callback()));
        pending.wait().await
    }

    /// Writes one message only if it can be enqueued immediately.
    ///
    /// Returns `Ok(false)` when the peer's queue is full or a write is
    /// already waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] if the channel is closed
    /// - [`Error::Terminated`] if the host has terminated
    pub fn try_write(&self, data: &[u8]) -> Result<bool> {
        self.shared.check_terminated()?;

        let (attempt, notifications) = {
            let writer = self.shared.writer.lock();
            if writer.is_pending() {
                return Ok(false);
            }
            self.shared.endpoint.try_write_deferred(data)
        };
        notifications.fire();

        match attempt {
            TryWrite::Written => Ok(true),
            TryWrite::Full => Ok(false),
            TryWrite::Closed => Err(self.shared.closed_error()),
        }
    }

    /// Closes the channel.
    ///
    /// A waiting read resolves with end of stream, a waiting write with
    /// [`Error::ChannelClosed`]. Queued messages are dropped. Idempotent.
    pub fn close(&self) {
        debug!("Closing channel");
        self.shared
            .close_with(|| Ok(None), || Error::ChannelClosed);
    }

    /// Closes the channel permanently on host termination.
    ///
    /// Waiters and every later call fail with [`Error::Terminated`].
    pub(crate) fn shutdown(&self) {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Shutting down channel");
        self.shared
            .close_with(|| Err(Error::Terminated), || Error::Terminated);
    }

    /// Returns `true` once this end has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.endpoint.is_closed()
    }

    /// Returns `true` if a caller is waiting in `direction`.
    #[must_use]
    pub fn has_waiter(&self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.shared.reader.lock().is_pending(),
            Direction::Write => self.shared.writer.lock().is_pending(),
        }
    }
}

// ============================================================================
// Ipc - Text and Streams
// ============================================================================

impl Ipc {
    /// Reads the next message as text.
    ///
    /// # Errors
    ///
    /// Same as [`Ipc::read`], plus [`Error::Decode`] for invalid text.
    pub async fn read_text(&self, encoding: TextEncoding) -> Result<Option<String>> {
        match self.read().await? {
            Some(bytes) => encoding.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Writes `text` encoded with `encoding`.
    ///
    /// # Errors
    ///
    /// Same as [`Ipc::write`], plus [`Error::Decode`] for unmappable text.
    pub async fn write_text(&self, text: &str, encoding: TextEncoding) -> Result<()> {
        self.write(encoding.encode(text)?).await
    }

    /// Converts this handle into a stream of messages.
    ///
    /// The stream ends at end of stream, or after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
        stream::unfold(Some(self), |state| async move {
            let ipc = state?;
            match ipc.read().await {
                Ok(Some(message)) => Some((Ok(message), Some(ipc))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::StreamExt;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    use crate::transport::ReadinessChannel;

    fn pair(capacity: usize) -> (Ipc, Ipc) {
        let (a, b) = ReadinessChannel::pair(capacity);
        (Ipc::new(a), Ipc::new(b))
    }

    #[tokio::test]
    async fn test_read_returns_queued_message() {
        let (a, b) = pair(4);
        a.write(b"hello".to_vec()).await.unwrap();
        assert_eq!(b.read().await.unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_read_wakes_on_write() {
        let (a, b) = pair(4);
        let mut read = task::spawn(b.read());
        assert_pending!(read.poll());
        assert!(b.has_waiter(Direction::Read));

        assert!(a.try_write(b"late").unwrap());
        assert!(read.is_woken());
        let message = assert_ready!(read.poll()).unwrap();
        assert_eq!(message, Some(b"late".to_vec()));
        assert!(!b.has_waiter(Direction::Read));
    }

    #[test]
    fn test_second_reader_is_rejected() {
        let (_a, b) = pair(4);
        let mut first = task::spawn(b.read());
        assert_pending!(first.poll());

        let mut second = task::spawn(b.read());
        let err = assert_ready!(second.poll()).unwrap_err();
        assert!(matches!(
            err,
            Error::ConcurrentAccess {
                direction: Direction::Read
            }
        ));
        assert_pending!(first.poll());
    }

    #[test]
    fn test_write_waits_for_capacity() {
        let (a, b) = pair(1);
        assert!(a.try_write(b"1").unwrap());

        let mut write = task::spawn(a.write(b"2".to_vec()));
        assert_pending!(write.poll());

        let mut second = task::spawn(a.write(b"3".to_vec()));
        assert!(assert_ready!(second.poll()).unwrap_err().is_caller_misuse());

        let mut read = task::spawn(b.read());
        assert_eq!(assert_ready!(read.poll()).unwrap(), Some(b"1".to_vec()));
        assert!(write.is_woken());
        assert_ready!(write.poll()).unwrap();

        let mut read = task::spawn(b.read());
        assert_eq!(assert_ready!(read.poll()).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_close_resolves_waiters() {
        let (a, b) = pair(1);
        assert!(a.try_write(b"fill").unwrap());

        let mut read = task::spawn(a.read());
        assert_pending!(read.poll());
        let mut write = task::spawn(a.write(b"blocked".to_vec()));
        assert_pending!(write.poll());

        a.close();
        a.close();

        assert_eq!(assert_ready!(read.poll()).unwrap(), None);
        assert!(matches!(
            assert_ready!(write.poll()).unwrap_err(),
            Error::ChannelClosed
        ));
        assert!(b.try_write(b"x").unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_drains_then_ends() {
        let (a, b) = pair(4);
        a.write(b"last".to_vec()).await.unwrap();
        a.close();

        assert_eq!(b.read().await.unwrap(), Some(b"last".to_vec()));
        assert_eq!(b.read().await.unwrap(), None);
    }

    #[test]
    fn test_shutdown_fails_waiters_and_later_calls() {
        let (a, _b) = pair(4);
        let mut read = task::spawn(a.read());
        assert_pending!(read.poll());

        a.shutdown();

        assert!(matches!(
            assert_ready!(read.poll()).unwrap_err(),
            Error::Terminated
        ));
        assert!(matches!(a.try_write(b"x"), Err(Error::Terminated)));
    }

    #[test]
    fn test_dropped_read_clears_waiter() {
        let (a, b) = pair(4);
        let mut read = task::spawn(b.read());
        assert_pending!(read.poll());
        drop(read);
        assert!(!b.has_waiter(Direction::Read));

        assert!(a.try_write(b"kept").unwrap());
        let mut read = task::spawn(b.read());
        assert_eq!(assert_ready!(read.poll()).unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn test_dropped_read_requeues_delivered_message() {
        let (a, b) = pair(4);
        let mut read = task::spawn(b.read());
        assert_pending!(read.poll());

        assert!(a.try_write(b"first").unwrap());
        assert!(a.try_write(b"second").unwrap());
        drop(read);

        let mut read = task::spawn(b.read());
        assert_eq!(assert_ready!(read.poll()).unwrap(), Some(b"first".to_vec()));
        let mut read = task::spawn(b.read());
        assert_eq!(assert_ready!(read.poll()).unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_text_helpers() {
        let (a, b) = pair(4);
        a.write_text("héllo", TextEncoding::Utf16Le).await.unwrap();
        let text = b.read_text(TextEncoding::Utf16Le).await.unwrap();
        assert_eq!(text.as_deref(), Some("héllo"));
    }

    #[tokio::test]
    async fn test_stream_ends_at_close() {
        let (a, b) = pair(4);
        a.write(vec![1]).await.unwrap();
        a.write(vec![2]).await.unwrap();
        a.close();

        let messages: Vec<_> = b.into_stream().map(|m| m.unwrap()).collect().await;
        assert_eq!(messages, vec![vec![1], vec![2]]);
    }
}
