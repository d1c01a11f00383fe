//! Readiness-driven duplex message transport.
//!
//! A [`ReadinessChannel`] is a connected pair of [`Endpoint`]s exchanging
//! opaque byte messages over two bounded queues. Nothing in this module
//! blocks: reads and writes either complete immediately or report that the
//! caller must wait, and waiting is expressed by registering a readiness
//! callback that fires when the endpoint becomes readable or writable.
//!
//! # Notification Rules
//!
//! - `readable` fires when the peer enqueues a message, when either side
//!   closes, and once at registration if the endpoint is already readable.
//! - `writable` fires when the peer dequeues a message, when either side
//!   closes, and once at registration if the endpoint is already writable.
//! - Notifications may be spurious. Callbacks run on the thread that caused
//!   the notification, never while the channel lock is held.
//!
//! # Example
//!
//! ```
//! use worklet_host::transport::{ReadinessChannel, TryRead, TryWrite};
//!
//! let (host, runtime) = ReadinessChannel::pair(4);
//! assert_eq!(host.try_write(b"ping"), TryWrite::Written);
//! assert_eq!(runtime.try_read(), TryRead::Data(b"ping".to_vec()));
//! assert_eq!(runtime.try_read(), TryRead::Empty);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

// ============================================================================
// Constants
// ============================================================================

/// Queue capacity, in messages, used for every worklet channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Types
// ============================================================================

/// Readiness callback registered on an endpoint.
///
/// Receives the endpoint that became ready.
pub type ReadinessCallback = Arc<dyn Fn(&Endpoint) + Send + Sync>;

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRead {
    /// A message was dequeued.
    Data(Vec<u8>),
    /// Nothing queued yet.
    Empty,
    /// The endpoint is closed, or the peer closed and the queue is drained.
    Closed,
}

/// Outcome of a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryWrite {
    /// The message was enqueued.
    Written,
    /// The peer's queue is full.
    Full,
    /// Either side is closed.
    Closed,
}

/// Per-endpoint state.
#[derive(Default)]
struct Side {
    /// Messages waiting to be read by this endpoint.
    inbox: VecDeque<Vec<u8>>,
    /// Set once this endpoint has been closed.
    closed: bool,
    /// Fired when this endpoint becomes readable.
    readable: Option<ReadinessCallback>,
    /// Fired when this endpoint becomes writable.
    writable: Option<ReadinessCallback>,
}

/// State shared by both endpoints.
struct Shared {
    /// Maximum queued messages per direction.
    capacity: usize,
    /// Both sides, indexed by endpoint.
    sides: Mutex<[Side; 2]>,
}

// ============================================================================
// Notifications
// ============================================================================

/// Callbacks collected under the channel lock, fired after it is released.
#[must_use = "notifications must be fired"]
#[derive(Default)]
pub(crate) struct Notifications {
    pending: Vec<(ReadinessCallback, Endpoint)>,
}

impl Notifications {
    fn push(&mut self, callback: Option<&ReadinessCallback>, endpoint: Endpoint) {
        if let Some(callback) = callback {
            self.pending.push((Arc::clone(callback), endpoint));
        }
    }

    /// Invokes every collected callback.
    pub(crate) fn fire(self) {
        for (callback, endpoint) in self.pending {
            callback(&endpoint);
        }
    }
}

// ============================================================================
// ReadinessChannel
// ============================================================================

/// Factory for connected endpoint pairs.
pub struct ReadinessChannel;

impl ReadinessChannel {
    /// Creates a connected pair of endpoints.
    ///
    /// Each direction queues at most `capacity` messages (minimum 1).
    #[must_use]
    pub fn pair(capacity: usize) -> (Endpoint, Endpoint) {
        let shared = Arc::new(Shared {
            capacity: capacity.max(1),
            sides: Mutex::new([Side::default(), Side::default()]),
        });

        (
            Endpoint {
                shared: Arc::clone(&shared),
                index: 0,
            },
            Endpoint { shared, index: 1 },
        )
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// One end of a [`ReadinessChannel`].
///
/// Cloning yields another handle to the same end.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
    index: usize,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sides = self.shared.sides.lock();
        f.debug_struct("Endpoint")
            .field("index", &self.index)
            .field("queued", &sides[self.index].inbox.len())
            .field("closed", &sides[self.index].closed)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Endpoint - Public API
// ============================================================================

impl Endpoint {
    /// Dequeues the next message without blocking.
    pub fn try_read(&self) -> TryRead {
        let (outcome, notifications) = self.try_read_deferred();
        notifications.fire();
        outcome
    }

    /// Enqueues a message for the peer without blocking.
    pub fn try_write(&self, data: &[u8]) -> TryWrite {
        let (outcome, notifications) = self.try_write_deferred(data);
        notifications.fire();
        outcome
    }

    /// Registers (or clears, with `None`) the readable callback.
    ///
    /// If the endpoint is already readable the callback fires immediately,
    /// so a registration racing with an incoming message never misses it.
    pub fn set_readable(&self, callback: Option<ReadinessCallback>) {
        let ready = {
            let mut sides = self.shared.sides.lock();
            let ready = {
                let me = &sides[self.index];
                let peer = &sides[self.peer()];
                me.closed || peer.closed || !me.inbox.is_empty()
            };
            sides[self.index].readable = callback.clone();
            ready
        };

        if ready && let Some(callback) = callback {
            callback(self);
        }
    }

    /// Registers (or clears, with `None`) the writable callback.
    ///
    /// If the endpoint is already writable the callback fires immediately.
    pub fn set_writable(&self, callback: Option<ReadinessCallback>) {
        let ready = {
            let mut sides = self.shared.sides.lock();
            let ready = {
                let me = &sides[self.index];
                let peer = &sides[self.peer()];
                me.closed || peer.closed || peer.inbox.len() < self.shared.capacity
            };
            sides[self.index].writable = callback.clone();
            ready
        };

        if ready && let Some(callback) = callback {
            callback(self);
        }
    }

    /// Closes this endpoint and drops every message queued for it.
    ///
    /// Both sides are notified. Idempotent.
    pub fn close(&self) {
        let mut notifications = Notifications::default();
        {
            let mut sides = self.shared.sides.lock();
            if sides[self.index].closed {
                return;
            }

            let me = &mut sides[self.index];
            me.closed = true;
            let dropped = me.inbox.len();
            me.inbox.clear();
            trace!(endpoint = self.index, dropped, "Endpoint closed");

            let me = &sides[self.index];
            notifications.push(me.readable.as_ref(), self.clone());
            notifications.push(me.writable.as_ref(), self.clone());

            let peer = &sides[self.peer()];
            let peer_endpoint = self.peer_endpoint();
            notifications.push(peer.readable.as_ref(), peer_endpoint.clone());
            notifications.push(peer.writable.as_ref(), peer_endpoint);
        }
        notifications.fire();
    }

    /// Returns `true` if this endpoint has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.sides.lock()[self.index].closed
    }

    /// Returns `true` if the peer endpoint has been closed.
    #[inline]
    #[must_use]
    pub fn is_peer_closed(&self) -> bool {
        self.shared.sides.lock()[self.peer()].closed
    }

    /// Returns the number of messages queued for this endpoint.
    #[inline]
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.sides.lock()[self.index].inbox.len()
    }

    /// Returns the per-direction queue capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

// ============================================================================
// Endpoint - Internal API
// ============================================================================

impl Endpoint {
    /// Non-blocking read whose notifications are fired by the caller.
    pub(crate) fn try_read_deferred(&self) -> (TryRead, Notifications) {
        let mut notifications = Notifications::default();
        let mut sides = self.shared.sides.lock();
        let peer_index = self.peer();

        if sides[self.index].closed {
            return (TryRead::Closed, notifications);
        }

        if let Some(message) = sides[self.index].inbox.pop_front() {
            notifications.push(sides[peer_index].writable.as_ref(), self.peer_endpoint());
            return (TryRead::Data(message), notifications);
        }

        if sides[peer_index].closed {
            return (TryRead::Closed, notifications);
        }

        (TryRead::Empty, notifications)
    }

    /// Non-blocking write whose notifications are fired by the caller.
    pub(crate) fn try_write_deferred(&self, data: &[u8]) -> (TryWrite, Notifications) {
        let mut notifications = Notifications::default();
        let mut sides = self.shared.sides.lock();
        let peer_index = self.peer();

        if sides[self.index].closed || sides[peer_index].closed {
            return (TryWrite::Closed, notifications);
        }

        if sides[peer_index].inbox.len() >= self.shared.capacity {
            return (TryWrite::Full, notifications);
        }

        sides[peer_index].inbox.push_back(data.to_vec());
        notifications.push(sides[peer_index].readable.as_ref(), self.peer_endpoint());
        (TryWrite::Written, notifications)
    }

    /// Puts a message back at the front of this endpoint's queue.
    ///
    /// Used when a dequeued message could not be handed to its reader.
    /// Dropped if the endpoint is closed.
    pub(crate) fn unread(&self, message: Vec<u8>) -> Notifications {
        let mut notifications = Notifications::default();
        let mut sides = self.shared.sides.lock();
        let me = &mut sides[self.index];

        if me.closed {
            return notifications;
        }

        me.inbox.push_front(message);
        notifications.push(me.readable.as_ref(), self.clone());
        notifications
    }

    #[inline]
    fn peer(&self) -> usize {
        1 - self.index
    }

    fn peer_endpoint(&self) -> Endpoint {
        Endpoint {
            shared: Arc::clone(&self.shared),
            index: self.peer(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, ReadinessCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&count);
        let callback: ReadinessCallback = Arc::new(move |_| {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn test_messages_flow_in_order() {
        let (a, b) = ReadinessChannel::pair(8);
        for i in 0..5u8 {
            assert_eq!(a.try_write(&[i]), TryWrite::Written);
        }
        for i in 0..5u8 {
            assert_eq!(b.try_read(), TryRead::Data(vec![i]));
        }
        assert_eq!(b.try_read(), TryRead::Empty);
    }

    #[test]
    fn test_directions_are_independent() {
        let (a, b) = ReadinessChannel::pair(8);
        a.try_write(b"to-b");
        b.try_write(b"to-a");
        assert_eq!(a.try_read(), TryRead::Data(b"to-a".to_vec()));
        assert_eq!(b.try_read(), TryRead::Data(b"to-b".to_vec()));
    }

    #[test]
    fn test_full_queue_reports_backpressure() {
        let (a, b) = ReadinessChannel::pair(2);
        assert_eq!(a.try_write(b"1"), TryWrite::Written);
        assert_eq!(a.try_write(b"2"), TryWrite::Written);
        assert_eq!(a.try_write(b"3"), TryWrite::Full);

        b.try_read();
        assert_eq!(a.try_write(b"3"), TryWrite::Written);
    }

    #[test]
    fn test_readable_fires_on_write() {
        let (a, b) = ReadinessChannel::pair(4);
        let (count, callback) = counter();

        b.set_readable(Some(callback));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        a.try_write(b"x");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_readable_fires_at_registration_when_data_waiting() {
        let (a, b) = ReadinessChannel::pair(4);
        a.try_write(b"x");

        let (count, callback) = counter();
        b.set_readable(Some(callback));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_writable_fires_when_peer_drains() {
        let (a, b) = ReadinessChannel::pair(1);
        a.try_write(b"x");

        let (count, callback) = counter();
        a.set_writable(Some(callback));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        b.try_read();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleared_callback_does_not_fire() {
        let (a, b) = ReadinessChannel::pair(4);
        let (count, callback) = counter();

        b.set_readable(Some(callback));
        b.set_readable(None);
        a.try_write(b"x");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_notifies_both_sides() {
        let (a, b) = ReadinessChannel::pair(4);
        let (readable, on_readable) = counter();
        let (writable, on_writable) = counter();

        b.set_readable(Some(on_readable));
        a.try_write(b"x");
        a.try_write(b"y");
        a.try_write(b"z");
        a.try_write(b"w");
        a.set_writable(Some(on_writable));
        let before = readable.load(Ordering::SeqCst);

        b.close();

        assert_eq!(readable.load(Ordering::SeqCst), before + 1);
        assert_eq!(writable.load(Ordering::SeqCst), 1);
        assert_eq!(b.try_read(), TryRead::Closed);
        assert_eq!(a.try_write(b"v"), TryWrite::Closed);
        assert_eq!(b.queued(), 0);
    }

    #[test]
    fn test_peer_close_drains_before_closed() {
        let (a, b) = ReadinessChannel::pair(4);
        a.try_write(b"last");
        a.close();

        assert!(b.is_peer_closed());
        assert_eq!(b.try_read(), TryRead::Data(b"last".to_vec()));
        assert_eq!(b.try_read(), TryRead::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (a, _b) = ReadinessChannel::pair(4);
        let (count, callback) = counter();
        a.set_readable(Some(callback));
        let registered = count.load(Ordering::SeqCst);

        a.close();
        a.close();
        assert_eq!(count.load(Ordering::SeqCst), registered + 1);
    }

    #[test]
    fn test_unread_restores_front() {
        let (a, b) = ReadinessChannel::pair(4);
        a.try_write(b"1");
        a.try_write(b"2");

        let TryRead::Data(first) = b.try_read() else {
            panic!("expected data");
        };
        b.unread(first).fire();

        assert_eq!(b.try_read(), TryRead::Data(b"1".to_vec()));
        assert_eq!(b.try_read(), TryRead::Data(b"2".to_vec()));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (a, _b) = ReadinessChannel::pair(0);
        assert_eq!(a.capacity(), 1);
    }
}
