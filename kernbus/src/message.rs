//! Kernel message envelope and the per-connection inbound queue.
//!
//! A [`KernelMessage`] is the broker's reference-counted wrapper around a
//! user-supplied message. It is immutable after enqueue; a broadcast shares
//! one allocation across every recipient queue instead of copying.
//!
//! The [`MessageQueue`] is a FIFO with waker-based async notification:
//! `recv()` resolves as soon as a message is enqueued, and closing the
//! queue wakes every blocked receiver with `ConnectionClosed` instead of
//! letting them hang.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;

use crate::error::{BrokerError, Result};
use crate::names::name_is_valid;
use crate::notify::Notification;
use crate::types::limits::{MAX_PAYLOAD_SIZE, MAX_QUEUE_DEPTH, MAX_REPLY_DEADLINE};
use crate::types::{ConnectionId, MessageId};

bitflags! {
    /// Control flags carried by a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u64 {
        /// Sender expects a reply correlated by cookie.
        const EXPECT_REPLY = 1 << 0;

        /// Broker-synthesized notification. User messages never carry
        /// this; the transport path is otherwise identical.
        const SYNTHETIC = 1 << 1;
    }
}

/// Where a message is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Unicast to a connection id.
    Connection(ConnectionId),
    /// Unicast to the current owner of a well-known name.
    Name(String),
    /// Every eligible active connection on the bus except the sender.
    Broadcast,
}

/// Payload of a kernel message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// Opaque user bytes, size-validated by the wire-format layer.
    User(Bytes),
    /// A broker-synthesized notification body.
    Notification(Notification),
}

/// A user-supplied message as handed over by the wire-format layer.
///
/// The wire layer is responsible for structural size validation; the broker
/// validates only the addressing fields and the deadline before wrapping
/// the draft into a [`KernelMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Addressing: connection id, well-known name, or broadcast.
    pub destination: Destination,
    /// Sender-chosen correlation cookie.
    pub cookie: u64,
    /// Cookie of the request this message replies to, or 0.
    pub cookie_reply: u64,
    /// Control flags.
    pub flags: MessageFlags,
    /// Deadline for the expected reply, relative to the send.
    pub reply_deadline: Option<Duration>,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Convenience constructor for a plain unicast message.
    pub fn to_connection(dst: ConnectionId, cookie: u64, payload: Bytes) -> Self {
        Self {
            destination: Destination::Connection(dst),
            cookie,
            cookie_reply: 0,
            flags: MessageFlags::empty(),
            reply_deadline: None,
            payload,
        }
    }

    /// Convenience constructor for a name-addressed message.
    pub fn to_name(name: impl Into<String>, cookie: u64, payload: Bytes) -> Self {
        Self {
            destination: Destination::Name(name.into()),
            cookie,
            cookie_reply: 0,
            flags: MessageFlags::empty(),
            reply_deadline: None,
            payload,
        }
    }

    /// Convenience constructor for a broadcast.
    pub fn broadcast(cookie: u64, payload: Bytes) -> Self {
        Self {
            destination: Destination::Broadcast,
            cookie,
            cookie_reply: 0,
            flags: MessageFlags::empty(),
            reply_deadline: None,
            payload,
        }
    }

    /// Mark this message as expecting a reply within `deadline`.
    pub fn expecting_reply(mut self, deadline: Duration) -> Self {
        self.flags |= MessageFlags::EXPECT_REPLY;
        self.reply_deadline = Some(deadline);
        self
    }

    /// Mark this message as a reply to `cookie`.
    pub fn replying_to(mut self, cookie: u64) -> Self {
        self.cookie_reply = cookie;
        self
    }
}

/// The broker's internal, reference-counted message envelope.
///
/// Enqueued on at most one queue at a time; a broadcast is shared by
/// reference across queues, and each queue slot counts as one reference.
/// Consumption pops the slot and hands that reference to the receiver.
#[derive(Debug)]
pub struct KernelMessage {
    /// Message id, monotonic per bus.
    pub id: MessageId,
    /// Sending connection, or [`ConnectionId::KERNEL`] for notifications.
    pub src: ConnectionId,
    /// Addressing as validated at send time.
    pub destination: Destination,
    /// Sender-chosen correlation cookie.
    pub cookie: u64,
    /// Cookie of the request this message replies to, or 0.
    pub cookie_reply: u64,
    /// Control flags.
    pub flags: MessageFlags,
    /// Deadline for the expected reply, relative to the send.
    pub reply_deadline: Option<Duration>,
    /// Payload.
    pub payload: MessagePayload,
}

impl KernelMessage {
    /// Wrap a user draft, validating addressing fields and deadline.
    ///
    /// Structural size of the payload was already validated by the wire
    /// layer; only the broker-relevant bounds are checked here.
    pub(crate) fn from_user(id: MessageId, src: ConnectionId, msg: Message) -> Result<Self> {
        if msg.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(BrokerError::InvalidArgument(format!(
                "payload of {} bytes exceeds {} bytes",
                msg.payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        if let Some(deadline) = msg.reply_deadline {
            if deadline > MAX_REPLY_DEADLINE {
                return Err(BrokerError::InvalidArgument(format!(
                    "reply deadline {deadline:?} exceeds {MAX_REPLY_DEADLINE:?}"
                )));
            }
            if !msg.flags.contains(MessageFlags::EXPECT_REPLY) {
                return Err(BrokerError::InvalidArgument(
                    "reply deadline without EXPECT_REPLY".into(),
                ));
            }
        }
        if msg.flags.contains(MessageFlags::SYNTHETIC) {
            return Err(BrokerError::InvalidArgument(
                "SYNTHETIC is reserved for broker-generated messages".into(),
            ));
        }
        match &msg.destination {
            Destination::Name(name) => {
                if !name_is_valid(name) {
                    return Err(BrokerError::InvalidArgument(format!(
                        "malformed destination name '{name}'"
                    )));
                }
            }
            Destination::Broadcast => {
                if msg.flags.contains(MessageFlags::EXPECT_REPLY) {
                    return Err(BrokerError::InvalidArgument(
                        "broadcast cannot expect a reply".into(),
                    ));
                }
                if msg.cookie_reply != 0 {
                    return Err(BrokerError::InvalidArgument(
                        "broadcast cannot be a reply".into(),
                    ));
                }
            }
            Destination::Connection(_) => {}
        }
        if msg.cookie_reply != 0 && msg.flags.contains(MessageFlags::EXPECT_REPLY) {
            return Err(BrokerError::InvalidArgument(
                "a reply cannot itself expect a reply".into(),
            ));
        }
        Ok(Self {
            id,
            src,
            destination: msg.destination,
            cookie: msg.cookie,
            cookie_reply: msg.cookie_reply,
            flags: msg.flags,
            reply_deadline: msg.reply_deadline,
            payload: MessagePayload::User(msg.payload),
        })
    }

    /// Build a broker-synthesized notification message.
    pub(crate) fn synthetic(
        id: MessageId,
        destination: Destination,
        note: Notification,
    ) -> Self {
        Self {
            id,
            src: ConnectionId::KERNEL,
            destination,
            cookie: 0,
            cookie_reply: 0,
            flags: MessageFlags::SYNTHETIC,
            reply_deadline: None,
            payload: MessagePayload::Notification(note),
        }
    }

    /// Whether this message was synthesized by the broker.
    pub fn is_synthetic(&self) -> bool {
        self.flags.contains(MessageFlags::SYNTHETIC)
    }

    /// The notification body, if this is a synthesized message.
    pub fn notification(&self) -> Option<&Notification> {
        match &self.payload {
            MessagePayload::Notification(note) => Some(note),
            MessagePayload::User(_) => None,
        }
    }

    /// The user payload bytes, if this is a user message.
    pub fn user_payload(&self) -> Option<&Bytes> {
        match &self.payload {
            MessagePayload::User(bytes) => Some(bytes),
            MessagePayload::Notification(_) => None,
        }
    }
}

#[derive(Debug)]
struct QueueInner {
    queue: VecDeque<Arc<KernelMessage>>,
    wakers: Vec<Waker>,
    closed: bool,
    enqueued: u64,
    dropped: u64,
}

/// Per-connection inbound FIFO with async notification.
///
/// Delivery order is FIFO relative to enqueue completion; concurrent
/// senders may interleave. The queue's own lock is the only lock taken by
/// push/pop, and it is never held across a wake.
#[derive(Debug)]
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    /// Create an empty, open queue.
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                wakers: Vec::new(),
                closed: false,
                enqueued: 0,
                dropped: 0,
            }),
        }
    }

    /// Enqueue a message, waking all blocked receivers.
    ///
    /// Fails with `ConnectionClosed` once the queue is closed and with
    /// `ResourceExhausted` when the depth limit is reached.
    pub(crate) fn push(&self, message: Arc<KernelMessage>) -> Result<()> {
        let wakers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                inner.dropped += 1;
                return Err(BrokerError::ConnectionClosed);
            }
            if inner.queue.len() >= MAX_QUEUE_DEPTH {
                inner.dropped += 1;
                return Err(BrokerError::ResourceExhausted(format!(
                    "queue depth limit of {MAX_QUEUE_DEPTH} reached"
                )));
            }
            inner.queue.push_back(message);
            inner.enqueued += 1;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    /// Dequeue the oldest message without blocking.
    pub fn try_recv(&self) -> Option<Arc<KernelMessage>> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Wait for the oldest message.
    ///
    /// Resolves with `ConnectionClosed` once the queue is closed, whether
    /// the close happened before or during the wait.
    pub fn recv(&self) -> RecvFuture<'_> {
        RecvFuture { queue: self }
    }

    /// Close and drain the queue, waking every blocked receiver.
    ///
    /// Idempotent. Returns the number of messages dropped by the drain.
    pub(crate) fn close(&self) -> usize {
        let (drained, wakers) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return 0;
            }
            inner.closed = true;
            let drained = inner.queue.len();
            inner.dropped += drained as u64;
            inner.queue.clear();
            (drained, std::mem::take(&mut inner.wakers))
        };
        for waker in wakers {
            waker.wake();
        }
        drained
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Total messages ever enqueued.
    pub fn enqueued(&self) -> u64 {
        self.inner.lock().unwrap().enqueued
    }

    /// Messages rejected or discarded (closed queue, depth limit, drain).
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }
}

/// Future returned by [`MessageQueue::recv`].
pub struct RecvFuture<'a> {
    queue: &'a MessageQueue,
}

impl Future for RecvFuture<'_> {
    type Output = Result<Arc<KernelMessage>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.queue.inner.lock().unwrap();

        if let Some(message) = inner.queue.pop_front() {
            return Poll::Ready(Ok(message));
        }
        if inner.closed {
            return Poll::Ready(Err(BrokerError::ConnectionClosed));
        }
        inner.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}
