//! Transport integration tests: unicast, name-addressed, and broadcast
//! delivery, queue backpressure, async receive wakeups, and the reply
//! deadline machinery.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use kernbus::{
    limits, BrokerError, Message, NameFlags, Notification, PolicyAccess, PolicyRule,
    PolicySubject,
};

use common::{bus_fixture, creds, drain, open_active};

const NAME: &str = "com.example.Echo";

#[test]
fn test_unicast_by_connection_id() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    drain(&b);

    let payload = Bytes::from_static(b"ping");
    a.send(Message::to_connection(b.id(), 7, payload.clone()))
        .unwrap();

    let msg = b.queue().try_recv().unwrap();
    assert_eq!(msg.src, a.id());
    assert_eq!(msg.cookie, 7);
    assert_eq!(msg.user_payload(), Some(&payload));
    assert!(!msg.is_synthetic());
}

#[test]
fn test_unicast_preserves_fifo_order() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    drain(&b);

    for cookie in 1..=5 {
        a.send(Message::to_connection(b.id(), cookie, Bytes::new()))
            .unwrap();
    }
    for cookie in 1..=5 {
        assert_eq!(b.queue().try_recv().unwrap().cookie, cookie);
    }
}

#[test]
fn test_send_to_name_reaches_current_owner() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    let c = open_active(&fx);

    b.name_acquire(NAME, NameFlags::ALLOW_QUEUEING).unwrap();
    c.name_acquire(NAME, NameFlags::QUEUE).unwrap();
    drain(&b);
    drain(&c);

    a.send(Message::to_name(NAME, 1, Bytes::from_static(b"one")))
        .unwrap();
    assert_eq!(b.queue().try_recv().unwrap().cookie, 1);
    assert!(c.queue().try_recv().is_none());

    // After a hand-off the same address reaches the successor.
    b.name_release(NAME).unwrap();
    drain(&c);
    a.send(Message::to_name(NAME, 2, Bytes::from_static(b"two")))
        .unwrap();
    assert_eq!(c.queue().try_recv().unwrap().cookie, 2);
}

#[test]
fn test_send_to_unknown_destination() {
    let fx = bus_fixture();
    let a = open_active(&fx);

    let err = a
        .send(Message::to_name("com.example.Nobody", 1, Bytes::new()))
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));

    let err = a
        .send(Message::to_connection(kernbus::ConnectionId::new(999), 1, Bytes::new()))
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[test]
fn test_broadcast_excludes_sender() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    let c = open_active(&fx);
    drain(&a);
    drain(&b);
    drain(&c);

    a.send(Message::broadcast(9, Bytes::from_static(b"all")))
        .unwrap();

    assert!(a.queue().try_recv().is_none());
    let to_b = b.queue().try_recv().unwrap();
    let to_c = c.queue().try_recv().unwrap();
    assert_eq!(to_b.cookie, 9);
    // One shared envelope, not a copy per recipient.
    assert!(Arc::ptr_eq(&to_b, &to_c));
}

#[test]
fn test_broadcast_skips_unannounced_connections() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let endpoint = fx.bus.default_endpoint().unwrap();
    let silent = fx.broker.open_endpoint(&endpoint, creds()).unwrap();

    a.send(Message::broadcast(1, Bytes::new())).unwrap();
    assert!(silent.queue().try_recv().is_none());
}

#[test]
fn test_queue_backpressure_rejects_sender() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    drain(&b);

    for cookie in 0..limits::MAX_QUEUE_DEPTH as u64 {
        a.send(Message::to_connection(b.id(), cookie, Bytes::new()))
            .unwrap();
    }
    let err = a
        .send(Message::to_connection(b.id(), u64::MAX, Bytes::new()))
        .unwrap_err();
    assert!(matches!(err, BrokerError::ResourceExhausted(_)));
    assert_eq!(b.queue().len(), limits::MAX_QUEUE_DEPTH);

    // Consuming one message frees one slot.
    b.queue().try_recv().unwrap();
    a.send(Message::to_connection(b.id(), u64::MAX, Bytes::new()))
        .unwrap();
}

#[test]
fn test_oversized_payload_rejected() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);

    let payload = Bytes::from(vec![0u8; limits::MAX_PAYLOAD_SIZE + 1]);
    let err = a
        .send(Message::to_connection(b.id(), 1, payload))
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_recv_wakes_on_delivery() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    drain(&b);

    let receiver = {
        let b = Arc::clone(&b);
        tokio::spawn(async move { b.recv().await })
    };
    tokio::task::yield_now().await;

    a.send(Message::to_connection(b.id(), 42, Bytes::new()))
        .unwrap();
    let msg = receiver.await.unwrap().unwrap();
    assert_eq!(msg.cookie, 42);
}

#[tokio::test]
async fn test_blocked_recv_woken_by_close() {
    let fx = bus_fixture();
    let b = open_active(&fx);
    drain(&b);

    let receiver = {
        let b = Arc::clone(&b);
        tokio::spawn(async move { b.recv().await })
    };
    tokio::task::yield_now().await;

    b.close();
    let err = receiver.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionClosed));
}

#[test]
fn test_reply_cancels_pending_deadline() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    drain(&a);
    drain(&b);

    a.send(
        Message::to_connection(b.id(), 7, Bytes::from_static(b"req"))
            .expecting_reply(Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(a.pending_replies(), 1);

    let req = b.queue().try_recv().unwrap();
    b.send(
        Message::to_connection(a.id(), 100, Bytes::from_static(b"resp")).replying_to(req.cookie),
    )
    .unwrap();

    assert_eq!(a.pending_replies(), 0);
    let resp = a.queue().try_recv().unwrap();
    assert_eq!(resp.cookie_reply, 7);

    // The cancelled deadline never fires.
    assert_eq!(a.scan_reply_deadlines(Instant::now() + Duration::from_secs(10)), 0);
    assert!(a.queue().try_recv().is_none());
}

#[test]
fn test_reply_timeout_fires_exactly_once() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    drain(&a);

    a.send(
        Message::to_connection(b.id(), 7, Bytes::new())
            .expecting_reply(Duration::from_millis(50)),
    )
    .unwrap();

    // Before the deadline nothing happens.
    assert_eq!(a.scan_reply_deadlines(Instant::now()), 0);
    assert!(a.queue().try_recv().is_none());

    let late = Instant::now() + Duration::from_millis(100);
    assert_eq!(a.scan_reply_deadlines(late), 1);
    let msg = a.queue().try_recv().unwrap();
    assert!(msg.is_synthetic());
    assert_eq!(
        msg.notification(),
        Some(&Notification::ReplyTimeout {
            peer: b.id(),
            cookie: 7,
        })
    );
    assert_eq!(a.pending_replies(), 0);

    // A second scan past the deadline finds nothing to report.
    assert_eq!(a.scan_reply_deadlines(late + Duration::from_secs(1)), 0);
    assert!(a.queue().try_recv().is_none());
}

#[test]
fn test_deadline_requires_expect_reply() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);

    let mut msg = Message::to_connection(b.id(), 1, Bytes::new());
    msg.reply_deadline = Some(Duration::from_secs(1));
    let err = a.send(msg).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidArgument(_)));

    let err = a
        .send(
            Message::to_connection(b.id(), 1, Bytes::new())
                .expecting_reply(limits::MAX_REPLY_DEADLINE + Duration::from_secs(1)),
        )
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidArgument(_)));
}

#[test]
fn test_reply_dead_when_peer_closes() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    drain(&a);

    a.send(
        Message::to_connection(b.id(), 7, Bytes::new())
            .expecting_reply(Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(a.pending_replies(), 1);

    let b_id = b.id();
    b.close();

    assert_eq!(a.pending_replies(), 0);
    let msg = a.queue().try_recv().unwrap();
    assert_eq!(
        msg.notification(),
        Some(&Notification::ReplyDead {
            peer: b_id,
            cookie: 7,
        })
    );
    // The id-owner-changed broadcast follows the reply-dead notice.
    let msg = a.queue().try_recv().unwrap();
    assert_eq!(msg.notification(), Some(&Notification::IdRemoved(b_id)));
}

#[tokio::test]
async fn test_reply_scanner_task_delivers_timeouts() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    drain(&a);

    a.spawn_reply_scanner(Duration::from_millis(10));
    a.send(
        Message::to_connection(b.id(), 3, Bytes::new())
            .expecting_reply(Duration::from_millis(20)),
    )
    .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), a.recv())
        .await
        .expect("scanner never fired")
        .unwrap();
    assert_eq!(
        msg.notification(),
        Some(&Notification::ReplyTimeout {
            peer: b.id(),
            cookie: 3,
        })
    );
}

#[test]
fn test_policy_gates_name_addressed_sends() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    b.name_acquire(NAME, NameFlags::empty()).unwrap();

    // Loading policy on the shared endpoint flips it to default-deny.
    a.policy_load(vec![PolicyRule {
        subject: PolicySubject::World,
        name: NAME.to_string(),
        access: PolicyAccess::OWN | PolicyAccess::RECV,
    }])
    .unwrap();

    let err = a
        .send(Message::to_name(NAME, 1, Bytes::new()))
        .unwrap_err();
    assert!(matches!(err, BrokerError::PermissionDenied(_)));

    a.policy_load(vec![PolicyRule {
        subject: PolicySubject::World,
        name: NAME.to_string(),
        access: PolicyAccess::OWN | PolicyAccess::SEND | PolicyAccess::RECV,
    }])
    .unwrap();
    a.send(Message::to_name(NAME, 1, Bytes::new())).unwrap();

    // Sends addressed by connection id bypass name policy.
    a.send(Message::to_connection(b.id(), 2, Bytes::new()))
        .unwrap();
}

#[test]
fn test_send_requires_matching_endpoint() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let other = fx
        .broker
        .create_endpoint(&fx.bus, "side", 0o600, creds())
        .unwrap();

    let err = other.send(&a, Message::broadcast(1, Bytes::new())).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidArgument(_)));
}
