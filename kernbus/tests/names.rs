//! Name registry integration tests: acquisition, replacement, the FIFO
//! wait queue, close-time release, and owner-change notifications.

mod common;

use kernbus::{
    AcquireOutcome, BrokerError, NameFlags, Notification, PolicyAccess, PolicyRule, PolicySubject,
};

use common::{bus_fixture, drain, open_active};

const NAME: &str = "com.example.Service";

#[test]
fn test_acquire_query_and_list() {
    let fx = bus_fixture();
    let a = open_active(&fx);

    let outcome = a.name_acquire(NAME, NameFlags::empty()).unwrap();
    assert_eq!(outcome, AcquireOutcome::Owner);

    let info = a.name_query(NAME).unwrap();
    assert_eq!(info.owner, a.id());
    assert_eq!(info.flags, NameFlags::empty());

    let listed = a.name_list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, NAME);
    assert_eq!(a.owned_names(), vec![NAME.to_string()]);
}

#[test]
fn test_malformed_names_are_rejected() {
    let fx = bus_fixture();
    let a = open_active(&fx);

    for name in ["", "nodots", "double..dot", ".leading", "com.1digit", "com.bad!char"] {
        let err = a.name_acquire(name, NameFlags::empty()).unwrap_err();
        assert!(
            matches!(err, BrokerError::InvalidArgument(_)),
            "expected rejection for {name:?}"
        );
    }

    let long = format!("com.{}", "x".repeat(300));
    assert!(a.name_acquire(&long, NameFlags::empty()).is_err());
}

#[test]
fn test_reacquire_updates_flags() {
    let fx = bus_fixture();
    let a = open_active(&fx);

    a.name_acquire(NAME, NameFlags::empty()).unwrap();
    let outcome = a
        .name_acquire(NAME, NameFlags::ALLOW_REPLACEMENT)
        .unwrap();
    assert_eq!(outcome, AcquireOutcome::AlreadyOwner);
    assert_eq!(a.name_query(NAME).unwrap().flags, NameFlags::ALLOW_REPLACEMENT);
}

#[test]
fn test_taken_name_without_queue_flag_fails_silently() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    a.name_acquire(NAME, NameFlags::empty()).unwrap();
    drain(&a);
    drain(&b);

    let err = b.name_acquire(NAME, NameFlags::empty()).unwrap_err();
    assert!(matches!(err, BrokerError::NameInUse(_)));

    // Ownership did not change, so no notification was broadcast.
    assert_eq!(drain(&a), 0);
    assert_eq!(drain(&b), 0);
    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, a.id());
}

#[test]
fn test_replacement_requires_consent_of_both_sides() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);

    // Owner does not allow replacement.
    a.name_acquire(NAME, NameFlags::empty()).unwrap();
    let err = b
        .name_acquire(NAME, NameFlags::REPLACE_EXISTING)
        .unwrap_err();
    assert!(matches!(err, BrokerError::NameInUse(_)));

    // Owner allows it, but the requester does not ask for it.
    a.name_acquire(NAME, NameFlags::ALLOW_REPLACEMENT).unwrap();
    let err = b.name_acquire(NAME, NameFlags::empty()).unwrap_err();
    assert!(matches!(err, BrokerError::NameInUse(_)));

    // Both sides agree.
    let outcome = b
        .name_acquire(NAME, NameFlags::REPLACE_EXISTING)
        .unwrap();
    assert_eq!(outcome, AcquireOutcome::Owner);
    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, b.id());
    assert!(a.owned_names().is_empty());
}

#[test]
fn test_displaced_owner_queues_only_with_queue_flag() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);

    a.name_acquire(NAME, NameFlags::ALLOW_REPLACEMENT | NameFlags::QUEUE)
        .unwrap();
    b.name_acquire(NAME, NameFlags::REPLACE_EXISTING | NameFlags::ALLOW_QUEUEING)
        .unwrap();

    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, b.id());
    assert_eq!(a.queued_names(), vec![NAME.to_string()]);

    // When the new owner releases, the displaced owner gets it back.
    b.name_release(NAME).unwrap();
    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, a.id());
}

#[test]
fn test_fifo_handoff_on_release() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    let c = open_active(&fx);

    a.name_acquire(NAME, NameFlags::ALLOW_QUEUEING).unwrap();
    assert_eq!(
        b.name_acquire(NAME, NameFlags::QUEUE).unwrap(),
        AcquireOutcome::Queued
    );
    assert_eq!(
        c.name_acquire(NAME, NameFlags::QUEUE).unwrap(),
        AcquireOutcome::Queued
    );

    a.name_release(NAME).unwrap();
    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, b.id());
    assert!(b.owned_names().contains(&NAME.to_string()));
    assert_eq!(c.queued_names(), vec![NAME.to_string()]);

    b.name_release(NAME).unwrap();
    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, c.id());

    // Last owner leaving with an empty queue removes the entry.
    c.name_release(NAME).unwrap();
    assert!(matches!(
        fx.bus.registry().query(NAME),
        Err(BrokerError::NotFound(_))
    ));
    assert!(fx.bus.registry().is_empty());
}

#[test]
fn test_queueing_requires_owner_consent() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);

    a.name_acquire(NAME, NameFlags::empty()).unwrap();
    let err = b.name_acquire(NAME, NameFlags::QUEUE).unwrap_err();
    assert!(matches!(err, BrokerError::NameInUse(_)));
}

#[test]
fn test_leaving_the_queue_is_silent() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);

    a.name_acquire(NAME, NameFlags::ALLOW_QUEUEING).unwrap();
    b.name_acquire(NAME, NameFlags::QUEUE).unwrap();
    drain(&a);
    drain(&b);

    b.name_release(NAME).unwrap();
    assert!(b.queued_names().is_empty());
    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, a.id());

    // Queue membership is not ownership; nothing was broadcast.
    assert_eq!(drain(&a), 0);

    // A second release finds nothing to remove.
    let err = b.name_release(NAME).unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[test]
fn test_owner_change_notifications() {
    let fx = bus_fixture();
    let observer = open_active(&fx);
    let a = open_active(&fx);
    drain(&observer);

    a.name_acquire(NAME, NameFlags::empty()).unwrap();
    let msg = observer.queue().try_recv().unwrap();
    assert!(msg.is_synthetic());
    assert_eq!(
        msg.notification(),
        Some(&Notification::NameOwnerChanged {
            name: NAME.to_string(),
            old: None,
            new: Some(a.id()),
            flags: NameFlags::empty(),
        })
    );

    a.name_release(NAME).unwrap();
    let msg = observer.queue().try_recv().unwrap();
    assert_eq!(
        msg.notification(),
        Some(&Notification::NameOwnerChanged {
            name: NAME.to_string(),
            old: Some(a.id()),
            new: None,
            flags: NameFlags::empty(),
        })
    );
}

#[test]
fn test_close_releases_names_and_hands_off() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);

    a.name_acquire(NAME, NameFlags::ALLOW_QUEUEING).unwrap();
    a.name_acquire("com.example.Other", NameFlags::empty()).unwrap();
    b.name_acquire(NAME, NameFlags::QUEUE).unwrap();

    a.close();

    // The queued claimant inherited the first name; the second vanished.
    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, b.id());
    assert!(matches!(
        fx.bus.registry().query("com.example.Other"),
        Err(BrokerError::NotFound(_))
    ));
    assert_eq!(fx.bus.registry().len(), 1);
    assert!(b.owned_names().contains(&NAME.to_string()));
}

#[test]
fn test_handoff_skips_dead_claimants() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    let b = open_active(&fx);
    let c = open_active(&fx);

    a.name_acquire(NAME, NameFlags::ALLOW_QUEUEING).unwrap();
    b.name_acquire(NAME, NameFlags::QUEUE).unwrap();
    c.name_acquire(NAME, NameFlags::QUEUE).unwrap();

    b.close();
    a.name_release(NAME).unwrap();

    // The earliest live claimant wins, not the earliest ever queued.
    assert_eq!(fx.bus.registry().query(NAME).unwrap().owner, c.id());
}

#[test]
fn test_policy_denies_name_ownership() {
    let fx = bus_fixture();
    let endpoint = fx
        .broker
        .create_endpoint(&fx.bus, "locked", 0o600, common::creds())
        .unwrap();
    let conn = fx.broker.open_endpoint(&endpoint, common::creds()).unwrap();
    conn.hello(kernbus::HelloFlags::empty()).unwrap();

    conn.policy_load(vec![PolicyRule {
        subject: PolicySubject::World,
        name: NAME.to_string(),
        access: PolicyAccess::SEND | PolicyAccess::RECV,
    }])
    .unwrap();

    let err = conn.name_acquire(NAME, NameFlags::empty()).unwrap_err();
    assert!(matches!(err, BrokerError::PermissionDenied(_)));

    conn.policy_load(vec![PolicyRule {
        subject: PolicySubject::User(1000),
        name: NAME.to_string(),
        access: PolicyAccess::OWN,
    }])
    .unwrap();
    assert_eq!(
        conn.name_acquire(NAME, NameFlags::empty()).unwrap(),
        AcquireOutcome::Owner
    );
}

#[test]
fn test_policy_filters_name_listing() {
    let fx = bus_fixture();
    let a = open_active(&fx);
    a.name_acquire(NAME, NameFlags::empty()).unwrap();
    a.name_acquire("com.example.Hidden", NameFlags::empty()).unwrap();

    let endpoint = fx
        .broker
        .create_endpoint(&fx.bus, "filtered", 0o600, common::creds())
        .unwrap();
    let viewer = fx.broker.open_endpoint(&endpoint, common::creds()).unwrap();
    viewer.hello(kernbus::HelloFlags::empty()).unwrap();
    viewer
        .policy_load(vec![PolicyRule {
            subject: PolicySubject::World,
            name: NAME.to_string(),
            access: PolicyAccess::RECV,
        }])
        .unwrap();

    let listed = viewer.name_list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, NAME);
}

#[test]
fn test_per_connection_name_limit() {
    let fx = bus_fixture();
    let a = open_active(&fx);

    for i in 0..kernbus::limits::MAX_NAMES_PER_CONNECTION {
        a.name_acquire(&format!("com.example.n{i}"), NameFlags::empty())
            .unwrap();
        drain(&a);
    }
    let err = a
        .name_acquire("com.example.overflow", NameFlags::empty())
        .unwrap_err();
    assert!(matches!(err, BrokerError::ResourceExhausted(_)));
}

#[test]
fn test_name_limit_still_allows_flag_updates() {
    let fx = bus_fixture();
    let a = open_active(&fx);

    for i in 0..kernbus::limits::MAX_NAMES_PER_CONNECTION {
        a.name_acquire(&format!("com.example.n{i}"), NameFlags::empty())
            .unwrap();
        drain(&a);
    }

    // Re-acquiring a held name adds nothing and must not be rejected.
    assert_eq!(
        a.name_acquire("com.example.n0", NameFlags::ALLOW_QUEUEING)
            .unwrap(),
        AcquireOutcome::AlreadyOwner
    );
    assert_eq!(
        fx.bus.registry().query("com.example.n0").unwrap().flags,
        NameFlags::ALLOW_QUEUEING
    );

    // A genuinely new name is still refused.
    let err = a
        .name_acquire("com.example.overflow", NameFlags::empty())
        .unwrap_err();
    assert!(matches!(err, BrokerError::ResourceExhausted(_)));
}
