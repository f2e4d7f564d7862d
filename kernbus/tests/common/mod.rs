//! Shared fixtures for broker integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use kernbus::{Broker, Bus, Connection, Credentials, HelloFlags};

/// A broker with one bus and its owning control connection kept alive.
pub struct Fixture {
    pub broker: Broker,
    pub owner: Arc<Connection>,
    pub bus: Arc<Bus>,
}

pub fn creds() -> Credentials {
    Credentials::new(1000, 1000)
}

/// Route broker tracing through the test harness. Safe to call from every
/// test; only the first initialization wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Broker with a single bus named `user-1000` in the initial namespace.
pub fn bus_fixture() -> Fixture {
    init_tracing();
    let broker = Broker::new();
    let control = broker.open_control(&broker.root(), creds()).unwrap();
    let bus = broker.create_bus(&control, "user-1000", 0, 0o660).unwrap();
    Fixture {
        broker,
        owner: control,
        bus,
    }
}

/// Open a connection on the bus's default endpoint and say hello.
pub fn open_active(fx: &Fixture) -> Arc<Connection> {
    open_active_as(fx, creds())
}

pub fn open_active_as(fx: &Fixture, creds: Credentials) -> Arc<Connection> {
    let endpoint = fx.bus.default_endpoint().unwrap();
    let conn = fx.broker.open_endpoint(&endpoint, creds).unwrap();
    conn.hello(HelloFlags::empty()).unwrap();
    conn
}

/// Pop everything currently queued, returning how many messages there were.
pub fn drain(conn: &Connection) -> usize {
    let mut n = 0;
    while conn.queue().try_recv().is_some() {
        n += 1;
    }
    n
}
