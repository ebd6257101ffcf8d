//! Reconnection, degraded mode, and liveness eviction.

mod fixtures;

use std::time::Duration;

use ripple_rs::{Client, Scope};

use fixtures::daemon_runtime::{DaemonFixture, poll_until, test_config};

#[test]
fn client_resubscribes_after_daemon_restart() {
    let mut fixture = DaemonFixture::start();
    let subscriber = Client::with_config(fixture.socket(), test_config()).expect("subscriber");
    subscriber.subscribe(Scope(4));

    let metrics = fixture.metrics();
    assert!(poll_until(Duration::from_secs(2), || {
        metrics.snapshot().active_connections == 1
    }));

    fixture.restart();

    // The client detects the disconnect and dials back in on its own; the
    // scope-4 subscription must come back without any help from us.
    assert!(
        poll_until(Duration::from_secs(5), || subscriber.is_connected()),
        "client should reconnect within the backoff window"
    );
    assert!(!subscriber.is_degraded());

    let publisher = Client::with_config(fixture.socket(), test_config()).expect("publisher");
    publisher.notify(Scope(4));

    let got = subscriber
        .listen()
        .recv_timeout(Duration::from_secs(3))
        .expect("event after restart");
    assert_eq!(got.scope, Scope(4));
    assert_eq!(subscriber.subscribed_scope(), Scope(4));
}

#[test]
fn both_clients_recover_from_a_restart() {
    let mut fixture = DaemonFixture::start();
    let a = Client::with_config(fixture.socket(), test_config()).expect("a");
    let b = Client::with_config(fixture.socket(), test_config()).expect("b");
    a.subscribe(Scope(1));
    b.subscribe(Scope(2));

    fixture.restart();

    assert!(poll_until(Duration::from_secs(5), || {
        a.is_connected() && b.is_connected()
    }));

    let publisher = Client::with_config(fixture.socket(), test_config()).expect("publisher");
    publisher.notify(Scope(1));
    publisher.notify(Scope(2));

    assert_eq!(
        a.listen()
            .recv_timeout(Duration::from_secs(3))
            .expect("a recovers")
            .scope,
        Scope(1)
    );
    assert_eq!(
        b.listen()
            .recv_timeout(Duration::from_secs(3))
            .expect("b recovers")
            .scope,
        Scope(2)
    );
}

#[test]
fn client_goes_degraded_after_exhausting_reconnects() {
    let mut config = test_config();
    config.backoff_base_ms = 50;
    config.backoff_max_ms = 400;

    let mut fixture = DaemonFixture::start();
    let client = Client::with_config(fixture.socket(), config).expect("client");
    let metrics = client.metrics();

    fixture.shutdown();

    // 50 + 100 + 200 + 400 + 400 ms of delays, then give up.
    assert!(
        poll_until(Duration::from_secs(10), || client.is_degraded()),
        "client should report degraded after the retry budget"
    );
    assert!(!client.is_connected());
    assert_eq!(metrics.snapshot().reconnects, 5);
}

#[test]
fn degraded_client_recovers_on_fresh_activity() {
    let mut config = test_config();
    config.backoff_base_ms = 50;
    config.backoff_max_ms = 200;

    let mut fixture = DaemonFixture::start();
    let client = Client::with_config(fixture.socket(), config).expect("client");

    fixture.shutdown();
    assert!(poll_until(Duration::from_secs(10), || client.is_degraded()));

    fixture.restart();
    // New local activity restarts the reconnect cycle.
    client.notify(Scope(1));

    assert!(
        poll_until(Duration::from_secs(5), || client.is_connected()),
        "notify should revive a degraded client once the daemon is back"
    );
    assert!(poll_until(Duration::from_secs(2), || !client.is_degraded()));
}

#[test]
fn silent_peer_is_evicted_by_the_liveness_monitor() {
    let mut config = test_config();
    config.liveness_interval_secs = 1;

    let fixture = DaemonFixture::start_with_config(config);
    let metrics = fixture.metrics();

    // A peer that never answers pings: raw socket, no reader, no writer.
    let raw = std::os::unix::net::UnixStream::connect(fixture.socket()).expect("raw connect");
    assert!(poll_until(Duration::from_secs(2), || {
        metrics.snapshot().active_connections == 1
    }));

    // Three silent intervals later the daemon must have dropped it.
    assert!(
        poll_until(Duration::from_secs(8), || {
            metrics.snapshot().active_connections == 0
        }),
        "silent peer should be evicted after three liveness intervals"
    );
    drop(raw);
}

#[test]
fn responsive_client_survives_the_liveness_monitor() {
    let mut config = test_config();
    config.liveness_interval_secs = 1;

    let fixture = DaemonFixture::start_with_config(config.clone());
    let metrics = fixture.metrics();
    let client = Client::with_config(fixture.socket(), config).expect("client");

    assert!(poll_until(Duration::from_secs(2), || {
        metrics.snapshot().active_connections == 1
    }));

    // Well past the eviction window; pong replies keep it alive.
    std::thread::sleep(Duration::from_secs(4));
    assert_eq!(metrics.snapshot().active_connections, 1);
    assert!(client.is_connected());
}
