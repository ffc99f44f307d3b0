mod common;

use std::time::{Duration, Instant};

use serde_json::json;

use mimir_net::{ConnectionEvent, Frame, MirrorClient, ReconnectConfig, TransportEvent};

fn test_config() -> ReconnectConfig {
    ReconnectConfig {
        floor: Duration::from_millis(100),
        ceiling: Duration::from_millis(300),
        factor: 2.0,
    }
}

fn ms(t0: Instant, millis: u64) -> Instant {
    t0 + Duration::from_millis(millis)
}

#[test]
fn test_backoff_grows_per_failure_and_caps() {
    let (connector, log) = common::ScriptedConnector::new(10);
    let mut client = MirrorClient::with_config(connector, || "srv".to_string(), test_config());
    let t0 = Instant::now();

    // first attempt happens immediately and fails
    assert_eq!(client.poll(t0), vec![ConnectionEvent::FailedConnect]);
    assert_eq!(log.borrow().urls.len(), 1);
    assert_eq!(client.retry_delay(), Duration::from_millis(200));

    // not due yet: no second attempt
    assert!(client.poll(ms(t0, 199)).is_empty());
    assert_eq!(log.borrow().urls.len(), 1);

    // due at floor * factor
    assert_eq!(client.poll(ms(t0, 200)), vec![ConnectionEvent::FailedConnect]);
    assert_eq!(log.borrow().urls.len(), 2);
    assert_eq!(client.retry_delay(), Duration::from_millis(300), "capped at the ceiling");

    // delay stays at the ceiling from here on
    assert_eq!(client.poll(ms(t0, 500)), vec![ConnectionEvent::FailedConnect]);
    assert_eq!(client.poll(ms(t0, 800)), vec![ConnectionEvent::FailedConnect]);
    assert_eq!(client.retry_delay(), Duration::from_millis(300));
    assert_eq!(log.borrow().urls.len(), 4);

    // it never gives up
    assert_eq!(client.poll(ms(t0, 1100)), vec![ConnectionEvent::FailedConnect]);
    assert_eq!(log.borrow().urls.len(), 5);
}

#[test]
fn test_url_is_recomputed_per_attempt() {
    let (connector, log) = common::ScriptedConnector::new(3);
    let mut counter = 0u32;
    let mut client = MirrorClient::with_config(
        connector,
        move || {
            counter += 1;
            format!("srv-{}", counter)
        },
        test_config(),
    );
    let t0 = Instant::now();

    client.poll(t0);
    client.poll(ms(t0, 200));
    client.poll(ms(t0, 500));
    assert_eq!(
        log.borrow().urls,
        vec!["srv-1".to_string(), "srv-2".to_string(), "srv-3".to_string()]
    );
}

#[test]
fn test_successful_open_resets_backoff() {
    let (connector, log) = common::ScriptedConnector::new(2);
    let mut client = MirrorClient::with_config(connector, || "srv".to_string(), test_config());
    let t0 = Instant::now();

    assert_eq!(client.poll(t0), vec![ConnectionEvent::FailedConnect]);
    assert_eq!(client.poll(ms(t0, 200)), vec![ConnectionEvent::FailedConnect]);

    // third attempt succeeds; the wire delivers Open on the same poll
    assert_eq!(client.poll(ms(t0, 500)), vec![ConnectionEvent::Connected]);
    assert!(client.is_connected());
    assert_eq!(client.retry_delay(), Duration::from_millis(100));
    assert_eq!(log.borrow().wires.len(), 1);
}

#[test]
fn test_loss_after_connect_notifies_and_reschedules() {
    let (connector, log) = common::ScriptedConnector::new(0);
    let mut client = MirrorClient::with_config(connector, || "srv".to_string(), test_config());
    let t0 = Instant::now();

    assert_eq!(client.poll(t0), vec![ConnectionEvent::Connected]);
    let wire = log.borrow().wires[0].clone();

    wire.borrow_mut().incoming.push_back(TransportEvent::Closed);
    assert_eq!(client.poll(ms(t0, 50)), vec![ConnectionEvent::Disconnected]);
    assert!(!client.is_connected());
    assert!(client.session().is_none(), "registry dies with the socket");

    // reconnect is scheduled at the floor delay, not a grown one
    assert!(client.poll(ms(t0, 149)).is_empty());
    assert_eq!(client.poll(ms(t0, 150)), vec![ConnectionEvent::Connected]);
    assert_eq!(log.borrow().wires.len(), 2);
}

#[test]
fn test_fresh_session_after_reconnect() {
    let (connector, log) = common::ScriptedConnector::new(0);
    let mut client = MirrorClient::with_config(connector, || "srv".to_string(), test_config());
    let t0 = Instant::now();

    client.poll(t0);
    let wire = log.borrow().wires[0].clone();
    common::push_text(
        &wire,
        &json!([
            ["register_block", 1, "/radio", []],
            ["value", 0, 1],
        ]),
    );
    client.poll(ms(t0, 10));
    assert!(client.session().unwrap().root().is_some());

    wire.borrow_mut().incoming.push_back(TransportEvent::Closed);
    client.poll(ms(t0, 20));
    client.poll(ms(t0, 200));
    assert!(client.is_connected());

    // the new registry knows nothing from the old connection
    let session = client.session().unwrap();
    assert_eq!(session.node_count(), 1);
    assert!(session.root().is_none());
}

#[test]
fn test_local_writes_are_flushed_to_the_transport() {
    let (connector, log) = common::ScriptedConnector::new(0);
    let mut client = MirrorClient::with_config(connector, || "srv".to_string(), test_config());
    let t0 = Instant::now();

    client.poll(t0);
    let wire = log.borrow().wires[0].clone();
    common::push_text(
        &wire,
        &json!([["register_cell", 2, "/freq",
            common::value_cell(true, json!("float64"), json!(100.0))]]),
    );
    client.poll(ms(t0, 10));

    let freq = client
        .session()
        .unwrap()
        .get(mimir_types::ObjectId::new(2))
        .and_then(|n| n.as_cell().cloned())
        .unwrap();
    freq.set(json!(146.52e6)).unwrap();

    client.poll(ms(t0, 20));
    let sent = wire.borrow().sent.clone();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Frame::Text(text) => {
            let msg: serde_json::Value = serde_json::from_str(text).unwrap();
            assert_eq!(msg[0], "set");
            assert_eq!(msg[1], 2);
            assert_eq!(msg[2], 146.52e6);
        }
        other => panic!("expected a text frame, got {:?}", other),
    }
}

#[test]
fn test_failure_after_loss_counts_as_failed_connect() {
    let (connector, log) = common::ScriptedConnector::new(0);
    let mut client = MirrorClient::with_config(connector, || "srv".to_string(), test_config());
    let t0 = Instant::now();

    client.poll(t0);
    let wire = log.borrow().wires[0].clone();
    wire.borrow_mut().incoming.push_back(TransportEvent::Closed);
    client.poll(ms(t0, 10));

    // make the next attempt fail: the "ever succeeded" flag was reset,
    // so this is a failed connect, not another disconnect
    log.borrow_mut().failures_remaining = 1;
    assert_eq!(
        client.poll(ms(t0, 110)),
        vec![ConnectionEvent::FailedConnect]
    );
}
