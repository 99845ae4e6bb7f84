//! Integration tests for sessions, RPC and event dispatch against a fake agent.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

mod common;

use std::time::Duration;

use common::{quick_policy, test_config, FakeAgent, FakeBridge, AGENT_UID};
use droidlink_client::{
    ClientError, DispatcherState, LineTransport, RpcClient, Session, SessionConfig, TcpTransport,
};
use droidlink_protocol::HandshakeRequest;
use regex::Regex;
use serde_json::json;
use tokio::time::timeout;

/// Upper bound for anything that should happen promptly.
const PROMPT: Duration = Duration::from_secs(5);

// ============================================================================
// RPC over TCP
// ============================================================================

#[tokio::test]
async fn test_rpc_round_trips_over_tcp() {
    let agent = FakeAgent::spawn().await;
    let transport = TcpTransport::open(agent.addr, &quick_policy()).await.unwrap();
    let client = RpcClient::new(Box::new(transport));

    let response = client.handshake(HandshakeRequest::initiate()).await.unwrap();
    assert_eq!(response.uid, AGENT_UID);

    assert_eq!(client.call("echo", vec![json!("ok")]).await.unwrap(), Some(json!("ok")));
    match client.call("fail", vec![]).await {
        Err(ClientError::Remote(message)) => assert_eq!(message, "boom"),
        other => panic!("Expected remote error, got {other:?}"),
    }
    assert_eq!(client.call("noop", vec![]).await.unwrap(), None);

    // The handshake used id 1.
    let ids: Vec<u64> = agent.requests().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![2, 3, 4]);
}

#[tokio::test]
async fn test_concurrent_calls_do_not_interleave() {
    let agent = FakeAgent::spawn().await;
    let transport = TcpTransport::open(agent.addr, &quick_policy()).await.unwrap();
    let client = std::sync::Arc::new(RpcClient::new(Box::new(transport)));

    let mut tasks = Vec::new();
    for n in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.call("echo", vec![json!(n)]).await
        }));
    }

    for (n, task) in tasks.into_iter().enumerate() {
        let value = task.await.unwrap().unwrap();
        assert_eq!(value, Some(json!(n)));
    }

    let mut ids: Vec<u64> = agent.requests().into_iter().map(|(id, _)| id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=8).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_transport_close_twice() {
    let agent = FakeAgent::spawn().await;
    let mut transport = TcpTransport::open(agent.addr, &quick_policy()).await.unwrap();

    transport.close().await.unwrap();
    transport.close().await.unwrap();
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_session_start_call_and_close() {
    let agent = FakeAgent::spawn().await;
    let bridge = FakeBridge::alive();
    let config = test_config(&agent);

    let session = Session::start(config.clone(), bridge.clone()).await.unwrap();
    assert_eq!(session.uid(), AGENT_UID);
    assert_eq!(session.host_port(), agent.addr.port());
    assert_eq!(session.dispatcher().state(), DispatcherState::Running);

    // Primary connection initiates; the event connection continues the session.
    let handshakes = agent.handshakes();
    assert_eq!(handshakes[0], json!({"cmd": "initiate", "uid": -1}));
    assert_eq!(handshakes[1], json!({"cmd": "continue", "uid": AGENT_UID}));

    let value = session.call("echo", vec![json!({"k": 1})]).await.unwrap();
    assert_eq!(value, Some(json!({"k": 1})));

    session.close().await;

    let commands = bridge.shell_commands();
    assert_eq!(commands[0], config.commands.launch_command(config.device_port));
    assert!(commands.contains(&config.commands.probe));
    assert_eq!(commands.last(), Some(&config.commands.stop));
    assert_eq!(*bridge.forwards.lock().unwrap(), vec![(agent.addr.port(), config.device_port)]);
    assert_eq!(*bridge.removed.lock().unwrap(), vec![agent.addr.port()]);
    assert!(agent.calls().contains(&"closeSl4aSession".to_string()));
}

#[tokio::test]
async fn test_request_ids_unique_across_session_connections() {
    let agent = FakeAgent::spawn().await;
    let session = Session::start(test_config(&agent), FakeBridge::alive()).await.unwrap();

    for n in 0..3 {
        session.call("echo", vec![json!(n)]).await.unwrap();
    }
    // Let the event connection run a few idle polls.
    tokio::time::sleep(Duration::from_millis(250)).await;
    session.close().await;

    let requests = agent.requests();
    assert!(requests.iter().any(|(_, method)| method == "eventWait"));
    assert!(requests.iter().any(|(_, method)| method == "echo"));

    let mut ids: Vec<u64> = requests.iter().map(|(id, _)| *id).collect();
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total, "request id reused: {requests:?}");
    // The two handshakes used ids 1 and 2.
    assert!(ids[0] >= 3);
}

#[tokio::test]
async fn test_dropped_session_stops_polling() {
    let agent = FakeAgent::spawn().await;
    let session = Session::start(test_config(&agent), FakeBridge::alive()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    drop(session);
    // Let any poll already on the wire land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let polls = |agent: &FakeAgent| {
        agent
            .requests()
            .iter()
            .filter(|(_, method)| method == "eventWait")
            .count()
    };
    let after_drop = polls(&agent);
    assert!(after_drop > 0);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(polls(&agent), after_drop);
}

#[tokio::test]
async fn test_session_start_fails_when_agent_not_running() {
    let agent = FakeAgent::spawn().await;
    let bridge = FakeBridge::dead();

    let err = Session::start(test_config(&agent), bridge.clone()).await.unwrap_err();

    assert!(matches!(err, ClientError::Startup(_)));
    assert!(bridge.forwards.lock().unwrap().is_empty());
    assert!(agent.handshakes().is_empty());
}

#[tokio::test]
async fn test_refused_handshake_removes_forward() {
    let agent = FakeAgent::spawn_refusing().await;
    let bridge = FakeBridge::alive();

    let err = Session::start(test_config(&agent), bridge.clone()).await.unwrap_err();

    assert!(matches!(err, ClientError::Protocol(_)));
    assert_eq!(*bridge.removed.lock().unwrap(), vec![agent.addr.port()]);
}

#[tokio::test]
async fn test_unreachable_agent_is_connection_error() {
    let agent = FakeAgent::spawn().await;
    let bridge = FakeBridge::alive();
    let unused_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = SessionConfig {
        host_port: Some(unused_port),
        ..test_config(&agent)
    };

    let err = Session::start(config, bridge.clone()).await.unwrap_err();

    assert!(matches!(err, ClientError::Connection(_)));
    assert_eq!(*bridge.removed.lock().unwrap(), vec![unused_port]);
}

#[tokio::test]
async fn test_missing_agent_is_installed() {
    let agent = FakeAgent::spawn().await;
    let bridge = FakeBridge::alive();
    let apk = tempfile::NamedTempFile::new().unwrap();
    let config = SessionConfig {
        agent_apk: Some(apk.path().to_path_buf()),
        ..test_config(&agent)
    };

    let session = Session::start(config, bridge.clone()).await.unwrap();
    session.close().await;

    assert_eq!(
        *bridge.installed.lock().unwrap(),
        vec![apk.path().display().to_string()]
    );
}

// ============================================================================
// Events through a live session
// ============================================================================

#[tokio::test]
async fn test_events_reach_consumers() {
    let agent = FakeAgent::spawn().await;
    let session = Session::start(test_config(&agent), FakeBridge::alive()).await.unwrap();
    let events = session.events().clone();

    // Parked before the event exists.
    let waiter = {
        let events = events.clone();
        tokio::spawn(async move { events.pop("BatteryChanged", PROMPT).await })
    };
    agent.emit("BatteryChanged", json!({"level": 80}), 100);

    let event = waiter.await.unwrap().unwrap().expect("event delivered");
    assert_eq!(event.name, "BatteryChanged");
    assert_eq!(event.data_value().unwrap(), json!({"level": 80}));
    assert_eq!(event.time, 100);

    agent.emit("Wifi", json!({"ok": false}), 200);
    agent.emit("Wifi", json!({"ok": true}), 201);
    let found = events
        .wait_for(
            "Wifi",
            |e| e.data_value().map(|v| v["ok"] == json!(true)).unwrap_or(false),
            PROMPT,
        )
        .await
        .unwrap()
        .expect("matching event");
    assert_eq!(found.time, 201);
    assert!(events.pop_all("Wifi").await.unwrap().is_empty());

    agent.emit("Scan2", json!(null), 302);
    agent.emit("Scan1", json!(null), 301);
    let pattern = Regex::new("^Scan").unwrap();
    let mut scans = Vec::new();
    while scans.len() < 2 {
        let batch = events.pop_events(&pattern, PROMPT).await.unwrap();
        assert!(!batch.is_empty(), "timed out waiting for scan events");
        scans.extend(batch);
    }
    assert_eq!(scans.len(), 2);

    session.close().await;
}

#[tokio::test]
async fn test_pop_times_out_without_events() {
    let agent = FakeAgent::spawn().await;
    let session = Session::start(test_config(&agent), FakeBridge::alive()).await.unwrap();

    let popped = session
        .events()
        .pop("NeverSent", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(popped.is_none());

    session.close().await;
}

#[tokio::test]
async fn test_shutdown_event_cancels_dispatcher() {
    let agent = FakeAgent::spawn().await;
    let session = Session::start(test_config(&agent), FakeBridge::alive()).await.unwrap();

    agent.emit("EventDispatcherShutdown", json!(null), 1);

    timeout(PROMPT, session.dispatcher().wait_until_canceled())
        .await
        .expect("dispatcher should cancel on the shutdown event");
    assert_eq!(session.dispatcher().state(), DispatcherState::Canceled);
    assert!(session
        .events()
        .pop_all("EventDispatcherShutdown")
        .await
        .unwrap()
        .is_empty());

    // Ordinary calls keep working on the primary connection.
    assert_eq!(
        session.call("echo", vec![json!(1)]).await.unwrap(),
        Some(json!(1))
    );

    session.close().await;
}
