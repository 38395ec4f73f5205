//! Status interface tests: live event fan-out, snapshots, details and bulk
//! retry/remove over a real WebSocket, plus the static document mapping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use sluice::{Accounting, JobSpec, JobState, Manager, ManagerConfig, CMDS_QUEUE};
use sluice_testkit::{MemoryStore, MockScheduler, RecordingRunner};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn served_manager() -> (Arc<Manager>, MemoryStore, SocketAddr) {
    let web_addr = free_addr();
    let cfg = ManagerConfig::default()
        .with_release_backoff(Duration::ZERO)
        .with_client_addr(free_addr())
        .with_web_addr(web_addr);
    let store = MemoryStore::new();
    let manager = Manager::with_action_runner(
        cfg,
        Arc::new(store.clone()),
        Arc::new(MockScheduler::new()),
        Arc::new(RecordingRunner::new()),
    );
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            let _ = manager.serve().await;
        });
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if tokio::net::TcpStream::connect(web_addr).await.is_ok() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "status interface never started"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    (manager, store, web_addr)
}

async fn ws_connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn next_json(ws: &mut WsClient) -> Value {
    let deadline = Duration::from_secs(3);
    loop {
        let message = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn failure(exit_code: i32) -> Accounting {
    Accounting {
        exit_code,
        ..Accounting::default()
    }
}

async fn bury_jobs(manager: &Arc<Manager>, rep_group: &str, count: usize) -> Vec<String> {
    let handle = manager.handle(CMDS_QUEUE);
    let mut keys = Vec::new();
    for n in 0..count {
        let spec = JobSpec::new(format!("step {rep_group} {n}"), "/tmp")
            .with_rep_group(rep_group)
            .with_retries(1);
        let added = manager.add_jobs(&handle, vec![spec], false).await.unwrap();
        keys.push(added[0].key.clone());
    }
    for key in &keys {
        manager
            .reserve(&handle, "", Duration::from_secs(60))
            .unwrap()
            .unwrap();
        manager.bury(&handle, key, "oom", Some(failure(2))).unwrap();
    }
    keys
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn current_sends_all_then_per_group_counts() {
    let (manager, _store, web_addr) = served_manager().await;
    let handle = manager.handle(CMDS_QUEUE);
    manager
        .add_jobs(
            &handle,
            vec![
                JobSpec::new("echo a", "/tmp").with_rep_group("r1"),
                JobSpec::new("echo b", "/tmp").with_rep_group("r2"),
            ],
            false,
        )
        .await
        .unwrap();

    let mut ws = ws_connect(web_addr).await;
    ws.send(WsMessage::Text(json!({"Request": "current"}).to_string()))
        .await
        .unwrap();

    let first = next_json(&mut ws).await;
    assert_eq!(first["RepGroup"], "+all+");
    assert_eq!(first["From"], "new");
    assert_eq!(first["To"], "ready");
    assert_eq!(first["Count"], 2);

    let mut groups = vec![next_json(&mut ws).await, next_json(&mut ws).await];
    groups.sort_by_key(|v| v["RepGroup"].as_str().unwrap().to_string());
    assert_eq!(groups[0]["RepGroup"], "r1");
    assert_eq!(groups[0]["Count"], 1);
    assert_eq!(groups[1]["RepGroup"], "r2");
    assert_eq!(groups[1]["Count"], 1);
}

#[tokio::test]
async fn key_requests_return_full_detail() {
    let (manager, _store, web_addr) = served_manager().await;
    let handle = manager.handle(CMDS_QUEUE);
    let spec = JobSpec::new("echo detail", "/tmp")
        .with_rep_group("r1")
        .with_env(vec!["FOO=bar".to_string()]);
    let key = manager.add_jobs(&handle, vec![spec], false).await.unwrap()[0]
        .key
        .clone();

    let mut ws = ws_connect(web_addr).await;
    ws.send(WsMessage::Text(json!({"Key": key}).to_string()))
        .await
        .unwrap();

    let detail = next_json(&mut ws).await;
    assert_eq!(detail["Key"], key.as_str());
    assert_eq!(detail["Cmd"], "echo detail");
    assert_eq!(detail["State"], "ready");
    assert_eq!(detail["Env"][0], "FOO=bar");
}

#[tokio::test]
async fn state_transitions_reach_observers_live() {
    let (manager, _store, web_addr) = served_manager().await;
    let mut ws = ws_connect(web_addr).await;
    // give the server-side handler a moment to subscribe
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = manager.handle(CMDS_QUEUE);
    let key = manager
        .add_jobs(
            &handle,
            vec![JobSpec::new("echo live", "/tmp").with_rep_group("live")],
            false,
        )
        .await
        .unwrap()[0]
        .key
        .clone();

    let event = next_json(&mut ws).await;
    assert_eq!(event["Key"], key.as_str());
    assert_eq!(event["From"], "new");
    assert_eq!(event["To"], "ready");
    assert_eq!(event["RepGroup"], "live");

    // the reservation is observed in commit order
    manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    let event = next_json(&mut ws).await;
    assert_eq!(event["From"], "ready");
    assert_eq!(event["To"], "reserved");
}

#[tokio::test]
async fn retry_kicks_one_then_all_matching_buried_jobs() {
    let (manager, _store, web_addr) = served_manager().await;
    bury_jobs(&manager, "r1", 3).await;
    let handle = manager.handle(CMDS_QUEUE);

    let mut ws = ws_connect(web_addr).await;
    ws.send(WsMessage::Text(
        json!({
            "Request": "retry",
            "RepGroup": "r1",
            "Exitcode": 2,
            "FailReason": "oom",
            "All": false,
        })
        .to_string(),
    ))
    .await
    .unwrap();

    {
        let manager = manager.clone();
        let handle = handle.clone();
        eventually("exactly one job kicked", move || {
            manager
                .get_by_rep_group(&handle, "r1", 0, Some(JobState::Buried))
                .len()
                == 2
        })
        .await;
    }

    ws.send(WsMessage::Text(
        json!({
            "Request": "retry",
            "RepGroup": "r1",
            "Exitcode": 2,
            "FailReason": "oom",
            "All": true,
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let manager2 = manager.clone();
    let handle2 = handle.clone();
    eventually("all matching jobs kicked", move || {
        manager2
            .get_by_rep_group(&handle2, "r1", 0, Some(JobState::Buried))
            .is_empty()
    })
    .await;

    // kicked jobs come back with a full retry budget
    let ready = manager.get_by_rep_group(&handle, "r1", 0, Some(JobState::Ready));
    assert_eq!(ready.len(), 3);
    assert!(ready.iter().all(|job| job.until_buried == job.retries + 1));
}

#[tokio::test]
async fn remove_deletes_matching_jobs_and_their_records() {
    let (manager, store, web_addr) = served_manager().await;
    let keys = bury_jobs(&manager, "doomed", 2).await;
    let handle = manager.handle(CMDS_QUEUE);

    let mut ws = ws_connect(web_addr).await;
    ws.send(WsMessage::Text(
        json!({
            "Request": "remove",
            "RepGroup": "doomed",
            "Exitcode": 2,
            "FailReason": "oom",
            "All": true,
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let manager2 = manager.clone();
    let handle2 = handle.clone();
    let keys2 = keys.clone();
    eventually("jobs removed", move || {
        manager2.get_by_keys(&handle2, &keys2).is_empty()
    })
    .await;
    assert_eq!(store.live_count(), 0);
    assert!(manager
        .get_by_rep_group(&handle, "doomed", 0, None)
        .is_empty());
}

#[tokio::test]
async fn details_sends_one_example_per_failure_mode() {
    let (manager, _store, web_addr) = served_manager().await;
    bury_jobs(&manager, "r1", 3).await;

    let mut ws = ws_connect(web_addr).await;
    ws.send(WsMessage::Text(
        json!({"Request": "details", "RepGroup": "r1"}).to_string(),
    ))
    .await
    .unwrap();

    // all three share (buried, 2, "oom"), so exactly one example arrives
    let example = next_json(&mut ws).await;
    assert_eq!(example["State"], "buried");
    assert_eq!(example["Exitcode"], 2);
    assert_eq!(example["FailReason"], "oom");
    assert_eq!(example["RepGroup"], "r1");
    assert_eq!(example["Similar"], 2);
}

#[tokio::test]
async fn static_pages_serve_with_mapped_content_types() {
    let (_manager, _store, web_addr) = served_manager().await;

    for path in ["/", "/status", "/status.html"] {
        let mut stream = tokio::net::TcpStream::connect(web_addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{path}: {response}");
        assert!(response.contains("text/html"), "{path}");
        assert!(response.contains("sluice"), "{path}");
    }

    // unknown documents 404
    let mut stream = tokio::net::TcpStream::connect(web_addr).await.unwrap();
    stream
        .write_all(b"GET /js/app.js HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));
}
