/// ACP bridge tests against stub agents (shell scripts speaking
/// newline-delimited JSON-RPC over stdio).
use std::sync::Arc;
use std::time::Duration;

use otgd::acp::bridge::AcpBridge;
use otgd::acp::store::AcpStore;
use otgd::config::DaemonConfig;
use otgd::events::EventBus;
use serde_json::{json, Value};

struct Fixture {
    bridge: Arc<AcpBridge>,
    bus: Arc<EventBus>,
    _workspace: tempfile::TempDir,
}

/// Write a stub agent script. The file name carries the "claude" token so
/// the bridge selects newline-delimited framing.
fn write_stub(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("fake-claude-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn fixture() -> Fixture {
    let workspace = tempfile::tempdir().unwrap();
    let config = Arc::new(DaemonConfig::load(None, None, Some(workspace.path().to_path_buf())));
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(AcpStore::open(config.acp_data_dir()));
    let bridge = AcpBridge::new(config, bus.clone(), store);
    Fixture { bridge, bus, _workspace: workspace }
}

async fn next_event(
    rx: &mut tokio::sync::broadcast::Receiver<String>,
    event_type: &str,
    deadline: Duration,
) -> Value {
    tokio::time::timeout(deadline, async {
        loop {
            let frame = rx.recv().await.expect("bus closed");
            let v: Value = serde_json::from_str(&frame).unwrap();
            if v["type"] == event_type {
                return v;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {event_type} event before deadline"))
}

const INIT_RESPONSE: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"authMethods":[],"agentCapabilities":{"promptCapabilities":{"image":false,"audio":false,"embeddedContext":false}}}}"#;

#[tokio::test]
async fn connect_initializes_and_reports_capabilities() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let script = write_stub(
        dir.path(),
        &format!(
            "read line\nprintf '%s\\n' '{INIT_RESPONSE}'\nsleep 2\n"
        ),
    );
    let mut rx = f.bus.subscribe();

    let result = f
        .bridge
        .connect(json!({ "agentCmd": format!("sh {}", script.display()) }))
        .await
        .unwrap();
    assert_eq!(result["ok"], true);
    assert!(result["init"]["agentCapabilities"].is_object());
    assert!(f.bridge.is_connected());

    let init_event = next_event(&mut rx, "agent_initialized", Duration::from_secs(2)).await;
    assert!(init_event["data"]["init"]["authMethods"].is_array());

    f.bridge.teardown().await;
    assert!(!f.bridge.is_connected());
    next_event(&mut rx, "agent_exit", Duration::from_secs(3)).await;
}

#[tokio::test]
async fn prompt_acks_then_streams_updates_then_final() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        r#"read line
printf '%s\n' '{INIT_RESPONSE}'
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":2,"result":{{"sessionId":"stub-1"}}}}'
read line
printf '%s\n' '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"stub-1","update":{{"n":1}}}}}}'
printf '%s\n' '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"stub-1","update":{{"n":2}}}}}}'
printf '%s\n' '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"stub-1","update":{{"n":3}}}}}}'
sleep 1
printf '%s\n' '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"end_turn"}}}}'
sleep 2
"#
    );
    let script = write_stub(dir.path(), &body);
    let mut rx = f.bus.subscribe();

    f.bridge
        .connect(json!({ "agentCmd": format!("sh {}", script.display()) }))
        .await
        .unwrap();
    let session = f.bridge.session_new(json!({})).await.unwrap();
    assert_eq!(session["sessionId"], "stub-1");

    // The ack comes back immediately even though the final JSON-RPC
    // response lags behind the updates.
    let ack = f
        .bridge
        .prompt(json!({ "prompt": [{ "type": "text", "text": "do the thing" }] }))
        .unwrap();
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["sessionId"], "stub-1");

    for expected in 1..=3 {
        let update = next_event(&mut rx, "session_update", Duration::from_secs(3)).await;
        assert_eq!(update["data"]["sessionId"], "stub-1");
        assert_eq!(update["data"]["update"]["n"], expected);
    }

    let fin = next_event(&mut rx, "acp_final", Duration::from_secs(5)).await;
    assert_eq!(fin["data"]["result"]["stopReason"], "end_turn");

    // The transcript was persisted in order.
    let thread = f.bridge.store().thread("stub-1").unwrap();
    assert_eq!(thread.len(), 3);
    assert_eq!(thread[0]["update"]["n"], 1);

    f.bridge.teardown().await;
}

#[tokio::test]
async fn permission_round_trip_reaches_the_agent() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let answer_file = dir.path().join("answer.json");
    let body = format!(
        r#"read line
printf '%s\n' '{INIT_RESPONSE}'
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":2,"result":{{"sessionId":"stub-1"}}}}'
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":77,"method":"session/request_permission","params":{{"sessionId":"stub-1","toolCall":{{"name":"write_file"}},"options":[{{"optionId":"a","name":"Allow","kind":"allow_once"}},{{"optionId":"b","name":"Reject","kind":"reject_once"}}]}}}}'
read answer
printf '%s\n' "$answer" > {answer}
printf '%s\n' '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"end_turn"}}}}'
sleep 2
"#,
        answer = answer_file.display()
    );
    let script = write_stub(dir.path(), &body);
    let mut rx = f.bus.subscribe();

    f.bridge
        .connect(json!({ "agentCmd": format!("sh {}", script.display()) }))
        .await
        .unwrap();
    f.bridge.session_new(json!({})).await.unwrap();
    f.bridge
        .prompt(json!({ "prompt": [{ "type": "text", "text": "write it" }] }))
        .unwrap();

    let request = next_event(&mut rx, "permission_request", Duration::from_secs(3)).await;
    let request_id = request["data"]["requestId"].as_u64().unwrap();
    let options = request["data"]["request"]["options"].as_array().unwrap();
    assert_eq!(options[0], json!({ "id": "a", "name": "Allow", "kind": "allow_once" }));
    assert_eq!(options[1]["kind"], "reject_once");

    f.bridge
        .resolve_permission(json!({
            "requestId": request_id,
            "outcome": "selected",
            "optionId": "a",
        }))
        .unwrap();

    // The stub writes the JSON-RPC response it observed to a file.
    let mut observed = String::new();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(contents) = std::fs::read_to_string(&answer_file) {
            if !contents.trim().is_empty() {
                observed = contents;
                break;
            }
        }
    }
    let answer: Value = serde_json::from_str(observed.trim()).expect("stub saw no answer");
    assert_eq!(answer["id"], 77);
    assert_eq!(answer["result"]["outcome"]["outcome"], "selected");
    assert_eq!(answer["result"]["outcome"]["optionId"], "a");

    f.bridge.teardown().await;
}

#[tokio::test]
async fn session_not_found_triggers_one_recovery() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        r#"read line
printf '%s\n' '{INIT_RESPONSE}'
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":2,"result":{{"sessionId":"stub-old"}}}}'
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":3,"error":{{"code":-32001,"message":"Session not found"}}}}'
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":4,"result":{{"sessionId":"stub-new"}}}}'
read line
printf '%s\n' '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"stub-new","update":{{"recovered":true}}}}}}'
printf '%s\n' '{{"jsonrpc":"2.0","id":5,"result":{{"stopReason":"end_turn"}}}}'
sleep 2
"#
    );
    let script = write_stub(dir.path(), &body);
    let mut rx = f.bus.subscribe();

    f.bridge
        .connect(json!({ "agentCmd": format!("sh {}", script.display()) }))
        .await
        .unwrap();
    f.bridge.session_new(json!({})).await.unwrap();
    f.bridge
        .prompt(json!({ "prompt": [{ "type": "text", "text": "hello" }] }))
        .unwrap();

    let recovered = next_event(&mut rx, "session_recovered", Duration::from_secs(3)).await;
    assert_eq!(recovered["data"]["oldSessionId"], "stub-old");
    assert_eq!(recovered["data"]["newSessionId"], "stub-new");

    let update = next_event(&mut rx, "session_update", Duration::from_secs(3)).await;
    assert_eq!(update["data"]["update"]["recovered"], true);

    let fin = next_event(&mut rx, "acp_final", Duration::from_secs(3)).await;
    assert_eq!(fin["data"]["result"]["stopReason"], "end_turn");
    assert!(fin["data"].get("error").is_none());

    // The persisted session identity followed the recovery.
    assert!(f.bridge.store().has_session("stub-new"));
    assert!(!f.bridge.store().has_session("stub-old"));

    f.bridge.teardown().await;
}

#[tokio::test]
async fn agent_exit_is_broadcast_and_clears_connection() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let script = write_stub(
        dir.path(),
        &format!("read line\nprintf '%s\\n' '{INIT_RESPONSE}'\nexit 0\n"),
    );
    let mut rx = f.bus.subscribe();

    f.bridge
        .connect(json!({ "agentCmd": format!("sh {}", script.display()) }))
        .await
        .unwrap();

    let exit = next_event(&mut rx, "agent_exit", Duration::from_secs(3)).await;
    assert_eq!(exit["data"]["code"], 0);

    // Subsequent ops fail with agent-not-connected.
    for _ in 0..20 {
        if !f.bridge.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!f.bridge.is_connected());
    let err = f.bridge.session_new(json!({})).await.unwrap_err();
    assert!(err.to_string().contains("not connected"), "{err}");
}
