use bytes::Bytes;
use renderbroker::config::Config;
use renderbroker::core::BrokerError;
use renderbroker::core::models::{ResourceConfig, SessionStatus};
use renderbroker::core::state::BrokerState;
use reqwest::Method;
use reqwest::header::HeaderMap;
use std::sync::Arc;

fn test_state() -> Arc<BrokerState> {
    BrokerState::initialize(Config::default()).expect("broker state")
}

fn renderer_config(id: &str) -> ResourceConfig {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "command_line": "/bin/echo",
        "wait_until_running": false,
        "graceful_exit": false,
    }))
    .expect("valid config json")
}

async fn execute(
    state: &BrokerState,
    session_id: &str,
    command: &str,
    body: &[u8],
) -> Result<renderbroker::core::session::broker::BrokerResponse, BrokerError> {
    state
        .broker
        .execute(
            session_id,
            command,
            &Method::PUT,
            &HeaderMap::new(),
            Bytes::copy_from_slice(body),
        )
        .await
}

fn body_json(body: &Bytes) -> serde_json::Value {
    serde_json::from_slice(body).expect("json body")
}

#[tokio::test]
async fn test_command_on_unknown_session_is_not_found() {
    let state = test_state();
    let err = execute(&state, "ghost", "status", b"").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn test_log_without_job_reports_unavailable() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    for command in ["log", "err", "job"] {
        let response = execute(&state, "s1", command, b"").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            body_json(&response.body)["contents"],
            "Rendering resource is currently unavailable"
        );
    }
}

#[tokio::test]
async fn test_status_of_stopped_session() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    let response = execute(&state, "s1", "status", b"").await.unwrap();
    assert_eq!(response.status, 200);
    let payload = body_json(&response.body);
    assert_eq!(payload["code"], "STOPPED");
    assert_eq!(payload["description"], "rtneuron is not active");
    assert_eq!(payload["session"], "s1");
}

#[tokio::test]
async fn test_forward_returns_status_payload_when_not_running() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    let response = execute(&state, "s1", "render", b"{\"frame\":1}")
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    let payload = body_json(&response.body);
    assert_eq!(payload["code"], "STOPPED");
}

#[tokio::test]
async fn test_schedule_with_malformed_body_is_invalid() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    let err = execute(&state, "s1", "schedule", b"{not json")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_schedule_assigns_randomized_port() {
    let state = test_state();
    state.registry.create(renderer_config("rtneuron")).await.unwrap();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();

    let response = execute(&state, "s1", "schedule", b"{}").await.unwrap();
    assert_eq!(response.status, 200);

    let session = state.manager.get_session("s1").await.unwrap();
    assert!((3000..4000).contains(&session.http_port));
    assert_eq!(session.status, SessionStatus::Starting);
    assert!(session.has_process());

    state.manager.delete_session("s1").await.unwrap();
}

#[tokio::test]
async fn test_open_refuses_duplicate_process() {
    let state = test_state();
    state.registry.create(renderer_config("rtneuron")).await.unwrap();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.process_pid = 4242;
    state.sessions.update(&session).await.unwrap();

    let err = execute(&state, "s1", "open", b"{}").await.unwrap_err();
    assert!(matches!(err, BrokerError::ProcessAlreadyStarted));
    assert_eq!(err.status_code(), 401);
}

#[tokio::test]
async fn test_imagefeed_without_service_is_invalid_request() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    let err = execute(&state, "s1", "imagefeed", b"").await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
}
