use renderbroker::config::Config;
use renderbroker::core::BrokerError;
use renderbroker::core::models::{JobInformation, ResourceConfig, SessionStatus};
use renderbroker::core::state::BrokerState;
use std::sync::Arc;

fn test_state() -> Arc<BrokerState> {
    BrokerState::initialize(Config::default()).expect("broker state")
}

fn renderer_config(id: &str, command_line: &str, wait_until_running: bool) -> ResourceConfig {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "command_line": command_line,
        "wait_until_running": wait_until_running,
        "graceful_exit": false,
    }))
    .expect("valid config json")
}

#[tokio::test]
async fn test_create_session_sets_defaults() {
    let state = test_state();
    let session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.process_pid, -1);
    assert!(session.job_id.is_empty());
    assert!(session.valid_until > session.created);
}

#[tokio::test]
async fn test_duplicate_session_is_conflict() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    let err = state
        .manager
        .create_session_with_id("s1", "bob", "rtneuron")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)));
}

#[tokio::test]
async fn test_create_delete_recreate_round_trip() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    state.manager.delete_session("s1").await.unwrap();
    assert!(state.manager.get_session("s1").await.is_err());
    // The second create succeeds.
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_suspend_gate_refuses_new_sessions() {
    let state = test_state();
    assert_eq!(
        state.manager.suspend_sessions().await,
        "Creation of new session now suspended"
    );
    let err = state
        .manager
        .create_session("alice", "rtneuron")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::SessionCreationSuspended));
    assert_eq!(err.status_code(), 403);

    // Suspending again reports the state unchanged.
    assert_eq!(
        state.manager.suspend_sessions().await,
        "Session creation already suspended"
    );

    assert_eq!(
        state.manager.resume_sessions().await,
        "Creation of new session now resumed"
    );
    assert!(state.manager.create_session("alice", "rtneuron").await.is_ok());
    assert_eq!(
        state.manager.resume_sessions().await,
        "Session creation already resumed"
    );
}

#[tokio::test]
async fn test_keep_alive_pushes_expiry_forward() {
    let state = test_state();
    let session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    let initial = session.valid_until;

    state.manager.keep_alive("s1").await.unwrap();
    let first = state.manager.get_session("s1").await.unwrap().valid_until;
    assert!(first >= initial);

    state.manager.keep_alive("s1").await.unwrap();
    let second = state.manager.get_session("s1").await.unwrap().valid_until;
    assert!(second >= first);
}

#[tokio::test]
async fn test_keep_alive_for_missing_session_is_not_found() {
    let state = test_state();
    let err = state.manager.keep_alive("ghost").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn test_query_status_of_stopped_session() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    let reply = state.manager.query_status("s1").await.unwrap();
    assert_eq!(reply.code, SessionStatus::Stopped);
    assert_eq!(reply.description, "rtneuron is not active");
}

#[tokio::test]
async fn test_query_status_reports_allocation_failure() {
    let state = test_state();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.status = SessionStatus::Failed;
    state.sessions.update(&session).await.unwrap();

    let reply = state.manager.query_status("s1").await.unwrap();
    assert_eq!(reply.code, SessionStatus::Failed);
    assert_eq!(reply.description, "Job allocation failed for rtneuron");
}

#[tokio::test]
async fn test_query_status_promotes_scheduled_once_host_is_known() {
    let state = test_state();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.status = SessionStatus::Scheduled;
    session.job_id = "12345".to_string();
    state.sessions.update(&session).await.unwrap();

    // No hostname yet: the session stays scheduled.
    let reply = state.manager.query_status("s1").await.unwrap();
    assert_eq!(reply.code, SessionStatus::Scheduled);

    session.http_host = "bbpviz1.cscs.ch".to_string();
    state.sessions.update(&session).await.unwrap();
    let reply = state.manager.query_status("s1").await.unwrap();
    assert_eq!(reply.code, SessionStatus::Starting);
    assert_eq!(reply.description, "rtneuron is starting");
}

#[tokio::test]
async fn test_query_status_promotes_starting_without_probe() {
    let state = test_state();
    state
        .registry
        .create(renderer_config("rtneuron", "/bin/echo", false))
        .await
        .unwrap();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.status = SessionStatus::Starting;
    session.job_id = "12345".to_string();
    session.http_host = "bbpviz1.cscs.ch".to_string();
    state.sessions.update(&session).await.unwrap();

    let reply = state.manager.query_status("s1").await.unwrap();
    assert_eq!(reply.code, SessionStatus::Running);
    assert_eq!(reply.description, "rtneuron is up and running");
    assert_eq!(reply.hostname, "bbpviz1.cscs.ch");
}

#[tokio::test]
async fn test_query_status_refreshes_expired_running_session() {
    let state = test_state();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.status = SessionStatus::Running;
    session.http_host = "localhost".to_string();
    session.valid_until = chrono::Utc::now() - chrono::Duration::seconds(30);
    state.sessions.update(&session).await.unwrap();

    state.manager.query_status("s1").await.unwrap();
    let refreshed = state.manager.get_session("s1").await.unwrap();
    assert!(refreshed.valid_until > chrono::Utc::now());
}

#[tokio::test]
async fn test_query_status_completes_stopping_deletion() {
    let state = test_state();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.status = SessionStatus::Stopping;
    state.sessions.update(&session).await.unwrap();

    let reply = state.manager.query_status("s1").await.unwrap();
    assert_eq!(reply.description, "rtneuron is terminating...");
    assert!(state.manager.get_session("s1").await.is_err());
}

#[tokio::test]
async fn test_schedule_requires_a_stopped_session() {
    let state = test_state();
    state
        .registry
        .create(renderer_config("rtneuron", "/bin/echo", false))
        .await
        .unwrap();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.status = SessionStatus::Running;
    state.sessions.update(&session).await.unwrap();

    let err = state
        .manager
        .schedule("s1", &JobInformation::default(), 3500)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_schedule_with_unknown_renderer_is_not_found() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "ghost")
        .await
        .unwrap();
    let err = state
        .manager
        .schedule("s1", &JobInformation::default(), 3500)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn test_local_schedule_attaches_process_and_runs() {
    let state = test_state();
    state
        .registry
        .create(renderer_config("rtneuron", "/bin/echo", false))
        .await
        .unwrap();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();

    state
        .manager
        .schedule("s1", &JobInformation::default(), 3500)
        .await
        .unwrap();

    let session = state.manager.get_session("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Starting);
    assert!(session.has_process());
    assert!(!session.has_job());
    assert_eq!(session.http_host, "localhost");
    assert_eq!(session.http_port, 3500);

    // No readiness probe required, so the next status query promotes.
    let reply = state.manager.query_status("s1").await.unwrap();
    assert_eq!(reply.code, SessionStatus::Running);

    state.manager.delete_session("s1").await.unwrap();
    assert!(state.manager.get_session("s1").await.is_err());
}

#[tokio::test]
async fn test_failed_local_spawn_marks_session_failed() {
    let state = test_state();
    state
        .registry
        .create(renderer_config(
            "broken",
            "/definitely/missing/binary-xyz12345",
            false,
        ))
        .await
        .unwrap();
    state
        .manager
        .create_session_with_id("s1", "alice", "broken")
        .await
        .unwrap();

    let err = state
        .manager
        .schedule("s1", &JobInformation::default(), 3500)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)));

    let session = state.manager.get_session("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    let reply = state.manager.query_status("s1").await.unwrap();
    assert_eq!(reply.description, "Job allocation failed for broken");
}

#[tokio::test]
async fn test_open_refuses_second_process() {
    let state = test_state();
    state
        .registry
        .create(renderer_config("rtneuron", "/bin/echo", false))
        .await
        .unwrap();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.process_pid = 4242;
    state.sessions.update(&session).await.unwrap();

    let err = state
        .manager
        .open("s1", "", "", 3500)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ProcessAlreadyStarted));
    assert_eq!(err.status_code(), 401);
}

#[tokio::test]
async fn test_verify_hostname_without_job_reports_current_host() {
    let state = test_state();
    let mut session = state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    session.http_host = "localhost".to_string();
    state.sessions.update(&session).await.unwrap();

    let message = state.manager.verify_hostname("s1").await.unwrap();
    assert_eq!(message, "Job is running on host localhost");
}

#[tokio::test]
async fn test_delete_survives_unreachable_graceful_exit() {
    let state = test_state();
    // graceful_exit is on but nothing listens on the backend port; the
    // teardown logs the failed exit call and still destroys the session.
    state
        .registry
        .create(
            serde_json::from_value(serde_json::json!({
                "id": "rtneuron",
                "command_line": "/bin/echo",
                "wait_until_running": false,
                "graceful_exit": true,
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    state
        .manager
        .schedule("s1", &JobInformation::default(), 3501)
        .await
        .unwrap();

    let message = state.manager.delete_session("s1").await.unwrap();
    assert_eq!(message, "Session successfully destroyed");
    assert!(state.manager.get_session("s1").await.is_err());
}

#[tokio::test]
async fn test_clear_sessions_removes_all_rows() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    state
        .manager
        .create_session_with_id("s2", "bob", "rtneuron")
        .await
        .unwrap();
    assert_eq!(
        state.manager.clear_sessions().await.unwrap(),
        "Sessions cleared"
    );
    assert!(state.manager.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registry_clear_removes_all_configurations() {
    let state = test_state();
    state
        .registry
        .create(renderer_config("rtneuron", "/bin/echo", false))
        .await
        .unwrap();
    state.registry.clear().await.unwrap();
    assert!(state.registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_twice_reports_not_found() {
    let state = test_state();
    state
        .manager
        .create_session_with_id("s1", "alice", "rtneuron")
        .await
        .unwrap();
    state.manager.delete_session("s1").await.unwrap();
    let err = state.manager.delete_session("s1").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}
