use renderbroker::config::SlurmConfig;
use renderbroker::core::allocator::slurm::{
    SLURM_ERR_FILE, SLURM_OUT_FILE, build_allocation_command, host_domain, interpret_job_query,
    log_file_name, parse_granted_job_id, parse_job_attribute,
};
use renderbroker::core::models::{HostLookup, JobInformation, ResourceConfig, Session};

fn slurm_settings() -> SlurmConfig {
    serde_json::from_value(serde_json::json!({
        "username": "vizuser",
        "ssh_key": "/etc/keys/viz",
        "hosts": ["bbpviz.cscs.ch"],
        "default_queue": "interactive",
        "default_time": "08:00:00",
    }))
    .expect("valid slurm settings")
}

fn renderer() -> ResourceConfig {
    serde_json::from_value(serde_json::json!({
        "id": "rtneuron",
        "command_line": "rtneuron-app.py",
        "project": "proj16",
        "queue": "interactive",
        "nb_cpus": 4,
        "nb_gpus": 1,
        "memory": 8192,
    }))
    .expect("valid renderer config")
}

fn session() -> Session {
    let mut session = Session::new("abc", "alice", "rtneuron", 600);
    session.cluster_node = "bbpviz.cscs.ch".to_string();
    session
}

#[test]
fn test_allocation_command_defaults() {
    let command =
        build_allocation_command(&slurm_settings(), &session(), &renderer(), &JobInformation::default());
    assert_eq!(
        command,
        "salloc --no-shell --immediate=10 -p interactive --account=proj16 \
         --job-name=alice_rtneuron --time=08:00:00 -c 4 --gres=gpu:1 --mem=8192"
    );
}

#[test]
fn test_allocation_command_overrides_beat_configuration() {
    let mut job = JobInformation::default();
    job.nb_nodes = 2;
    job.nb_cpus = 16;
    job.memory = 65536;
    job.exclusive_allocation = true;
    job.reservation = "demo".to_string();
    job.queue = "prod".to_string();
    job.allocation_time = "01:00:00".to_string();
    let command = build_allocation_command(&slurm_settings(), &session(), &renderer(), &job);
    assert!(command.contains("--exclusive"));
    assert!(command.contains("-N 2"));
    assert!(command.contains("-c 16"));
    assert!(command.contains("--mem=65536"));
    assert!(command.contains("--reservation=demo"));
    assert!(command.contains("-p prod"));
    assert!(command.contains("--time=01:00:00"));
}

#[test]
fn test_allocation_command_omits_nodes_when_zero() {
    let command =
        build_allocation_command(&slurm_settings(), &session(), &renderer(), &JobInformation::default());
    assert!(!command.contains("-N "));
}

#[test]
fn test_granted_job_id_extraction() {
    let stderr = "salloc: Granted job allocation 12345\n";
    assert_eq!(parse_granted_job_id(stderr), Some("12345".to_string()));
}

#[test]
fn test_refused_allocation_yields_no_job_id() {
    let stderr = "salloc: error: Unable to allocate resources: Requested time limit is invalid\n";
    assert_eq!(parse_granted_job_id(stderr), None);
}

#[test]
fn test_job_attribute_parsing() {
    let output = "JobId=12345 JobName=alice_rtneuron\n   JobState=RUNNING Reason=None\n   BatchHost=bbpviz1\n";
    assert_eq!(
        parse_job_attribute(output, "JobState"),
        Some("RUNNING".to_string())
    );
    assert_eq!(
        parse_job_attribute(output, "BatchHost"),
        Some("bbpviz1".to_string())
    );
    assert_eq!(parse_job_attribute(output, "Missing"), None);
}

#[test]
fn test_host_domain_is_everything_after_first_dot() {
    assert_eq!(host_domain("bbpviz.cscs.ch"), "cscs.ch");
    assert_eq!(host_domain("plainhost"), "");
}

#[test]
fn test_running_job_resolves_qualified_host() {
    let output = "JobState=RUNNING BatchHost=bbpviz1";
    assert_eq!(
        interpret_job_query(output, "bbpviz.cscs.ch"),
        HostLookup::Resolved("bbpviz1.cscs.ch".to_string())
    );
}

#[test]
fn test_cancelled_job_stays_pending() {
    let output = "JobState=CANCELLED BatchHost=bbpviz1";
    assert_eq!(
        interpret_job_query(output, "bbpviz.cscs.ch"),
        HostLookup::Pending
    );
}

#[test]
fn test_terminal_job_states_are_failed() {
    for state in ["FAILED", "TIMEOUT", "NODE_FAIL"] {
        let output = format!("JobState={state} BatchHost=bbpviz1");
        assert_eq!(
            interpret_job_query(&output, "bbpviz.cscs.ch"),
            HostLookup::Failed,
            "state {state}"
        );
    }
}

#[test]
fn test_pending_job_without_batch_host() {
    let output = "JobState=PENDING Reason=Resources";
    assert_eq!(
        interpret_job_query(output, "bbpviz.cscs.ch"),
        HostLookup::Pending
    );
}

#[test]
fn test_garbage_output_stays_pending() {
    assert_eq!(
        interpret_job_query("ssh: connection refused", "bbpviz.cscs.ch"),
        HostLookup::Pending
    );
}

#[test]
fn test_log_file_names() {
    let mut session = session();
    session.job_id = "12345".to_string();
    assert_eq!(
        log_file_name("/var/log/vws", &session, SLURM_OUT_FILE),
        "/var/log/vws_12345_rtneuron_out.log"
    );
    assert_eq!(
        log_file_name("/var/log/vws", &session, SLURM_ERR_FILE),
        "/var/log/vws_12345_rtneuron_err.log"
    );
}
