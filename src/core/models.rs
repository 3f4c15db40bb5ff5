// src/core/models.rs

//! Data model shared by the repositories, the allocators and the session manager.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Maximum length of a session identifier.
pub const SESSION_ID_MAX_LEN: usize = 64;
/// Maximum length of a resource configuration name.
pub const CONFIG_ID_MAX_LEN: usize = 50;

/// Lifecycle states of a session.
///
/// The state machine advances monotonically except for the recoverable
/// SCHEDULED <-> GETTING_HOSTNAME pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// No rendering resource is active.
    #[default]
    Stopped,
    /// The allocator is negotiating with the batch system or grid.
    Scheduling,
    /// A job exists but the resource is not started yet.
    Scheduled,
    /// The allocator is being asked which host serves the job.
    GettingHostname,
    /// The resource is started but not yet ready to serve REST requests.
    Starting,
    /// The resource answered the readiness probe and accepts REST traffic.
    Running,
    /// Teardown was requested; no further mutation is allowed.
    Stopping,
    /// The allocation was refused by every candidate.
    Failed,
}

/// A user session, binding a cookie to one rendering resource and its allocator state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner: String,
    /// Name of the `ResourceConfig` driving this session.
    pub renderer_id: String,
    pub created: DateTime<Utc>,
    /// Pushed forward on every keep-alive; the sweeper reaps sessions past it.
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub status: SessionStatus,
    /// Opaque to the core; meaningful only to the allocator that wrote it.
    /// The UNICORE allocator stores the normalized job URL here.
    #[serde(default)]
    pub job_id: String,
    /// PID of an attached local process, -1 when none.
    #[serde(default = "default_process_pid")]
    pub process_pid: i32,
    /// Backend endpoint discovered after allocation; empty until resolved.
    #[serde(default)]
    pub http_host: String,
    #[serde(default)]
    pub http_port: u16,
    /// Batch-scheduler entry node against which SSH commands run.
    #[serde(default)]
    pub cluster_node: String,
    /// UNICORE working-directory URL for this job.
    #[serde(default)]
    pub work_dir: String,
    /// Last-seen client-supplied blobs.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub parameters: String,
}

fn default_process_pid() -> i32 {
    -1
}

impl Session {
    /// Creates a fresh STOPPED session valid for `keep_alive_timeout` seconds.
    pub fn new(id: &str, owner: &str, renderer_id: &str, keep_alive_timeout: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            owner: owner.to_string(),
            renderer_id: renderer_id.to_string(),
            created: now,
            valid_until: now + Duration::seconds(keep_alive_timeout as i64),
            status: SessionStatus::Stopped,
            job_id: String::new(),
            process_pid: -1,
            http_host: String::new(),
            http_port: 0,
            cluster_node: String::new(),
            work_dir: String::new(),
            command: String::new(),
            parameters: String::new(),
        }
    }

    /// True when an allocator owns a job for this session.
    pub fn has_job(&self) -> bool {
        !self.job_id.is_empty()
    }

    /// True when a local process is attached to this session.
    pub fn has_process(&self) -> bool {
        self.process_pid != -1
    }

    /// Pushes the expiration timestamp `keep_alive_timeout` seconds into the future.
    pub fn refresh_valid_until(&mut self, keep_alive_timeout: u64) {
        self.valid_until = Utc::now() + Duration::seconds(keep_alive_timeout as i64);
    }
}

/// A named template describing how to launch a rendering binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Lowercase name, unique across the registry.
    pub id: String,
    /// Executable and fixed arguments.
    pub command_line: String,
    /// Whitespace-separated `K=V` pairs.
    #[serde(default)]
    pub environment_variables: String,
    /// Whitespace-separated names for environment-module loading.
    #[serde(default)]
    pub modules: String,
    /// Parameter templates; see [`crate::core::registry::format_rest_parameters`].
    #[serde(default)]
    pub process_rest_parameters_format: String,
    #[serde(default)]
    pub scheduler_rest_parameters_format: String,
    /// Scheduler account.
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub nb_nodes: u32,
    #[serde(default = "default_nb_cpus")]
    pub nb_cpus: u32,
    #[serde(default)]
    pub nb_gpus: u32,
    #[serde(default)]
    pub memory: u32,
    /// Issue `PUT /v1/exit` to the backend before killing the job.
    #[serde(default = "default_true")]
    pub graceful_exit: bool,
    /// Require a readiness probe to pass before declaring RUNNING.
    #[serde(default = "default_true")]
    pub wait_until_running: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

fn default_nb_cpus() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

/// The admission gate and keep-alive timeout, owned by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// When false, new sessions are refused with 403.
    pub session_creation: bool,
    pub session_keep_alive_timeout: u64,
}

impl GlobalSettings {
    pub fn new(session_keep_alive_timeout: u64) -> Self {
        Self {
            session_creation: true,
            session_keep_alive_timeout,
        }
    }
}

/// Per-call overrides for a scheduling request. Non-zero / non-empty values
/// take precedence over the `ResourceConfig` defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInformation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default, rename = "reservation_name")]
    pub reservation: String,
    #[serde(default, rename = "queue_name")]
    pub queue: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub exclusive_allocation: bool,
    #[serde(default)]
    pub nb_nodes: u32,
    #[serde(default)]
    pub nb_cpus: u32,
    #[serde(default)]
    pub nb_gpus: u32,
    #[serde(default)]
    pub memory: u32,
    #[serde(default)]
    pub allocation_time: String,
    /// Bearer token passed through to the UNICORE allocator.
    #[serde(skip)]
    pub authorization: Option<String>,
}

/// Outcome of asking an allocator which host serves a session's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLookup {
    /// The backend host is known.
    Resolved(String),
    /// The job exists but no host is assigned yet.
    Pending,
    /// The job is gone for good; the session must be deleted.
    Failed,
}

/// JSON payload returned by the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub session: String,
    pub code: SessionStatus,
    pub description: String,
    pub hostname: String,
    pub port: String,
}
