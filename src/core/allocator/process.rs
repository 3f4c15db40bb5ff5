// src/core/allocator/process.rs

//! The local-process allocator, for development or co-located deployments.
//!
//! Rendering binaries are spawned directly on the broker host; the session
//! keeps the PID. Teardown prefers the graceful-exit HTTP call, then SIGTERM
//! with a 2 second grace period, then SIGKILL, and reaps any zombie left by
//! processes the broker did not spawn itself.

use super::{LOG_NOT_AVAILABLE, request_graceful_exit};
use crate::core::errors::BrokerError;
use crate::core::models::{HostLookup, JobInformation, ResourceConfig, Session, SessionStatus};
use crate::core::registry::{format_rest_parameters, rest_schema};
use crate::core::repository::SessionStore;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Grace period between SIGTERM and SIGKILL.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Allocator spawning rendering binaries as local child processes.
#[derive(Clone)]
pub struct LocalProcessAllocator {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    /// Children spawned by this broker instance, keyed by PID. Sessions may
    /// outlive a broker restart, so stop falls back to raw signals for PIDs
    /// that are not in this map.
    children: DashMap<i32, Child>,
    http: reqwest::Client,
    request_timeout: Duration,
    exit_path: String,
}

impl LocalProcessAllocator {
    pub fn new(http: reqwest::Client, request_timeout: Duration, exit_path: String) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                children: DashMap::new(),
                http,
                request_timeout,
                exit_path,
            }),
        }
    }

    /// Local rendition of the uniform schedule operation: the backend host is
    /// the broker host itself and starting is immediate.
    pub async fn schedule(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        job: &JobInformation,
    ) -> Result<String, BrokerError> {
        if session.has_process() {
            return Err(BrokerError::ProcessAlreadyStarted);
        }
        session.http_host = "localhost".to_string();
        self.start(store, session, config, &job.params, &job.environment)
            .await
    }

    /// Spawns the configured binary and attaches its PID to the session.
    pub async fn start(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        params: &str,
        environment: &str,
    ) -> Result<String, BrokerError> {
        let schema = rest_schema(&config.id, &session.id);
        let default_parameters = format_rest_parameters(
            &config.process_rest_parameters_format,
            &session.http_host,
            session.http_port,
            &schema,
            &session.job_id,
        );

        let mut tokens = config.command_line.split_whitespace();
        let program = tokens.next().ok_or_else(|| {
            BrokerError::InvalidRequest(format!("{} has an empty command line", config.id))
        })?;

        let mut command = Command::new(program);
        command
            .args(tokens)
            .args(default_parameters.split_whitespace())
            .args(params.split_whitespace())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in parse_environment(&config.environment_variables, environment) {
            command.env(key, value);
        }

        info!("Launching {} with {}", config.id, config.command_line);
        let child = command.spawn()?;
        let pid = child
            .id()
            .map(|p| p as i32)
            .ok_or_else(|| BrokerError::Internal("spawned process has no PID".to_string()))?;
        self.inner.children.insert(pid, child);

        session.process_pid = pid;
        session.status = SessionStatus::Starting;
        store.update(session).await?;
        Ok(format!("Process started with pid {pid}"))
    }

    /// Gently stops the attached process and reaps it.
    pub async fn stop(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: Option<&ResourceConfig>,
    ) -> Result<String, BrokerError> {
        if !session.has_process() {
            return Err(BrokerError::NotFound("Process does not exist".to_string()));
        }
        if config.is_some_and(|c| c.graceful_exit) {
            request_graceful_exit(
                &self.inner.http,
                session,
                &self.inner.exit_path,
                self.inner.request_timeout,
            )
            .await;
        }

        let pid = session.process_pid;
        info!("Terminating process {pid}");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        tokio::time::sleep(STOP_GRACE_PERIOD).await;
        self.finish_off(pid).await;

        session.process_pid = -1;
        if let Err(e) = store.update(session).await {
            warn!("Failed to persist process teardown: {e}");
        }
        Ok(format!("Successfully closed process {pid}"))
    }

    /// Kills the attached process immediately. Only for when stop failed.
    pub async fn kill(&self, session: &mut Session) -> Result<String, BrokerError> {
        if !session.has_process() {
            return Err(BrokerError::NotFound("Process does not exist".to_string()));
        }
        let pid = session.process_pid;
        self.finish_off(pid).await;
        session.process_pid = -1;
        Ok(format!("Successfully closed process {pid}"))
    }

    /// Ensures the process is dead and reaped, whether or not it was spawned
    /// by this broker instance.
    async fn finish_off(&self, pid: i32) {
        match self.inner.children.remove(&pid) {
            Some((_, mut child)) => {
                match child.try_wait() {
                    Ok(Some(status)) => info!("Process {pid} exited with {status}"),
                    _ => {
                        info!("Failed to stop process {pid}. Killing it");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }
            None => unsafe {
                if libc::kill(pid, 0) == 0 {
                    info!("Failed to stop process {pid}. Killing it");
                    libc::kill(pid, libc::SIGKILL);
                }
                // Reap any zombie child left behind.
                libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG);
            },
        }
    }

    pub async fn hostname(&self, session: &Session) -> Result<HostLookup, BrokerError> {
        if session.has_process() {
            let host = if session.http_host.is_empty() {
                "localhost".to_string()
            } else {
                session.http_host.clone()
            };
            Ok(HostLookup::Resolved(host))
        } else {
            Ok(HostLookup::Pending)
        }
    }

    /// Reports whether the attached PID is still alive.
    pub async fn job_information(&self, session: &Session) -> Result<String, BrokerError> {
        if !session.has_process() {
            return Ok(LOG_NOT_AVAILABLE.to_string());
        }
        let pid = session.process_pid;
        let alive = unsafe { libc::kill(pid, 0) == 0 };
        Ok(if alive {
            format!("Process {pid} is running")
        } else {
            format!("Process {pid} is not running")
        })
    }

    pub async fn out_log(&self, _session: &Session) -> Result<String, BrokerError> {
        Ok(LOG_NOT_AVAILABLE.to_string())
    }

    pub async fn err_log(&self, _session: &Session) -> Result<String, BrokerError> {
        Ok(LOG_NOT_AVAILABLE.to_string())
    }
}

/// Merges configured `K=V` pairs (whitespace-separated) with client-supplied
/// ones (comma-separated); entries without a `=` are dropped.
pub fn parse_environment(configured: &str, extra: &str) -> Vec<(String, String)> {
    configured
        .split_whitespace()
        .chain(extra.split(','))
        .filter_map(|entry| {
            let entry = entry.trim();
            entry
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}
