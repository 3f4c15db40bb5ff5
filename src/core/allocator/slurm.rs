// src/core/allocator/slurm.rs

//! The SSH-batch allocator, targeting a SLURM system reachable over SSH from
//! the broker host.
//!
//! Scheduling is `salloc` allocation followed by hostname resolution and a
//! remote start of the rendering binary. The `Granted`, `JobState=` and
//! `BatchHost=` parsing mirrors what the scheduler actually prints.

use super::{LOG_NOT_AVAILABLE, build_launch_script, request_graceful_exit};
use crate::config::SlurmConfig;
use crate::core::errors::BrokerError;
use crate::core::models::{HostLookup, JobInformation, ResourceConfig, Session, SessionStatus};
use crate::core::registry::{format_rest_parameters, rest_schema};
use crate::core::repository::SessionStore;
use regex::Regex;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Extension of the remote file capturing the rendering binary's stdout.
pub const SLURM_OUT_FILE: &str = "out.log";
/// Extension of the remote file capturing the rendering binary's stderr.
pub const SLURM_ERR_FILE: &str = "err.log";

static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Allocator for SLURM batch jobs driven over SSH.
pub struct SlurmAllocator {
    settings: SlurmConfig,
    http: reqwest::Client,
    request_timeout: Duration,
    exit_path: String,
    /// Serializes the SSH dialogue so concurrent schedules observe a total order.
    mutex: Mutex<()>,
}

impl SlurmAllocator {
    pub fn new(
        settings: SlurmConfig,
        http: reqwest::Client,
        request_timeout: Duration,
        exit_path: String,
    ) -> Self {
        Self {
            settings,
            http,
            request_timeout,
            exit_path,
            mutex: Mutex::new(()),
        }
    }

    /// Allocates a job, resolves the batch host and starts the rendering
    /// resource on it. On success the session carries the job id and ends in
    /// STARTING (or RUNNING when no readiness probe is required).
    pub async fn schedule(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        job: &JobInformation,
    ) -> Result<String, BrokerError> {
        let _guard = self.mutex.lock().await;
        self.allocate(store, session, config, job).await?;
        if let HostLookup::Resolved(host) = self.resolve_hostname(session).await? {
            session.http_host = host;
            store.update(session).await?;
        }
        self.launch(store, session, config, job).await
    }

    /// Iterates the candidate cluster entry nodes until one grants an
    /// allocation. A refusal marks the session FAILED and moves on to the
    /// next candidate; exhaustion surfaces `AllocationFailed`.
    async fn allocate(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        job: &JobInformation,
    ) -> Result<(), BrokerError> {
        for cluster_node in &self.settings.hosts {
            session.status = SessionStatus::Scheduling;
            session.cluster_node = cluster_node.clone();
            store.update(session).await?;

            info!("Scheduling job for session {}", session.id);
            let command = build_allocation_command(&self.settings, session, config, job);
            debug!("{command}");

            match self.run_ssh(cluster_node, &command).await {
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if let Some(job_id) = parse_granted_job_id(&stderr) {
                        info!("Allocated job {job_id} on cluster node {cluster_node}");
                        session.job_id = job_id;
                        session.status = SessionStatus::Scheduled;
                        store.update(session).await?;
                        return Ok(());
                    }
                    warn!("Allocation refused on {cluster_node}: {}", stderr.trim());
                    session.status = SessionStatus::Failed;
                    store.update(session).await?;
                }
                Err(e) => {
                    warn!("Allocation attempt on {cluster_node} failed: {e}");
                    session.status = SessionStatus::Failed;
                    store.update(session).await?;
                }
            }
        }
        Err(BrokerError::AllocationFailed(session.renderer_id.clone()))
    }

    /// Starts the rendering binary on the resolved batch host.
    pub async fn start(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        job: &JobInformation,
    ) -> Result<String, BrokerError> {
        let _guard = self.mutex.lock().await;
        self.launch(store, session, config, job).await
    }

    /// Start body: pipes a shell program into an SSH session on the host.
    /// The caller must hold the allocator mutex.
    async fn launch(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        job: &JobInformation,
    ) -> Result<String, BrokerError> {
        session.status = SessionStatus::Starting;
        store.update(session).await?;

        let schema = rest_schema(&config.id, &session.id);
        let rest_parameters = format_rest_parameters(
            &config.scheduler_rest_parameters_format,
            &session.http_host,
            session.http_port,
            &schema,
            &session.job_id,
        );
        let out_file = log_file_name(&self.settings.output_prefix, session, SLURM_OUT_FILE);
        let err_file = log_file_name(&self.settings.output_prefix, session, SLURM_ERR_FILE);
        let script = build_launch_script(
            config,
            job,
            &rest_parameters,
            Some((&out_file, &err_file)),
            false,
        );

        info!("Connecting to cluster machine {}", session.http_host);
        debug!("Full command:\n{script}");
        let output = self.run_ssh_shell(&session.http_host, &script).await?;
        debug!("{}", String::from_utf8_lossy(&output.stdout));

        session.status = if config.wait_until_running {
            SessionStatus::Starting
        } else {
            SessionStatus::Running
        };
        store.update(session).await?;
        Ok(format!("{} successfully started", session.renderer_id))
    }

    /// Stops the job, attempting a graceful exit through the backend's HTTP
    /// control channel first when the configuration asks for one.
    pub async fn stop(
        &self,
        _store: &dyn SessionStore,
        session: &mut Session,
        config: Option<&ResourceConfig>,
    ) -> Result<String, BrokerError> {
        let _guard = self.mutex.lock().await;
        if config.is_some_and(|c| c.graceful_exit) {
            request_graceful_exit(&self.http, session, &self.exit_path, self.request_timeout)
                .await;
        }
        self.cancel_job(session).await
    }

    /// Cancels the job without any graceful-exit attempt.
    pub async fn kill(&self, session: &mut Session) -> Result<String, BrokerError> {
        let _guard = self.mutex.lock().await;
        self.cancel_job(session).await
    }

    async fn cancel_job(&self, session: &Session) -> Result<String, BrokerError> {
        if !session.has_job() {
            return Err(BrokerError::InvalidRequest(
                "no job attached to session".to_string(),
            ));
        }
        info!("Stopping job {}", session.job_id);
        let output = self
            .run_ssh(&session.cluster_node, &format!("scancel {}", session.job_id))
            .await?;
        debug!("{}", String::from_utf8_lossy(&output.stdout));
        Ok("Job successfully cancelled".to_string())
    }

    /// Resolves the host serving the session's job via `scontrol`.
    pub async fn hostname(&self, session: &Session) -> Result<HostLookup, BrokerError> {
        let _guard = self.mutex.lock().await;
        self.resolve_hostname(session).await
    }

    async fn resolve_hostname(&self, session: &Session) -> Result<HostLookup, BrokerError> {
        if !session.has_job() {
            return Ok(HostLookup::Pending);
        }
        let output = self.query_job(session).await?;
        let lookup = interpret_job_query(&output, &session.cluster_node);
        if let HostLookup::Resolved(host) = &lookup {
            info!("Job {} is running on host {host}", session.job_id);
        }
        Ok(lookup)
    }

    /// Returns the raw `scontrol show job` output. No parsing contract is
    /// defined for this text; clients receive it verbatim.
    pub async fn job_information(&self, session: &Session) -> Result<String, BrokerError> {
        if !session.has_job() {
            return Ok(LOG_NOT_AVAILABLE.to_string());
        }
        let _guard = self.mutex.lock().await;
        let output = self.query_job(session).await?;
        Ok(output)
    }

    pub async fn out_log(&self, session: &Session) -> Result<String, BrokerError> {
        self.fetch_log(session, SLURM_OUT_FILE).await
    }

    pub async fn err_log(&self, session: &Session) -> Result<String, BrokerError> {
        self.fetch_log(session, SLURM_ERR_FILE).await
    }

    async fn fetch_log(&self, session: &Session, extension: &str) -> Result<String, BrokerError> {
        if !matches!(
            session.status,
            SessionStatus::Starting | SessionStatus::Running
        ) {
            return Ok(LOG_NOT_AVAILABLE.to_string());
        }
        let _guard = self.mutex.lock().await;
        let file = log_file_name(&self.settings.output_prefix, session, extension);
        debug!("Querying log: {file}");
        let output = self
            .run_ssh(&session.cluster_node, &format!("cat {file}"))
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn query_job(&self, session: &Session) -> Result<String, BrokerError> {
        let output = self
            .run_ssh(
                &session.cluster_node,
                &format!("scontrol show job {}", session.job_id),
            )
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_ssh(
        &self,
        target: &str,
        remote_command: &str,
    ) -> Result<std::process::Output, BrokerError> {
        let output = Command::new("ssh")
            .arg("-i")
            .arg(&self.settings.ssh_key)
            .arg(format!("{}@{}", self.settings.username, target))
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }

    /// Opens an SSH shell on `target` and pipes `script` into its stdin.
    async fn run_ssh_shell(
        &self,
        target: &str,
        script: &str,
    ) -> Result<std::process::Output, BrokerError> {
        let mut child = Command::new("ssh")
            .arg("-i")
            .arg(&self.settings.ssh_key)
            .arg(format!("{}@{}", self.settings.username, target))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        Ok(output)
    }
}

/// Builds the remote `salloc` command for one allocation attempt.
///
/// Non-zero / non-empty `JobInformation` values override the resource
/// configuration; a node count of 0 omits `-N` entirely.
pub fn build_allocation_command(
    settings: &SlurmConfig,
    session: &Session,
    config: &ResourceConfig,
    job: &JobInformation,
) -> String {
    let mut options = String::new();
    if job.exclusive_allocation || config.exclusive {
        options.push_str(" --exclusive");
    }

    let nb_nodes = if job.nb_nodes != 0 {
        job.nb_nodes
    } else {
        config.nb_nodes
    };
    if nb_nodes != 0 {
        options.push_str(&format!(" -N {nb_nodes}"));
    }

    let nb_cpus = if job.nb_cpus != 0 {
        job.nb_cpus
    } else {
        config.nb_cpus
    };
    options.push_str(&format!(" -c {nb_cpus}"));

    let nb_gpus = if job.nb_gpus != 0 {
        job.nb_gpus
    } else {
        config.nb_gpus
    };
    options.push_str(&format!(" --gres=gpu:{nb_gpus}"));

    let memory = if job.memory != 0 {
        job.memory
    } else {
        config.memory
    };
    options.push_str(&format!(" --mem={memory}"));

    if !job.reservation.is_empty() {
        options.push_str(&format!(" --reservation={}", job.reservation));
    }

    let queue = if job.queue.is_empty() {
        &config.queue
    } else {
        &job.queue
    };
    let project = if job.project.is_empty() {
        &config.project
    } else {
        &job.project
    };
    let allocation_time = if job.allocation_time.is_empty() {
        &settings.default_time
    } else {
        &job.allocation_time
    };

    let job_name = format!("{}_{}", session.owner, config.id);
    format!(
        "salloc --no-shell --immediate={} -p {queue} --account={project} \
         --job-name={job_name} --time={allocation_time}{options}",
        settings.allocation_timeout_secs
    )
}

/// Extracts the job id from `salloc` stderr. The allocation is granted only
/// when the word `Granted` appears; the job id is the first run of digits.
pub fn parse_granted_job_id(stderr: &str) -> Option<String> {
    if !stderr.contains("Granted") {
        return None;
    }
    JOB_ID_RE
        .find(stderr)
        .map(|m| m.as_str().to_string())
}

/// Extracts a `Key=value` attribute from `scontrol show job` output.
pub fn parse_job_attribute(output: &str, attribute: &str) -> Option<String> {
    let re = Regex::new(&format!(r"{}=(\w+)", regex::escape(attribute))).ok()?;
    re.captures(output)
        .map(|captures| captures[1].to_string())
}

/// The domain part of a cluster entry node: everything after the first dot.
pub fn host_domain(cluster_node: &str) -> &str {
    cluster_node
        .split_once('.')
        .map(|(_, domain)| domain)
        .unwrap_or("")
}

/// Maps one `scontrol show job` reply to a hostname lookup outcome.
///
/// CANCELLED jobs stay pending so the caller can fall back to SCHEDULED;
/// terminal scheduler states produce the FAILED sentinel that deletes the
/// session. The batch host is qualified with the entry node's domain.
pub fn interpret_job_query(output: &str, cluster_node: &str) -> HostLookup {
    match parse_job_attribute(output, "JobState").as_deref() {
        None => HostLookup::Pending,
        Some("CANCELLED") => HostLookup::Pending,
        Some("FAILED") | Some("TIMEOUT") | Some("NODE_FAIL") => HostLookup::Failed,
        Some(_) => match parse_job_attribute(output, "BatchHost") {
            Some(host) => {
                let domain = host_domain(cluster_node);
                if domain.is_empty() {
                    HostLookup::Resolved(host)
                } else {
                    HostLookup::Resolved(format!("{host}.{domain}"))
                }
            }
            None => HostLookup::Pending,
        },
    }
}

/// The remote log file for a session: `<prefix>_<job_id>_<renderer>_<ext>`.
pub fn log_file_name(prefix: &str, session: &Session, extension: &str) -> String {
    format!(
        "{prefix}_{}_{}_{extension}",
        session.job_id, session.renderer_id
    )
}
