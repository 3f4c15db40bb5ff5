// src/core/allocator/mod.rs

//! Allocation backends for rendering resources.
//!
//! The three backends share one capability set and are modeled as a closed
//! variant chosen at startup from the configuration. One allocator instance
//! exists per broker and is injected into the session manager; each backend
//! serializes its external dialogue (SSH or REST) through a single mutex so
//! concurrent schedule calls observe a total order.

pub mod process;
pub mod slurm;
pub mod unicore;

pub use process::LocalProcessAllocator;
pub use slurm::SlurmAllocator;
pub use unicore::UnicoreAllocator;

use crate::core::errors::BrokerError;
use crate::core::models::{HostLookup, JobInformation, ResourceConfig, Session};
use crate::core::repository::SessionStore;
use std::time::Duration;
use tracing::{info, warn};

/// Text returned for logs that cannot be fetched in the current state.
pub const LOG_NOT_AVAILABLE: &str = "Not currently available";

/// The configured allocation backend.
pub enum Allocator {
    Slurm(SlurmAllocator),
    Unicore(UnicoreAllocator),
    Local(LocalProcessAllocator),
}

impl Allocator {
    /// Allocates a job and starts the rendering resource.
    pub async fn schedule(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        job: &JobInformation,
    ) -> Result<String, BrokerError> {
        match self {
            Allocator::Slurm(a) => a.schedule(store, session, config, job).await,
            Allocator::Unicore(a) => a.schedule(store, session, config, job).await,
            Allocator::Local(a) => a.schedule(store, session, config, job).await,
        }
    }

    /// Starts the rendering resource for an already-allocated job.
    pub async fn start(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        job: &JobInformation,
    ) -> Result<String, BrokerError> {
        match self {
            Allocator::Slurm(a) => a.start(store, session, config, job).await,
            Allocator::Unicore(a) => a.start(store, session, config).await,
            Allocator::Local(a) => {
                a.start(store, session, config, &job.params, &job.environment)
                    .await
            }
        }
    }

    /// Stops the resource, preferring a graceful exit when configured.
    pub async fn stop(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: Option<&ResourceConfig>,
    ) -> Result<String, BrokerError> {
        match self {
            Allocator::Slurm(a) => a.stop(store, session, config).await,
            Allocator::Unicore(a) => a.stop(store, session).await,
            Allocator::Local(a) => a.stop(store, session, config).await,
        }
    }

    /// Kills the job or process without any graceful-exit attempt.
    pub async fn kill(&self, session: &mut Session) -> Result<String, BrokerError> {
        match self {
            Allocator::Slurm(a) => a.kill(session).await,
            Allocator::Unicore(a) => a.kill(session).await,
            Allocator::Local(a) => a.kill(session).await,
        }
    }

    /// Asks the backend which host now serves the session's job.
    pub async fn hostname(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
    ) -> Result<HostLookup, BrokerError> {
        match self {
            Allocator::Slurm(a) => a.hostname(session).await,
            Allocator::Unicore(a) => a.hostname(store, session, config).await,
            Allocator::Local(a) => a.hostname(session).await,
        }
    }

    /// Returns scheduler-specific job information, verbatim.
    pub async fn job_information(&self, session: &Session) -> Result<String, BrokerError> {
        match self {
            Allocator::Slurm(a) => a.job_information(session).await,
            Allocator::Unicore(a) => a.job_information(session).await,
            Allocator::Local(a) => a.job_information(session).await,
        }
    }

    pub async fn out_log(&self, session: &Session) -> Result<String, BrokerError> {
        match self {
            Allocator::Slurm(a) => a.out_log(session).await,
            Allocator::Unicore(a) => a.out_log(session).await,
            Allocator::Local(a) => a.out_log(session).await,
        }
    }

    pub async fn err_log(&self, session: &Session) -> Result<String, BrokerError> {
        match self {
            Allocator::Slurm(a) => a.err_log(session).await,
            Allocator::Unicore(a) => a.err_log(session).await,
            Allocator::Local(a) => a.err_log(session).await,
        }
    }
}

/// Builds the shell program that starts a rendering binary on a remote node.
///
/// The program purges and loads environment modules, prefixes the command
/// line with environment variables, appends the formatted rest parameters and
/// any extra client parameters, and optionally redirects output into log
/// files and detaches.
pub fn build_launch_script(
    config: &ResourceConfig,
    job: &JobInformation,
    rest_parameters: &str,
    redirect: Option<(&str, &str)>,
    echo_hostname: bool,
) -> String {
    let mut script = String::new();
    if echo_hostname {
        // The hostname line is the contract the UNICORE hostname parser
        // relies on; see UnicoreAllocator::hostname.
        script.push_str("#!/bin/sh\n");
        script.push_str("echo HOSTNAME=$HOSTNAME\n");
    }
    script.push_str("module purge\n");
    for module in config.modules.split_whitespace() {
        script.push_str("module load ");
        script.push_str(module);
        script.push('\n');
    }
    for variable in config
        .environment_variables
        .split_whitespace()
        .chain(job.environment.split_whitespace())
    {
        script.push_str(variable);
        script.push(' ');
    }
    script.push_str(&config.command_line);
    for parameter in rest_parameters
        .split_whitespace()
        .chain(job.params.split_whitespace())
    {
        script.push(' ');
        script.push_str(parameter);
    }
    if let Some((out_file, err_file)) = redirect {
        script.push_str(" > ");
        script.push_str(out_file);
        script.push_str(" 2> ");
        script.push_str(err_file);
        script.push_str(" &");
    }
    script.push('\n');
    script
}

/// Asks the backend to exit through its HTTP control channel.
///
/// Failures are logged and swallowed; the caller proceeds to kill the job.
pub(crate) async fn request_graceful_exit(
    http: &reqwest::Client,
    session: &Session,
    exit_path: &str,
    timeout: Duration,
) {
    if session.http_host.is_empty() {
        return;
    }
    let url = format!(
        "http://{}:{}/{}",
        session.http_host, session.http_port, exit_path
    );
    info!("Gracefully exiting rendering resource at {url}");
    match http.put(&url).timeout(timeout).send().await {
        Ok(_) => {}
        Err(e) => warn!("Graceful exit request failed: {e}"),
    }
}
