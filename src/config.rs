// src/config.rs

//! Manages broker configuration: loading, defaulting, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// Selects the allocation backend used for the `schedule` command.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    /// SLURM batch system reached over SSH.
    Slurm,
    /// UNICORE REST grid.
    Unicore,
    /// Local process on the broker host, for development or co-located setups.
    #[default]
    Local,
}

/// Session lifecycle tunables.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    /// Delay after which a session is closed if no keep-alive message is received.
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout_secs: u64,
    /// Frequency at which the keep-alive sweeper checks for expired sessions.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Timeout for readiness probes, graceful-exit calls and forwarded requests.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Well-known path probed on the backend to detect REST readiness.
    #[serde(default = "default_vocabulary_path")]
    pub vocabulary_path: String,
    /// Path used to ask a backend to exit gracefully before the job is killed.
    #[serde(default = "default_exit_path")]
    pub exit_path: String,
    /// Base of the randomized HTTP port assigned to a backend on schedule/open.
    #[serde(default = "default_renderer_port")]
    pub default_renderer_port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout_secs: default_keep_alive_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            request_timeout_secs: default_request_timeout(),
            vocabulary_path: default_vocabulary_path(),
            exit_path: default_exit_path(),
            default_renderer_port: default_renderer_port(),
        }
    }
}

fn default_keep_alive_timeout() -> u64 {
    600
}
fn default_sweep_interval() -> u64 {
    100
}
fn default_request_timeout() -> u64 {
    5
}
fn default_vocabulary_path() -> String {
    "registry".to_string()
}
fn default_exit_path() -> String {
    "v1/exit".to_string()
}
fn default_renderer_port() -> u16 {
    3000
}

/// Settings for the SSH-batch (SLURM) allocator.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SlurmConfig {
    /// Account used for all SSH dialogues with the cluster entry nodes.
    #[serde(default)]
    pub username: String,
    /// Path to the private key passed to `ssh -i`.
    #[serde(default)]
    pub ssh_key: String,
    /// Candidate cluster entry nodes, tried in order during allocation.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub default_queue: String,
    /// Default wall-clock time for allocations (`salloc --time`).
    #[serde(default)]
    pub default_time: String,
    /// `salloc --immediate` timeout in seconds.
    #[serde(default = "default_allocation_timeout")]
    pub allocation_timeout_secs: u64,
    /// Prefix of the remote log files the started binaries redirect into.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
}

fn default_allocation_timeout() -> u64 {
    10
}
fn default_output_prefix() -> String {
    "/var/log/vws".to_string()
}

/// Settings for the UNICORE grid allocator.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UnicoreConfig {
    /// URL of the UNICORE registry listing the available sites.
    #[serde(default)]
    pub registry_url: String,
    /// Name of the site jobs are submitted to.
    #[serde(default)]
    pub default_site: String,
    /// Largest remote log file the broker will fetch, in bytes.
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
}

fn default_max_log_size() -> u64 {
    2_048_000
}

/// Settings for the image-feed sidecar collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ImageFeedConfig {
    /// Base URL of the image streaming service. Routes are not managed when unset.
    #[serde(default)]
    pub url: Option<String>,
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_base_url_prefix")]
    base_url_prefix: String,
    #[serde(default)]
    allocator: AllocatorKind,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    slurm: SlurmConfig,
    #[serde(default)]
    unicore: UnicoreConfig,
    #[serde(default)]
    image_feed: ImageFeedConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8095
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_base_url_prefix() -> String {
    "/rrm/v1".to_string()
}

/// Represents the final, validated broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// URI prefix all routes are nested under, e.g. `/rrm/v1`.
    pub base_url_prefix: String,
    pub allocator: AllocatorKind,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub slurm: SlurmConfig,
    #[serde(default)]
    pub unicore: UnicoreConfig,
    #[serde(default)]
    pub image_feed: ImageFeedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            base_url_prefix: default_base_url_prefix(),
            allocator: AllocatorKind::default(),
            session: SessionConfig::default(),
            slurm: SlurmConfig::default(),
            unicore: UnicoreConfig::default(),
            image_feed: ImageFeedConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents)
    }

    /// Parses and validates a configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse TOML config")?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            base_url_prefix: raw.base_url_prefix,
            allocator: raw.allocator,
            session: raw.session,
            slurm: raw.slurm,
            unicore: raw.unicore,
            image_feed: raw.image_feed,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if !self.base_url_prefix.starts_with('/') {
            return Err(anyhow!("base_url_prefix must start with '/'"));
        }
        if self.session.keep_alive_timeout_secs == 0 {
            return Err(anyhow!("session.keep_alive_timeout_secs cannot be 0"));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(anyhow!("session.sweep_interval_secs cannot be 0"));
        }

        match self.allocator {
            AllocatorKind::Slurm => {
                if self.slurm.username.trim().is_empty() {
                    return Err(anyhow!("slurm.username is required for the slurm allocator"));
                }
                if self.slurm.ssh_key.trim().is_empty() {
                    return Err(anyhow!("slurm.ssh_key is required for the slurm allocator"));
                }
                if self.slurm.hosts.is_empty() {
                    return Err(anyhow!(
                        "slurm.hosts must list at least one cluster entry node"
                    ));
                }
            }
            AllocatorKind::Unicore => {
                if self.unicore.registry_url.trim().is_empty() {
                    return Err(anyhow!(
                        "unicore.registry_url is required for the unicore allocator"
                    ));
                }
                if self.unicore.default_site.trim().is_empty() {
                    return Err(anyhow!(
                        "unicore.default_site is required for the unicore allocator"
                    ));
                }
            }
            AllocatorKind::Local => {}
        }
        Ok(())
    }
}
