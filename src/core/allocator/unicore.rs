// src/core/allocator/unicore.rs

//! The UNICORE grid allocator, driving a REST API over HTTPS with
//! bearer-token authentication supplied per call.
//!
//! The job is a `Bash shell` application sourcing an uploaded `input.sh`;
//! the script echoes `HOSTNAME=$HOSTNAME` before launching the binary, which
//! is the contract the hostname resolution below depends on.

use super::{LOG_NOT_AVAILABLE, build_launch_script};
use crate::config::UnicoreConfig;
use crate::core::errors::BrokerError;
use crate::core::models::{HostLookup, JobInformation, ResourceConfig, Session, SessionStatus};
use crate::core::registry::{format_rest_parameters, rest_schema};
use crate::core::repository::SessionStore;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::LazyLock;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

static SITE_BASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(https://\S+/rest/core)").unwrap());
static SITE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://\S+/(\S+)/rest/core").unwrap());
static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"HOSTNAME=(\w+)").unwrap());

/// Allocator for UNICORE grid jobs.
pub struct UnicoreAllocator {
    settings: UnicoreConfig,
    http: reqwest::Client,
    /// Last-seen bearer token; scheduling refreshes it, teardown driven by
    /// the sweeper reuses it.
    auth_token: RwLock<Option<String>>,
    /// Serializes the REST dialogue so concurrent schedules observe a total order.
    mutex: Mutex<()>,
}

impl UnicoreAllocator {
    pub fn new(settings: UnicoreConfig) -> Result<Self, BrokerError> {
        // Grid sites routinely present certificates the broker host does not
        // trust; verification is disabled the same way the deployments do it.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            settings,
            http,
            auth_token: RwLock::new(None),
            mutex: Mutex::new(()),
        })
    }

    /// Submits a job to the configured site and uploads its `input.sh`.
    /// The session ends SCHEDULED with `job_id` holding the normalized job
    /// URL and `work_dir` the working-directory URL.
    pub async fn schedule(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
        job: &JobInformation,
    ) -> Result<String, BrokerError> {
        let _guard = self.mutex.lock().await;
        if let Some(token) = &job.authorization {
            *self.auth_token.write().await = Some(token.clone());
        }

        session.status = SessionStatus::Scheduling;
        store.update(session).await?;

        let sites = self.sites().await?;
        let site_core = sites.get(&self.settings.default_site).ok_or_else(|| {
            BrokerError::Transport(format!(
                "Site {} is not listed by the registry",
                self.settings.default_site
            ))
        })?;

        let properties = self.get_json(site_core).await?;
        if let Err(e) = self.clear_jobs(&properties).await {
            warn!("Failed to clear stale job placeholders: {e}");
        }

        let document = build_job_document(config, job);
        let submitted = self.submit_job(site_core, &document).await?;

        let body = self.get_json(&submitted).await?;
        session.job_id = json_href(&body, "/_links/self/href")?;
        session.work_dir = json_href(&body, "/_links/workingDirectory/href")?;

        let schema = rest_schema(&config.id, &session.id);
        let rest_parameters = format_rest_parameters(
            &config.scheduler_rest_parameters_format,
            &session.http_host,
            session.http_port,
            &schema,
            &session.job_id,
        );
        let script = build_launch_script(config, job, &rest_parameters, None, true);
        self.upload(&format!("{}/files/input.sh", session.work_dir), script)
            .await?;

        session.status = SessionStatus::Scheduled;
        store.update(session).await?;
        let message = format!("Job submitted to {}", session.job_id);
        info!("{message}");
        Ok(message)
    }

    /// Explicitly starts a submitted job through its `action:start` link.
    pub async fn start(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
    ) -> Result<String, BrokerError> {
        let _guard = self.mutex.lock().await;
        self.start_inner(store, session, config).await
    }

    async fn start_inner(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
    ) -> Result<String, BrokerError> {
        session.status = SessionStatus::Starting;
        store.update(session).await?;

        let properties = self.get_json(&session.job_id).await?;
        let action_url = json_href(&properties, "/_links/action:start/href")?;
        let response = self
            .request(reqwest::Method::POST, &action_url)
            .await
            .json(&json!({}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BrokerError::Transport(format!(
                "Error invoking start action: {}",
                response.status()
            )));
        }

        if !config.wait_until_running {
            session.status = SessionStatus::Running;
        }
        store.update(session).await?;
        Ok(format!("{} successfully started", session.renderer_id))
    }

    /// Best-effort job deletion. The session row is transitioned to STOPPING
    /// before the DELETE goes out; a reply other than 204 surfaces as a
    /// transport error but leaves the row transitioned.
    pub async fn stop(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
    ) -> Result<String, BrokerError> {
        let _guard = self.mutex.lock().await;
        self.stop_inner(store, session).await
    }

    async fn stop_inner(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
    ) -> Result<String, BrokerError> {
        if !session.has_job() {
            return Err(BrokerError::InvalidRequest(
                "no job attached to session".to_string(),
            ));
        }
        session.status = SessionStatus::Stopping;
        store.update(session).await?;

        let response = self
            .request(reqwest::Method::DELETE, &session.job_id)
            .await
            .send()
            .await?;
        if response.status().as_u16() != 204 {
            warn!(
                "UNICORE job deletion returned {} for {}",
                response.status(),
                session.job_id
            );
            return Err(BrokerError::Transport(format!(
                "Error deleting job: {}",
                response.status()
            )));
        }
        Ok("Job successfully cancelled".to_string())
    }

    pub async fn kill(&self, session: &mut Session) -> Result<String, BrokerError> {
        if !session.has_job() {
            return Err(BrokerError::InvalidRequest(
                "no job attached to session".to_string(),
            ));
        }
        let _guard = self.mutex.lock().await;
        let response = self
            .request(reqwest::Method::DELETE, &session.job_id)
            .await
            .send()
            .await?;
        debug!("Job deletion returned {}", response.status());
        Ok("Job successfully cancelled".to_string())
    }

    /// Dispatches on the job status: READY jobs are started, terminal jobs
    /// are torn down and reported as the FAILED sentinel, anything else is
    /// resolved by scraping `HOSTNAME=` from the job's stderr file.
    pub async fn hostname(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
        config: &ResourceConfig,
    ) -> Result<HostLookup, BrokerError> {
        if !session.has_job() {
            return Ok(HostLookup::Pending);
        }
        let _guard = self.mutex.lock().await;

        let properties = self.get_json(&session.job_id).await?;
        let status = properties
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match status {
            "READY" => {
                self.start_inner(store, session, config).await?;
                Ok(HostLookup::Pending)
            }
            "SUCCESSFUL" | "FAILED" => {
                if let Err(e) = self.stop_inner(store, session).await {
                    warn!("Teardown of finished job failed: {e}");
                }
                Ok(HostLookup::Failed)
            }
            _ => {
                let stderr = self
                    .fetch_file(&format!("{}/files/stderr", session.work_dir))
                    .await
                    .unwrap_or_default();
                match scrape_hostname(&stderr) {
                    Some(host) => {
                        info!("HOSTNAME={host}");
                        session.status = SessionStatus::Starting;
                        store.update(session).await?;
                        Ok(HostLookup::Resolved(host))
                    }
                    None => Ok(HostLookup::Pending),
                }
            }
        }
    }

    /// Returns the job properties document, verbatim.
    pub async fn job_information(&self, session: &Session) -> Result<String, BrokerError> {
        if !session.has_job() {
            return Ok(LOG_NOT_AVAILABLE.to_string());
        }
        let properties = self.get_json(&session.job_id).await?;
        Ok(serde_json::to_string_pretty(&properties)?)
    }

    pub async fn out_log(&self, session: &Session) -> Result<String, BrokerError> {
        self.remote_log(session, "stdout").await
    }

    pub async fn err_log(&self, session: &Session) -> Result<String, BrokerError> {
        self.remote_log(session, "stderr").await
    }

    async fn remote_log(&self, session: &Session, file: &str) -> Result<String, BrokerError> {
        if session.work_dir.is_empty() {
            return Ok(LOG_NOT_AVAILABLE.to_string());
        }
        self.fetch_file(&format!("{}/files/{file}", session.work_dir))
            .await
    }

    /// Reads the base URLs of the available sites from the registry.
    pub async fn sites(&self) -> Result<HashMap<String, String>, BrokerError> {
        let listing = self.get_json(&self.settings.registry_url).await?;
        let mut sites = HashMap::new();
        if let Some(entries) = listing.get("entries").and_then(Value::as_array) {
            for entry in entries {
                let href = entry.get("href").and_then(Value::as_str).unwrap_or_default();
                let service_type = entry.get("type").and_then(Value::as_str).unwrap_or_default();
                if service_type != "TargetSystemFactory" {
                    continue;
                }
                if let (Some(base), Some(name)) = (
                    SITE_BASE_RE.captures(href).map(|c| c[1].to_string()),
                    SITE_NAME_RE.captures(href).map(|c| c[1].to_string()),
                ) {
                    sites.insert(name, base);
                }
            }
        }
        debug!("Sites: {sites:?}");
        Ok(sites)
    }

    /// Deletes stale job placeholders left on the site by previous sessions.
    async fn clear_jobs(&self, site_properties: &Value) -> Result<(), BrokerError> {
        let jobs_url = json_href(site_properties, "/_links/jobs/href")?;
        let listing = self.get_json(&jobs_url).await?;
        let Some(jobs) = listing.get("jobs").and_then(Value::as_array) else {
            return Ok(());
        };
        for job in jobs {
            let Some(url) = job.as_str() else { continue };
            let response = self
                .request(reqwest::Method::DELETE, url)
                .await
                .send()
                .await?;
            let code = response.status().as_u16();
            if code != 200 && code != 204 {
                return Err(BrokerError::Transport(format!(
                    "Error deleting job {url}: {code}"
                )));
            }
        }
        Ok(())
    }

    async fn submit_job(&self, site_core: &str, document: &Value) -> Result<String, BrokerError> {
        let response = self
            .request(reqwest::Method::POST, &format!("{site_core}/jobs"))
            .await
            .json(document)
            .send()
            .await?;
        if response.status().as_u16() != 201 {
            let code = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Transport(format!(
                "Error submitting job: [{code}] {body}"
            )));
        }
        response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                BrokerError::Transport("Job submission reply carries no Location header".to_string())
            })
    }

    async fn upload(&self, destination: &str, data: String) -> Result<(), BrokerError> {
        let mut request = self
            .http
            .put(destination)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data);
        if let Some(token) = self.auth_token.read().await.clone() {
            request = request.header(AUTHORIZATION, token);
        }
        let response = request.send().await?;
        if response.status().as_u16() != 204 {
            return Err(BrokerError::Transport(format!(
                "Error uploading data: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Fetches a remote file, refusing anything larger than the configured cap.
    async fn fetch_file(&self, file_url: &str) -> Result<String, BrokerError> {
        debug!("Getting file content from {file_url}");
        let properties = self.get_json(file_url).await?;
        if let Some(size) = properties.get("size").and_then(Value::as_u64)
            && size > self.settings.max_log_size
        {
            return Err(BrokerError::Transport(format!(
                "File {file_url} is too large to fetch ({size} bytes)"
            )));
        }
        let mut request = self
            .http
            .get(file_url)
            .header(ACCEPT, "application/octet-stream");
        if let Some(token) = self.auth_token.read().await.clone() {
            request = request.header(AUTHORIZATION, token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BrokerError::Transport(format!(
                "Error fetching {file_url}: {}",
                response.status()
            )));
        }
        Ok(response.text().await.unwrap_or_default())
    }

    async fn get_json(&self, url: &str) -> Result<Value, BrokerError> {
        let response = self.request(reqwest::Method::GET, url).await.send().await?;
        if !response.status().is_success() {
            return Err(BrokerError::Transport(format!(
                "Error accessing {url}: {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = self.auth_token.read().await.clone() {
            request = request.header(AUTHORIZATION, token);
        }
        request
    }
}

/// Builds the UNICORE job document for a scheduling request.
pub fn build_job_document(config: &ResourceConfig, job: &JobInformation) -> Value {
    let nb_nodes = if job.nb_nodes != 0 {
        job.nb_nodes
    } else {
        config.nb_nodes
    };
    json!({
        "ApplicationName": "Bash shell",
        "Parameters": { "SOURCE": "input.sh" },
        "Resources": { "Nodes": nb_nodes.max(1) },
        "haveClientStageIn": true,
    })
}

/// Extracts the first `HOSTNAME=<token>` line from a job's stderr.
pub fn scrape_hostname(log: &str) -> Option<String> {
    HOSTNAME_RE.captures(log).map(|captures| captures[1].to_string())
}

fn json_href(value: &Value, pointer: &str) -> Result<String, BrokerError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            BrokerError::Transport(format!("Missing field {pointer} in UNICORE reply"))
        })
}
