// src/core/session/manager.rs

//! The state-machine owner. All session transitions go through here,
//! coordinating the allocator, the repository and the readiness probes.

use crate::core::allocator::Allocator;
use crate::core::allocator::process::LocalProcessAllocator;
use crate::core::errors::BrokerError;
use crate::core::models::{
    GlobalSettings, HostLookup, JobInformation, SESSION_ID_MAX_LEN, Session, SessionStatus,
    StatusReply,
};
use crate::core::registry::ConfigRegistry;
use crate::core::repository::SessionStore;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns the session lifecycle: creation, scheduling, status advancement,
/// keep-alive accounting and teardown.
pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    registry: ConfigRegistry,
    allocator: Arc<Allocator>,
    /// Always available regardless of the configured allocator; `open`
    /// attaches local processes and the sweeper stops them through it.
    process: LocalProcessAllocator,
    settings: Mutex<GlobalSettings>,
    http: reqwest::Client,
    request_timeout: Duration,
    vocabulary_path: String,
    /// Per-session locks serializing multi-step state transitions.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        registry: ConfigRegistry,
        allocator: Arc<Allocator>,
        process: LocalProcessAllocator,
        settings: GlobalSettings,
        http: reqwest::Client,
        request_timeout: Duration,
        vocabulary_path: String,
    ) -> Self {
        Self {
            sessions,
            registry,
            allocator,
            process,
            settings: Mutex::new(settings),
            http,
            request_timeout,
            vocabulary_path,
            locks: DashMap::new(),
        }
    }

    fn session_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates a session with a fresh UUID, subject to the admission gate.
    pub async fn create_session(
        &self,
        owner: &str,
        renderer_id: &str,
    ) -> Result<Session, BrokerError> {
        let id = Uuid::new_v4().to_string();
        self.create_session_with_id(&id, owner, renderer_id).await
    }

    /// Creates a session under a caller-chosen id. Duplicate ids are refused
    /// with `Conflict`, and a closed admission gate with 403.
    pub async fn create_session_with_id(
        &self,
        id: &str,
        owner: &str,
        renderer_id: &str,
    ) -> Result<Session, BrokerError> {
        if id.is_empty() || id.len() > SESSION_ID_MAX_LEN {
            return Err(BrokerError::InvalidRequest(format!(
                "session id must be between 1 and {SESSION_ID_MAX_LEN} characters"
            )));
        }
        let keep_alive = {
            let settings = self.settings.lock().await;
            if !settings.session_creation {
                return Err(BrokerError::SessionCreationSuspended);
            }
            settings.session_keep_alive_timeout
        };
        let session = Session::new(id, owner, renderer_id, keep_alive);
        self.sessions.create(session.clone()).await?;
        info!("Session created {id}");
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Session, BrokerError> {
        self.sessions.get(id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, BrokerError> {
        self.sessions.list().await
    }

    /// Tears a session down: STOPPING barrier, local process stop, job stop,
    /// row deletion. Allocator failures are logged; deletion proceeds.
    pub async fn delete_session(&self, id: &str) -> Result<String, BrokerError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        let mut session = self.sessions.get(id).await?;
        self.delete_session_locked(&mut session).await
    }

    /// Teardown body; the caller must hold the session lock.
    async fn delete_session_locked(&self, session: &mut Session) -> Result<String, BrokerError> {
        if session.status == SessionStatus::Stopping {
            let msg = "Session is currently being destroyed".to_string();
            info!("{msg}");
            return Ok(msg);
        }
        info!("Removing session {}", session.id);
        session.status = SessionStatus::Stopping;
        self.sessions.update(session).await?;

        let config = self.registry.get(&session.renderer_id).await.ok();
        if session.has_process()
            && let Err(e) = self
                .process
                .stop(self.sessions.as_ref(), session, config.as_ref())
                .await
        {
            warn!("Local process teardown failed: {e}");
        }
        if session.has_job()
            && let Err(e) = self
                .allocator
                .stop(self.sessions.as_ref(), session, config.as_ref())
                .await
        {
            warn!("Job teardown failed: {e}");
        }

        self.sessions.delete(&session.id).await?;
        self.locks.remove(&session.id);
        let msg = "Session successfully destroyed".to_string();
        info!("{msg}");
        Ok(msg)
    }

    /// Deletes every session without driving teardown. Admin surface.
    pub async fn clear_sessions(&self) -> Result<String, BrokerError> {
        self.sessions.clear().await?;
        self.locks.clear();
        Ok("Sessions cleared".to_string())
    }

    /// Runs the configured allocator for a STOPPED session. Failures mark
    /// the session FAILED.
    pub async fn schedule(
        &self,
        id: &str,
        job: &JobInformation,
        http_port: u16,
    ) -> Result<String, BrokerError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        let mut session = self.sessions.get(id).await?;
        if session.status != SessionStatus::Stopped {
            return Err(BrokerError::InvalidRequest(format!(
                "{} is already scheduled or running",
                session.renderer_id
            )));
        }
        let config = self.registry.get(&session.renderer_id).await?;

        session.http_host.clear();
        session.http_port = http_port;
        self.sessions.update(&session).await?;

        match self
            .allocator
            .schedule(self.sessions.as_ref(), &mut session, &config, job)
            .await
        {
            Ok(message) => Ok(message),
            Err(e) => {
                if session.status != SessionStatus::Failed {
                    session.status = SessionStatus::Failed;
                    if let Err(persist) = self.sessions.update(&session).await {
                        warn!("Failed to persist FAILED status: {persist}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Attaches a local rendering process to the session. Refused while a
    /// process is already attached.
    pub async fn open(
        &self,
        id: &str,
        params: &str,
        environment: &str,
        http_port: u16,
    ) -> Result<String, BrokerError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        let mut session = self.sessions.get(id).await?;
        if session.has_process() {
            return Err(BrokerError::ProcessAlreadyStarted);
        }
        let config = self.registry.get(&session.renderer_id).await?;
        session.http_host = "localhost".to_string();
        session.http_port = http_port;
        self.process
            .start(
                self.sessions.as_ref(),
                &mut session,
                &config,
                params,
                environment,
            )
            .await
    }

    /// Queries the session status and advances the state machine:
    /// SCHEDULED/GETTING_HOSTNAME promote to STARTING once a host is known,
    /// STARTING promotes to RUNNING when the readiness probe passes (or
    /// immediately when no probe is required), RUNNING refreshes an expired
    /// keep-alive, STOPPING completes the deletion.
    pub async fn query_status(&self, id: &str) -> Result<StatusReply, BrokerError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        let mut session = self.sessions.get(id).await?;
        debug!("Current session status is: {}", session.status);

        let description = match session.status {
            SessionStatus::Scheduling => format!("{} is scheduled", session.renderer_id),
            SessionStatus::Scheduled | SessionStatus::GettingHostname => {
                if !session.http_host.is_empty() {
                    session.status = SessionStatus::Starting;
                    self.sessions.update(&session).await?;
                    format!("{} is starting", session.renderer_id)
                } else {
                    format!("{} is scheduled", session.renderer_id)
                }
            }
            SessionStatus::Starting => {
                let config = self.registry.get(&session.renderer_id).await?;
                if !config.wait_until_running {
                    session.status = SessionStatus::Running;
                    self.sessions.update(&session).await?;
                    format!("{} is up and running", session.renderer_id)
                } else {
                    debug!("Requesting rendering resource vocabulary");
                    match self.request_vocabulary(&session).await {
                        Ok(_) => {
                            session.status = SessionStatus::Running;
                            self.sessions.update(&session).await?;
                            format!("{} is up and running", session.renderer_id)
                        }
                        Err(_) => format!(
                            "{} is starting but the HTTP interface is not yet available",
                            session.renderer_id
                        ),
                    }
                }
            }
            SessionStatus::Running => {
                if Utc::now() > session.valid_until {
                    let keep_alive = self.settings.lock().await.session_keep_alive_timeout;
                    session.refresh_valid_until(keep_alive);
                    self.sessions.update(&session).await?;
                }
                format!("{} is up and running", session.renderer_id)
            }
            SessionStatus::Stopping => {
                let description = format!("{} is terminating...", session.renderer_id);
                self.sessions.delete(&session.id).await?;
                self.locks.remove(&session.id);
                description
            }
            SessionStatus::Stopped => format!("{} is not active", session.renderer_id),
            SessionStatus::Failed => {
                format!("Job allocation failed for {}", session.renderer_id)
            }
        };

        Ok(StatusReply {
            session: session.id.clone(),
            code: session.status,
            description,
            hostname: session.http_host.clone(),
            port: session.http_port.to_string(),
        })
    }

    /// Probes the backend's vocabulary endpoint to confirm it serves REST
    /// traffic. Failure means the backend is not ready yet.
    pub async fn request_vocabulary(&self, session: &Session) -> Result<String, BrokerError> {
        let url = format!(
            "http://{}:{}/{}",
            session.http_host, session.http_port, self.vocabulary_path
        );
        debug!("Requesting vocabulary from {url}");
        match self
            .http
            .put(&url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => Ok(response.text().await.unwrap_or_default()),
            Err(e) => {
                debug!("{e}");
                Err(BrokerError::BackendNotReady(session.renderer_id.clone()))
            }
        }
    }

    /// Idempotent helper populating `http_host` when a job owes the session
    /// a hostname. Reverts to SCHEDULED while the allocator has no answer;
    /// the FAILED sentinel deletes the session.
    pub async fn verify_hostname(&self, id: &str) -> Result<String, BrokerError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        let mut session = self.sessions.get(id).await?;
        debug!(
            "Verifying hostname '{}' for session {}",
            session.http_host, session.id
        );

        if session.status != SessionStatus::GettingHostname
            && session.has_job()
            && session.http_host.is_empty()
        {
            session.status = SessionStatus::GettingHostname;
            self.sessions.update(&session).await?;
            info!("Querying job hostname for job id: {}", session.job_id);

            let config = self.registry.get(&session.renderer_id).await?;
            match self
                .allocator
                .hostname(self.sessions.as_ref(), &mut session, &config)
                .await?
            {
                HostLookup::Resolved(host) => {
                    session.http_host = host;
                    self.sessions.update(&session).await?;
                    let msg = format!(
                        "Resolved hostname for job {} to {}",
                        session.job_id, session.http_host
                    );
                    info!("{msg}");
                    Ok(msg)
                }
                HostLookup::Pending => {
                    session.status = SessionStatus::Scheduled;
                    self.sessions.update(&session).await?;
                    Err(BrokerError::NotFound(format!(
                        "Job scheduled but {} is not yet running",
                        session.renderer_id
                    )))
                }
                HostLookup::Failed => {
                    self.delete_session_locked(&mut session).await?;
                    Err(BrokerError::NotFound("Job has been cancelled".to_string()))
                }
            }
        } else {
            Ok(format!("Job is running on host {}", session.http_host))
        }
    }

    /// Asks the allocator which host serves the session's job without any
    /// state transition. Used by the forwarding failure path.
    pub async fn hostname_lookup(&self, session: &mut Session) -> Result<HostLookup, BrokerError> {
        let config = self.registry.get(&session.renderer_id).await?;
        self.allocator
            .hostname(self.sessions.as_ref(), session, &config)
            .await
    }

    /// Pushes the session expiration forward by the keep-alive timeout.
    pub async fn keep_alive(&self, id: &str) -> Result<String, BrokerError> {
        debug!("Session {id} is being updated");
        let keep_alive = self.settings.lock().await.session_keep_alive_timeout;
        let mut session = self.sessions.get(id).await?;
        session.refresh_valid_until(keep_alive);
        self.sessions.update(&session).await?;
        Ok(format!("Session {id} successfully updated"))
    }

    /// Closes the admission gate. Idempotent.
    pub async fn suspend_sessions(&self) -> String {
        let mut settings = self.settings.lock().await;
        let msg = if !settings.session_creation {
            "Session creation already suspended"
        } else {
            settings.session_creation = false;
            "Creation of new session now suspended"
        };
        debug!("{msg}");
        msg.to_string()
    }

    /// Reopens the admission gate. Idempotent.
    pub async fn resume_sessions(&self) -> String {
        let mut settings = self.settings.lock().await;
        let msg = if settings.session_creation {
            "Session creation already resumed"
        } else {
            settings.session_creation = true;
            "Creation of new session now resumed"
        };
        debug!("{msg}");
        msg.to_string()
    }

    /// Tears down every session whose keep-alive expired. Returns how many
    /// sessions were reaped.
    pub async fn reap_expired(&self) -> usize {
        let sessions = match self.sessions.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Failed to list sessions for expiry check: {e}");
                return 0;
            }
        };
        let now = Utc::now();
        let mut reaped = 0;
        for session in sessions {
            debug!(
                "Session {} is valid until {}",
                session.id, session.valid_until
            );
            if now > session.valid_until {
                info!(
                    "Session {} timed out. Session will now be closed",
                    session.id
                );
                match self.delete_session(&session.id).await {
                    Ok(_) => reaped += 1,
                    Err(e) => warn!("Failed to reap session {}: {e}", session.id),
                }
            }
        }
        reaped
    }
}
