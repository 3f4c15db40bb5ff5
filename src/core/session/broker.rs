// src/core/session/broker.rs

//! Entry point for all per-session commands: named commands are dispatched
//! to the session manager or the allocator, anything else is proxied to the
//! rendering resource once it is RUNNING.

use super::COOKIE_ID;
use super::image_feed::ImageFeedClient;
use super::manager::SessionManager;
use crate::core::allocator::Allocator;
use crate::core::errors::BrokerError;
use crate::core::models::{HostLookup, JobInformation, Session, SessionStatus};
use bytes::Bytes;
use rand::Rng;
use reqwest::Method;
use reqwest::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, HeaderMap, HeaderName,
    TRANSFER_ENCODING,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// An HTTP-shaped reply produced by the broker, converted into a framework
/// response at the server boundary.
#[derive(Debug, Clone)]
pub struct BrokerResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl BrokerResponse {
    /// The `{"contents": ...}` body shape used for diagnostics.
    pub fn message(status: u16, contents: &str) -> Self {
        Self::json(status, &json!({ "contents": contents }))
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: Bytes::from(value.to_string()),
        }
    }
}

/// Dispatches per-session commands and proxies opaque ones to the backend.
pub struct RequestBroker {
    manager: Arc<SessionManager>,
    allocator: Arc<Allocator>,
    image_feed: ImageFeedClient,
    http: reqwest::Client,
    request_timeout: Duration,
    default_renderer_port: u16,
}

impl RequestBroker {
    pub fn new(
        manager: Arc<SessionManager>,
        allocator: Arc<Allocator>,
        image_feed: ImageFeedClient,
        http: reqwest::Client,
        request_timeout: Duration,
        default_renderer_port: u16,
    ) -> Self {
        Self {
            manager,
            allocator,
            image_feed,
            http,
            request_timeout,
            default_renderer_port,
        }
    }

    /// Executes `command` on the session identified by the cookie.
    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
        method: &Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<BrokerResponse, BrokerError> {
        debug!("Processing command <{command}> for session {session_id}");
        match command {
            "schedule" => self.schedule(session_id, headers, &body).await,
            "open" => self.open(session_id, &body).await,
            "status" => self.status(session_id).await,
            "log" => self.wrapped_log(session_id, LogKind::Out).await,
            "err" => self.wrapped_log(session_id, LogKind::Err).await,
            "job" => self.wrapped_log(session_id, LogKind::Job).await,
            "imagefeed" => self.image_feed_route(session_id).await,
            _ => self.forward(session_id, command, method, headers, body).await,
        }
    }

    /// Randomized port in `[base, base + 1000)` assigned to a new backend.
    fn pick_renderer_port(&self) -> u16 {
        self.default_renderer_port + rand::thread_rng().gen_range(0..1000)
    }

    async fn schedule(
        &self,
        session_id: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<BrokerResponse, BrokerError> {
        let mut job: JobInformation = if body.is_empty() {
            JobInformation::default()
        } else {
            serde_json::from_slice(body)
                .map_err(|e| BrokerError::InvalidRequest(format!("bad job information: {e}")))?
        };
        job.authorization = headers
            .get(reqwest::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let port = self.pick_renderer_port();
        let message = self.manager.schedule(session_id, &job, port).await?;
        Ok(BrokerResponse::message(200, &message))
    }

    async fn open(&self, session_id: &str, body: &Bytes) -> Result<BrokerResponse, BrokerError> {
        let value: serde_json::Value = if body.is_empty() {
            json!({})
        } else {
            serde_json::from_slice(body)
                .map_err(|e| BrokerError::InvalidRequest(format!("bad process parameters: {e}")))?
        };
        let params = value
            .get("params")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let environment = value
            .get("environment")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        debug!("Executing command <open> parameters={params} environment={environment}");

        let port = self.pick_renderer_port();
        let message = self
            .manager
            .open(session_id, params, environment, port)
            .await?;
        Ok(BrokerResponse::message(200, &message))
    }

    async fn status(&self, session_id: &str) -> Result<BrokerResponse, BrokerError> {
        self.manager.verify_hostname(session_id).await?;
        let reply = self.manager.query_status(session_id).await?;
        Ok(BrokerResponse::json(200, &serde_json::to_value(&reply)?))
    }

    async fn wrapped_log(
        &self,
        session_id: &str,
        kind: LogKind,
    ) -> Result<BrokerResponse, BrokerError> {
        let session = self.manager.get_session(session_id).await?;
        let contents = if session.has_job() {
            let fetched = match kind {
                LogKind::Out => self.allocator.out_log(&session).await,
                LogKind::Err => self.allocator.err_log(&session).await,
                LogKind::Job => self.allocator.job_information(&session).await,
            };
            fetched.unwrap_or_else(|e| e.to_string())
        } else {
            "Rendering resource is currently unavailable".to_string()
        };
        Ok(BrokerResponse::message(200, &contents))
    }

    async fn image_feed_route(&self, session_id: &str) -> Result<BrokerResponse, BrokerError> {
        info!("Requesting image feed");
        let session = self.manager.get_session(session_id).await?;
        let body = self.image_feed.get_route(&session).await?;
        Ok(BrokerResponse {
            status: 200,
            content_type: "application/json".to_string(),
            body: Bytes::from(body),
        })
    }

    /// Proxies an opaque command to the rendering resource, gated on the
    /// session being RUNNING with a resolved endpoint.
    async fn forward(
        &self,
        session_id: &str,
        command: &str,
        method: &Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<BrokerResponse, BrokerError> {
        self.manager.verify_hostname(session_id).await?;
        let reply = self.manager.query_status(session_id).await?;
        if reply.code != SessionStatus::Running || reply.hostname.is_empty() {
            return Ok(BrokerResponse::json(200, &serde_json::to_value(&reply)?));
        }

        let mut session = self.manager.get_session(session_id).await?;
        let url = format!(
            "http://{}:{}/{command}",
            session.http_host, session.http_port
        );
        debug!("Querying {url}");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .timeout(self.request_timeout);
        for (name, value) in headers {
            if !is_skipped_header(name) {
                request = request.header(name, value.clone());
            }
        }
        request = request.header(COOKIE, format!("{COOKIE_ID}={}", session.id));
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return self.forward_failure(&mut session, &e.to_string()).await,
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let declared = response.content_length();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return self.forward_failure(&mut session, &e.to_string()).await,
        };
        if let Some(expected) = declared
            && expected != bytes.len() as u64
        {
            return Ok(BrokerResponse::message(
                400,
                &format!(
                    "Incomplete response from {}: expected {expected} bytes, read {}",
                    session.renderer_id,
                    bytes.len()
                ),
            ));
        }

        Ok(BrokerResponse {
            status,
            content_type,
            body: bytes,
        })
    }

    /// Turns a transport failure into a state transition when the job is
    /// gone: the session is deleted and the client told the backend is down.
    async fn forward_failure(
        &self,
        session: &mut Session,
        error: &str,
    ) -> Result<BrokerResponse, BrokerError> {
        if session.has_job()
            && matches!(
                self.manager.hostname_lookup(session).await,
                Ok(HostLookup::Failed)
            )
        {
            let _ = self.manager.delete_session(&session.id).await;
            return Ok(BrokerResponse::message(
                400,
                &format!("{} is down", session.renderer_id),
            ));
        }
        Ok(BrokerResponse::message(400, error))
    }
}

enum LogKind {
    Out,
    Err,
    Job,
}

/// Headers that must not be copied onto the upstream request: hop-by-hop
/// headers, the original host/length, and the cookie the broker replaces.
fn is_skipped_header(name: &HeaderName) -> bool {
    *name == HOST
        || *name == CONTENT_LENGTH
        || *name == CONNECTION
        || *name == TRANSFER_ENCODING
        || *name == COOKIE
        || name.as_str().eq_ignore_ascii_case("keep-alive")
        || name.as_str().eq_ignore_ascii_case("upgrade")
        || name.as_str().eq_ignore_ascii_case("te")
        || name.as_str().eq_ignore_ascii_case("trailer")
}
