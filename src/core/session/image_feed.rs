// src/core/session/image_feed.rs

//! Client for the image streaming sidecar. The broker registers a route for
//! each session pointing at the backend endpoint, keyed by the session cookie.

use super::COOKIE_ID;
use crate::core::errors::BrokerError;
use crate::core::models::Session;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Manages image-feed routes on the external streaming service.
#[derive(Clone)]
pub struct ImageFeedClient {
    /// Base URL of the streaming service; route management is a no-op when unset.
    url: Option<String>,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl ImageFeedClient {
    pub fn new(url: Option<String>, http: reqwest::Client, request_timeout: Duration) -> Self {
        Self {
            url,
            http,
            request_timeout,
        }
    }

    /// Registers a route for the session's backend endpoint.
    pub async fn add_route(&self, session: &Session) -> Result<String, BrokerError> {
        let uri = json!({
            "uri": format!("http://{}:{}", session.http_host, session.http_port)
        });
        let (code, body) = self
            .do_request(Method::POST, &session.id, Some(uri.to_string()))
            .await?;
        if code == 200 {
            Ok(body)
        } else {
            Err(BrokerError::Transport(format!(
                "Image streaming service failed to create new route: [{code}] {body}"
            )))
        }
    }

    /// Removes the route for a session; missing routes are not an error.
    pub async fn remove_route(&self, session_id: &str) -> Result<(), BrokerError> {
        if self.url.is_none() {
            return Ok(());
        }
        let (code, body) = self.do_request(Method::DELETE, session_id, None).await?;
        if code != 200 && code != 404 {
            warn!("Image feed route removal returned [{code}] {body}");
        }
        Ok(())
    }

    /// Returns the route for a session, creating it when it does not exist.
    pub async fn get_route(&self, session: &Session) -> Result<String, BrokerError> {
        let (code, body) = self.do_request(Method::GET, &session.id, None).await?;
        match code {
            200 => {
                debug!("Route exists: {body}");
                Ok(body)
            }
            404 => {
                debug!(
                    "Route does not exist for session {}, creating it",
                    session.id
                );
                self.add_route(session).await?;
                let (code, body) = self.do_request(Method::GET, &session.id, None).await?;
                if code == 200 {
                    Ok(body)
                } else {
                    Err(BrokerError::Transport(format!(
                        "Image streaming service failed to create new route: [{code}] {body}"
                    )))
                }
            }
            _ => Err(BrokerError::Transport(format!(
                "Image streaming service returned [{code}] {body}"
            ))),
        }
    }

    async fn do_request(
        &self,
        method: Method,
        session_id: &str,
        body: Option<String>,
    ) -> Result<(u16, String), BrokerError> {
        let base = self.url.as_ref().ok_or_else(|| {
            BrokerError::InvalidRequest("image streaming service is not configured".to_string())
        })?;
        let url = format!("{base}/route");
        let mut request = self
            .http
            .request(method, &url)
            .timeout(self.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(COOKIE, format!("{COOKIE_ID}={session_id}"));
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await.map_err(|e| {
            BrokerError::Transport(format!("Image streaming service ({base}) is unreachable: {e}"))
        })?;
        let code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok((code, body))
    }
}
