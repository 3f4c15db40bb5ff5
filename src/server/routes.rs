// src/server/routes.rs

//! The HTTP surface of the broker: session CRUD and commands, resource
//! configuration CRUD, and the admin commands.

use crate::core::errors::BrokerError;
use crate::core::models::ResourceConfig;
use crate::core::session::COOKIE_ID;
use crate::core::session::broker::BrokerResponse;
use crate::core::state::BrokerState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, put};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "contents": self.to_string() }))).into_response()
    }
}

/// Builds the full router, nested under the configured URI prefix.
pub fn router(state: Arc<BrokerState>) -> Router {
    let api = Router::new()
        .route(
            "/session/",
            axum::routing::post(create_session)
                .get(list_sessions)
                .delete(destroy_session),
        )
        .route("/session/{id}/", get(session_details))
        .route("/session/{id}", any(execute_command))
        .route(
            "/config/",
            get(list_configs).post(create_config).put(update_config),
        )
        .route("/config/{id}/", delete(delete_config))
        .route("/admin/{command}", put(admin_command));

    Router::new()
        .nest(&state.config.base_url_prefix, api)
        .with_state(state)
}

fn reply(status: u16, contents: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "contents": contents }))).into_response()
}

/// Extracts the session id from the `HBP` cookie.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == COOKIE_ID).then(|| value.to_string())
    })
}

fn broker_response(broker: BrokerResponse) -> Response {
    let status =
        StatusCode::from_u16(broker.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, broker.body).into_response();
    if let Ok(value) = HeaderValue::from_str(&broker.content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

/// POST /session/ — creates a session and sets the `HBP` cookie.
async fn create_session(State(state): State<Arc<BrokerState>>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return reply(401, &format!("Invalid request body: {e}")),
    };
    let Some(owner) = value.get("owner").and_then(Value::as_str) else {
        return reply(401, "Field 'owner' is missing");
    };
    let Some(renderer_id) = value.get("renderer_id").and_then(Value::as_str) else {
        return reply(401, "Field 'renderer_id' is missing");
    };

    match state.manager.create_session(owner, renderer_id).await {
        Ok(session) => {
            let mut response = (
                StatusCode::CREATED,
                Json(json!({ "contents": "Session successfully created" })),
            )
                .into_response();
            if let Ok(cookie) = HeaderValue::from_str(&format!("{COOKIE_ID}={}", session.id)) {
                response.headers_mut().insert(header::SET_COOKIE, cookie);
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

/// GET /session/ — lists sessions with their minimal serialization.
async fn list_sessions(State(state): State<Arc<BrokerState>>) -> Response {
    match state.manager.list_sessions().await {
        Ok(sessions) => {
            let listing: Vec<Value> = sessions
                .iter()
                .map(|session| {
                    json!({ "owner": session.owner, "renderer_id": session.renderer_id })
                })
                .collect();
            Json(listing).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// DELETE /session/ — destroys the session identified by the cookie.
async fn destroy_session(State(state): State<Arc<BrokerState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_cookie(&headers) else {
        return reply(404, "Cookie HBP is missing");
    };
    if let Err(e) = state.image_feed.remove_route(&session_id).await {
        warn!("Image feed route removal failed: {e}");
    }
    match state.manager.delete_session(&session_id).await {
        Ok(message) => reply(200, &message),
        Err(e) => e.into_response(),
    }
}

/// GET /session/{id}/ — extended session serialization.
async fn session_details(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.get_session(&id).await {
        Ok(session) => Json(json!({
            "owner": session.owner,
            "created": session.created,
            "renderer_id": session.renderer_id,
            "job_id": session.job_id,
            "status": session.status,
            "http_host": session.http_host,
            "http_port": session.http_port,
            "valid_until": session.valid_until,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// ANY /session/{cmd} — executes a command on the session identified by the
/// cookie; unknown commands are proxied to the rendering resource.
async fn execute_command(
    State(state): State<Arc<BrokerState>>,
    Path(command): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session_id) = session_cookie(&headers) else {
        return reply(404, "Cookie HBP is missing");
    };
    match state
        .broker
        .execute(&session_id, &command, &method, &headers, body)
        .await
    {
        Ok(response) => broker_response(response),
        Err(e) => e.into_response(),
    }
}

/// GET /config/ — lists resource configurations.
async fn list_configs(State(state): State<Arc<BrokerState>>) -> Response {
    match state.registry.list().await {
        Ok(configs) => Json(configs).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /config/ — creates a resource configuration.
async fn create_config(
    State(state): State<Arc<BrokerState>>,
    Json(config): Json<ResourceConfig>,
) -> Response {
    match state.registry.create(config).await {
        Ok(message) => reply(201, &message),
        Err(e) => e.into_response(),
    }
}

/// PUT /config/ — updates a resource configuration.
async fn update_config(
    State(state): State<Arc<BrokerState>>,
    Json(config): Json<ResourceConfig>,
) -> Response {
    match state.registry.update(config).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /config/{id}/ — deletes a resource configuration.
async fn delete_config(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.delete(&id).await {
        Ok(message) => reply(200, &message),
        Err(e) => e.into_response(),
    }
}

/// PUT /admin/{cmd} — keepalive, suspend and resume.
async fn admin_command(
    State(state): State<Arc<BrokerState>>,
    Path(command): Path<String>,
    headers: HeaderMap,
) -> Response {
    match command.as_str() {
        "keepalive" => {
            let Some(session_id) = session_cookie(&headers) else {
                return reply(404, "Cookie HBP is missing");
            };
            match state.manager.keep_alive(&session_id).await {
                Ok(message) => reply(200, &message),
                Err(e) => e.into_response(),
            }
        }
        "suspend" => reply(200, &state.manager.suspend_sessions().await),
        "resume" => reply(200, &state.manager.resume_sessions().await),
        _ => BrokerError::UnknownCommand(command).into_response(),
    }
}
