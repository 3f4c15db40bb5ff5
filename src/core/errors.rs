// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within the broker.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
///
/// The HTTP boundary maps each variant to a status code; internal components
/// propagate these with `?` instead of hand-rolling `(code, body)` pairs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// A session or resource configuration does not exist. Maps to 404.
    #[error("{0}")]
    NotFound(String),

    /// An entity with the same id already exists. Maps to 409.
    #[error("{0}")]
    Conflict(String),

    /// The admission gate is closed. Maps to 403.
    #[error("Session creation is currently suspended")]
    SessionCreationSuspended,

    /// An SSH, HTTPS or HTTP dialogue with an external system failed. Maps to 400.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The batch system refused or timed out the allocation. Maps to 400,
    /// and the session is marked FAILED.
    #[error("Job allocation failed for {0}")]
    AllocationFailed(String),

    /// The resource is allocated but its HTTP interface is not serving yet. Maps to 503.
    #[error("{0} is starting but the HTTP interface is not yet available")]
    BackendNotReady(String),

    /// Maps to 401, matching the legacy wire contract for bad admin commands.
    #[error("{0} is an invalid command")]
    UnknownCommand(String),

    /// A second `open` while a local process is attached. Maps to 401.
    #[error("process is already started")]
    ProcessAlreadyStarted,

    /// Malformed client input. Maps to 400.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Programmer errors and serialized-state violations. Maps to 500.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// The HTTP status code this error translates to at the broker boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::NotFound(_) => 404,
            BrokerError::Conflict(_) => 409,
            BrokerError::SessionCreationSuspended => 403,
            BrokerError::Transport(_) => 400,
            BrokerError::AllocationFailed(_) => 400,
            BrokerError::BackendNotReady(_) => 503,
            BrokerError::UnknownCommand(_) => 401,
            BrokerError::ProcessAlreadyStarted => 401,
            BrokerError::InvalidRequest(_) => 400,
            BrokerError::Internal(_) => 500,
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        BrokerError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<uuid::Error> for BrokerError {
    fn from(e: uuid::Error) -> Self {
        BrokerError::Internal(format!("Failed to generate UUID: {e}"))
    }
}
