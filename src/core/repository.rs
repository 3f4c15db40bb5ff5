// src/core/repository.rs

//! Persistence contracts for sessions and resource configurations, with
//! in-memory reference implementations.
//!
//! The service only ever talks to the traits; swapping in a relational store
//! is a matter of providing another implementation. The in-memory stores rely
//! on `DashMap` shard locking to serialize row updates; multi-step state
//! transitions are additionally covered by the session manager's per-session
//! locks.

use crate::core::errors::BrokerError;
use crate::core::models::{ResourceConfig, Session};
use async_trait::async_trait;
use dashmap::DashMap;

/// Durable storage for [`Session`] rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Session, BrokerError>;
    /// Fails with `Conflict` when the id already exists.
    async fn create(&self, session: Session) -> Result<(), BrokerError>;
    /// Fails with `NotFound` when the id is absent.
    async fn update(&self, session: &Session) -> Result<(), BrokerError>;
    async fn delete(&self, id: &str) -> Result<(), BrokerError>;
    async fn list(&self) -> Result<Vec<Session>, BrokerError>;
    async fn clear(&self) -> Result<(), BrokerError>;
}

/// Durable storage for [`ResourceConfig`] rows, keyed by lowercase name.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<ResourceConfig, BrokerError>;
    async fn create(&self, config: ResourceConfig) -> Result<(), BrokerError>;
    async fn update(&self, config: ResourceConfig) -> Result<(), BrokerError>;
    async fn delete(&self, id: &str) -> Result<(), BrokerError>;
    async fn list(&self) -> Result<Vec<ResourceConfig>, BrokerError>;
    async fn clear(&self) -> Result<(), BrokerError>;
}

/// In-memory session store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    rows: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Session, BrokerError> {
        self.rows
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NotFound(format!("Session {id} does not exist")))
    }

    async fn create(&self, session: Session) -> Result<(), BrokerError> {
        match self.rows.entry(session.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BrokerError::Conflict(format!(
                "Session {} already exists",
                session.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    async fn update(&self, session: &Session) -> Result<(), BrokerError> {
        match self.rows.get_mut(&session.id) {
            Some(mut entry) => {
                *entry.value_mut() = session.clone();
                Ok(())
            }
            None => Err(BrokerError::NotFound(format!(
                "Session {} does not exist",
                session.id
            ))),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), BrokerError> {
        self.rows
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("Session {id} does not exist")))
    }

    async fn list(&self) -> Result<Vec<Session>, BrokerError> {
        let mut sessions: Vec<Session> =
            self.rows.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn clear(&self) -> Result<(), BrokerError> {
        self.rows.clear();
        Ok(())
    }
}

/// In-memory resource configuration store.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    rows: DashMap<String, ResourceConfig>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get(&self, id: &str) -> Result<ResourceConfig, BrokerError> {
        let key = id.to_lowercase();
        self.rows
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                BrokerError::NotFound(format!("Rendering resource {key} is not configured"))
            })
    }

    async fn create(&self, mut config: ResourceConfig) -> Result<(), BrokerError> {
        config.id = config.id.to_lowercase();
        match self.rows.entry(config.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BrokerError::Conflict(format!(
                "Rendering resource {} is already configured",
                config.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(config);
                Ok(())
            }
        }
    }

    async fn update(&self, mut config: ResourceConfig) -> Result<(), BrokerError> {
        config.id = config.id.to_lowercase();
        match self.rows.get_mut(&config.id) {
            Some(mut entry) => {
                *entry.value_mut() = config;
                Ok(())
            }
            None => Err(BrokerError::NotFound(format!(
                "Rendering resource {} is not configured",
                config.id
            ))),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), BrokerError> {
        let key = id.to_lowercase();
        self.rows.remove(&key).map(|_| ()).ok_or_else(|| {
            BrokerError::NotFound(format!("Rendering resource {key} is not configured"))
        })
    }

    async fn list(&self) -> Result<Vec<ResourceConfig>, BrokerError> {
        let mut configs: Vec<ResourceConfig> =
            self.rows.iter().map(|entry| entry.value().clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }

    async fn clear(&self) -> Result<(), BrokerError> {
        self.rows.clear();
        Ok(())
    }
}
