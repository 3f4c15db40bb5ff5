// src/core/registry.rs

//! CRUD surface over the resource-configuration store, plus the pure
//! parameter-template helpers shared by all allocators.

use crate::core::errors::BrokerError;
use crate::core::models::{CONFIG_ID_MAX_LEN, ResourceConfig};
use crate::core::repository::ConfigStore;
use std::sync::Arc;
use tracing::info;

/// Registry of named rendering-resource templates.
///
/// Ids are lowercased on every write and lookup, matching the wire contract.
#[derive(Clone)]
pub struct ConfigRegistry {
    store: Arc<dyn ConfigStore>,
}

impl ConfigRegistry {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &str) -> Result<ResourceConfig, BrokerError> {
        self.store.get(id).await
    }

    pub async fn create(&self, config: ResourceConfig) -> Result<String, BrokerError> {
        validate_config_id(&config.id)?;
        let id = config.id.to_lowercase();
        self.store.create(config).await?;
        info!("Rendering resource {id} successfully configured");
        Ok(format!("Rendering Resource {id} successfully configured"))
    }

    pub async fn update(&self, config: ResourceConfig) -> Result<(), BrokerError> {
        validate_config_id(&config.id)?;
        self.store.update(config).await
    }

    pub async fn delete(&self, id: &str) -> Result<String, BrokerError> {
        self.store.delete(id).await?;
        Ok("Settings successfully deleted".to_string())
    }

    pub async fn list(&self) -> Result<Vec<ResourceConfig>, BrokerError> {
        self.store.list().await
    }

    pub async fn clear(&self) -> Result<String, BrokerError> {
        self.store.clear().await?;
        Ok("Settings cleared".to_string())
    }
}

fn validate_config_id(id: &str) -> Result<(), BrokerError> {
    if id.is_empty() {
        return Err(BrokerError::InvalidRequest(
            "configuration id cannot be empty".to_string(),
        ));
    }
    if id.len() > CONFIG_ID_MAX_LEN {
        return Err(BrokerError::InvalidRequest(format!(
            "configuration id exceeds {CONFIG_ID_MAX_LEN} characters"
        )));
    }
    Ok(())
}

/// Substitutes the known placeholders of a parameter-format template.
///
/// Only `${rest_hostname}`, `${rest_port}`, `${rest_schema}` and `${job_id}`
/// are rewritten; any other text is left untouched. The function is pure.
pub fn format_rest_parameters(
    template: &str,
    hostname: &str,
    port: u16,
    schema: &str,
    job_id: &str,
) -> String {
    template
        .replace("${rest_hostname}", hostname)
        .replace("${rest_port}", &port.to_string())
        .replace("${rest_schema}", schema)
        .replace("${job_id}", job_id)
}

/// Builds the per-session schema token used in the rest-parameter templates.
pub fn rest_schema(config_id: &str, session_id: &str) -> String {
    format!("rest{config_id}{session_id}")
}
