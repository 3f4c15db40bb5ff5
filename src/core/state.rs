// src/core/state.rs

//! Defines the central `BrokerState` struct, holding all shared broker-wide
//! state: configuration, repositories, the allocator and the command broker.

use crate::config::{AllocatorKind, Config};
use crate::core::allocator::{
    Allocator, LocalProcessAllocator, SlurmAllocator, UnicoreAllocator,
};
use crate::core::errors::BrokerError;
use crate::core::models::GlobalSettings;
use crate::core::registry::ConfigRegistry;
use crate::core::repository::{
    ConfigStore, InMemoryConfigStore, InMemorySessionStore, SessionStore,
};
use crate::core::session::broker::RequestBroker;
use crate::core::session::image_feed::ImageFeedClient;
use crate::core::session::manager::SessionManager;
use std::sync::Arc;
use std::time::Duration;

/// The central struct holding all shared, broker-wide state. Wrapped in an
/// `Arc` and handed to every request handler and background task.
pub struct BrokerState {
    pub config: Config,
    pub sessions: Arc<dyn SessionStore>,
    pub registry: ConfigRegistry,
    pub manager: Arc<SessionManager>,
    pub broker: RequestBroker,
    pub image_feed: ImageFeedClient,
}

impl BrokerState {
    /// Wires all components together from a validated configuration.
    pub fn initialize(config: Config) -> Result<Arc<Self>, BrokerError> {
        let http = reqwest::Client::builder().build()?;
        let request_timeout = Duration::from_secs(config.session.request_timeout_secs);

        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let configs: Arc<dyn ConfigStore> = Arc::new(InMemoryConfigStore::new());
        let registry = ConfigRegistry::new(configs);

        let process = LocalProcessAllocator::new(
            http.clone(),
            request_timeout,
            config.session.exit_path.clone(),
        );
        let allocator = Arc::new(match config.allocator {
            AllocatorKind::Slurm => Allocator::Slurm(SlurmAllocator::new(
                config.slurm.clone(),
                http.clone(),
                request_timeout,
                config.session.exit_path.clone(),
            )),
            AllocatorKind::Unicore => {
                Allocator::Unicore(UnicoreAllocator::new(config.unicore.clone())?)
            }
            AllocatorKind::Local => Allocator::Local(process.clone()),
        });

        let settings = GlobalSettings::new(config.session.keep_alive_timeout_secs);
        let manager = Arc::new(SessionManager::new(
            sessions.clone(),
            registry.clone(),
            allocator.clone(),
            process,
            settings,
            http.clone(),
            request_timeout,
            config.session.vocabulary_path.clone(),
        ));

        let image_feed =
            ImageFeedClient::new(config.image_feed.url.clone(), http.clone(), request_timeout);
        let broker = RequestBroker::new(
            manager.clone(),
            allocator,
            image_feed.clone(),
            http,
            request_timeout,
            config.session.default_renderer_port,
        );

        Ok(Arc::new(Self {
            config,
            sessions,
            registry,
            manager,
            broker,
            image_feed,
        }))
    }
}
