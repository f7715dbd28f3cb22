//! Umbra discovery
//!
//! Connection lifecycle management, the discovery engine, and the periodic
//! scheduler. Long-running work lives in spawned tasks behind bounded
//! channels; everything is injected through constructors.

pub mod connection;
pub mod engine;
pub mod scheduler;

pub use connection::ConnectionManager;
pub use engine::DiscoveryEngine;
pub use scheduler::Scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use umbra_connectors::Connector;
use umbra_core::config::UmbraConfig;
use umbra_core::types::Platform;

/// Platform -> adapter lookup; built once at startup
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<Platform, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.platform(), connector);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.connectors.keys().copied().collect()
    }

    /// The production adapter set, one per supported platform
    pub fn standard(cfg: &UmbraConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(umbra_connectors::slack::SlackConnector::new(
            cfg.oauth_slack.clone(),
        )));
        registry.register(Arc::new(umbra_connectors::google::GoogleConnector::new(
            cfg.oauth_google.clone(),
        )));
        registry.register(Arc::new(
            umbra_connectors::microsoft::MicrosoftConnector::new(cfg.oauth_microsoft.clone()),
        ));
        for provider in [Platform::Chatgpt, Platform::Claude, Platform::Gemini] {
            registry.register(Arc::new(
                umbra_connectors::ai_platform::AiPlatformConnector::new(
                    provider,
                    cfg.oauth_ai.clone(),
                ),
            ));
        }
        registry
    }
}
