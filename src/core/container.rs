//! Dependency injection container
//!
//! Owns the coordinator and widget manager a page shares, so call sites
//! receive them explicitly instead of reaching for global singletons.

use std::sync::Arc;

use log::info;

use super::traits::ScriptHost;
use crate::{
    config::Config,
    coordinator::RequestCoordinator,
    widget::{HeadlessHost, WidgetLifecycleManager, WidgetSettings},
};

/// Main dependency injection container
pub struct ServiceContainer {
    /// Shared request deduplication and batching
    coordinator: Arc<RequestCoordinator>,

    /// Verification widget lifecycle
    widgets: Arc<WidgetLifecycleManager>,
}

impl ServiceContainer {
    /// Create a container with default settings and no script host
    pub fn new() -> Self {
        Self {
            coordinator: Arc::new(RequestCoordinator::new()),
            widgets: Arc::new(WidgetLifecycleManager::new(
                Arc::new(HeadlessHost),
                WidgetSettings::default(),
            )),
        }
    }

    pub fn from_config(config: &Config, host: Arc<dyn ScriptHost>) -> Self {
        Self {
            coordinator: Arc::new(RequestCoordinator::from_config(&config.coordinator)),
            widgets: Arc::new(WidgetLifecycleManager::from_config(host, &config.widget)),
        }
    }

    /// Create a container with custom components
    pub fn with_components(
        coordinator: Arc<RequestCoordinator>,
        widgets: Arc<WidgetLifecycleManager>,
    ) -> Self {
        Self {
            coordinator,
            widgets,
        }
    }

    pub fn coordinator(&self) -> Arc<RequestCoordinator> {
        self.coordinator.clone()
    }

    pub fn widgets(&self) -> Arc<WidgetLifecycleManager> {
        self.widgets.clone()
    }

    /// Drop pending coordination state and remove every rendered widget
    pub fn teardown(&self) {
        info!("Tearing down service container");
        self.coordinator.clear();
        self.widgets.remove_all();
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}
