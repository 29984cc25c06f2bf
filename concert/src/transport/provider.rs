//! Factories for local endpoints.
//!
//! Higher layers (sessions, clients) never build a bus connection
//! themselves; they ask an [`EndpointProvider`] for a named endpoint.

use std::sync::Arc;

use crate::config::EndpointSettings;
use crate::time::SharedTime;
use crate::transport::local::LocalEndpoint;
use crate::transport::memory::MemoryBusHub;

/// Creates local endpoints on some bus.
pub trait EndpointProvider: Send + Sync {
    /// Create an endpoint named `friendly_name`.
    fn create_local_endpoint(
        &self,
        friendly_name: &str,
        settings: EndpointSettings,
    ) -> LocalEndpoint;

    /// Clock shared by every endpoint this provider creates.
    fn time(&self) -> SharedTime;
}

/// Shared handle to an endpoint provider.
pub type SharedEndpointProvider = Arc<dyn EndpointProvider>;

/// Provider giving every endpoint its own node on a [`MemoryBusHub`].
#[derive(Clone)]
pub struct MemoryEndpointProvider {
    hub: MemoryBusHub,
    time: SharedTime,
}

impl MemoryEndpointProvider {
    /// Create a provider on `hub`, reading time from `time`.
    pub fn new(hub: MemoryBusHub, time: SharedTime) -> Self {
        Self { hub, time }
    }

    /// The hub endpoints are attached to.
    pub fn hub(&self) -> &MemoryBusHub {
        &self.hub
    }
}

impl EndpointProvider for MemoryEndpointProvider {
    fn create_local_endpoint(
        &self,
        friendly_name: &str,
        settings: EndpointSettings,
    ) -> LocalEndpoint {
        let node = self.hub.connect(friendly_name);
        LocalEndpoint::new(friendly_name, settings, Arc::new(node), self.time.clone())
    }

    fn time(&self) -> SharedTime {
        self.time.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualTimeProvider;

    #[test]
    fn test_endpoints_share_the_hub() {
        let provider = MemoryEndpointProvider::new(
            MemoryBusHub::new(),
            Arc::new(ManualTimeProvider::new()),
        );
        let a = provider.create_local_endpoint("a", EndpointSettings::default());
        let b = provider.create_local_endpoint("b", EndpointSettings::default());
        assert_ne!(a.address(), b.address());

        a.publish_discovery();
        b.tick();
        assert!(b.has_remote_endpoint(a.id()));
    }
}
