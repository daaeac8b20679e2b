use gpsync_core::PortRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Looks up the externally reachable port for a forwarded local port.
#[derive(Debug, Clone)]
pub struct ExternalPortResolver {
    ports: Arc<PortRegistry>,
}

impl ExternalPortResolver {
    pub fn new(ports: Arc<PortRegistry>) -> Self {
        Self { ports }
    }

    /// Waits as long as it takes; see [`PortRegistry::resolve_external_port`].
    pub async fn resolve(&self, local_port: u32) -> u32 {
        self.ports.resolve_external_port(local_port).await
    }

    pub async fn resolve_within(&self, local_port: u32, timeout: Duration) -> Option<u32> {
        tokio::time::timeout(timeout, self.resolve(local_port))
            .await
            .ok()
    }
}
