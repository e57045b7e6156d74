//! Live connection to one cluster

use std::fmt;

use kube::{Client, Config};

use crate::discovery::{DiscoveredResource, DiscoveryCache};

/// A ready-to-use connection to one cluster
///
/// The kube `Client` serves both typed and dynamic (`DynamicObject`) access;
/// the transport `Config` is kept for raw proxying and diagnostics.
pub struct ClusterClient {
    client: Client,
    config: Config,
    insecure: bool,
    discovery: DiscoveryCache,
}

impl fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterClient")
            .field("server", &self.server_url())
            .field("insecure", &self.insecure)
            .field("discovered", &self.discovery.len())
            .finish()
    }
}

impl ClusterClient {
    /// Wrap an already constructed kube client
    pub fn new(client: Client, config: Config, insecure: bool) -> Self {
        Self {
            client,
            config,
            insecure,
            discovery: DiscoveryCache::new(),
        }
    }

    /// The kube client (cheap to clone)
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Transport configuration the client was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// API server URL
    pub fn server_url(&self) -> String {
        self.config.cluster_url.to_string()
    }

    /// Whether TLS verification was disabled to reach this cluster
    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Cached API discovery
    pub fn discovery(&self) -> &DiscoveryCache {
        &self.discovery
    }

    /// Re-run API discovery
    pub async fn refresh_discovery(&self) -> Result<usize, kube::Error> {
        self.discovery.refresh(&self.client).await
    }

    /// Find a resource by group/version/plural, re-discovering on a miss
    /// unless discovery ran moments ago
    pub async fn resolve_resource(
        &self,
        group: &str,
        version: &str,
        plural: &str,
    ) -> Result<Option<DiscoveredResource>, kube::Error> {
        if let Some(found) = self.discovery.get(group, version, plural) {
            return Ok(Some(found));
        }
        self.discovery.refresh_after_miss(&self.client).await?;
        Ok(self.discovery.get(group, version, plural))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use http::{Request, Response};
    use kube::client::Body;

    /// Client backed by a tower-test mock; the handle answers requests
    pub(crate) fn mock_cluster_client(
        server: &str,
    ) -> (
        ClusterClient,
        tower_test::mock::Handle<Request<Body>, Response<Body>>,
    ) {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(service, "default");
        let config = Config::new(server.parse().expect("valid test url"));
        (ClusterClient::new(client, config, false), handle)
    }
}
