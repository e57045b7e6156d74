//! Request-to-cluster resolution
//!
//! An explicit `clusterId` is tried as an id and then as a name (older
//! clients send names). Without one, `clusterName` is tried, then the active
//! cluster. Resolution happens under a single read of the registry so the
//! answer is consistent even while clusters are switched or removed.

use std::sync::Arc;

use serde::Deserialize;

use cilikube_common::{Error, Result};

use crate::client::ClusterClient;
use crate::registry::ClusterRegistry;

/// Cluster selection carried by a request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterSelector {
    /// Cluster id (or, for older clients, name)
    #[serde(rename = "clusterId", default)]
    pub cluster_id: Option<String>,
    /// Cluster name
    #[serde(rename = "clusterName", default)]
    pub cluster_name: Option<String>,
}

impl ClusterSelector {
    /// Select by id
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            cluster_id: Some(id.into()),
            cluster_name: None,
        }
    }

    fn explicit_id(&self) -> Option<&str> {
        self.cluster_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn explicit_name(&self) -> Option<&str> {
        self.cluster_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// A cluster chosen for one request
#[derive(Debug, Clone)]
pub struct ResolvedCluster {
    /// Cluster id
    pub id: String,
    /// Cluster name
    pub name: String,
    /// Client to issue the request with
    pub client: Arc<ClusterClient>,
}

impl ClusterRegistry {
    /// Pick the cluster a request targets
    ///
    /// Fails with `ClusterNotFound` for unknown explicit targets,
    /// `ClusterUnavailable` when the target has no client and
    /// `ClusterSelectionMissing` when nothing is selected and no cluster
    /// is active.
    pub async fn resolve(&self, selector: &ClusterSelector) -> Result<ResolvedCluster> {
        let state = self.read_state().await;
        let id = match (selector.explicit_id(), selector.explicit_name()) {
            (Some(key), _) => state
                .find_id(key)
                .ok_or_else(|| Error::ClusterNotFound(key.to_string()))?,
            (None, Some(name)) => state
                .id_by_name(name)
                .map(str::to_string)
                .ok_or_else(|| Error::ClusterNotFound(name.to_string()))?,
            (None, None) => state
                .active_id()
                .map(str::to_string)
                .ok_or(Error::ClusterSelectionMissing)?,
        };
        state
            .get(&id)
            .ok_or(Error::ClusterNotFound(id.clone()))?
            .resolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{available, registry_with, seed, BROKEN, GOOD};
    use crate::store::MemoryClusterStore;

    fn by_name(name: &str) -> ClusterSelector {
        ClusterSelector {
            cluster_id: None,
            cluster_name: Some(name.to_string()),
        }
    }

    async fn loaded() -> ClusterRegistry {
        let store = MemoryClusterStore::new();
        seed(&store, "prod", GOOD).await;
        seed(&store, "staging", GOOD).await;
        seed(&store, "legacy", BROKEN).await;
        let registry = registry_with(store, available("v1"));
        registry.load(&[], None).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn explicit_id_wins_over_active() {
        let registry = loaded().await;
        let resolved = registry
            .resolve(&ClusterSelector::id("staging-id"))
            .await
            .unwrap();
        assert_eq!(resolved.id, "staging-id");
        assert_eq!(resolved.name, "staging");
    }

    #[tokio::test]
    async fn cluster_id_may_carry_a_name() {
        let registry = loaded().await;
        let resolved = registry
            .resolve(&ClusterSelector::id("staging"))
            .await
            .unwrap();
        assert_eq!(resolved.id, "staging-id");
    }

    #[tokio::test]
    async fn cluster_name_selects_by_name() {
        let registry = loaded().await;
        assert_eq!(
            registry.resolve(&by_name("staging")).await.unwrap().id,
            "staging-id"
        );
        assert!(matches!(
            registry.resolve(&by_name("staging-id")).await,
            Err(Error::ClusterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn no_selection_uses_active() {
        let registry = loaded().await;
        let resolved = registry.resolve(&ClusterSelector::default()).await.unwrap();
        assert_eq!(resolved.id, "prod-id");

        // Blank values count as no selection
        let blank = ClusterSelector {
            cluster_id: Some("  ".into()),
            cluster_name: Some("".into()),
        };
        assert_eq!(registry.resolve(&blank).await.unwrap().id, "prod-id");
    }

    #[tokio::test]
    async fn resolution_failures() {
        let registry = loaded().await;
        assert!(matches!(
            registry.resolve(&ClusterSelector::id("ghost")).await,
            Err(Error::ClusterNotFound(id)) if id == "ghost"
        ));
        assert!(matches!(
            registry.resolve(&ClusterSelector::id("legacy-id")).await,
            Err(Error::ClusterUnavailable { cluster, .. }) if cluster == "legacy-id"
        ));

        let empty = registry_with(MemoryClusterStore::new(), available("v1"));
        empty.load(&[], None).await.unwrap();
        assert!(matches!(
            empty.resolve(&ClusterSelector::default()).await,
            Err(Error::ClusterSelectionMissing)
        ));
    }

    #[test]
    fn selector_reads_query_names() {
        let selector: ClusterSelector =
            serde_json::from_str(r#"{"clusterId":"a","clusterName":"b"}"#).unwrap();
        assert_eq!(selector.cluster_id.as_deref(), Some("a"));
        assert_eq!(selector.cluster_name.as_deref(), Some("b"));
    }
}
