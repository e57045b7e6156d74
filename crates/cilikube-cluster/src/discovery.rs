//! Per-cluster cache of discovered API resources
//!
//! Keyed by (group, version, plural) so the CRD gateway can resolve a
//! resource's scope without a round-trip. Misses trigger a re-discovery at
//! most once per [`MISS_REDISCOVERY_INTERVAL`]; concurrent misses share it.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Minimum spacing of discovery runs caused by cache misses
pub const MISS_REDISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Whether a resource lives inside namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceScope {
    /// Namespace-scoped
    Namespaced,
    /// Cluster-scoped
    Cluster,
}

impl From<&Scope> for ResourceScope {
    fn from(scope: &Scope) -> Self {
        match scope {
            Scope::Namespaced => Self::Namespaced,
            Scope::Cluster => Self::Cluster,
        }
    }
}

/// A resource the API server advertises
#[derive(Debug, Clone)]
pub struct DiscoveredResource {
    /// Group, version, kind and plural
    pub api_resource: ApiResource,
    /// Namespace or cluster scope
    pub scope: ResourceScope,
}

impl DiscoveredResource {
    /// Build from kube discovery output
    pub fn new(api_resource: ApiResource, caps: &ApiCapabilities) -> Self {
        Self {
            api_resource,
            scope: ResourceScope::from(&caps.scope),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    group: String,
    version: String,
    plural: String,
}

impl ResourceKey {
    fn new(group: &str, version: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
        }
    }
}

/// Concurrent discovery cache
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    resources: DashMap<ResourceKey, DiscoveredResource>,
    /// Serializes discovery runs; holds when the last one completed
    last_run: Mutex<Option<Instant>>,
}

fn ran_recently(last_run: Option<Instant>, now: Instant) -> bool {
    last_run.is_some_and(|at| now.saturating_duration_since(at) < MISS_REDISCOVERY_INTERVAL)
}

impl DiscoveryCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a resource; the core group is the empty string
    pub fn get(&self, group: &str, version: &str, plural: &str) -> Option<DiscoveredResource> {
        self.resources
            .get(&ResourceKey::new(group, version, plural))
            .map(|r| r.clone())
    }

    /// Insert or replace one resource
    pub fn insert(&self, resource: DiscoveredResource) {
        let key = ResourceKey::new(
            &resource.api_resource.group,
            &resource.api_resource.version,
            &resource.api_resource.plural,
        );
        self.resources.insert(key, resource);
    }

    /// Replace the whole cache; entries present before and after stay
    /// visible throughout
    pub fn replace_all(&self, resources: Vec<DiscoveredResource>) {
        let mut keep = HashSet::with_capacity(resources.len());
        for resource in resources {
            keep.insert(ResourceKey::new(
                &resource.api_resource.group,
                &resource.api_resource.version,
                &resource.api_resource.plural,
            ));
            self.insert(resource);
        }
        self.resources.retain(|key, _| keep.contains(key));
    }

    /// Number of cached resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether discovery has populated anything yet
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Run full API discovery and repopulate the cache
    pub async fn refresh(&self, client: &Client) -> Result<usize, kube::Error> {
        let mut last_run = self.last_run.lock().await;
        let count = self.run(client).await?;
        *last_run = Some(Instant::now());
        Ok(count)
    }

    /// Re-discover after a miss unless a run finished recently; true when
    /// discovery ran
    pub async fn refresh_after_miss(&self, client: &Client) -> Result<bool, kube::Error> {
        let mut last_run = self.last_run.lock().await;
        if ran_recently(*last_run, Instant::now()) {
            return Ok(false);
        }
        self.run(client).await?;
        *last_run = Some(Instant::now());
        Ok(true)
    }

    async fn run(&self, client: &Client) -> Result<usize, kube::Error> {
        let discovery = Discovery::new(client.clone()).run().await?;
        let mut found = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    found.push(DiscoveredResource::new(ar, &caps));
                }
            }
        }
        let count = found.len();
        self.replace_all(found);
        debug!(resources = count, "discovery cache refreshed");
        Ok(count)
    }
}
