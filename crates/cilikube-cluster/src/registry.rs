//! Cluster registry: the in-memory set of clusters and the active selection
//!
//! All state sits behind one `RwLock` so the entry map, name index, ordering
//! and active id can never disagree. Client construction and probes happen
//! outside the lock; results are swapped in with a short write.
//!
//! Database records load before file-declared clusters, so on an id or name
//! collision the database record wins and the file cluster is skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cilikube_common::config::{FileClusterConfig, KubernetesConfig};
use cilikube_common::{Error, Result};

use crate::client::ClusterClient;
use crate::factory::{BuiltClient, ClientFactory, ProbeOutcome};
use crate::record::{ClusterRecord, ClusterSource};
use crate::resolver::ResolvedCluster;
use crate::status::{ClusterDetails, ClusterPhase, ClusterStatus};
use crate::store::ClusterStore;

/// Timing for the background health sweep
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Per-client probe timeout
    pub probe_timeout: Duration,
    /// Interval between sweeps
    pub refresh_interval: Duration,
    /// Delay before the first sweep
    pub refresh_initial_delay: Duration,
}

impl From<&KubernetesConfig> for RegistrySettings {
    fn from(config: &KubernetesConfig) -> Self {
        Self {
            probe_timeout: config.probe_timeout(),
            refresh_interval: config.refresh_interval(),
            refresh_initial_delay: config.refresh_initial_delay(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&KubernetesConfig::default())
    }
}

/// Input for registering a new cluster
#[derive(Debug, Clone, Default)]
pub struct NewCluster {
    /// Unique name
    pub name: String,
    /// Raw kubeconfig
    pub kubeconfig: Vec<u8>,
    /// Environment label
    pub environment: String,
    /// Provider label
    pub provider: String,
    /// Description
    pub description: String,
    /// Region
    pub region: String,
}

/// Changes to an existing cluster; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct ClusterUpdate {
    /// New name
    pub name: Option<String>,
    /// Replacement kubeconfig; triggers a client rebuild
    pub kubeconfig: Option<Vec<u8>>,
    /// Environment label
    pub environment: Option<String>,
    /// Provider label
    pub provider: Option<String>,
    /// Description
    pub description: Option<String>,
    /// Region
    pub region: Option<String>,
}

pub(crate) struct ClusterEntry {
    pub(crate) record: ClusterRecord,
    pub(crate) client: Option<Arc<ClusterClient>>,
    pub(crate) status: ClusterStatus,
}

impl ClusterEntry {
    fn from_build(record: ClusterRecord, built: Result<BuiltClient>) -> Self {
        let mut status = ClusterStatus::checking(&record);
        match built {
            Ok(built) => {
                status.server = built.client.server_url();
                status.insecure = built.client.is_insecure();
                status.apply_probe(&built.probe);
                Self {
                    record,
                    client: Some(built.client),
                    status,
                }
            }
            Err(e) => {
                warn!(cluster = %record.id, name = %record.name, error = %e, "cluster client init failed");
                status.mark_init_failed(e.to_string());
                Self {
                    record,
                    client: None,
                    status,
                }
            }
        }
    }

    fn unavailable(&self) -> Error {
        Error::ClusterUnavailable {
            cluster: self.record.id.clone(),
            reason: self
                .status
                .reason
                .clone()
                .unwrap_or_else(|| "client not initialized".to_string()),
        }
    }

    pub(crate) fn resolved(&self) -> Result<ResolvedCluster> {
        let client = self.client.clone().ok_or_else(|| self.unavailable())?;
        Ok(ResolvedCluster {
            id: self.record.id.clone(),
            name: self.record.name.clone(),
            client,
        })
    }
}

#[derive(Default)]
pub(crate) struct RegistryState {
    entries: HashMap<String, ClusterEntry>,
    order: Vec<String>,
    names: HashMap<String, String>,
    active: Option<String>,
}

impl RegistryState {
    fn insert(&mut self, entry: ClusterEntry) {
        let id = entry.record.id.clone();
        self.names.insert(entry.record.name.clone(), id.clone());
        if !self.entries.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &str) -> Option<ClusterEntry> {
        let entry = self.entries.remove(id)?;
        self.names.remove(&entry.record.name);
        self.order.retain(|o| o != id);
        if self.active.as_deref() == Some(id) {
            self.active = None;
            self.promote_active();
        }
        Some(entry)
    }

    fn promote_active(&mut self) {
        let next = self
            .ordered()
            .find(|e| e.client.is_some())
            .or_else(|| self.ordered().next())
            .map(|e| e.record.id.clone());
        self.active = next;
    }

    fn ordered(&self) -> impl Iterator<Item = &ClusterEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub(crate) fn get(&self, id: &str) -> Option<&ClusterEntry> {
        self.entries.get(id)
    }

    pub(crate) fn id_by_name(&self, name: &str) -> Option<&str> {
        self.names.get(name).map(String::as_str)
    }

    pub(crate) fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Resolve an id first, then fall back to treating the key as a name
    pub(crate) fn find_id(&self, key: &str) -> Option<String> {
        if self.entries.contains_key(key) {
            Some(key.to_string())
        } else {
            self.id_by_name(key).map(str::to_string)
        }
    }

    fn name_taken(&self, name: &str, except_id: &str) -> bool {
        self.names
            .get(name)
            .is_some_and(|owner| owner != except_id)
    }

    fn status_of(&self, entry: &ClusterEntry) -> ClusterStatus {
        let mut status = entry.status.clone();
        status.is_active = self.active.as_deref() == Some(entry.record.id.as_str());
        status
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert_eq!(self.order.len(), self.entries.len(), "order tracks entries");
        assert_eq!(self.names.len(), self.entries.len(), "one name per entry");
        for id in &self.order {
            let entry = self.entries.get(id).expect("ordered id has an entry");
            assert_eq!(
                self.names.get(&entry.record.name),
                Some(id),
                "name index points at entry"
            );
        }
        if let Some(active) = &self.active {
            assert!(self.entries.contains_key(active), "active id is registered");
        }
    }
}

/// In-memory registry of cluster clients
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ClusterRegistry {
    state: Arc<RwLock<RegistryState>>,
    store: Arc<dyn ClusterStore>,
    factory: Arc<dyn ClientFactory>,
    settings: RegistrySettings,
}

impl ClusterRegistry {
    /// Empty registry over the given store and factory
    pub fn new(
        store: Arc<dyn ClusterStore>,
        factory: Arc<dyn ClientFactory>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            store,
            factory,
            settings,
        }
    }

    pub(crate) async fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().await
    }

    async fn build_entries(&self, records: Vec<ClusterRecord>) -> Vec<ClusterEntry> {
        let factory = &self.factory;
        join_all(records.into_iter().map(|record| async move {
            let built = factory.build(&record.kubeconfig_source()).await;
            ClusterEntry::from_build(record, built)
        }))
        .await
    }

    /// Load database and file clusters and pick the active cluster
    ///
    /// Per-cluster failures become `init-failed` entries; only a store
    /// failure aborts loading.
    pub async fn load(
        &self,
        file_clusters: &[FileClusterConfig],
        preferred_active: Option<&str>,
    ) -> Result<()> {
        let records = self.store.list_all().await?;
        info!(count = records.len(), "loading clusters from store");
        let db_entries = self.build_entries(records).await;

        let mut seen_ids: HashSet<String> =
            db_entries.iter().map(|e| e.record.id.clone()).collect();
        let mut seen_names: HashSet<String> =
            db_entries.iter().map(|e| e.record.name.clone()).collect();
        let mut file_records = Vec::new();
        for cluster in file_clusters {
            let record = ClusterRecord::from_file(cluster);
            if seen_ids.contains(&record.id) || seen_names.contains(&record.name) {
                warn!(
                    cluster = %record.id,
                    name = %record.name,
                    "file cluster collides with a registered cluster, skipping"
                );
                continue;
            }
            seen_ids.insert(record.id.clone());
            seen_names.insert(record.name.clone());
            file_records.push(record);
        }
        info!(count = file_records.len(), "loading clusters from configuration");
        let file_entries = self.build_entries(file_records).await;

        let mut version_updates = Vec::new();
        {
            let mut state = self.state.write().await;
            for mut entry in db_entries.into_iter().chain(file_entries) {
                if let Some(update) = take_version_change(&mut entry) {
                    version_updates.push(update);
                }
                state.insert(entry);
            }

            let preferred = preferred_active
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .and_then(|p| state.find_id(p))
                .filter(|id| state.get(id).is_some_and(|e| e.client.is_some()));
            match preferred {
                Some(id) => state.active = Some(id),
                None => {
                    if let Some(p) = preferred_active.filter(|p| !p.trim().is_empty()) {
                        warn!(cluster = %p, "configured active cluster is not usable");
                    }
                    let fallback = state
                        .ordered()
                        .find(|e| e.client.is_some())
                        .map(|e| e.record.id.clone());
                    state.active = fallback;
                }
            }
            match &state.active {
                Some(id) => info!(cluster = %id, clusters = state.entries.len(), "active cluster selected"),
                None => warn!(clusters = state.entries.len(), "no usable cluster; active cluster unset"),
            }
        }

        self.persist_versions(version_updates).await;
        Ok(())
    }

    /// Load all clusters and start the background health sweep
    pub async fn initialize(
        &self,
        file_clusters: &[FileClusterConfig],
        preferred_active: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        self.load(file_clusters, preferred_active).await?;
        Ok(self.spawn_refresh(cancel))
    }

    /// Status of every cluster in registration order
    pub async fn list(&self) -> Vec<ClusterStatus> {
        let state = self.state.read().await;
        state.ordered().map(|e| state.status_of(e)).collect()
    }

    /// Status and metadata of one cluster
    pub async fn get(&self, id: &str) -> Result<ClusterDetails> {
        let state = self.state.read().await;
        let entry = state
            .get(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        Ok(ClusterDetails {
            status: state.status_of(entry),
            description: entry.record.description.clone(),
            config_path: entry.record.config_path.clone(),
            discovered_resources: entry.client.as_ref().map_or(0, |c| c.discovery().len()),
            created_at: entry.record.created_at,
            updated_at: entry.record.updated_at,
        })
    }

    /// Persist and register a new cluster
    ///
    /// An unusable kubeconfig is rejected before anything is stored; an
    /// unreachable cluster is still registered.
    pub async fn add(&self, cluster: NewCluster) -> Result<ClusterStatus> {
        let name = cluster.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }
        if cluster.kubeconfig.is_empty() {
            return Err(Error::validation("kubeconfig must not be empty"));
        }
        if self.state.read().await.name_taken(&name, "") {
            return Err(Error::Conflict(format!("cluster name already exists: {}", name)));
        }

        let mut record = ClusterRecord::new(name, cluster.kubeconfig);
        record.environment = cluster.environment;
        record.provider = cluster.provider;
        record.description = cluster.description;
        record.region = cluster.region;

        let built = self.factory.build(&record.kubeconfig_source()).await;
        if let Err(Error::ConfigInvalid(msg)) = &built {
            return Err(Error::ConfigInvalid(msg.clone()));
        }

        let record = self.store.create(record).await?;
        let mut entry = ClusterEntry::from_build(record, built);
        let version_update = take_version_change(&mut entry);
        let id = entry.record.id.clone();

        let status = {
            let mut state = self.state.write().await;
            if state.name_taken(&entry.record.name, &id) {
                drop(state);
                self.store.delete_by_id(&id).await?;
                return Err(Error::Conflict(format!(
                    "cluster name already exists: {}",
                    entry.record.name
                )));
            }
            let has_client = entry.client.is_some();
            state.insert(entry);
            if state.active.is_none() && has_client {
                state.active = Some(id.clone());
                info!(cluster = %id, "first usable cluster became active");
            }
            let entry = state.get(&id).ok_or_else(|| Error::ClusterNotFound(id.clone()))?;
            state.status_of(entry)
        };

        self.persist_versions(version_update.into_iter().collect()).await;
        info!(cluster = %id, name = %status.name, status = ?status.status, "cluster registered");
        Ok(status)
    }

    /// Update a database-sourced cluster, rebuilding its client when the
    /// kubeconfig changes
    ///
    /// The old client is swapped out atomically; requests already holding it
    /// finish against the old connection.
    pub async fn update(&self, id: &str, changes: ClusterUpdate) -> Result<ClusterStatus> {
        let current = {
            let state = self.state.read().await;
            let entry = state
                .get(id)
                .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
            if !entry.record.is_mutable() {
                return Err(Error::validation(format!(
                    "cluster {} is declared in the configuration file and is read-only",
                    id
                )));
            }
            entry.record.clone()
        };

        let mut record = current.clone();
        if let Some(name) = changes.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(Error::validation("cluster name must not be empty"));
            }
            if self.state.read().await.name_taken(&name, id) {
                return Err(Error::Conflict(format!("cluster name already exists: {}", name)));
            }
            record.name = name;
        }
        if let Some(v) = changes.environment {
            record.environment = v;
        }
        if let Some(v) = changes.provider {
            record.provider = v;
        }
        if let Some(v) = changes.description {
            record.description = v;
        }
        if let Some(v) = changes.region {
            record.region = v;
        }

        let rebuilt = match changes.kubeconfig {
            Some(kubeconfig) if Some(&kubeconfig) != current.kubeconfig.as_ref() => {
                if kubeconfig.is_empty() {
                    return Err(Error::validation("kubeconfig must not be empty"));
                }
                record.kubeconfig = Some(kubeconfig);
                let built = self.factory.build(&record.kubeconfig_source()).await;
                if let Err(Error::ConfigInvalid(msg)) = &built {
                    return Err(Error::ConfigInvalid(msg.clone()));
                }
                Some(built)
            }
            _ => None,
        };

        let record = self.store.update(record).await?;

        let mut state = self.state.write().await;
        let mut entry = state
            .remove_for_swap(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        entry.record = record;
        if let Some(built) = rebuilt {
            let fresh = ClusterEntry::from_build(entry.record.clone(), built);
            entry.client = fresh.client;
            entry.status = fresh.status;
            info!(cluster = %id, "cluster client rebuilt");
        }
        entry.status.sync_record(&entry.record);
        state.reinsert(entry);
        let entry = state.get(id).ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        Ok(state.status_of(entry))
    }

    /// Delete a database-sourced cluster
    pub async fn remove(&self, id: &str) -> Result<()> {
        {
            let state = self.state.read().await;
            let entry = state
                .get(id)
                .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
            if !entry.record.is_mutable() {
                return Err(Error::validation(format!(
                    "cluster {} is declared in the configuration file and cannot be deleted",
                    id
                )));
            }
        }

        match self.store.delete_by_id(id).await {
            Ok(()) | Err(crate::store::StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut state = self.state.write().await;
        state.remove(id);
        info!(cluster = %id, active = ?state.active, "cluster removed");
        Ok(())
    }

    /// Make a cluster (by id or name) the default for requests without one
    pub async fn set_active(&self, key: &str) -> Result<ClusterStatus> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::validation("cluster id must not be empty"));
        }
        let mut state = self.state.write().await;
        let id = state
            .find_id(key)
            .ok_or_else(|| Error::ClusterNotFound(key.to_string()))?;
        let entry = state
            .get(&id)
            .ok_or_else(|| Error::ClusterNotFound(id.clone()))?;
        if entry.client.is_none() {
            return Err(entry.unavailable());
        }
        state.active = Some(id.clone());
        info!(cluster = %id, "active cluster switched");
        let entry = state.get(&id).ok_or_else(|| Error::ClusterNotFound(id.clone()))?;
        Ok(state.status_of(entry))
    }

    /// The active cluster's client
    pub async fn active(&self) -> Result<ResolvedCluster> {
        let state = self.state.read().await;
        let id = state.active.as_deref().ok_or(Error::NoActive)?;
        state
            .get(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?
            .resolved()
    }

    /// Status of the active cluster
    pub async fn active_status(&self) -> Result<ClusterStatus> {
        let state = self.state.read().await;
        let id = state.active.as_deref().ok_or(Error::NoActive)?;
        let entry = state
            .get(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        Ok(state.status_of(entry))
    }

    /// Client for a cluster id
    pub async fn lookup(&self, id: &str) -> Result<ResolvedCluster> {
        let state = self.state.read().await;
        state
            .get(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?
            .resolved()
    }

    /// Probe every cluster that has a client and record the results
    ///
    /// Probe results are discarded for entries whose client was replaced or
    /// removed while the probe ran.
    pub async fn refresh_all(&self) {
        let targets: Vec<(String, Arc<ClusterClient>)> = {
            let state = self.state.read().await;
            state
                .ordered()
                .filter_map(|e| e.client.clone().map(|c| (e.record.id.clone(), c)))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let probes = targets.into_iter().map(|(id, client)| {
            let factory = Arc::clone(&self.factory);
            let timeout = self.settings.probe_timeout;
            tokio::spawn(async move {
                let outcome = tokio::time::timeout(timeout, factory.probe(&client))
                    .await
                    .unwrap_or_else(|_| ProbeOutcome::Unavailable {
                        reason: format!("probe timed out after {}s", timeout.as_secs()),
                    });
                (id, client, outcome)
            })
        });
        let results: Vec<_> = join_all(probes)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(error = %e, "probe task failed");
                    None
                }
            })
            .collect();

        let mut version_updates = Vec::new();
        let mut available = 0usize;
        {
            let mut state = self.state.write().await;
            for (id, client, outcome) in &results {
                let Some(entry) = state.entries.get_mut(id) else {
                    continue;
                };
                let current = entry.client.as_ref().is_some_and(|c| Arc::ptr_eq(c, client));
                if !current {
                    debug!(cluster = %id, "discarding probe for replaced client");
                    continue;
                }
                let before = entry.status.status;
                entry.status.apply_probe(outcome);
                if entry.status.status != before {
                    info!(
                        cluster = %id,
                        from = ?before,
                        to = ?entry.status.status,
                        reason = ?entry.status.reason,
                        "cluster status changed"
                    );
                }
                if entry.status.status == ClusterPhase::Available {
                    available += 1;
                }
                if let Some(update) = take_version_change(entry) {
                    version_updates.push(update);
                }
            }
        }
        debug!(probed = results.len(), available, "cluster health sweep complete");

        self.persist_versions(version_updates).await;
    }

    /// Probe one cluster and re-run its API discovery
    pub async fn refresh_one(&self, id: &str) -> Result<ClusterStatus> {
        let resolved = self.lookup(id).await?;
        let outcome = tokio::time::timeout(
            self.settings.probe_timeout,
            self.factory.probe(&resolved.client),
        )
        .await
        .unwrap_or_else(|_| ProbeOutcome::Unavailable {
            reason: "probe timed out".to_string(),
        });
        if matches!(outcome, ProbeOutcome::Available { .. }) {
            if let Err(e) = resolved.client.refresh_discovery().await {
                warn!(cluster = %id, error = %e, "API discovery failed");
            }
        }

        let (status, version_update) = {
            let mut state = self.state.write().await;
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
            let current = entry
                .client
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &resolved.client));
            let update = if current {
                entry.status.apply_probe(&outcome);
                take_version_change(entry)
            } else {
                None
            };
            let entry = state.get(id).ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
            (state.status_of(entry), update)
        };
        self.persist_versions(version_update.into_iter().collect()).await;
        Ok(status)
    }

    /// Run `refresh_all` after the initial delay and then on every interval
    pub fn spawn_refresh(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let initial_delay = self.settings.refresh_initial_delay;
        let interval = self.settings.refresh_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cluster health sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => registry.refresh_all().await,
                }
            }
        })
    }

    async fn persist_versions(&self, updates: Vec<(String, String)>) {
        for (id, version) in updates {
            if let Err(e) = self.store.update_version(&id, &version).await {
                warn!(cluster = %id, error = %e, "failed to persist cluster version");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn check_invariants(&self) {
        self.state.read().await.check_invariants();
    }
}

impl RegistryState {
    fn remove_for_swap(&mut self, id: &str) -> Option<ClusterEntry> {
        let entry = self.entries.remove(id)?;
        self.names.remove(&entry.record.name);
        Some(entry)
    }

    fn reinsert(&mut self, entry: ClusterEntry) {
        self.names
            .insert(entry.record.name.clone(), entry.record.id.clone());
        self.entries.insert(entry.record.id.clone(), entry);
    }
}

/// New version to persist for database records whose probe reported one
fn take_version_change(entry: &mut ClusterEntry) -> Option<(String, String)> {
    if entry.record.source != ClusterSource::Database
        || entry.status.version.is_empty()
        || entry.status.version == entry.record.version
    {
        return None;
    }
    entry.record.version = entry.status.version.clone();
    Some((entry.record.id.clone(), entry.record.version.clone()))
}
