//! Cluster health as reported to API consumers

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::factory::ProbeOutcome;
use crate::record::{ClusterRecord, ClusterSource};

/// Health phase of a registered cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterPhase {
    /// Not probed yet
    Checking,
    /// Last probe succeeded
    Available,
    /// Last probe failed; the client is kept and retried
    Unavailable,
    /// No client could be built
    InitFailed,
}

/// Observable status of one cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Cluster id
    pub id: String,
    /// Cluster name
    pub name: String,
    /// API server URL, empty when no client exists
    pub server: String,
    /// Server version from the last successful probe
    pub version: String,
    /// Health phase
    pub status: ClusterPhase,
    /// Failure reason for unavailable or init-failed clusters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Record origin
    pub source: ClusterSource,
    /// Environment label
    pub environment: String,
    /// Provider label
    pub provider: String,
    /// Region label
    pub region: String,
    /// TLS verification disabled for this cluster
    pub insecure: bool,
    /// Whether this is the active cluster
    pub is_active: bool,
    /// Last status change
    pub last_updated: DateTime<Utc>,
}

impl ClusterStatus {
    pub(crate) fn checking(record: &ClusterRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            server: String::new(),
            version: record.version.clone(),
            status: ClusterPhase::Checking,
            reason: None,
            source: record.source,
            environment: record.environment.clone(),
            provider: record.provider.clone(),
            region: record.region.clone(),
            insecure: false,
            is_active: false,
            last_updated: Utc::now(),
        }
    }

    pub(crate) fn sync_record(&mut self, record: &ClusterRecord) {
        self.name = record.name.clone();
        self.environment = record.environment.clone();
        self.provider = record.provider.clone();
        self.region = record.region.clone();
    }

    pub(crate) fn apply_probe(&mut self, outcome: &ProbeOutcome) {
        match outcome {
            ProbeOutcome::Available { version } => {
                self.status = ClusterPhase::Available;
                self.version = version.clone();
                self.reason = None;
            }
            ProbeOutcome::AuthFailed { reason } => {
                self.status = ClusterPhase::Unavailable;
                self.reason = Some(format!("authentication failed: {}", reason));
            }
            ProbeOutcome::Unavailable { reason } => {
                self.status = ClusterPhase::Unavailable;
                self.reason = Some(reason.clone());
            }
        }
        self.last_updated = Utc::now();
    }

    pub(crate) fn mark_init_failed(&mut self, reason: impl Into<String>) {
        self.status = ClusterPhase::InitFailed;
        self.reason = Some(reason.into());
        self.last_updated = Utc::now();
    }
}

/// Status plus the descriptive fields of the record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetails {
    /// Live status
    #[serde(flatten)]
    pub status: ClusterStatus,
    /// Free-form description
    pub description: String,
    /// Kubeconfig path for file-sourced clusters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    /// Number of API resources in the discovery cache
    pub discovered_resources: usize,
    /// Record creation time
    pub created_at: DateTime<Utc>,
    /// Record modification time
    pub updated_at: DateTime<Utc>,
}
