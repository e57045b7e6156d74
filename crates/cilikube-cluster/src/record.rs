//! Cluster records: the durable description of a cluster

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cilikube_common::config::{FileClusterConfig, IN_CLUSTER_SENTINEL};

use crate::factory::KubeconfigSource;

/// Where a cluster record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSource {
    /// Created through the API and persisted in the credential store
    Database,
    /// Declared in the static configuration file; read-only
    File,
}

impl ClusterSource {
    /// Stable string form used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::File => "file",
        }
    }
}

/// Durable description of one cluster
#[derive(Clone, PartialEq)]
pub struct ClusterRecord {
    /// Immutable unique identifier
    pub id: String,
    /// Unique human name
    pub name: String,
    /// Raw kubeconfig document; absent for file-sourced records
    pub kubeconfig: Option<Vec<u8>>,
    /// Kubeconfig location for file-sourced records
    pub config_path: Option<String>,
    /// Origin of the record
    pub source: ClusterSource,
    /// Environment label
    pub environment: String,
    /// Hosting provider
    pub provider: String,
    /// Free-form description
    pub description: String,
    /// Region
    pub region: String,
    /// Last discovered server version
    pub version: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

// Kubeconfig bytes hold credentials and never reach logs.
impl fmt::Debug for ClusterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field(
                "kubeconfig",
                &self.kubeconfig.as_ref().map(|k| format!("<{} bytes>", k.len())),
            )
            .field("config_path", &self.config_path)
            .field("source", &self.source)
            .field("environment", &self.environment)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl ClusterRecord {
    /// New database-sourced record; the store assigns an id when empty
    pub fn new(name: impl Into<String>, kubeconfig: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            kubeconfig: Some(kubeconfig),
            config_path: None,
            source: ClusterSource::Database,
            environment: String::new(),
            provider: String::new(),
            description: String::new(),
            region: String::new(),
            version: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record for a cluster declared in the configuration file
    pub fn from_file(cluster: &FileClusterConfig) -> Self {
        let now = Utc::now();
        Self {
            id: cluster.effective_id().to_string(),
            name: cluster.name.clone(),
            kubeconfig: None,
            config_path: Some(cluster.config_path.clone()),
            source: ClusterSource::File,
            environment: cluster.environment.clone(),
            provider: cluster.provider.clone(),
            description: cluster.description.clone(),
            region: cluster.region.clone(),
            version: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the API may modify or delete this record
    pub fn is_mutable(&self) -> bool {
        self.source == ClusterSource::Database
    }

    /// How the client factory should obtain this cluster's credentials
    pub fn kubeconfig_source(&self) -> KubeconfigSource {
        if let Some(bytes) = &self.kubeconfig {
            return KubeconfigSource::Bytes(bytes.clone());
        }
        match self.config_path.as_deref().map(str::trim) {
            Some(IN_CLUSTER_SENTINEL) => KubeconfigSource::InCluster,
            Some(path) if !path.is_empty() => KubeconfigSource::Path(PathBuf::from(path)),
            _ => KubeconfigSource::DefaultPath,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_cluster(path: &str) -> FileClusterConfig {
        FileClusterConfig {
            name: "lab".to_string(),
            config_path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn file_records_pick_source_from_path() {
        let rec = ClusterRecord::from_file(&file_cluster("/etc/kube/lab"));
        assert!(matches!(rec.kubeconfig_source(), KubeconfigSource::Path(p) if p == PathBuf::from("/etc/kube/lab")));

        let rec = ClusterRecord::from_file(&file_cluster("in-cluster"));
        assert!(matches!(rec.kubeconfig_source(), KubeconfigSource::InCluster));

        let rec = ClusterRecord::from_file(&file_cluster(""));
        assert!(matches!(rec.kubeconfig_source(), KubeconfigSource::DefaultPath));
    }

    #[test]
    fn file_records_are_read_only() {
        let rec = ClusterRecord::from_file(&file_cluster("x"));
        assert_eq!(rec.id, "lab");
        assert_eq!(rec.source, ClusterSource::File);
        assert!(!rec.is_mutable());
        assert!(ClusterRecord::new("db", b"k".to_vec()).is_mutable());
    }

    #[test]
    fn debug_output_redacts_kubeconfig() {
        let rec = ClusterRecord::new("lab", b"token: hunter2".to_vec());
        let debug = format!("{:?}", rec);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<14 bytes>"));
    }
}
