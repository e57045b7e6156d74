//! Static configuration loaded at boot
//!
//! The configuration file is YAML with camelCase keys. Every section has
//! defaults, so an empty file yields a runnable (database-less) server.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "CILIKUBE_CONFIG_PATH";

/// Environment variable overriding `server.mode`
pub const MODE_ENV: &str = "CILIKUBE_MODE";

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";

/// Sentinel `configPath` selecting the in-cluster service account
pub const IN_CLUSTER_SENTINEL: &str = "in-cluster";

/// Root configuration document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Clusters declared in the file (held in memory only)
    pub clusters: Vec<FileClusterConfig>,
    /// Credential store settings
    pub database: DatabaseConfig,
    /// Token settings, consumed by the auth subsystem
    pub jwt: JwtConfig,
    /// Cluster client tuning
    pub kubernetes: KubernetesConfig,
}

/// Run mode, mirrors debug/release toggles of the HTTP layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Human-readable logs, verbose defaults
    #[default]
    Debug,
    /// JSON logs
    Release,
}

impl std::str::FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "test" => Ok(Self::Debug),
            "release" => Ok(Self::Release),
            other => Err(Error::Config(format!("unknown server mode: {}", other))),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Listen port
    pub port: u16,
    /// Run mode
    pub mode: RunMode,
    /// Cluster selected as active at boot, if loaded
    pub active_cluster_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            mode: RunMode::Debug,
            active_cluster_id: String::new(),
        }
    }
}

/// A cluster declared in the configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileClusterConfig {
    /// Stable identifier; defaults to `name` when empty
    pub id: String,
    /// Unique human name
    pub name: String,
    /// Kubeconfig path, `in-cluster`, or empty for the user default
    pub config_path: String,
    /// Environment label (dev, staging, prod)
    pub environment: String,
    /// Hosting provider
    pub provider: String,
    /// Free-form description
    pub description: String,
    /// Region
    pub region: String,
}

impl FileClusterConfig {
    /// Identifier used for the registry entry
    pub fn effective_id(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

/// Supported relational backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// SQLite file database
    #[default]
    Sqlite,
    /// MySQL server
    Mysql,
}

/// Credential store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Whether the durable store is used; false keeps records in memory
    pub enabled: bool,
    /// Backend type
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    /// MySQL host
    pub host: String,
    /// MySQL port
    pub port: u16,
    /// MySQL user
    pub username: String,
    /// MySQL password
    pub password: String,
    /// MySQL database name
    pub database: String,
    /// SQLite file path
    pub path: String,
    /// Pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: DatabaseKind::Sqlite,
            host: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: "cilikube".to_string(),
            path: "data/cilikube.db".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    /// Connection URL understood by the `sqlx` any-driver
    pub fn url(&self) -> String {
        match self.kind {
            DatabaseKind::Sqlite => format!("sqlite://{}?mode=rwc", self.path),
            DatabaseKind::Mysql => format!(
                "mysql://{}:{}@{}:{}/{}",
                encode_userinfo(&self.username),
                encode_userinfo(&self.password),
                self.host,
                self.port,
                self.database
            ),
        }
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Token settings. Parsed so the file validates; issued and checked elsewhere.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JwtConfig {
    /// Signing key
    pub secret_key: String,
    /// Token lifetime, e.g. "24h"
    pub expire_duration: String,
    /// Issuer claim
    pub issuer: String,
}

/// Cluster client tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Sustained requests per second per cluster
    pub qps: u32,
    /// Requests allowed in a burst per cluster
    pub burst: u32,
    /// Retry client construction with TLS verification disabled
    pub insecure_fallback: bool,
    /// Timeout for each health probe
    pub probe_timeout_secs: u64,
    /// Interval between health sweeps
    pub refresh_interval_secs: u64,
    /// Delay before the first health sweep
    pub refresh_initial_delay_secs: u64,
    /// Connect timeout for the cluster transport
    pub connect_timeout_secs: u64,
    /// Read timeout for the cluster transport (non-streaming calls)
    pub read_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            qps: 50,
            burst: 100,
            insecure_fallback: true,
            probe_timeout_secs: 5,
            refresh_interval_secs: 300,
            refresh_initial_delay_secs: 5,
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
        }
    }
}

impl KubernetesConfig {
    /// Probe timeout as a duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    /// Refresh interval as a duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Initial refresh delay as a duration
    pub fn refresh_initial_delay(&self) -> Duration {
        Duration::from_secs(self.refresh_initial_delay_secs)
    }
}

impl Config {
    /// Parse a configuration document
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Load and validate a configuration file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config = Self::from_yaml(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CILIKUBE_MODE` on top of the file value
    pub fn apply_env_overrides(&mut self) -> Result<(), Error> {
        if let Ok(mode) = std::env::var(MODE_ENV) {
            if !mode.trim().is_empty() {
                self.server.mode = mode.parse()?;
            }
        }
        Ok(())
    }

    /// Reject file-declared clusters with missing or duplicate names
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.trim().is_empty() {
                return Err(Error::Config(
                    "clusters[]: every cluster needs a name".to_string(),
                ));
            }
            if !seen.insert(cluster.name.as_str()) {
                return Err(Error::Config(format!(
                    "clusters[]: duplicate cluster name {}",
                    cluster.name
                )));
            }
        }
        if self.kubernetes.qps == 0 || self.kubernetes.burst == 0 {
            return Err(Error::Config(
                "kubernetes.qps and kubernetes.burst must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
