//! Client factory: kubeconfig in, probed cluster client out
//!
//! Construction order:
//! 1. Parse the kubeconfig (bytes, file, default location or in-cluster)
//! 2. Apply transport timeouts and a QPS/burst rate limit
//! 3. Build the client, retrying once with TLS verification disabled
//! 4. Probe the server version; on a certificate failure retry insecure
//! 5. Populate the discovery cache when the probe succeeds

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::client::ClientBuilder;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
#[cfg(test)]
use mockall::automock;
use tower::limit::RateLimitLayer;
use tracing::{debug, warn};

use cilikube_common::config::KubernetesConfig;
use cilikube_common::Error;

use crate::client::ClusterClient;

/// Where a cluster's credentials come from
#[derive(Clone, PartialEq, Eq)]
pub enum KubeconfigSource {
    /// Raw kubeconfig document
    Bytes(Vec<u8>),
    /// Kubeconfig file on disk
    Path(PathBuf),
    /// `$KUBECONFIG` or `~/.kube/config`
    DefaultPath,
    /// Service account of the pod we run in
    InCluster,
}

impl std::fmt::Debug for KubeconfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(b) => write!(f, "Bytes(<{} bytes>)", b.len()),
            Self::Path(p) => write!(f, "Path({})", p.display()),
            Self::DefaultPath => f.write_str("DefaultPath"),
            Self::InCluster => f.write_str("InCluster"),
        }
    }
}

/// Result of a version probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Server answered with its version
    Available {
        /// `gitVersion` reported by the server
        version: String,
    },
    /// Server rejected our credentials
    AuthFailed {
        /// Server or client message
        reason: String,
    },
    /// Server could not be reached or answered with an error
    Unavailable {
        /// Failure description
        reason: String,
    },
}

/// A constructed client together with its first probe
#[derive(Debug, Clone)]
pub struct BuiltClient {
    /// Ready-to-use client
    pub client: Arc<ClusterClient>,
    /// Outcome of the initial probe
    pub probe: ProbeOutcome,
}

/// Builds and probes cluster clients
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a client from the given credentials and probe it
    ///
    /// Fails with `ConfigInvalid` for unusable kubeconfigs, `Unreachable`
    /// when no client can be constructed and `AuthFailed` when the server
    /// rejects the credentials. Other probe failures still yield a client.
    async fn build(&self, source: &KubeconfigSource) -> Result<BuiltClient, Error>;

    /// Ask the server for its version
    async fn probe(&self, client: &ClusterClient) -> ProbeOutcome;
}

/// Transport and retry knobs for [`KubeClientFactory`]
#[derive(Debug, Clone)]
pub struct FactorySettings {
    /// Sustained requests per second per cluster
    pub qps: u32,
    /// Maximum burst per cluster
    pub burst: u32,
    /// Retry without TLS verification when verification fails
    pub insecure_fallback: bool,
    /// Version probe timeout
    pub probe_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Response read timeout
    pub read_timeout: Duration,
}

impl From<&KubernetesConfig> for FactorySettings {
    fn from(config: &KubernetesConfig) -> Self {
        Self {
            qps: config.qps,
            burst: config.burst,
            insecure_fallback: config.insecure_fallback,
            probe_timeout: config.probe_timeout(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
        }
    }
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self::from(&KubernetesConfig::default())
    }
}

impl FactorySettings {
    /// Token bucket parameters: `burst` requests per `burst / qps` seconds
    fn rate_limit(&self) -> (u64, Duration) {
        let qps = self.qps.max(1);
        let burst = self.burst.max(1);
        (
            u64::from(burst),
            Duration::from_secs_f64(f64::from(burst) / f64::from(qps)),
        )
    }

    fn apply(&self, config: &mut Config) {
        config.connect_timeout = Some(self.connect_timeout);
        config.read_timeout = Some(self.read_timeout);
    }
}

/// Same endpoint and credentials with TLS verification disabled
fn insecure_variant(config: &Config) -> Config {
    let mut insecure = config.clone();
    insecure.accept_invalid_certs = true;
    insecure.root_cert = None;
    insecure
}

fn is_certificate_error(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("certificate") || reason.contains("unknownissuer")
}

fn classify_probe_error(err: kube::Error) -> ProbeOutcome {
    match err {
        kube::Error::Api(resp) if resp.code == 401 => ProbeOutcome::AuthFailed {
            reason: resp.message,
        },
        kube::Error::Auth(e) => ProbeOutcome::AuthFailed {
            reason: e.to_string(),
        },
        other => ProbeOutcome::Unavailable {
            reason: other.to_string(),
        },
    }
}

async fn load_config(source: &KubeconfigSource) -> Result<Config, Error> {
    let kubeconfig = match source {
        KubeconfigSource::InCluster => {
            return Config::incluster().map_err(|e| {
                Error::ConfigInvalid(format!("in-cluster configuration unavailable: {}", e))
            });
        }
        KubeconfigSource::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| Error::ConfigInvalid("kubeconfig is not valid UTF-8".into()))?;
            if text.trim().is_empty() {
                return Err(Error::ConfigInvalid("kubeconfig is empty".into()));
            }
            Kubeconfig::from_yaml(text)
        }
        KubeconfigSource::Path(path) => Kubeconfig::read_from(path),
        KubeconfigSource::DefaultPath => Kubeconfig::read(),
    }
    .map_err(|e| Error::ConfigInvalid(format!("failed to parse kubeconfig: {}", e)))?;

    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::ConfigInvalid(format!("failed to load kubeconfig: {}", e)))
}

/// Client construction and probing under the fallback policy
#[async_trait]
trait Connector: Send + Sync {
    fn connect(&self, config: Config, insecure: bool) -> Result<ClusterClient, kube::Error>;

    async fn probe(&self, client: &ClusterClient) -> ProbeOutcome;
}

/// Build a client for `config` and probe it
///
/// With `insecure_fallback`, a construction failure or a certificate error
/// on the first probe is retried once against [`insecure_variant`].
async fn establish<C: Connector + ?Sized>(
    connector: &C,
    config: Config,
    insecure_fallback: bool,
) -> Result<(ClusterClient, ProbeOutcome), Error> {
    let unreachable = |e: kube::Error| Error::Unreachable(format!("failed to construct client: {}", e));

    let mut client = match connector.connect(config.clone(), false) {
        Ok(client) => client,
        Err(e) if insecure_fallback => {
            warn!(
                server = %config.cluster_url,
                error = %e,
                "client construction failed, retrying without TLS verification"
            );
            connector.connect(insecure_variant(&config), true).map_err(unreachable)?
        }
        Err(e) => return Err(unreachable(e)),
    };
    let mut probe = connector.probe(&client).await;

    if let ProbeOutcome::Unavailable { reason } = &probe {
        if insecure_fallback && !client.is_insecure() && is_certificate_error(reason) {
            warn!(
                server = %client.server_url(),
                reason = %reason,
                "TLS verification failed, retrying without verification"
            );
            let insecure = connector
                .connect(insecure_variant(client.config()), true)
                .map_err(unreachable)?;
            probe = connector.probe(&insecure).await;
            client = insecure;
        }
    }
    Ok((client, probe))
}

/// Production factory backed by kube-rs
#[derive(Debug, Clone, Default)]
pub struct KubeClientFactory {
    settings: FactorySettings,
}

impl KubeClientFactory {
    /// Factory with the given settings
    pub fn new(settings: FactorySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for KubeClientFactory {
    fn connect(&self, config: Config, insecure: bool) -> Result<ClusterClient, kube::Error> {
        let (num, per) = self.settings.rate_limit();
        let client = ClientBuilder::try_from(config.clone())?
            .with_layer(&RateLimitLayer::new(num, per))
            .build();
        Ok(ClusterClient::new(client, config, insecure))
    }

    async fn probe(&self, client: &ClusterClient) -> ProbeOutcome {
        ClientFactory::probe(self, client).await
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn build(&self, source: &KubeconfigSource) -> Result<BuiltClient, Error> {
        let mut config = load_config(source).await?;
        self.settings.apply(&mut config);

        let (client, probe) = establish(self, config, self.settings.insecure_fallback).await?;

        match &probe {
            ProbeOutcome::AuthFailed { reason } => return Err(Error::AuthFailed(reason.clone())),
            ProbeOutcome::Available { version } => {
                debug!(server = %client.server_url(), version = %version, "cluster reachable");
                if let Err(e) = client.refresh_discovery().await {
                    warn!(server = %client.server_url(), error = %e, "API discovery failed");
                }
            }
            ProbeOutcome::Unavailable { reason } => {
                warn!(server = %client.server_url(), reason = %reason, "cluster probe failed");
            }
        }

        Ok(BuiltClient {
            client: Arc::new(client),
            probe,
        })
    }

    async fn probe(&self, client: &ClusterClient) -> ProbeOutcome {
        let timeout = self.settings.probe_timeout;
        match tokio::time::timeout(timeout, client.client().apiserver_version()).await {
            Ok(Ok(info)) => ProbeOutcome::Available {
                version: info.git_version,
            },
            Ok(Err(e)) => classify_probe_error(e),
            Err(_) => ProbeOutcome::Unavailable {
                reason: format!("probe timed out after {}s", timeout.as_secs()),
            },
        }
    }
}
