//! cilikube - multi-cluster Kubernetes management backend

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cilikube_api::{start_server, AppState, ServerConfig};
use cilikube_cluster::{
    ClusterRegistry, ClusterStore, FactorySettings, KubeClientFactory, MemoryClusterStore,
    RegistrySettings, SqlClusterStore,
};
use cilikube_common::config::{
    Config, DatabaseConfig, DatabaseKind, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH,
};
use cilikube_common::telemetry::{init_telemetry, TelemetryConfig};

/// cilikube - manage many Kubernetes clusters through one API
#[derive(Parser, Debug)]
#[command(name = "cilikube", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override `server.port`
    #[arg(long)]
    port: Option<u16>,
}

/// Missing file means defaults; anything else must parse
fn load_config(path: &Path) -> anyhow::Result<(Config, bool)> {
    if !path.exists() {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        return Ok((config, false));
    }
    Ok((Config::load(path)?, true))
}

async fn open_store(database: &DatabaseConfig) -> anyhow::Result<Arc<dyn ClusterStore>> {
    if !database.enabled {
        warn!("database disabled; registered clusters are kept in memory only");
        return Ok(Arc::new(MemoryClusterStore::new()));
    }
    if database.kind == DatabaseKind::Sqlite {
        if let Some(dir) = Path::new(&database.path).parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
    }
    let store = SqlClusterStore::connect(&database.url(), database.max_connections)
        .await
        .context("failed to open cluster store")?;
    info!(kind = ?database.kind, "cluster store ready");
    Ok(Arc::new(store))
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (mut config, from_file) = load_config(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_telemetry(TelemetryConfig {
        mode: config.server.mode,
        ..TelemetryConfig::default()
    })?;
    if from_file {
        info!(path = %cli.config.display(), "configuration loaded");
    } else {
        warn!(path = %cli.config.display(), "configuration file not found, using defaults");
    }

    let store = open_store(&config.database).await?;
    let factory = Arc::new(KubeClientFactory::new(FactorySettings::from(
        &config.kubernetes,
    )));
    let registry = ClusterRegistry::new(
        store,
        factory,
        RegistrySettings::from(&config.kubernetes),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let preferred = config.server.active_cluster_id.trim();
    let refresh = registry
        .initialize(
            &config.clusters,
            (!preferred.is_empty()).then_some(preferred),
            shutdown.clone(),
        )
        .await
        .context("failed to load clusters")?;

    let server = ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], config.server.port)),
    };
    start_server(server, AppState { registry }, shutdown.clone()).await?;

    shutdown.cancel();
    let _ = refresh.await;
    info!("cilikube stopped");
    Ok(())
}
