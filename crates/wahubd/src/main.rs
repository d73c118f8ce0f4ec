//! wahubd - the session hosting daemon.
//!
//! Boots telemetry, loads configuration from the environment, resolves the
//! critical secrets, wires the components together, recovers persisted
//! sessions, and runs until SIGINT/SIGTERM, at which point it performs a
//! preserving shutdown (or a logout shutdown with `--logout-on-shutdown`).

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wahub_config::{LoadBalanceStrategy, ProxyType, ServiceConfig, StorageMode};
use wahub_coordinator::{CoordinatorConfig, InstanceCoordinator, PlacementStrategy};
use wahub_events::EventBus;
use wahub_pool::{ConnectionPool, PoolConfig, ShutdownMode};
use wahub_pool::reconcile::{ReconcileConfig, Reconciler};
use wahub_protocol::{NullConnector, ProtocolConnector};
use wahub_proxy::{
    AllocatorConfig, CountryOracle, HttpProxyVendor, LlmOracle, LlmOracleConfig, ProxyAllocator,
    RegionTableOracle, VendorConfig,
};
use wahub_secrets::{EnvSecretProvider, SecretStore, names};
use wahub_session_store::{SessionStore, SessionStoreConfig, StoreMode};
use wahub_state::{StateManager, StateManagerConfig};
use wahub_storage::{DocumentStore, FsObjectStore, MemoryDocumentStore, ObjectStore};
use wahub_telemetry::{LogConfig, LogFormat, setup_logging};

/// Vendor API endpoint for zone IP management.
const VENDOR_API_BASE: &str = "https://api.brightdata.com";

#[derive(Debug, Parser)]
#[command(name = "wahubd", about = "WhatsApp Web session hosting service")]
struct Args {
    /// Base log level.
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Log output format.
    #[arg(long, default_value = "json", value_parser = ["pretty", "compact", "json"])]
    log_format: String,

    /// Log out every session on shutdown instead of preserving them.
    #[arg(long)]
    logout_on_shutdown: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let format = match args.log_format.as_str() {
        "pretty" => LogFormat::Pretty,
        "compact" => LogFormat::Compact,
        _ => LogFormat::Json,
    };
    setup_logging(&LogConfig::new(&args.log_level).with_format(format))
        .context("failed to install logging")?;

    let config = ServiceConfig::from_env().context("configuration invalid")?;
    info!(instance_url = %config.instance_url, "wahubd starting");

    let secrets = Arc::new(SecretStore::new(Arc::new(EnvSecretProvider)));
    let mut required = vec![names::SESSION_ENCRYPTION_KEY];
    if config.use_proxy {
        required.push(names::PROXY_PASSWORD);
    }
    secrets
        .require_valid(&required)
        .await
        .context("critical secrets missing or placeholders")?;

    // The projection store is an external collaborator; deployments plug a
    // real backend in behind the DocumentStore trait. The in-memory store
    // keeps a single-instance deployment functional.
    let docs: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());

    let objects: Option<Arc<dyn ObjectStore>> = match &config.storage_bucket {
        Some(bucket) => Some(Arc::new(FsObjectStore::new(bucket))),
        None => None,
    };
    let blobs = Arc::new(SessionStore::new(
        SessionStoreConfig {
            mode: match config.session_storage_type {
                StorageMode::Local => StoreMode::Local,
                StorageMode::Cloud => StoreMode::Cloud,
                StorageMode::Hybrid => StoreMode::Hybrid,
            },
            root: config.session_storage_path.clone(),
            backup_interval: config.session_backup_interval,
        },
        objects,
        Arc::clone(&secrets),
    )?);

    let allocator = if config.use_proxy {
        let vendor_config = config
            .proxy
            .as_ref()
            .context("USE_PROXY set without vendor settings")?;
        let token = secrets.get(names::PROXY_PASSWORD).await?;
        let vendor = Arc::new(HttpProxyVendor::new(VendorConfig {
            api_base: VENDOR_API_BASE.to_string(),
            customer: vendor_config.customer.clone(),
            zone: vendor_config.zone.clone(),
            token,
        })?);
        let oracle: Arc<dyn CountryOracle> = match secrets.get(names::ANTHROPIC_API_KEY).await {
            Ok(api_key) => Arc::new(LlmOracle::new(LlmOracleConfig::new(api_key))?),
            Err(e) => {
                info!(reason = %e, "LLM oracle unavailable, using the region table");
                Arc::new(RegionTableOracle::new())
            }
        };
        Some(Arc::new(ProxyAllocator::new(
            vendor,
            oracle,
            AllocatorConfig {
                gateway_port: vendor_config.port,
                strict: vendor_config.proxy_type == ProxyType::Isp,
                ..AllocatorConfig::default()
            },
        )))
    } else {
        None
    };

    let coordinator = Arc::new(InstanceCoordinator::new(
        Arc::clone(&docs),
        CoordinatorConfig {
            instance_id: String::new(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            instance_url: config.instance_url.clone(),
            heartbeat_interval: config.instance_heartbeat_interval,
            instance_timeout: config.instance_timeout,
            cleanup_interval: config.session_cleanup_interval,
            max_connections: config.max_connections_per_instance,
            strategy: match config.load_balance_strategy {
                LoadBalanceStrategy::LeastConnections => PlacementStrategy::LeastConnections,
                LoadBalanceStrategy::ResourceBased => PlacementStrategy::ResourceBased,
                LoadBalanceStrategy::RoundRobin => PlacementStrategy::RoundRobin,
            },
        },
    ));
    coordinator.start().await.context("instance registration failed")?;

    let bus = EventBus::new();
    let state = Arc::new(StateManager::new(
        Arc::clone(&docs),
        bus.clone(),
        StateManagerConfig {
            instance_url: config.instance_url.clone(),
            ..StateManagerConfig::default()
        },
    ));

    // The concrete protocol driver is linked by the deployment build; the
    // null connector keeps everything else (registry, reconciliation,
    // projections) operational without one.
    let connector: Arc<dyn ProtocolConnector> = Arc::new(NullConnector);

    let pool = Arc::new(ConnectionPool::new(
        connector,
        allocator,
        Arc::clone(&blobs),
        Arc::clone(&coordinator),
        Arc::clone(&state),
        bus.clone(),
        PoolConfig {
            max_connections: config.max_connections,
            auto_reconnect: config.auto_reconnect,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
            default_country: config
                .priority_countries
                .first()
                .cloned()
                .unwrap_or_else(|| PoolConfig::default().default_country),
            use_proxy: config.use_proxy,
            timings: wahub_pool::PoolTimings {
                attach_deadline: config.session_timeout,
                ..wahub_pool::PoolTimings::default()
            },
            ..PoolConfig::default()
        },
    ));

    let shutdown = CancellationToken::new();
    let mut loops = tokio::task::JoinSet::new();
    loops.spawn(Arc::clone(&coordinator).heartbeat_loop(shutdown.clone()));
    loops.spawn(Arc::clone(&coordinator).cleanup_loop(shutdown.clone()));
    loops.spawn(Arc::clone(&blobs).backup_loop(shutdown.clone()));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&pool),
        ReconcileConfig {
            interval: config.health_check_interval,
            ..ReconcileConfig::default()
        },
    ));
    loops.spawn(Arc::clone(&reconciler).run(shutdown.clone()));

    match pool.recover_on_startup().await {
        Ok(recovered) => info!(recovered, "Recovery scan finished"),
        Err(e) => warn!(error = %e, "Recovery scan failed"),
    }

    wait_for_signal().await;
    info!("Shutdown signal received");

    let mode = if args.logout_on_shutdown {
        ShutdownMode::Logout
    } else {
        ShutdownMode::Preserving
    };
    pool.shutdown(mode).await;
    shutdown.cancel();
    while loops.join_next().await.is_some() {}
    info!("wahubd stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
