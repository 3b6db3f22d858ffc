use dozegate::admin::AdminServer;
use dozegate::config::{spawn_config_watcher, ConfigSnapshot};
use dozegate::docker::DockerDriver;
use dozegate::driver::{DriverSet, WorkloadControl};
use dozegate::engine::Engine;
use dozegate::page::HoldingPage;
use dozegate::pool::{PoolConfig, UpstreamPool};
use dozegate::proxy::ProxyServer;
use dozegate::reaper::IdleReaper;
use dozegate::scheduler::Scheduler;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default proxy port when `PORT` is unset.
const DEFAULT_PORT: u16 = 10000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dozegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    let snapshot = ConfigSnapshot::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(
        path = %config_path.display(),
        backends = snapshot.backends().len(),
        groups = snapshot.groups().len(),
        "Configuration loaded"
    );

    let port = read_port("PORT", DEFAULT_PORT)?;
    let ui_port = std::env::var("UI_PORT")
        .ok()
        .map(|raw| raw.parse::<u16>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid UI_PORT: {}", e))?;
    let docker_proxy_url = std::env::var("DOCKER_PROXY_URL").ok();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        port,
        ui_port,
        "Starting proxy server"
    );

    // Container runtime: remote daemon preferred, local socket otherwise.
    let docker = match DockerDriver::connect(docker_proxy_url.as_deref()) {
        Ok(driver) => Some(Arc::new(driver)),
        Err(e) => {
            warn!(error = %e, "Container runtime unavailable, runtime-managed backends stay down");
            None
        }
    };

    let driver_set = Arc::new(DriverSet::new(docker));
    driver_set.reconfigure_pve(snapshot.pve.as_ref());
    let control: Arc<dyn WorkloadControl> = driver_set.clone();

    let engine = Engine::new(snapshot, control);
    let pool = Arc::new(UpstreamPool::new(PoolConfig::default()));

    let page = match std::env::var("HOLDING_PAGE") {
        Ok(path) => HoldingPage::from_file(&path).map_err(|e| {
            error!(path = %path, error = %e, "Failed to load holding page template");
            e
        })?,
        Err(_) => HoldingPage::built_in(),
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Configuration watcher: swap snapshots and refresh PVE credentials.
    {
        let engine = Arc::clone(&engine);
        let driver_set = Arc::clone(&driver_set);
        spawn_config_watcher(config_path.clone(), shutdown_rx.clone(), move |snapshot| {
            driver_set.reconfigure_pve(snapshot.pve.as_ref());
            engine.install_snapshot(snapshot);
        })?;
    }

    // Idle reaper
    let reaper = IdleReaper::new(Arc::clone(&engine), shutdown_rx.clone());
    tokio::spawn(async move {
        reaper.run().await;
    });

    // Schedule engine
    let scheduler = Scheduler::new(Arc::clone(&engine), shutdown_rx.clone());
    tokio::spawn(async move {
        scheduler.run().await;
    });

    // Proxy server
    let proxy_addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid proxy bind address: {}", e))?;
    let proxy = ProxyServer::new(
        proxy_addr,
        Arc::clone(&engine),
        Arc::clone(&pool),
        page,
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Admin server, only when UI_PORT is set
    let admin_handle = if let Some(ui_port) = ui_port {
        let admin_addr: SocketAddr = format!("0.0.0.0:{}", ui_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid admin bind address: {}", e))?;
        let admin = AdminServer::new(
            admin_addr,
            Arc::clone(&engine),
            Arc::clone(&pool),
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; workloads are left in their current state.
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn read_port(var: &str, default: u16) -> anyhow::Result<u16> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", var, e)),
        Err(_) => Ok(default),
    }
}
