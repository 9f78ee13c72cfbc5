use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use axum_server::Handle;
use data_model::Target;
use discovery::{AllocatorConfig, DiscoveryManager};
use sharder::{InvariantViolation, TargetSharder};
use tokio::{
    signal,
    sync::watch,
    task::JoinHandle,
};
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    metrics::{self, AllocatorMetrics, Timer},
    routes::{create_routes, RouteState},
};

pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub sharder: Arc<TargetSharder>,
    pub discovery: Arc<DiscoveryManager>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let discovery = Arc::new(
            DiscoveryManager::new().with_file_sd_poll_interval(Duration::from_secs(
                config.file_sd_poll_interval_secs,
            )),
        );
        Self {
            config,
            shutdown_tx,
            shutdown_rx,
            sharder: Arc::new(TargetSharder::new()),
            discovery,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let registry = Arc::new(metrics::init_provider()?);

        let mut resharder = self.bootstrap().await?;

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let discovery = self.discovery.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            discovery.close().await;
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(RouteState {
            sharder: self.sharder.clone(),
            registry,
        });
        let mut server = std::pin::pin!(axum_server::bind(addr)
            .handle(handle.clone())
            .serve(routes.into_make_service()));

        tokio::select! {
            result = &mut server => {
                result?;
            }
            result = &mut resharder => {
                match result {
                    // a clean resharder exit follows the shutdown signal;
                    // let the server finish draining in-flight requests
                    Ok(Ok(())) => {
                        server.await?;
                    }
                    Ok(Err(err)) => {
                        handle.shutdown();
                        return Err(err.context("assignment resharder failed"));
                    }
                    Err(err) => {
                        handle.shutdown();
                        return Err(anyhow!("resharder task failed: {}", err));
                    }
                }
            }
        }

        Ok(())
    }

    /// Installs the roster, starts discovery from the allocation config and
    /// spawns the resharder loop that applies consolidated snapshots. The
    /// returned handle finishes early only when the resharder hits a fatal
    /// error, which the caller surfaces for the process to exit on.
    async fn bootstrap(&self) -> Result<JoinHandle<Result<()>>> {
        self.sharder
            .set_collectors(self.config.collectors.clone())
            .await
            .context("installing collector roster")?;

        let allocation_config = AllocatorConfig::from_path(&self.config.allocation_config_path)
            .with_context(|| {
                format!(
                    "loading allocation config from {}",
                    self.config.allocation_config_path
                )
            })?;
        self.discovery
            .apply_config(&allocation_config)
            .await
            .context("applying scrape configuration")?;

        let snapshot_rx = self.discovery.watch();
        let sharder = self.sharder.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        Ok(tokio::spawn(run_resharder(sharder, snapshot_rx, shutdown_rx)))
    }
}

/// Applies every consolidated snapshot to the sharder. The snapshot channel
/// is a one-slot mailbox, so a burst of discovery updates collapses into one
/// reshard over the latest state.
///
/// A reshard failure that left the assignment consistent is logged and the
/// loop keeps serving the previous state; an invariant violation is a bug
/// and is returned so the process exits instead of serving a wrong view.
async fn run_resharder(
    sharder: Arc<TargetSharder>,
    mut snapshot_rx: watch::Receiver<Vec<Target>>,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<()> {
    let metrics = AllocatorMetrics::new();
    loop {
        tokio::select! {
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let targets = snapshot_rx.borrow_and_update().clone();
                let _timer = Timer::start(&metrics.reshard_latency);
                sharder.set_targets(targets).await;
                match sharder.reshard().await {
                    Ok(()) => {
                        metrics.snapshots_applied.add(1, &[]);
                    }
                    Err(err) if err.is::<InvariantViolation>() => {
                        error!("assignment state violated an invariant: {:?}", err);
                        return Err(err);
                    }
                    Err(err) => {
                        error!("failed to reshard staged targets: {:?}", err);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("resharder shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
