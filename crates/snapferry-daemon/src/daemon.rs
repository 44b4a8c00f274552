//! Process wiring for `snapferry serve`.

use anyhow::Context;
use snapferry_scheduler::Runner;
use snapferry_storage::{MemoryDriver, StorageDriver};
use snapferry_transport::TransportState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DaemonConfig;

/// In-memory driver holding both parent datasets and the configured filesystems.
pub fn build_driver(config: &DaemonConfig) -> anyhow::Result<Arc<MemoryDriver>> {
    let driver = MemoryDriver::new();
    let roots = [
        config.http.parent_dataset.as_str(),
        config.runner.parent_dataset.as_str(),
    ];
    for name in roots
        .into_iter()
        .chain(config.filesystems.iter().map(String::as_str))
        .filter(|name| !name.is_empty())
    {
        driver
            .create_filesystem(name)
            .with_context(|| format!("creating {}", name))?;
    }
    Ok(Arc::new(driver))
}

/// Binds the configured address and runs until `shutdown` fires.
pub async fn serve(config: DaemonConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.http.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.http.bind_addr))?;
    run(config, listener, shutdown).await
}

/// Runs the replication server and the lifecycle runner on `listener`.
///
/// On shutdown the runner loops stop first, then the server drains its open
/// connections.
pub async fn run(
    config: DaemonConfig,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let memory = build_driver(&config)?;
    let driver: Arc<dyn StorageDriver> = memory;
    info!(
        parent = %config.http.parent_dataset,
        filesystems = config.filesystems.len(),
        "storage ready"
    );

    let state = Arc::new(TransportState::new(driver.clone(), config.http.clone()));
    let server_shutdown = shutdown.child_token();
    let server = tokio::spawn(snapferry_transport::serve(
        listener,
        state,
        server_shutdown.clone(),
    ));

    let mut runner = Runner::new(driver, config.runner.clone(), shutdown.child_token());
    runner.start();

    shutdown.cancelled().await;
    info!("shutting down");
    runner.shutdown().await;
    server_shutdown.cancel();
    match server.await {
        Ok(result) => result.context("replication server failed")?,
        Err(e) => error!(error = %e, "replication server task panicked"),
    }
    info!("snapferry stopped");
    Ok(())
}
