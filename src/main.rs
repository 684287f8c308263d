use s3_stream_gateway::{
    config::Config,
    http_gateway::{GatewayState, HttpGateway},
    janitor::Janitor,
    logging::{self, LoggerManager},
    record_store::CatalogRecordStore,
    s3_client::S3Connector,
    shutdown::ShutdownCoordinator,
    GatewayError, Result,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let logger = Arc::new(LoggerManager::new(
        config.logging.clone(),
        logging::hostname(),
    ));
    logger.initialize()?;

    info!(
        "Starting S3 stream gateway v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!(
        "Streaming: idle_timeout={:?}, max_stream_age={:?}",
        config.streaming.idle_timeout, config.streaming.max_stream_age
    );
    info!(
        "Admission: max_concurrent={}, burst_threshold={}, burst_window={:?}",
        config.admission.max_concurrent,
        config.admission.burst_threshold,
        config.admission.burst_window
    );

    let records = Arc::new(CatalogRecordStore::from_config(&config.catalog));
    info!(
        "Catalog: {} storages, {} files",
        config.catalog.storages.len(),
        config.catalog.files.len()
    );

    let mut shutdown_coordinator =
        ShutdownCoordinator::new(config.server.shutdown_timeout, config.server.drain_timeout);

    let state = Arc::new(GatewayState::from_config(
        &config,
        records,
        Arc::new(S3Connector),
        shutdown_coordinator.token(),
        Some(Arc::clone(&logger)),
    ));

    shutdown_coordinator.set_stream_registry(Arc::clone(state.registry()));
    shutdown_coordinator.set_client_cache(Arc::clone(&state.clients));

    let janitor = Janitor::new(
        Arc::clone(state.registry()),
        Arc::clone(&state.metadata),
        state.admission.clone(),
        config.janitor.interval,
        config.streaming.max_stream_age,
    );
    let janitor_task = janitor.spawn(shutdown_coordinator.subscribe());

    let ip: IpAddr = config.server.bind_address.parse().map_err(|e| {
        GatewayError::ConfigError(format!(
            "Invalid bind_address '{}': {}",
            config.server.bind_address, e
        ))
    })?;
    let http_addr = SocketAddr::new(ip, config.server.http_port);
    let gateway = HttpGateway::new(http_addr, state, config.server.drain_timeout);

    let http_shutdown = shutdown_coordinator.subscribe();
    let http_task = tokio::spawn(async move {
        if let Err(e) = gateway.start(http_shutdown).await {
            error!("HTTP gateway failed: {}", e);
        }
    });

    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    shutdown_task.await.ok();
    info!("Shutdown coordinator completed, waiting for server tasks");

    http_task.await.ok();
    janitor_task.await.ok();

    info!("S3 stream gateway shutdown complete");
    Ok(())
}
