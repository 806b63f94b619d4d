use std::sync::Arc;

use stylequeue::{
    backends::{self, Backends},
    config::AppConfig,
    controller::{Janitor, PoolController},
    shutdown, telemetry,
    worker::{pool::LocalPool, WorkerContext},
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting stylequeue pool controller");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let prometheus_handle =
        telemetry::install_metrics().expect("Failed to install Prometheus metrics recorder");

    let backends = Backends::connect(&config, true)
        .await
        .expect("Failed to connect backends");

    let mut worker_settings = config.worker_settings();
    // The controller decides when replicas go away.
    worker_settings.idle_exit = None;

    let pool = Arc::new(LocalPool::new(WorkerContext {
        registry: backends.registry.clone(),
        queue: backends.queue.clone(),
        store: backends.store.clone(),
        processors: backends::processors(&config),
        settings: worker_settings,
    }));

    let scaler_settings = config.scaler_settings();
    let janitor = Janitor::new(
        backends.registry.clone(),
        backends.store.clone(),
        scaler_settings.retention,
    );
    let controller = PoolController::new(backends.queue.clone(), pool.clone(), scaler_settings)
        .with_janitor(janitor);

    // Serve the pool's metrics alongside the control loop.
    let metrics_addr = config.controller_metrics_addr.clone();
    tokio::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = prometheus_handle.clone();
                async move { handle.render() }
            }),
        );
        match tokio::net::TcpListener::bind(&metrics_addr).await {
            Ok(listener) => {
                tracing::info!("Controller metrics listening on {}", metrics_addr);
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "Metrics server error");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to bind metrics address"),
        }
    });

    let stop = shutdown::token();
    controller.run(stop).await;

    tracing::info!("Draining worker replicas");
    pool.shutdown().await;
    tracing::info!("Controller exited");
}
