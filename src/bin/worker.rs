use stylequeue::{
    backends::{self, Backends},
    config::AppConfig,
    shutdown, telemetry,
    worker::{worker_id, WorkerContext, WorkerRuntime},
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting stylequeue worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let backends = Backends::connect(&config, false)
        .await
        .expect("Failed to connect backends");

    let ctx = WorkerContext {
        registry: backends.registry,
        queue: backends.queue,
        store: backends.store,
        processors: backends::processors(&config),
        settings: config.worker_settings(),
    };

    let drain = shutdown::token();
    let runtime = WorkerRuntime::new(worker_id("worker"), ctx, drain);
    let exit = runtime.run().await;

    tracing::info!(?exit, "Worker exited");
}
