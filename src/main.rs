use stylequeue::{
    app_state::AppState, backends::Backends, config::AppConfig, router,
    services::gateway::Gateway, shutdown, telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing stylequeue gateway");

    let prometheus_handle =
        telemetry::install_metrics().expect("Failed to install Prometheus metrics recorder");

    let backends = Backends::connect(&config, true)
        .await
        .expect("Failed to connect backends");

    let gateway = Gateway::new(
        backends.registry,
        backends.queue,
        backends.store,
        config.gateway_settings(),
    );
    let state = AppState::new(gateway).with_metrics(prometheus_handle);
    let app = router(state, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::signal())
        .await
        .expect("Server error");
}
