use brandwork::config::RuntimeConfig;
use brandwork::Runtime;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Brandwork engine");

    let config = RuntimeConfig::default();
    let runtime = match Runtime::start(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Engine failed to start");
            std::process::exit(1);
        }
    };

    tracing::info!(
        file_port = runtime.config().file_permission_port,
        question_port = runtime.config().question_port,
        commerce_port = runtime.config().commerce_permission_port,
        "Engine ready"
    );

    // Wait for shutdown signal
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl+c");
    }

    tracing::info!("Shutting down");
    runtime.shutdown().await;
}
