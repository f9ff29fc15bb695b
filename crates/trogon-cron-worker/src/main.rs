use trogon_cron_worker::env::SystemEnv;
use trogon_cron_worker::signal::shutdown_signal;
use trogon_cron_worker::{
    NatsKvFeed, NatsProcessRegistry, NixKiller, Worker, WorkerConfig, WorkerError, WorkerSettings,
    connect, health, kv,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), WorkerError> {
    let config = WorkerConfig::from_env(&SystemEnv)?;
    tracing::info!(
        host_name = %config.host_name,
        node_id = %config.node_id,
        bucket = %config.bucket,
        "Starting CRON worker"
    );

    let nats = connect::connect(&config.nats).await?;
    let js = async_nats::jetstream::new(nats);
    let store = kv::get_or_create_bucket(&js, &config.bucket).await?;

    let handle = Worker::new(
        WorkerSettings::from(&config),
        NatsKvFeed::new(store.clone()),
        NixKiller,
        NatsProcessRegistry::new(store),
    )
    .run();

    let health = tokio::spawn(health::serve(
        handle.health_state(),
        config.health_port,
        handle.shutdown_token(),
    ));

    shutdown_signal().await;
    handle.shutdown().await;

    match health.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "Health server failed"),
        Err(e) => tracing::warn!(error = %e, "Health server task failed"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
