use std::sync::Arc;

use anyhow::{Error, Result};
use clap::Parser;
use event_queue::{
    api::{AppState, bind_listener, run_api_server},
    clients::{queue::QueueClient, rbmq::RabbitMqClient},
    config::{Cli, Config},
    utils::{init_tracing, shutdown_signal},
    worker::{
        handler::HandlerRegistry,
        pool::{PoolConfig, WorkerPool},
    },
};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    init_tracing(config.log_format);

    info!(
        queue = %config.queue_name,
        workers = config.worker_count,
        max_retries = config.max_retries,
        "Starting queue worker service"
    );

    let rabbitmq = RabbitMqClient::connect(&config).await?;
    let client = QueueClient::new(Arc::new(rabbitmq));
    let handlers = Arc::new(HandlerRegistry::with_defaults());

    let listener = bind_listener(config.server_port).await?;

    let pool = WorkerPool::start(client.clone(), handlers, PoolConfig::from(&config)).await?;

    let (server_shutdown, server_shutdown_rx) = watch::channel(false);
    let mut api = tokio::spawn(run_api_server(
        AppState::new(client.clone(), config.queue_names()),
        listener,
        server_shutdown_rx,
    ));

    info!("Queue worker service started. Press Ctrl+C to stop.");

    let api_finished = tokio::select! {
        _ = shutdown_signal() => false,
        result = &mut api => {
            log_api_exit(result);
            true
        }
    };
    info!("Shutting down queue worker service...");

    let report = pool.stop().await;
    if report.abandoned > 0 {
        warn!(abandoned = report.abandoned, "Some in-flight messages were left for redelivery");
    }

    let _ = server_shutdown.send(true);
    if !api_finished {
        log_api_exit(api.await);
    }

    if let Err(e) = client.close().await {
        warn!(error = %e, "Failed to close broker connection cleanly");
    }

    info!("Queue worker service stopped.");

    Ok(())
}

fn log_api_exit(result: Result<Result<(), Error>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task panicked"),
    }
}
