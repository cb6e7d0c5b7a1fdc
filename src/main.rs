use std::{error::Error, sync::Arc, time::Duration};

use cube_worker::{Context, DockerCri, TaskServer, Worker, WorkerConfig, run_tasks};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env()?;

    // An unreachable engine is the one failure worth refusing to start over.
    let docker = DockerCri::connect(config.docker.clone())?;
    docker
        .ping(&Context::background().with_timeout(Duration::from_secs(5)))
        .await?;

    let worker = Arc::new(Worker::from_config(&config, Arc::new(docker)));
    let (ctx, shutdown) = Context::with_cancel();

    let dispatch = tokio::spawn(run_tasks(
        worker.clone(),
        ctx.clone(),
        config.poll_interval,
    ));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown requested");
        shutdown.cancel();
    });

    let server = TaskServer::new(worker, &config.address, config.port);
    server.start_server(ctx).await?;

    dispatch.await?;
    Ok(())
}
