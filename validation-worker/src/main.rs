use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use common_redis::RedisClient;
use envconfig::Envconfig;
use futures::future::ready;
use health::{HealthHandle, HealthRegistry};
use pipeline_core::{Consumer, Publisher, StreamWorker};
use serve_metrics::{serve, setup_metrics_routes};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use validation_worker::config::Config;
use validation_worker::stage::ValidationHandler;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn index() -> &'static str {
    "validation worker"
}

fn start_health_liveness_server(config: &Config, liveness: HealthRegistry) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = format!("{}:{}", config.host, config.port);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let sigterm = async {
            #[cfg(unix)]
            {
                let mut stream =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                stream.recv().await;
            }
            #[cfg(not(unix))]
            futures::future::pending::<()>().await;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
            _ = sigterm => info!("received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
}

fn worker_liveness_hook(handle: HealthHandle) -> Box<dyn Fn() + Send + Sync> {
    Box::new(move || handle.report_healthy())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let config = Config::init_from_env()?;
    let channels = config.channels()?;

    // An unreachable backend at startup is unrecoverable: exit non-zero.
    let client = Arc::new(RedisClient::new(config.redis_url.clone()).await?);

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker".to_string(), Duration::from_secs(60));
    start_health_liveness_server(&config, liveness);

    let publisher = Publisher::new(client.clone(), config.publisher_config());
    let handler = Arc::new(ValidationHandler::new(publisher));
    let consumer = Consumer::new(client, &config.consumer_group, &config.consumer_name);

    let mut worker = StreamWorker::new(consumer, config.worker_config());
    for channel in &channels {
        worker.register(channel.as_str(), handler.clone());
        worker.register(&channel.retry(), handler.clone());
    }
    worker.ensure_groups("0").await?;
    worker.set_pass_hook(worker_liveness_hook(worker_liveness));

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    info!(channels = ?channels, group = config.consumer_group, "validation worker starting");
    worker.run(shutdown).await;
    info!("validation worker stopped cleanly");
    Ok(())
}
