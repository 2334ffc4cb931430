use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use health::HealthRegistry;
use pipeline_core::{PeriodicTimer, PgStore, WeightedScoring};
use serve_metrics::{serve, setup_metrics_routes};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use batch_aggregator::config::Config;
use batch_aggregator::runner::BatchRunner;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn index() -> &'static str {
    "batch aggregator"
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let config = Config::init_from_env()?;
    let windows = config.windows()?;

    let store = Arc::new(PgStore::connect(&config.database_url, config.max_pg_connections).await?);

    let liveness = HealthRegistry::new("liveness");
    // The deadline spans two run intervals so a single slow run does not
    // flip liveness.
    let runner_liveness =
        liveness.register("runner".to_string(), config.run_interval() * 2);
    start_health_liveness_server(&config, liveness);

    let runner = BatchRunner::new(
        store,
        Box::new(WeightedScoring),
        windows,
        config.run_options(),
    );

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());
    let mut timer = PeriodicTimer::new(config.run_interval(), shutdown);

    info!(
        interval_hours = config.run_interval_hours,
        run_on_start = config.run_on_start,
        "batch aggregator starting"
    );
    runner_liveness.report_healthy();

    if config.run_on_start {
        runner.run().await;
        runner_liveness.report_healthy();
    }
    // The interval's first tick fires immediately; the run_on_start flag
    // decides whether that cycle happens, so the tick itself is skipped.
    let mut first_tick = true;
    while timer.tick().await {
        if first_tick {
            first_tick = false;
            continue;
        }
        runner.run().await;
        runner_liveness.report_healthy();
    }

    info!("batch aggregator stopped cleanly");
    Ok(())
}
