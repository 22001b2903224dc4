use std::future::ready;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinHandle;
use tracing::info;

use kafka_ingest::{Config, IngestService};

pub async fn index() -> &'static str {
    "kafka ingest service"
}

fn start_server(config: &Config) -> JoinHandle<()> {
    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder");

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(recorder.render())));

    let bind = config.bind_address();

    tokio::task::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .expect("failed to bind metrics server");
        axum::serve(listener, router)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("starting kafka ingest service");

    let config = Config::init_with_defaults()
        .context("failed to load configuration from environment variables")?;

    info!("configuration loaded: {:?}", config);

    let server_handle = start_server(&config);
    info!("started metrics server on {}", config.bind_address());

    let service = IngestService::new(config)
        .context("failed to create ingest service, check the Kafka and format configuration")?;

    // Blocks until shutdown
    service.run().await?;

    server_handle.abort();

    Ok(())
}
