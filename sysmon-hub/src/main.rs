//! sysmon hub: pulls host telemetry from the metrics engine, scores it for
//! anomalies, forecasts the cpu trend, adds GPU readings and pushes every
//! merged sample to live WebSocket subscribers.
//!
//! Three kinds of long-running tasks share the process: the ingestion loop,
//! the GPU sampler and one push task per subscriber. None of them ever exits
//! on its own; shutdown is process exit.

use sysmon_hub::analyzer::AnomalyAnalyzer;
use sysmon_hub::config::load_config;
use sysmon_hub::gpu::GpuSampler;
use sysmon_hub::health::HealthTracker;
use sysmon_hub::http::{self, AppState};
use sysmon_hub::ingest::MetricsIngestor;
use sysmon_hub::state::{new_state, StateStore};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sysmon_hub=info")))
        .init();

    let cfg = load_config().await;

    let store = StateStore::new();
    let health = HealthTracker::new();
    let analyzer = new_state(AnomalyAnalyzer::new(cfg.analyzer.clone()));

    // GPU readings reach the ingestor through a watch channel
    let (sampler, gpu_readings) = GpuSampler::new(cfg.gpu.clone());
    sampler.spawn();

    MetricsIngestor::new(cfg.engine.clone(), analyzer, gpu_readings, store.clone(), health.clone()).spawn();

    let app = http::build_router(AppState { store, health });
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
