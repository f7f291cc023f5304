mod config;
mod engine;
mod error;
mod events;
mod records;
mod stats;
mod store;

use crate::config::Config;
use crate::engine::Session;
use crate::stats::EngineStats;
use crate::store::postgres::{build_pool, PgStore};
use anyhow::{Context, Result};
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,usage_alert_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    match config
        .otlp_endpoint
        .as_deref()
        .map(normalize_otlp_http_endpoint)
        .filter(|endpoint| !endpoint.is_empty())
    {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "usage-alert-worker"),
                ])))
                .install_batch(Tokio)?;

            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(otel_layer)
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool));
    store
        .ensure_schema()
        .await
        .context("failed to prepare usage tables")?;

    let mut session = Session::new(
        config.session_settings(),
        store.clone(),
        store,
        Arc::new(EngineStats::new()),
    );
    session.start().await?;

    let report = session.run_now().await?;
    if report.is_ok() {
        tracing::info!(
            trigger = ?report.trigger,
            intervals = report.derive.inserted,
            alerts = report.evaluate.inserted,
            requeued = report.requeued,
            "startup usage cycle finished"
        );
    }

    match session.usage_intervals().await {
        Ok(recorded) => tracing::info!(
            recorded = recorded.len(),
            latest_end = ?recorded.first().map(|interval| interval.end_time),
            "usage intervals on record"
        ),
        Err(err) => tracing::warn!(error = %err, "failed to list usage intervals"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!(state = %session.state(), "shutdown signal received");

    session.teardown().await?;
    if let Some(err) = session.stats().last_error() {
        tracing::warn!(error = %err, "last cycle error before shutdown");
    }

    Ok(())
}
