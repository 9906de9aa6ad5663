use anyhow::{Context, Result};
use app_metrics_sidecar::buckets::parse_timezone;
use app_metrics_sidecar::cli::{Cli, Command, IntegrationArgs, ScopeArgs};
use app_metrics_sidecar::config::{Config, StoreBackend};
use app_metrics_sidecar::consumer::spawn_consumer;
use app_metrics_sidecar::dead_letter::{DeadLetterStore, MemoryDeadLetterStore, PgDeadLetterStore};
use app_metrics_sidecar::ingest::Ingestor;
use app_metrics_sidecar::pipeline::IngestStats;
use app_metrics_sidecar::query::{ErrorQuery, ErrorSampleQuery, QueryEngine, TimeSeriesQuery};
use app_metrics_sidecar::store::postgres::{build_pool, ensure_schema};
use app_metrics_sidecar::store::{AggregateStore, MemoryAggregateStore, PgAggregateStore};
use clap::Parser;
use futures::future;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,app_metrics_sidecar=info".into());
    // stdout is reserved for JSON results of one-shot commands.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "app-metrics-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
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

async fn build_stores(
    config: &Config,
) -> Result<(Arc<dyn AggregateStore>, Arc<dyn DeadLetterStore>)> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; metrics are lost on restart");
            let aggregates: Arc<dyn AggregateStore> = Arc::new(MemoryAggregateStore::new());
            let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(MemoryDeadLetterStore::new());
            Ok((aggregates, dead_letters))
        }
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("database url is required for the postgres store")?;
            let pool = build_pool(database_url, config.db_pool_size)
                .await
                .context("failed to connect to Postgres")?;
            ensure_schema(&pool)
                .await
                .context("failed to prepare app metrics schema")?;
            let aggregates: Arc<dyn AggregateStore> = Arc::new(PgAggregateStore::new(pool.clone()));
            let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(PgDeadLetterStore::new(pool));
            Ok((aggregates, dead_letters))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(
    config: Config,
    aggregates: Arc<dyn AggregateStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
) -> Result<()> {
    let stats = Arc::new(IngestStats::new());
    let ingestor = Ingestor::new(aggregates.clone(), dead_letters, stats.clone());

    let mut consumers = Vec::with_capacity(config.consumer_workers);
    let mut workers = Vec::with_capacity(config.consumer_workers);
    for index in 0..config.consumer_workers {
        let tasks = spawn_consumer(&config, index, ingestor.clone());
        consumers.push(tasks.consumer);
        workers.push(tasks.worker);
    }
    tracing::info!(
        workers = config.consumer_workers,
        topic = %config.subscription_topic(),
        "app metrics sidecar started"
    );

    let compaction_handle = {
        let interval = config.compaction_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match aggregates.compact().await {
                    Ok(report) if report.parts_merged > 0 => {
                        tracing::debug!(
                            partitions = report.partitions,
                            parts_merged = report.parts_merged,
                            rows_before = report.rows_before,
                            rows_after = report.rows_after,
                            "compacted aggregate store"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error=%err, "compaction failed"),
                }
            }
        })
    };

    let status_handle = {
        let interval = config.status_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                stats.log_status();
            }
        })
    };

    tokio::select! {
        _ = future::join_all(consumers.iter_mut()) => {
            tracing::warn!("all consumers exited");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Stopping the consumers drops their pipeline handles, so each worker flushes and exits.
    for consumer in &consumers {
        consumer.abort();
    }
    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, future::join_all(workers))
        .await
        .is_err()
    {
        tracing::warn!("batch workers did not finish flushing before shutdown");
    }
    compaction_handle.abort();
    status_handle.abort();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let (aggregates, dead_letters) = build_stores(&config).await?;
    let command = cli.command.unwrap_or(Command::Serve);
    let engine = QueryEngine::new(aggregates.clone());

    match command {
        Command::Serve => serve(config, aggregates, dead_letters).await?,
        Command::RedriveDeadLetters(args) => {
            let ingestor = Ingestor::new(aggregates, dead_letters, Arc::new(IngestStats::new()));
            print_json(&ingestor.redrive_dead_letters(args.limit).await?)?;
        }
        Command::DeliveryRate(args) => {
            print_json(&engine.delivery_rate(args.team_id, args.from).await?)?;
        }
        Command::TimeSeries(args) => {
            let ScopeArgs {
                integration,
                from,
                to,
            } = args.scope;
            let query = TimeSeriesQuery {
                team_id: integration.team_id,
                plugin_config_id: integration.plugin_config_id,
                category: integration.category,
                job_id: integration.job_id,
                date_from: from,
                date_to: to,
                interval: args.interval,
                timezone: parse_timezone(&args.timezone)?,
            };
            print_json(&engine.time_series(&query).await?)?;
        }
        Command::Errors(args) => {
            let ScopeArgs {
                integration,
                from,
                to,
            } = args.scope;
            let query = ErrorQuery {
                team_id: integration.team_id,
                plugin_config_id: integration.plugin_config_id,
                category: integration.category,
                job_id: integration.job_id,
                date_from: from,
                date_to: to,
            };
            print_json(&engine.error_breakdown(&query).await?)?;
        }
        Command::ErrorSamples(args) => {
            let IntegrationArgs {
                team_id,
                plugin_config_id,
                category,
                job_id,
            } = args.integration;
            let query = ErrorSampleQuery {
                team_id,
                plugin_config_id,
                category,
                job_id,
                error_type: args.error_type,
            };
            print_json(&engine.error_samples(&query).await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
