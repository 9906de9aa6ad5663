use super::{
    sort_rows, AggregateFilter, AggregateRow, AggregateStore, CompactionReport, MinuteTotal,
};
use crate::error::StoreError;
use crate::record::{CompositeKey, Counters, MetricRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::ops::Bound;

const CREATE_METRICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS app_metrics (
    id bigserial,
    team_id bigint NOT NULL,
    ts timestamptz NOT NULL,
    plugin_config_id bigint NOT NULL,
    category text NOT NULL DEFAULT '',
    job_id text NOT NULL DEFAULT '',
    successes bigint NOT NULL DEFAULT 0,
    successes_on_retry bigint NOT NULL DEFAULT 0,
    failures bigint NOT NULL DEFAULT 0,
    error_uuid uuid NOT NULL,
    error_type text NOT NULL DEFAULT '',
    error_details text NOT NULL DEFAULT '',
    record_digest bigint NOT NULL,
    inserted_at timestamptz NOT NULL DEFAULT now(),
    UNIQUE (record_digest, ts)
)
"#;

const CREATE_METRICS_KEY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS app_metrics_key_idx
    ON app_metrics (team_id, plugin_config_id, job_id, category, ts)
"#;

const CREATE_DEAD_LETTER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS app_metrics_dead_letters (
    id bigserial PRIMARY KEY,
    received_at timestamptz NOT NULL,
    source_topic text NOT NULL,
    source_partition integer NULL,
    source_offset bigint NULL,
    raw_payload bytea NOT NULL,
    error text NOT NULL
)
"#;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Creates the metrics and dead-letter tables. The metrics table becomes a TimescaleDB
/// hypertable with one-month chunks when the extension is installed.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(CREATE_METRICS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_METRICS_KEY_INDEX).execute(pool).await?;
    sqlx::query(CREATE_DEAD_LETTER_TABLE).execute(pool).await?;

    let timescale: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')",
    )
    .fetch_one(pool)
    .await?;
    if timescale {
        let result = sqlx::query(
            "SELECT create_hypertable('app_metrics', 'ts', chunk_time_interval => INTERVAL '1 month', if_not_exists => TRUE, migrate_data => TRUE)",
        )
        .execute(pool)
        .await;
        if let Err(err) = result {
            tracing::warn!(error=%err, "failed to convert app_metrics into a hypertable");
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct PgAggregateStore {
    pool: PgPool,
}

impl PgAggregateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_time_bound(builder: &mut QueryBuilder<'_, Postgres>, bound: Bound<DateTime<Utc>>, lower: bool) {
    let (op, ts) = match (bound, lower) {
        (Bound::Included(ts), true) => (">=", ts),
        (Bound::Excluded(ts), true) => (">", ts),
        (Bound::Included(ts), false) => ("<=", ts),
        (Bound::Excluded(ts), false) => ("<", ts),
        (Bound::Unbounded, _) => return,
    };
    builder.push(format!(" AND ts {op} "));
    builder.push_bind(ts);
}

/// `WHERE` clause for `filter`; time bounds apply to each stored row's own `ts`.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &AggregateFilter) {
    builder.push(" WHERE team_id = ").push_bind(filter.team_id);
    if let Some(plugin_config_id) = filter.plugin_config_id {
        builder.push(" AND plugin_config_id = ").push_bind(plugin_config_id);
    }
    if let Some(category) = &filter.category {
        builder.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(job_id) = &filter.job_id {
        builder.push(" AND job_id = ").push_bind(job_id.clone());
    }
    if let Some(error_type) = &filter.error_type {
        builder.push(" AND error_type = ").push_bind(error_type.clone());
    }
    if filter.errors_only {
        builder.push(" AND error_type <> ''");
    }
    push_time_bound(builder, filter.from, true);
    push_time_bound(builder, filter.to, false);
}

fn decode_row(row: &PgRow) -> Result<AggregateRow, sqlx::Error> {
    Ok(AggregateRow {
        key: CompositeKey {
            team_id: row.try_get("team_id")?,
            plugin_config_id: row.try_get("plugin_config_id")?,
            job_id: row.try_get("job_id")?,
            category: row.try_get("category")?,
            hour: row.try_get("hour")?,
            error_type: row.try_get("error_type")?,
            error_uuid: row.try_get("error_uuid")?,
        },
        counters: Counters {
            successes: row.try_get("successes")?,
            successes_on_retry: row.try_get("successes_on_retry")?,
            failures: row.try_get("failures")?,
        },
        timestamp: row.try_get("last_ts")?,
        error_details: row
            .try_get::<Option<String>, _>("error_details")?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl AggregateStore for PgAggregateStore {
    async fn insert(&self, records: &[MetricRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let inserted_at = Utc::now();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO app_metrics (team_id, ts, plugin_config_id, category, job_id, successes, successes_on_retry, failures, error_uuid, error_type, error_details, record_digest, inserted_at) ",
        );
        builder.push_values(records.iter(), |mut b, record| {
            b.push_bind(record.team_id)
                .push_bind(record.timestamp)
                .push_bind(record.plugin_config_id)
                .push_bind(&record.category)
                .push_bind(&record.job_id)
                .push_bind(record.successes)
                .push_bind(record.successes_on_retry)
                .push_bind(record.failures)
                .push_bind(record.error_uuid)
                .push_bind(&record.error_type)
                .push_bind(&record.error_details)
                .push_bind(record.digest() as i64)
                .push_bind(inserted_at);
        });
        builder.push(" ON CONFLICT DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        let inserted = result.rows_affected() as usize;
        if inserted < records.len() {
            tracing::debug!(
                inserted,
                skipped = records.len() - inserted,
                "skipped redelivered metric rows"
            );
        }
        Ok(())
    }

    async fn aggregate(&self, filter: &AggregateFilter) -> Result<Vec<AggregateRow>, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"SELECT team_id, plugin_config_id, job_id, category,
                date_trunc('hour', ts, 'UTC') AS hour, error_type, error_uuid,
                SUM(successes)::bigint AS successes,
                SUM(successes_on_retry)::bigint AS successes_on_retry,
                SUM(failures)::bigint AS failures,
                MAX(ts) AS last_ts,
                (ARRAY_AGG(error_details ORDER BY inserted_at DESC, id DESC))[1] AS error_details
            FROM app_metrics"#,
        );
        push_filter(&mut builder, filter);
        builder.push(" GROUP BY 1, 2, 3, 4, 5, 6, 7");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut decoded = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;
        sort_rows(&mut decoded);
        Ok(decoded)
    }

    async fn minute_totals(&self, filter: &AggregateFilter) -> Result<Vec<MinuteTotal>, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"SELECT date_trunc('minute', ts, 'UTC') AS minute,
                SUM(successes)::bigint AS successes,
                SUM(successes_on_retry)::bigint AS successes_on_retry,
                SUM(failures)::bigint AS failures
            FROM app_metrics"#,
        );
        push_filter(&mut builder, filter);
        builder.push(" GROUP BY 1 ORDER BY 1");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let totals = rows
            .iter()
            .map(|row| -> Result<MinuteTotal, sqlx::Error> {
                Ok(MinuteTotal {
                    minute: row.try_get("minute")?,
                    counters: Counters {
                        successes: row.try_get("successes")?,
                        successes_on_retry: row.try_get("successes_on_retry")?,
                        failures: row.try_get("failures")?,
                    },
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(totals)
    }

    async fn compact(&self) -> Result<CompactionReport, StoreError> {
        Ok(CompactionReport::default())
    }
}
