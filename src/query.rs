//! Read-side analytics over the aggregate store.
//!
//! Every query is answered from re-aggregated reads (see [`AggregateStore::aggregate`] and
//! [`AggregateStore::minute_totals`]), so results do not depend on how far background
//! compaction has progressed.

use crate::buckets::{bucket_range, truncate, Interval};
use crate::error::QueryError;
use crate::record::Counters;
use crate::store::{AggregateFilter, AggregateStore};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use uuid::Uuid;

pub const MAX_ERROR_SAMPLES: usize = 20;
pub const MAX_BUCKETS: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryRate {
    Rate(f64),
    /// No successes, retries or failures in range.
    Undefined,
}

impl DeliveryRate {
    fn from_counters(counters: &Counters) -> Self {
        let delivered = counters.successes.saturating_add(counters.successes_on_retry);
        let total = delivered.saturating_add(counters.failures);
        if total == 0 {
            DeliveryRate::Undefined
        } else {
            DeliveryRate::Rate(delivered as f64 / total as f64)
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            DeliveryRate::Rate(rate) => Some(*rate),
            DeliveryRate::Undefined => None,
        }
    }
}

impl Serialize for DeliveryRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DeliveryRate::Rate(rate) => serializer.serialize_f64(*rate),
            DeliveryRate::Undefined => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeSeriesQuery {
    pub team_id: i64,
    pub plugin_config_id: i64,
    pub category: String,
    pub job_id: Option<String>,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
    pub interval: Interval,
    pub timezone: Tz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeSeriesBucket {
    pub date: DateTime<Utc>,
    pub successes: i64,
    pub successes_on_retry: i64,
    pub failures: i64,
}

#[derive(Debug, Clone)]
pub struct ErrorQuery {
    pub team_id: i64,
    pub plugin_config_id: i64,
    pub category: String,
    pub job_id: Option<String>,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorTypeSummary {
    pub error_type: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorSampleQuery {
    pub team_id: i64,
    pub plugin_config_id: i64,
    pub category: String,
    pub job_id: Option<String>,
    pub error_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSample {
    pub timestamp: DateTime<Utc>,
    pub error_uuid: Uuid,
    pub error_type: String,
    pub error_details: String,
}

#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn AggregateStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self { store }
    }

    /// Delivery rate per integration over rows strictly newer than `from_date`.
    pub async fn delivery_rate(
        &self,
        team_id: i64,
        from_date: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, DeliveryRate>, QueryError> {
        let filter =
            AggregateFilter::for_team(team_id).between(Bound::Excluded(from_date), Bound::Unbounded);
        let rows = self.store.aggregate(&filter).await?;

        let mut per_plugin: BTreeMap<i64, Counters> = BTreeMap::new();
        for row in &rows {
            per_plugin
                .entry(row.key.plugin_config_id)
                .or_default()
                .add(&row.counters);
        }
        Ok(per_plugin
            .into_iter()
            .map(|(plugin, counters)| (plugin, DeliveryRate::from_counters(&counters)))
            .collect())
    }

    /// One entry per generated bucket (zeroed when empty), ascending.
    pub async fn time_series(
        &self,
        query: &TimeSeriesQuery,
    ) -> Result<Vec<TimeSeriesBucket>, QueryError> {
        if query.date_from > query.date_to {
            return Ok(Vec::new());
        }
        let buckets: Vec<DateTime<Utc>> =
            bucket_range(query.interval, query.date_from, query.date_to, &query.timezone)
                .take(MAX_BUCKETS + 1)
                .collect();
        if buckets.len() > MAX_BUCKETS {
            return Err(QueryError::TooManyBuckets { limit: MAX_BUCKETS });
        }

        let mut series: BTreeMap<DateTime<Utc>, Counters> = buckets
            .into_iter()
            .map(|bucket| (bucket, Counters::default()))
            .collect();

        let filter = AggregateFilter::for_team(query.team_id)
            .plugin(query.plugin_config_id)
            .category(query.category.clone())
            .job(query.job_id.clone())
            .between(Bound::Included(query.date_from), Bound::Excluded(query.date_to));
        for total in self.store.minute_totals(&filter).await? {
            let bucket = truncate(total.minute, query.interval, &query.timezone);
            series.entry(bucket).or_default().add(&total.counters);
        }

        Ok(series
            .into_iter()
            .map(|(date, counters)| TimeSeriesBucket {
                date,
                successes: counters.successes,
                successes_on_retry: counters.successes_on_retry,
                failures: counters.failures,
            })
            .collect())
    }

    /// Error occurrences grouped by type, most frequent first.
    pub async fn error_breakdown(
        &self,
        query: &ErrorQuery,
    ) -> Result<Vec<ErrorTypeSummary>, QueryError> {
        if query.date_from > query.date_to {
            return Ok(Vec::new());
        }
        let filter = AggregateFilter::for_team(query.team_id)
            .plugin(query.plugin_config_id)
            .category(query.category.clone())
            .job(query.job_id.clone())
            .errors_only()
            .between(Bound::Included(query.date_from), Bound::Excluded(query.date_to));

        let mut by_type: HashMap<String, ErrorTypeSummary> = HashMap::new();
        for row in self.store.aggregate(&filter).await? {
            let summary = by_type
                .entry(row.key.error_type.clone())
                .or_insert_with(|| ErrorTypeSummary {
                    error_type: row.key.error_type.clone(),
                    count: 0,
                    last_seen: row.timestamp,
                });
            summary.count += 1;
            summary.last_seen = summary.last_seen.max(row.timestamp);
        }

        let mut summaries: Vec<ErrorTypeSummary> = by_type.into_values().collect();
        summaries.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.error_type.cmp(&b.error_type))
        });
        Ok(summaries)
    }

    /// Newest occurrences of one error type across all time, at most [`MAX_ERROR_SAMPLES`].
    pub async fn error_samples(
        &self,
        query: &ErrorSampleQuery,
    ) -> Result<Vec<ErrorSample>, QueryError> {
        let filter = AggregateFilter::for_team(query.team_id)
            .plugin(query.plugin_config_id)
            .category(query.category.clone())
            .job(query.job_id.clone())
            .error_type(query.error_type.clone());

        let mut rows = self.store.aggregate(&filter).await?;
        rows.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.key.error_uuid.cmp(&b.key.error_uuid))
        });
        Ok(rows
            .into_iter()
            .take(MAX_ERROR_SAMPLES)
            .map(|row| ErrorSample {
                timestamp: row.timestamp,
                error_uuid: row.key.error_uuid,
                error_type: row.key.error_type,
                error_details: row.error_details,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fixtures, MetricRecord};
    use crate::store::MemoryAggregateStore;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    async fn engine_with(records: &[MetricRecord]) -> QueryEngine {
        let store = Arc::new(MemoryAggregateStore::new());
        store.insert(records).await.unwrap();
        QueryEngine::new(store)
    }

    fn series_query(from: &str, to: &str, interval: Interval) -> TimeSeriesQuery {
        TimeSeriesQuery {
            team_id: 1,
            plugin_config_id: 10,
            category: "processEvent".to_string(),
            job_id: None,
            date_from: at(from),
            date_to: at(to),
            interval,
            timezone: Tz::UTC,
        }
    }

    fn error_query() -> ErrorQuery {
        ErrorQuery {
            team_id: 1,
            plugin_config_id: 10,
            category: "processEvent".to_string(),
            job_id: None,
            date_from: at("2024-01-01T00:00:00Z"),
            date_to: at("2024-02-01T00:00:00Z"),
        }
    }

    #[tokio::test]
    async fn empty_store_yields_zeroed_buckets() {
        let engine = engine_with(&[]).await;
        let series = engine
            .time_series(&series_query(
                "2024-01-01T00:00:00Z",
                "2024-01-03T00:00:00Z",
                Interval::Day,
            ))
            .await
            .unwrap();
        assert_eq!(series.len(), 3);
        assert!(series
            .iter()
            .all(|b| b.successes == 0 && b.successes_on_retry == 0 && b.failures == 0));
        assert_eq!(series[2].date, at("2024-01-03T00:00:00Z"));
    }

    #[tokio::test]
    async fn time_series_fills_gaps_around_data() {
        let engine = engine_with(&[
            fixtures::counted(1, 10, "2024-01-02T03:00:00Z", 5, 1, 2),
            fixtures::counted(1, 10, "2024-01-02T22:30:00Z", 1, 0, 0),
            fixtures::counted(1, 11, "2024-01-02T03:00:00Z", 100, 0, 0),
            fixtures::counted(1, 10, "2024-01-05T00:00:00Z", 100, 0, 0),
        ])
        .await;
        let series = engine
            .time_series(&series_query(
                "2024-01-01T00:00:00Z",
                "2024-01-03T00:00:00Z",
                Interval::Day,
            ))
            .await
            .unwrap();
        let dates: Vec<_> = series.iter().map(|b| b.date).collect();
        assert_eq!(
            dates,
            vec![
                at("2024-01-01T00:00:00Z"),
                at("2024-01-02T00:00:00Z"),
                at("2024-01-03T00:00:00Z"),
            ]
        );
        assert_eq!(
            series[1],
            TimeSeriesBucket {
                date: at("2024-01-02T00:00:00Z"),
                successes: 6,
                successes_on_retry: 1,
                failures: 2,
            }
        );
        assert_eq!(series[0].successes, 0);
        assert_eq!(series[2].successes, 0);
    }

    #[tokio::test]
    async fn time_series_buckets_in_local_time() {
        let engine = engine_with(&[fixtures::counted(1, 10, "2024-01-02T03:00:00Z", 4, 0, 0)]).await;
        let mut query = series_query("2024-01-01T12:00:00Z", "2024-01-02T12:00:00Z", Interval::Day);
        query.timezone = "America/New_York".parse().unwrap();
        let series = engine.time_series(&query).await.unwrap();
        // 03:00Z on Jan 2 is still Jan 1 in New York.
        assert_eq!(series[0].date, at("2024-01-01T05:00:00Z"));
        assert_eq!(series[0].successes, 4);
        assert_eq!(series.len(), 2);
    }

    #[tokio::test]
    async fn time_series_reversed_range_is_empty() {
        let engine = engine_with(&[]).await;
        let series = engine
            .time_series(&series_query(
                "2024-01-03T00:00:00Z",
                "2024-01-01T00:00:00Z",
                Interval::Day,
            ))
            .await
            .unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn time_series_refuses_huge_ranges() {
        let engine = engine_with(&[]).await;
        let err = engine
            .time_series(&series_query(
                "2020-01-01T00:00:00Z",
                "2024-01-01T00:00:00Z",
                Interval::Hour,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::TooManyBuckets { limit: MAX_BUCKETS }));
    }

    #[tokio::test]
    async fn delivery_rate_per_plugin() {
        let engine = engine_with(&[
            fixtures::counted(1, 10, "2024-01-02T00:00:00Z", 8, 2, 0),
            fixtures::counted(1, 11, "2024-01-02T00:00:00Z", 0, 0, 0),
            fixtures::counted(1, 12, "2024-01-02T00:00:00Z", 1, 0, 3),
            fixtures::counted(1, 13, "2023-12-31T00:00:00Z", 1, 0, 0),
            fixtures::counted(2, 10, "2024-01-02T00:00:00Z", 0, 0, 9),
        ])
        .await;
        let rates = engine
            .delivery_rate(1, at("2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(rates.len(), 3);
        assert_eq!(rates[&10], DeliveryRate::Rate(1.0));
        assert_eq!(rates[&11], DeliveryRate::Undefined);
        assert_eq!(rates[&12].value(), Some(0.25));
        assert_eq!(serde_json::to_string(&rates).unwrap(), r#"{"10":1.0,"11":null,"12":0.25}"#);
    }

    #[tokio::test]
    async fn delivery_rate_excludes_rows_at_from_date() {
        let engine = engine_with(&[fixtures::counted(1, 10, "2024-01-01T00:00:00Z", 1, 0, 0)]).await;
        let rates = engine
            .delivery_rate(1, at("2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        assert!(rates.is_empty());
    }

    #[tokio::test]
    async fn error_breakdown_orders_by_count() {
        let mut records = Vec::new();
        for minute in 0..3 {
            records.push(fixtures::error(
                1,
                10,
                &format!("2024-01-02T10:{minute:02}:00Z"),
                "ValueError",
                "{}",
            ));
        }
        for minute in 0..5 {
            records.push(fixtures::error(
                1,
                10,
                &format!("2024-01-03T10:{minute:02}:00Z"),
                "TypeError",
                "{}",
            ));
        }
        records.push(fixtures::counted(1, 10, "2024-01-04T00:00:00Z", 0, 0, 7));
        let engine = engine_with(&records).await;

        let summaries = engine.error_breakdown(&error_query()).await.unwrap();
        assert_eq!(
            summaries,
            vec![
                ErrorTypeSummary {
                    error_type: "TypeError".to_string(),
                    count: 5,
                    last_seen: at("2024-01-03T10:04:00Z"),
                },
                ErrorTypeSummary {
                    error_type: "ValueError".to_string(),
                    count: 3,
                    last_seen: at("2024-01-02T10:02:00Z"),
                },
            ]
        );
    }

    #[tokio::test]
    async fn error_samples_are_capped_and_newest_first() {
        let mut records = Vec::new();
        for minute in 0..30 {
            records.push(fixtures::error(
                1,
                10,
                &format!("2024-01-02T10:{minute:02}:00Z"),
                "TypeError",
                &format!(r#"{{"attempt":{minute}}}"#),
            ));
        }
        records.push(fixtures::error(1, 10, "2024-01-02T11:00:00Z", "ValueError", "{}"));
        let engine = engine_with(&records).await;

        let samples = engine
            .error_samples(&ErrorSampleQuery {
                team_id: 1,
                plugin_config_id: 10,
                category: "processEvent".to_string(),
                job_id: Some(String::new()),
                error_type: "TypeError".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(samples.len(), MAX_ERROR_SAMPLES);
        assert_eq!(samples[0].timestamp, at("2024-01-02T10:29:00Z"));
        assert_eq!(samples[0].error_details, r#"{"attempt":29}"#);
        assert!(samples
            .windows(2)
            .all(|pair| pair[0].timestamp >= pair[1].timestamp));
        assert!(samples.iter().all(|s| s.error_type == "TypeError"));
    }

    #[tokio::test]
    async fn time_series_bounds_apply_to_each_record() {
        let engine = engine_with(&[
            fixtures::counted(1, 10, "2024-01-01T10:05:00Z", 3, 0, 0),
            fixtures::counted(1, 10, "2024-01-01T10:40:00Z", 2, 0, 0),
        ])
        .await;
        let series = engine
            .time_series(&series_query(
                "2024-01-01T00:00:00Z",
                "2024-01-01T10:30:00Z",
                Interval::Day,
            ))
            .await
            .unwrap();
        assert_eq!(series[0].date, at("2024-01-01T00:00:00Z"));
        assert_eq!(series[0].successes, 3);

        let series = engine
            .time_series(&series_query(
                "2024-01-01T10:30:00Z",
                "2024-01-01T12:00:00Z",
                Interval::Day,
            ))
            .await
            .unwrap();
        assert_eq!(series[0].successes, 2);
    }

    #[tokio::test]
    async fn time_series_splits_an_hour_across_half_hour_offsets() {
        let engine = engine_with(&[
            fixtures::counted(1, 10, "2024-01-01T18:10:00Z", 1, 0, 0),
            fixtures::counted(1, 10, "2024-01-01T18:50:00Z", 1, 0, 0),
        ])
        .await;
        let mut query = series_query("2024-01-01T17:30:00Z", "2024-01-01T18:59:00Z", Interval::Hour);
        query.timezone = "Asia/Kolkata".parse().unwrap();
        let series = engine.time_series(&query).await.unwrap();
        let counts: Vec<_> = series.iter().map(|b| (b.date, b.successes)).collect();
        assert_eq!(
            counts,
            vec![
                (at("2024-01-01T17:30:00Z"), 1),
                (at("2024-01-01T18:30:00Z"), 1),
            ]
        );
    }

    #[tokio::test]
    async fn delivery_rate_ignores_records_before_from_date() {
        let engine = engine_with(&[
            fixtures::counted(1, 10, "2024-01-01T10:05:00Z", 0, 0, 5),
            fixtures::counted(1, 10, "2024-01-01T10:40:00Z", 1, 0, 0),
        ])
        .await;
        let rates = engine
            .delivery_rate(1, at("2024-01-01T10:30:00Z"))
            .await
            .unwrap();
        assert_eq!(rates[&10], DeliveryRate::Rate(1.0));
    }

    #[tokio::test]
    async fn error_breakdown_breaks_ties_by_type() {
        let records = vec![
            fixtures::error(1, 10, "2024-01-02T10:00:00Z", "ValueError", "{}"),
            fixtures::error(1, 10, "2024-01-02T10:01:00Z", "ValueError", "{}"),
            fixtures::error(1, 10, "2024-01-02T10:02:00Z", "TypeError", "{}"),
            fixtures::error(1, 10, "2024-01-02T10:03:00Z", "TypeError", "{}"),
            fixtures::error(1, 10, "2024-01-02T10:04:00Z", "RangeError", "{}"),
            fixtures::error(1, 10, "2024-01-02T10:05:00Z", "RangeError", "{}"),
        ];
        let engine = engine_with(&records).await;
        let types: Vec<_> = engine
            .error_breakdown(&error_query())
            .await
            .unwrap()
            .into_iter()
            .map(|summary| (summary.error_type, summary.count))
            .collect();
        assert_eq!(
            types,
            vec![
                ("RangeError".to_string(), 2),
                ("TypeError".to_string(), 2),
                ("ValueError".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn job_filter_none_differs_from_empty_job() {
        let mut job_run = fixtures::counted(1, 10, "2024-01-02T10:00:00Z", 7, 0, 0);
        job_run.job_id = "nightly-export".to_string();
        let engine = engine_with(&[
            fixtures::counted(1, 10, "2024-01-02T10:00:00Z", 2, 0, 0),
            job_run,
        ])
        .await;

        let mut query = series_query("2024-01-02T00:00:00Z", "2024-01-02T23:00:00Z", Interval::Day);
        let any_job = engine.time_series(&query).await.unwrap();
        assert_eq!(any_job[0].successes, 9);

        query.job_id = Some(String::new());
        let without_job = engine.time_series(&query).await.unwrap();
        assert_eq!(without_job[0].successes, 2);

        query.job_id = Some("nightly-export".to_string());
        let one_job = engine.time_series(&query).await.unwrap();
        assert_eq!(one_job[0].successes, 7);
    }

    #[tokio::test]
    async fn error_samples_are_not_time_bounded() {
        let engine = engine_with(&[
            fixtures::error(1, 10, "2019-06-01T00:00:00Z", "TypeError", "old"),
            fixtures::error(1, 10, "2030-06-01T00:00:00Z", "TypeError", "new"),
        ])
        .await;
        let samples = engine
            .error_samples(&ErrorSampleQuery {
                team_id: 1,
                plugin_config_id: 10,
                category: "processEvent".to_string(),
                job_id: None,
                error_type: "TypeError".to_string(),
            })
            .await
            .unwrap();
        let details: Vec<_> = samples.iter().map(|s| s.error_details.as_str()).collect();
        assert_eq!(details, vec!["new", "old"]);
    }
}
