//! Aggregate fact storage for app metrics.
//!
//! Stores are append-only; rows sharing a [`CompositeKey`] are summed on every read, so callers
//! never depend on whether background compaction has run yet. Time bounds always apply to the
//! timestamp each record was ingested with, before any folding.

pub mod memory;
pub mod postgres;

pub use memory::MemoryAggregateStore;
pub use postgres::PgAggregateStore;

use crate::error::StoreError;
use crate::record::{hour_start, month_partition, CompositeKey, Counters, MetricRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::Bound;

/// Which records a read folds. Time bounds apply to each record's own timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFilter {
    pub team_id: i64,
    pub plugin_config_id: Option<i64>,
    pub category: Option<String>,
    /// `None` skips the job filter; `Some("")` selects rows without a job.
    pub job_id: Option<String>,
    pub error_type: Option<String>,
    pub errors_only: bool,
    pub from: Bound<DateTime<Utc>>,
    pub to: Bound<DateTime<Utc>>,
}

impl AggregateFilter {
    pub fn for_team(team_id: i64) -> Self {
        Self {
            team_id,
            plugin_config_id: None,
            category: None,
            job_id: None,
            error_type: None,
            errors_only: false,
            from: Bound::Unbounded,
            to: Bound::Unbounded,
        }
    }

    pub fn plugin(mut self, plugin_config_id: i64) -> Self {
        self.plugin_config_id = Some(plugin_config_id);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn job(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Only rows carrying a non-empty `error_type`.
    pub fn errors_only(mut self) -> Self {
        self.errors_only = true;
        self
    }

    pub fn between(mut self, from: Bound<DateTime<Utc>>, to: Bound<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn matches_key(&self, key: &CompositeKey) -> bool {
        key.team_id == self.team_id
            && self.plugin_config_id.map_or(true, |id| key.plugin_config_id == id)
            && self.category.as_deref().map_or(true, |c| key.category == c)
            && self.job_id.as_deref().map_or(true, |j| key.job_id == j)
            && self.error_type.as_deref().map_or(true, |e| key.error_type == e)
            && (!self.errors_only || !key.error_type.is_empty())
    }

    pub fn matches_time(&self, ts: DateTime<Utc>) -> bool {
        let above = match self.from {
            Bound::Included(from) => ts >= from,
            Bound::Excluded(from) => ts > from,
            Bound::Unbounded => true,
        };
        let below = match self.to {
            Bound::Included(to) => ts <= to,
            Bound::Excluded(to) => ts < to,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// Hour keys that may hold a matching record. Used for pruning only.
    pub fn hour_span(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let lower = match self.from {
            Bound::Included(from) | Bound::Excluded(from) => Some(hour_start(from)),
            Bound::Unbounded => None,
        };
        let upper = match self.to {
            Bound::Included(to) | Bound::Excluded(to) => Some(hour_start(to)),
            Bound::Unbounded => None,
        };
        (lower, upper)
    }

    pub(crate) fn partition_span(&self) -> (u32, u32) {
        let (lower, upper) = self.hour_span();
        (
            lower.map_or(0, month_partition),
            upper.map_or(u32::MAX, month_partition),
        )
    }
}

/// One logical row: the in-range records of a composite key folded together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRow {
    pub key: CompositeKey,
    pub counters: Counters,
    /// Latest in-range record timestamp for the key.
    pub timestamp: DateTime<Utc>,
    pub error_details: String,
}

/// Counters of every matching record whose timestamp falls in `minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinuteTotal {
    pub minute: DateTime<Utc>,
    pub counters: Counters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub partitions: usize,
    pub parts_merged: usize,
    pub rows_before: usize,
    pub rows_after: usize,
}

#[async_trait]
pub trait AggregateStore: Send + Sync + 'static {
    async fn insert(&self, records: &[MetricRecord]) -> Result<(), StoreError>;

    /// Rows grouped by composite key, ordered by hour then key.
    async fn aggregate(&self, filter: &AggregateFilter) -> Result<Vec<AggregateRow>, StoreError>;

    /// Matching counters summed per UTC minute, ascending. Every zone offset in use is a whole
    /// number of minutes, so local buckets can be built from these without splitting a minute.
    async fn minute_totals(&self, filter: &AggregateFilter) -> Result<Vec<MinuteTotal>, StoreError>;

    async fn compact(&self) -> Result<CompactionReport, StoreError>;
}

pub(crate) fn sort_rows(rows: &mut [AggregateRow]) {
    rows.sort_by(|a, b| a.key.hour.cmp(&b.key.hour).then_with(|| a.key.cmp(&b.key)));
}
