use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use simd_json::prelude::ValueAsScalar;
use simd_json::{BorrowedValue, StaticNode};
use uuid::Uuid;

const NAIVE_UTC_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricRecord {
    pub team_id: i64,
    pub timestamp: DateTime<Utc>,
    pub plugin_config_id: i64,
    pub category: String,
    pub job_id: String,
    pub successes: i64,
    pub successes_on_retry: i64,
    pub failures: i64,
    pub error_uuid: Uuid,
    pub error_type: String,
    pub error_details: String,
}

/// Merge identity of a record. Field order is the physical sort order of a partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeKey {
    pub team_id: i64,
    pub plugin_config_id: i64,
    pub job_id: String,
    pub category: String,
    pub hour: DateTime<Utc>,
    pub error_type: String,
    pub error_uuid: Uuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub successes: i64,
    pub successes_on_retry: i64,
    pub failures: i64,
}

impl Counters {
    pub fn add(&mut self, other: &Counters) {
        self.successes = self.successes.saturating_add(other.successes);
        self.successes_on_retry = self.successes_on_retry.saturating_add(other.successes_on_retry);
        self.failures = self.failures.saturating_add(other.failures);
    }
}

impl MetricRecord {
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            team_id: self.team_id,
            plugin_config_id: self.plugin_config_id,
            job_id: self.job_id.clone(),
            category: self.category.clone(),
            hour: hour_start(self.timestamp),
            error_type: self.error_type.clone(),
            error_uuid: self.error_uuid,
        }
    }

    pub fn counters(&self) -> Counters {
        Counters {
            successes: self.successes,
            successes_on_retry: self.successes_on_retry,
            failures: self.failures,
        }
    }

    /// Content fingerprint; two deliveries of the same payload share it.
    pub fn digest(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.team_id.to_le_bytes());
        hasher.update(self.timestamp.timestamp_micros().to_le_bytes());
        hasher.update(self.plugin_config_id.to_le_bytes());
        for text in [&self.category, &self.job_id, &self.error_type] {
            hasher.update((text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        hasher.update(self.successes.to_le_bytes());
        hasher.update(self.successes_on_retry.to_le_bytes());
        hasher.update(self.failures.to_le_bytes());
        hasher.update(self.error_uuid.as_bytes());
        hasher.update((self.error_details.len() as u64).to_le_bytes());
        hasher.update(self.error_details.as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(head)
    }

    /// Month partition (`YYYYMM`) the record lands in.
    pub fn partition(&self) -> u32 {
        month_partition(self.timestamp)
    }
}

pub fn hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    floor_to(ts, 3600)
}

pub fn minute_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    floor_to(ts, 60)
}

fn floor_to(ts: DateTime<Utc>, step_secs: i64) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let bucket = secs - secs.rem_euclid(step_secs);
    Utc.timestamp_opt(bucket, 0).single().unwrap_or(ts)
}

pub fn month_partition(ts: DateTime<Utc>) -> u32 {
    ts.year().max(0) as u32 * 100 + ts.month()
}

/// Where a stream message came from; kept on dead letters for replay and audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceMeta {
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub source: SourceMeta,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            source: SourceMeta {
                topic: topic.into(),
                partition: None,
                offset: None,
            },
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_offset(mut self, partition: Option<i32>, offset: Option<i64>) -> Self {
        self.source.partition = partition;
        self.source.offset = offset;
        self
    }
}

pub fn parse_metric_payload(payload: &[u8]) -> Result<MetricRecord, ValidationError> {
    let mut bytes = payload.to_vec();
    let value = simd_json::to_borrowed_value(&mut bytes)
        .map_err(|err| ValidationError::InvalidJson(err.to_string()))?;
    let BorrowedValue::Object(obj) = value else {
        return Err(ValidationError::NotAnObject);
    };

    let field = |name: &str| obj.get(name).filter(|value| !is_null(value));

    let team_id = required_int(field("team_id"), "team_id")?;
    let plugin_config_id = required_int(field("plugin_config_id"), "plugin_config_id")?;
    let timestamp = match field("timestamp") {
        Some(value) => parse_timestamp(value)?,
        None => return Err(ValidationError::MissingField("timestamp")),
    };

    let category = optional_string(field("category"), "category")?;
    let job_id = optional_string(field("job_id"), "job_id")?;
    let error_type = optional_string(field("error_type"), "error_type")?;

    let successes = counter(field("successes"), "successes")?;
    let successes_on_retry = counter(field("successes_on_retry"), "successes_on_retry")?;
    let failures = counter(field("failures"), "failures")?;

    let error_uuid = match field("error_uuid") {
        None => Uuid::nil(),
        Some(value) => {
            let raw = value.as_str().ok_or(ValidationError::InvalidField {
                field: "error_uuid",
                reason: "expected a UUID string".to_string(),
            })?;
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Uuid::nil()
            } else {
                Uuid::parse_str(trimmed).map_err(|err| ValidationError::InvalidField {
                    field: "error_uuid",
                    reason: err.to_string(),
                })?
            }
        }
    };

    let error_details = match field("error_details") {
        None => String::new(),
        Some(value) => match value.as_str() {
            Some(text) => text.to_string(),
            None => serde_json::to_string(value).map_err(|err| ValidationError::InvalidField {
                field: "error_details",
                reason: err.to_string(),
            })?,
        },
    };

    Ok(MetricRecord {
        team_id,
        timestamp,
        plugin_config_id,
        category,
        job_id,
        successes,
        successes_on_retry,
        failures,
        error_uuid,
        error_type,
        error_details,
    })
}

fn is_null(value: &BorrowedValue) -> bool {
    matches!(value, BorrowedValue::Static(StaticNode::Null))
}

fn as_integer(value: &BorrowedValue) -> Option<i64> {
    match value {
        BorrowedValue::Static(StaticNode::I64(_)) | BorrowedValue::Static(StaticNode::U64(_)) => {
            value.as_i64()
        }
        _ => None,
    }
}

fn required_int(value: Option<&BorrowedValue>, field: &'static str) -> Result<i64, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(field))?;
    as_integer(value).ok_or(ValidationError::InvalidField {
        field,
        reason: "expected an integer".to_string(),
    })
}

fn counter(value: Option<&BorrowedValue>, field: &'static str) -> Result<i64, ValidationError> {
    let Some(value) = value else {
        return Ok(0);
    };
    let parsed = as_integer(value).ok_or(ValidationError::InvalidField {
        field,
        reason: "expected an integer counter".to_string(),
    })?;
    if parsed < 0 {
        return Err(ValidationError::NegativeCounter {
            field,
            value: parsed,
        });
    }
    Ok(parsed)
}

fn optional_string(
    value: Option<&BorrowedValue>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match value {
        None => Ok(String::new()),
        Some(value) => value
            .as_str()
            .map(|text| text.to_string())
            .ok_or(ValidationError::InvalidField {
                field,
                reason: "expected a string".to_string(),
            }),
    }
}

fn parse_timestamp(value: &BorrowedValue) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField {
        field: "timestamp",
        reason,
    };
    let parsed = if let Some(raw) = value.as_str() {
        let raw = raw.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(raw, NAIVE_UTC_FORMAT)
                    .map(|naive| naive.and_utc())
            })
            .map_err(|err| invalid(format!("unrecognised timestamp `{raw}`: {err}")))?
    } else if let Some(ms) = as_integer(value) {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| invalid(format!("epoch millis {ms} out of range")))?
    } else if let Some(ms) = value.as_f64() {
        let micros = (ms * 1000.0).round();
        if !micros.is_finite() {
            return Err(invalid("non-finite epoch millis".to_string()));
        }
        DateTime::from_timestamp_micros(micros as i64)
            .ok_or_else(|| invalid(format!("epoch millis {ms} out of range")))?
    } else {
        return Err(invalid("expected a string or epoch millis".to_string()));
    };
    Ok(truncate_to_micros(parsed))
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000).unwrap_or(ts)
}
