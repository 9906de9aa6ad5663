use crate::error::{StoreError, ValidationError};
use crate::record::{RawMessage, SourceMeta};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A stream message that failed validation, kept byte-for-byte for inspection and replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub received_at: DateTime<Utc>,
    pub source: SourceMeta,
    pub raw_payload: Bytes,
    pub reason: String,
}

impl DeadLetterRecord {
    pub fn from_message(message: &RawMessage, reason: &ValidationError) -> Self {
        Self {
            received_at: message.received_at,
            source: message.source.clone(),
            raw_payload: message.payload.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub record: DeadLetterRecord,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync + 'static {
    async fn write(&self, records: &[DeadLetterRecord]) -> Result<(), StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Returns how many entries were removed.
    async fn remove(&self, ids: &[i64]) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryDeadLetters {
    next_id: i64,
    entries: BTreeMap<i64, DeadLetterRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    inner: Mutex<MemoryDeadLetters>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut MemoryDeadLetters) -> T) -> Result<T, StoreError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("dead-letter store lock poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn write(&self, records: &[DeadLetterRecord]) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            for record in records {
                inner.next_id += 1;
                inner.entries.insert(inner.next_id, record.clone());
            }
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.with_inner(|inner| inner.entries.len() as u64)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.with_inner(|inner| {
            inner
                .entries
                .iter()
                .take(limit)
                .map(|(id, record)| DeadLetterEntry {
                    id: *id,
                    record: record.clone(),
                })
                .collect()
        })
    }

    async fn remove(&self, ids: &[i64]) -> Result<u64, StoreError> {
        self.with_inner(|inner| {
            ids.iter()
                .filter(|id| inner.entries.remove(*id).is_some())
                .count() as u64
        })
    }
}

/// Dead letters in `app_metrics_dead_letters`; the table is created by
/// [`crate::store::postgres::ensure_schema`].
#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn write(&self, records: &[DeadLetterRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO app_metrics_dead_letters (received_at, source_topic, source_partition, source_offset, raw_payload, error) ",
        );
        builder.push_values(records.iter(), |mut b, record| {
            b.push_bind(record.received_at)
                .push_bind(&record.source.topic)
                .push_bind(record.source.partition)
                .push_bind(record.source.offset)
                .push_bind(record.raw_payload.to_vec())
                .push_bind(&record.reason);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM app_metrics_dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, received_at, source_topic, source_partition, source_offset, raw_payload, error
            FROM app_metrics_dead_letters
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: Vec<u8> = row.try_get("raw_payload")?;
            entries.push(DeadLetterEntry {
                id: row.try_get("id")?,
                record: DeadLetterRecord {
                    received_at: row.try_get("received_at")?,
                    source: SourceMeta {
                        topic: row.try_get("source_topic")?,
                        partition: row.try_get("source_partition")?,
                        offset: row.try_get("source_offset")?,
                    },
                    raw_payload: Bytes::from(payload),
                    reason: row.try_get("error")?,
                },
            });
        }
        Ok(entries)
    }

    async fn remove(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM app_metrics_dead_letters WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
