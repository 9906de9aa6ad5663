use crate::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::error::{IngestError, ValidationError};
use crate::pipeline::IngestStats;
use crate::record::{parse_metric_payload, MetricRecord, RawMessage};
use crate::store::AggregateStore;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// What happened to a message that may now be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    DeadLettered(ValidationError),
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RedriveReport {
    pub examined: usize,
    pub committed: usize,
    pub still_invalid: usize,
}

/// Validates raw stream messages and routes them to the aggregate or dead-letter store.
#[derive(Clone)]
pub struct Ingestor {
    aggregates: Arc<dyn AggregateStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    pub fn new(
        aggregates: Arc<dyn AggregateStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            aggregates,
            dead_letters,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn consume(&self, raw: &RawMessage) -> Result<Outcome, IngestError> {
        let mut outcomes = self.consume_batch(std::slice::from_ref(raw)).await?;
        Ok(outcomes.pop().unwrap_or(Outcome::Committed))
    }

    /// Outcomes are returned in input order. Aggregates are written before dead letters so
    /// that a retried batch can only repeat the idempotent half.
    pub async fn consume_batch(&self, raws: &[RawMessage]) -> Result<Vec<Outcome>, IngestError> {
        let mut records: Vec<MetricRecord> = Vec::with_capacity(raws.len());
        let mut dead: Vec<DeadLetterRecord> = Vec::new();
        let mut outcomes = Vec::with_capacity(raws.len());

        for raw in raws {
            match parse_metric_payload(&raw.payload) {
                Ok(record) => {
                    records.push(record);
                    outcomes.push(Outcome::Committed);
                }
                Err(reason) => {
                    tracing::warn!(
                        topic = %raw.source.topic,
                        offset = ?raw.source.offset,
                        reason = %reason,
                        "dead-lettering invalid metric payload"
                    );
                    dead.push(DeadLetterRecord::from_message(raw, &reason));
                    outcomes.push(Outcome::DeadLettered(reason));
                }
            }
        }

        if !records.is_empty() {
            if let Err(err) = self.aggregates.insert(&records).await {
                self.stats.store_failures_total.fetch_add(1, Ordering::Relaxed);
                return Err(IngestError::StoreUnavailable(err));
            }
            self.stats
                .committed_total
                .fetch_add(records.len() as u64, Ordering::Relaxed);
        }
        if !dead.is_empty() {
            if let Err(err) = self.dead_letters.write(&dead).await {
                self.stats.store_failures_total.fetch_add(1, Ordering::Relaxed);
                return Err(IngestError::DeadLetterUnavailable(err));
            }
            self.stats
                .dead_lettered_total
                .fetch_add(dead.len() as u64, Ordering::Relaxed);
        }
        Ok(outcomes)
    }

    /// Re-validates up to `limit` dead letters. Payloads that now parse are committed and
    /// removed; the rest stay where they are.
    pub async fn redrive_dead_letters(&self, limit: usize) -> Result<RedriveReport, IngestError> {
        let pending = self
            .dead_letters
            .pending(limit)
            .await
            .map_err(IngestError::DeadLetterUnavailable)?;

        let mut report = RedriveReport {
            examined: pending.len(),
            ..RedriveReport::default()
        };
        let mut records = Vec::new();
        let mut ids = Vec::new();
        for entry in &pending {
            match parse_metric_payload(&entry.record.raw_payload) {
                Ok(record) => {
                    records.push(record);
                    ids.push(entry.id);
                }
                Err(reason) => {
                    tracing::debug!(id = entry.id, reason = %reason, "dead letter still invalid");
                    report.still_invalid += 1;
                }
            }
        }

        if !records.is_empty() {
            self.aggregates
                .insert(&records)
                .await
                .map_err(IngestError::StoreUnavailable)?;
            self.dead_letters
                .remove(&ids)
                .await
                .map_err(IngestError::DeadLetterUnavailable)?;
            report.committed = records.len();
        }
        tracing::info!(
            examined = report.examined,
            committed = report.committed,
            still_invalid = report.still_invalid,
            "redrove dead letters"
        );
        Ok(report)
    }
}
