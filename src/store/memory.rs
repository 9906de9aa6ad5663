use super::{
    sort_rows, AggregateFilter, AggregateRow, AggregateStore, CompactionReport, MinuteTotal,
};
use crate::error::StoreError;
use crate::record::{minute_start, CompositeKey, Counters, MetricRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

/// Counters recorded at one instant.
#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: DateTime<Utc>,
    counters: Counters,
}

/// A stored row. Freshly inserted fragments carry one digest and one sample; compacted
/// fragments carry the digests of every record folded into them and one sample per distinct
/// timestamp, so time bounds stay exact after a merge.
#[derive(Debug, Clone)]
struct Fragment {
    key: CompositeKey,
    samples: Vec<Sample>,
    details: Arc<[u8]>,
    seq: u64,
    digests: Vec<u64>,
}

/// Immutable run of fragments sorted by composite key.
#[derive(Debug)]
struct Part {
    fragments: Vec<Fragment>,
    min_hour: DateTime<Utc>,
    max_hour: DateTime<Utc>,
}

impl Part {
    fn new(mut fragments: Vec<Fragment>) -> Option<Self> {
        fragments.sort_by(|a, b| a.key.cmp(&b.key));
        let min_hour = fragments.iter().map(|f| f.key.hour).min()?;
        let max_hour = fragments.iter().map(|f| f.key.hour).max()?;
        Some(Self {
            fragments,
            min_hour,
            max_hour,
        })
    }

    fn overlaps(&self, lower: Option<DateTime<Utc>>, upper: Option<DateTime<Utc>>) -> bool {
        lower.map_or(true, |lower| self.max_hour >= lower)
            && upper.map_or(true, |upper| self.min_hour <= upper)
    }

    /// Fragments for the filter's team (and plugin, when set); relies on key ordering.
    fn candidates(&self, filter: &AggregateFilter) -> &[Fragment] {
        let team = filter.team_id;
        let (start, end) = match filter.plugin_config_id {
            Some(plugin) => (
                self.fragments
                    .partition_point(|f| (f.key.team_id, f.key.plugin_config_id) < (team, plugin)),
                self.fragments
                    .partition_point(|f| (f.key.team_id, f.key.plugin_config_id) <= (team, plugin)),
            ),
            None => (
                self.fragments.partition_point(|f| f.key.team_id < team),
                self.fragments.partition_point(|f| f.key.team_id <= team),
            ),
        };
        &self.fragments[start..end]
    }
}

/// Result of folding every fragment of one composite key.
struct Folded<'a> {
    key: &'a CompositeKey,
    samples: BTreeMap<DateTime<Utc>, Counters>,
    details: &'a Arc<[u8]>,
    seq: u64,
    digests: HashSet<u64>,
}

/// Samples inside the filter's time bounds, ascending.
fn in_range<'f>(
    samples: &'f BTreeMap<DateTime<Utc>, Counters>,
    filter: &'f AggregateFilter,
) -> impl Iterator<Item = (DateTime<Utc>, &'f Counters)> + 'f {
    samples
        .iter()
        .filter(move |(ts, _)| filter.matches_time(**ts))
        .map(|(ts, counters)| (*ts, counters))
}

/// Folds fragments of a single key in storage order. A fragment whose digests were all
/// counted already is a redelivery and contributes nothing. At most one multi-digest fragment
/// exists per key and it always precedes the single-digest ones.
fn fold<'a>(fragments: &[&'a Fragment]) -> Option<Folded<'a>> {
    let mut acc: Option<Folded<'a>> = None;
    for &fragment in fragments {
        if let Some(folded) = &acc {
            if fragment.digests.iter().all(|d| folded.digests.contains(d)) {
                continue;
            }
        }
        let folded = acc.get_or_insert_with(|| Folded {
            key: &fragment.key,
            samples: BTreeMap::new(),
            details: &fragment.details,
            seq: fragment.seq,
            digests: HashSet::new(),
        });
        if fragment.seq > folded.seq {
            folded.seq = fragment.seq;
            folded.details = &fragment.details;
        }
        folded.digests.extend(fragment.digests.iter().copied());
        for sample in &fragment.samples {
            folded
                .samples
                .entry(sample.timestamp)
                .or_default()
                .add(&sample.counters);
        }
    }
    acc
}

fn group_by_key<'a>(
    fragments: impl Iterator<Item = &'a Fragment>,
) -> BTreeMap<&'a CompositeKey, Vec<&'a Fragment>> {
    let mut grouped: BTreeMap<&CompositeKey, Vec<&Fragment>> = BTreeMap::new();
    for fragment in fragments {
        grouped.entry(&fragment.key).or_default().push(fragment);
    }
    grouped
}

fn compress(details: &str) -> Result<Arc<[u8]>, StoreError> {
    if details.is_empty() {
        return Ok(Arc::from(Vec::new()));
    }
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    let failed = |err: std::io::Error| StoreError::Unavailable(format!("compress error details: {err}"));
    encoder.write_all(details.as_bytes()).map_err(failed)?;
    let compressed = encoder.finish().map_err(failed)?;
    Ok(Arc::from(compressed))
}

fn decompress(bytes: &[u8]) -> Result<String, StoreError> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    let mut details = String::new();
    DeflateDecoder::new(bytes)
        .read_to_string(&mut details)
        .map_err(|err| StoreError::Corrupt(format!("inflate error details: {err}")))?;
    Ok(details)
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("aggregate store lock poisoned".to_string())
}

/// In-process store: per-month partitions holding an arena of immutable sorted parts.
#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    partitions: RwLock<BTreeMap<u32, Vec<Arc<Part>>>>,
    next_seq: AtomicU64,
    compaction: Mutex<()>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored fragments, merged or not.
    pub fn fragment_count(&self) -> Result<usize, StoreError> {
        let partitions = self.partitions.read().map_err(|_| poisoned())?;
        Ok(partitions
            .values()
            .flatten()
            .map(|part| part.fragments.len())
            .sum())
    }

    fn insert_now(&self, records: &[MetricRecord]) -> Result<(), StoreError> {
        let mut by_partition: BTreeMap<u32, Vec<Fragment>> = BTreeMap::new();
        for record in records {
            let fragment = Fragment {
                key: record.key(),
                samples: vec![Sample {
                    timestamp: record.timestamp,
                    counters: record.counters(),
                }],
                details: compress(&record.error_details)?,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                digests: vec![record.digest()],
            };
            by_partition
                .entry(record.partition())
                .or_default()
                .push(fragment);
        }

        let parts: Vec<(u32, Arc<Part>)> = by_partition
            .into_iter()
            .filter_map(|(partition, fragments)| Part::new(fragments).map(|p| (partition, Arc::new(p))))
            .collect();
        let mut partitions = self.partitions.write().map_err(|_| poisoned())?;
        for (partition, part) in parts {
            partitions.entry(partition).or_default().push(part);
        }
        Ok(())
    }

    /// Folds every key matching `filter` from a snapshot of the parts and hands each result
    /// to `visit`. The partition lock is only held while taking the snapshot.
    fn scan<F>(&self, filter: &AggregateFilter, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(Folded<'_>) -> Result<(), StoreError>,
    {
        let (first, last) = filter.partition_span();
        let snapshot: Vec<Arc<Part>> = {
            let partitions = self.partitions.read().map_err(|_| poisoned())?;
            partitions
                .range(first..=last)
                .flat_map(|(_, parts)| parts.iter().cloned())
                .collect()
        };

        let (lower, upper) = filter.hour_span();
        let candidates = snapshot
            .iter()
            .filter(|part| part.overlaps(lower, upper))
            .flat_map(|part| part.candidates(filter))
            .filter(|fragment| filter.matches_key(&fragment.key))
            .filter(|fragment| {
                lower.map_or(true, |l| fragment.key.hour >= l)
                    && upper.map_or(true, |u| fragment.key.hour <= u)
            });

        for fragments in group_by_key(candidates).values() {
            if let Some(folded) = fold(fragments) {
                visit(folded)?;
            }
        }
        Ok(())
    }

    fn aggregate_now(&self, filter: &AggregateFilter) -> Result<Vec<AggregateRow>, StoreError> {
        let mut rows = Vec::new();
        self.scan(filter, |folded| {
            let mut counters = Counters::default();
            let mut latest = None;
            for (ts, sample) in in_range(&folded.samples, filter) {
                counters.add(sample);
                latest = Some(ts);
            }
            let Some(timestamp) = latest else {
                return Ok(());
            };
            rows.push(AggregateRow {
                key: folded.key.clone(),
                counters,
                timestamp,
                error_details: decompress(folded.details)?,
            });
            Ok(())
        })?;
        sort_rows(&mut rows);
        Ok(rows)
    }

    fn minute_totals_now(&self, filter: &AggregateFilter) -> Result<Vec<MinuteTotal>, StoreError> {
        let mut minutes: BTreeMap<DateTime<Utc>, Counters> = BTreeMap::new();
        self.scan(filter, |folded| {
            for (ts, sample) in in_range(&folded.samples, filter) {
                minutes.entry(minute_start(ts)).or_default().add(sample);
            }
            Ok(())
        })?;
        Ok(minutes
            .into_iter()
            .map(|(minute, counters)| MinuteTotal { minute, counters })
            .collect())
    }

    fn compact_now(&self) -> Result<CompactionReport, StoreError> {
        let _running = match self.compaction.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(CompactionReport::default()),
            Err(TryLockError::Poisoned(err)) => err.into_inner(),
        };

        let pending: Vec<(u32, Vec<Arc<Part>>)> = {
            let partitions = self.partitions.read().map_err(|_| poisoned())?;
            partitions
                .iter()
                .filter(|(_, parts)| parts.len() > 1)
                .map(|(partition, parts)| (*partition, parts.clone()))
                .collect()
        };

        let mut report = CompactionReport::default();
        for (partition, parts) in pending {
            let rows_before: usize = parts.iter().map(|part| part.fragments.len()).sum();
            let merged = merge_parts(&parts);
            let rows_after = merged.as_ref().map_or(0, |part| part.fragments.len());

            let mut partitions = self.partitions.write().map_err(|_| poisoned())?;
            let Some(current) = partitions.get_mut(&partition) else {
                continue;
            };
            let still_prefix = current.len() >= parts.len()
                && current.iter().zip(&parts).all(|(a, b)| Arc::ptr_eq(a, b));
            if !still_prefix {
                tracing::debug!(partition, "partition changed during compaction; skipping");
                continue;
            }
            let mut rebuilt: Vec<Arc<Part>> = merged.map(Arc::new).into_iter().collect();
            rebuilt.extend(current.drain(parts.len()..));
            *current = rebuilt;
            drop(partitions);

            report.partitions += 1;
            report.parts_merged += parts.len();
            report.rows_before += rows_before;
            report.rows_after += rows_after;
        }
        Ok(report)
    }
}

fn merge_parts(parts: &[Arc<Part>]) -> Option<Part> {
    let grouped = group_by_key(parts.iter().flat_map(|part| part.fragments.iter()));
    let fragments = grouped
        .values()
        .filter_map(|fragments| fold(fragments))
        .map(|folded| {
            let mut digests: Vec<u64> = folded.digests.into_iter().collect();
            digests.sort_unstable();
            Fragment {
                key: folded.key.clone(),
                samples: folded
                    .samples
                    .into_iter()
                    .map(|(timestamp, counters)| Sample {
                        timestamp,
                        counters,
                    })
                    .collect(),
                details: folded.details.clone(),
                seq: folded.seq,
                digests,
            }
        })
        .collect();
    Part::new(fragments)
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn insert(&self, records: &[MetricRecord]) -> Result<(), StoreError> {
        self.insert_now(records)
    }

    async fn aggregate(&self, filter: &AggregateFilter) -> Result<Vec<AggregateRow>, StoreError> {
        self.aggregate_now(filter)
    }

    async fn minute_totals(&self, filter: &AggregateFilter) -> Result<Vec<MinuteTotal>, StoreError> {
        self.minute_totals_now(filter)
    }

    async fn compact(&self) -> Result<CompactionReport, StoreError> {
        self.compact_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures;
    use std::ops::Bound;

    fn summary(rows: &[AggregateRow]) -> Vec<(CompositeKey, Counters, DateTime<Utc>)> {
        rows.iter()
            .map(|row| (row.key.clone(), row.counters, row.timestamp))
            .collect()
    }

    fn sample_records() -> Vec<MetricRecord> {
        vec![
            fixtures::counted(1, 10, "2024-01-01T10:05:00Z", 3, 0, 1),
            fixtures::counted(1, 10, "2024-01-01T10:40:00Z", 2, 1, 0),
            fixtures::counted(1, 10, "2024-01-01T11:00:00Z", 7, 0, 0),
            fixtures::counted(1, 11, "2024-01-01T10:10:00Z", 0, 0, 4),
            fixtures::counted(2, 10, "2024-01-01T10:10:00Z", 9, 9, 9),
            fixtures::counted(1, 10, "2024-02-03T08:00:00Z", 1, 0, 0),
        ]
    }

    #[tokio::test]
    async fn sums_rows_sharing_a_key() {
        let store = MemoryAggregateStore::new();
        store.insert(&sample_records()).await.unwrap();

        let rows = store
            .aggregate(&AggregateFilter::for_team(1).plugin(10))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0].counters,
            Counters {
                successes: 5,
                successes_on_retry: 1,
                failures: 1
            }
        );
        assert_eq!(rows[0].timestamp.to_rfc3339(), "2024-01-01T10:40:00+00:00");
        assert_eq!(rows[1].counters.successes, 7);
        assert_eq!(rows[2].key.hour.to_rfc3339(), "2024-02-03T08:00:00+00:00");
    }

    #[tokio::test]
    async fn aggregation_ignores_order_and_redelivery() {
        let records = sample_records();
        let forward = MemoryAggregateStore::new();
        forward.insert(&records).await.unwrap();

        let shuffled = MemoryAggregateStore::new();
        let mut reversed = records.clone();
        reversed.reverse();
        shuffled.insert(&reversed[..3]).await.unwrap();
        shuffled.insert(&records).await.unwrap();
        shuffled.insert(&reversed[3..]).await.unwrap();

        let filter = AggregateFilter::for_team(1);
        assert_eq!(
            summary(&forward.aggregate(&filter).await.unwrap()),
            summary(&shuffled.aggregate(&filter).await.unwrap())
        );
    }

    #[tokio::test]
    async fn compaction_preserves_results() {
        let store = MemoryAggregateStore::new();
        let records = sample_records();
        for record in &records {
            store.insert(std::slice::from_ref(record)).await.unwrap();
        }
        store.insert(&records[..2]).await.unwrap();
        let filter = AggregateFilter::for_team(1);
        let before = store.aggregate(&filter).await.unwrap();

        let report = store.compact().await.unwrap();
        // February only ever received one part.
        assert_eq!(report.partitions, 1);
        assert!(report.rows_after < report.rows_before);
        assert_eq!(store.aggregate(&filter).await.unwrap(), before);

        // Redelivery after compaction is still counted once.
        store.insert(&records).await.unwrap();
        assert_eq!(store.aggregate(&filter).await.unwrap(), before);
        store.compact().await.unwrap();
        assert_eq!(store.aggregate(&filter).await.unwrap(), before);
        assert_eq!(store.fragment_count().unwrap(), 5);
    }

    #[tokio::test]
    async fn keeps_latest_error_details() {
        let store = MemoryAggregateStore::new();
        let first = fixtures::error(1, 10, "2024-01-01T10:00:00Z", "TypeError", r#"{"n":1}"#);
        let mut second = first.clone();
        second.timestamp = first.timestamp + chrono::Duration::minutes(5);
        second.error_details = r#"{"n":2}"#.to_string();
        store.insert(&[first]).await.unwrap();
        store.insert(&[second]).await.unwrap();

        let rows = store.aggregate(&AggregateFilter::for_team(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].counters.failures, 2);
        assert_eq!(rows[0].error_details, r#"{"n":2}"#);

        store.compact().await.unwrap();
        let rows = store.aggregate(&AggregateFilter::for_team(1)).await.unwrap();
        assert_eq!(rows[0].error_details, r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn filters_by_time_and_job() {
        let store = MemoryAggregateStore::new();
        let mut job_row = fixtures::counted(1, 10, "2024-01-01T12:00:00Z", 4, 0, 0);
        job_row.job_id = "export".to_string();
        store.insert(&sample_records()).await.unwrap();
        store.insert(&[job_row]).await.unwrap();

        let from = DateTime::parse_from_rfc3339("2024-01-01T10:40:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let to = DateTime::parse_from_rfc3339("2024-01-31T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let rows = store
            .aggregate(
                &AggregateFilter::for_team(1)
                    .plugin(10)
                    .between(Bound::Excluded(from), Bound::Excluded(to)),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.timestamp > from));

        let rows = store
            .aggregate(&AggregateFilter::for_team(1).plugin(10).job(Some(String::new())))
            .await
            .unwrap();
        assert!(rows.iter().all(|row| row.key.job_id.is_empty()));
        assert_eq!(rows.len(), 3);

        let rows = store
            .aggregate(&AggregateFilter::for_team(1).job(Some("export".to_string())))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].counters.successes, 4);
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn bounds_apply_to_each_record_before_and_after_compaction() {
        let store = MemoryAggregateStore::new();
        store
            .insert(&[fixtures::counted(1, 10, "2024-01-01T10:05:00Z", 3, 0, 0)])
            .await
            .unwrap();
        store
            .insert(&[fixtures::counted(1, 10, "2024-01-01T10:40:00Z", 2, 0, 0)])
            .await
            .unwrap();
        let split = at("2024-01-01T10:30:00Z");
        let early = AggregateFilter::for_team(1).between(Bound::Unbounded, Bound::Excluded(split));
        let late = AggregateFilter::for_team(1).between(Bound::Included(split), Bound::Unbounded);

        for _ in 0..2 {
            let rows = store.aggregate(&early).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].counters.successes, 3);
            assert_eq!(rows[0].timestamp, at("2024-01-01T10:05:00Z"));

            let rows = store.aggregate(&late).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].counters.successes, 2);
            assert_eq!(rows[0].timestamp, at("2024-01-01T10:40:00Z"));

            store.compact().await.unwrap();
        }
        assert_eq!(store.fragment_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn minute_totals_sum_records_within_each_minute() {
        let store = MemoryAggregateStore::new();
        let records = vec![
            fixtures::counted(1, 10, "2024-01-01T10:05:10Z", 1, 0, 0),
            fixtures::counted(1, 10, "2024-01-01T10:05:50Z", 2, 0, 1),
            fixtures::counted(1, 11, "2024-01-01T10:40:00Z", 3, 0, 0),
            fixtures::counted(2, 10, "2024-01-01T10:40:00Z", 50, 0, 0),
        ];
        for record in &records {
            store.insert(std::slice::from_ref(record)).await.unwrap();
        }
        store.insert(&records[..1]).await.unwrap();

        let expected = vec![
            MinuteTotal {
                minute: at("2024-01-01T10:05:00Z"),
                counters: Counters {
                    successes: 3,
                    successes_on_retry: 0,
                    failures: 1,
                },
            },
            MinuteTotal {
                minute: at("2024-01-01T10:40:00Z"),
                counters: Counters {
                    successes: 3,
                    successes_on_retry: 0,
                    failures: 0,
                },
            },
        ];
        let filter = AggregateFilter::for_team(1);
        assert_eq!(store.minute_totals(&filter).await.unwrap(), expected);
        store.compact().await.unwrap();
        assert_eq!(store.minute_totals(&filter).await.unwrap(), expected);

        let bounded = filter.between(
            Bound::Included(at("2024-01-01T10:05:30Z")),
            Bound::Unbounded,
        );
        let totals = store.minute_totals(&bounded).await.unwrap();
        assert_eq!(totals[0].counters.successes, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_stay_consistent_during_compaction() {
        let store = Arc::new(MemoryAggregateStore::new());
        for minute in 0..60 {
            let ts = format!("2024-01-01T10:{minute:02}:00Z");
            store
                .insert(&[fixtures::counted(1, 10, &ts, 1, 0, 0)])
                .await
                .unwrap();
        }

        let compactor = {
            let store = store.clone();
            tokio::spawn(async move { store.compact().await })
        };
        for _ in 0..20 {
            let rows = store.aggregate(&AggregateFilter::for_team(1)).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].counters.successes, 60);
        }
        compactor.await.unwrap().unwrap();
        assert_eq!(store.fragment_count().unwrap(), 1);
    }
}
