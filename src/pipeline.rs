use crate::ingest::Ingestor;
use crate::record::RawMessage;
use anyhow::Result;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// `A` is the stream's acknowledgement token, handed back once the message is committed.
#[derive(Debug)]
pub enum BatchCommand<A> {
    Message(RawMessage, A),
    Flush(oneshot::Sender<()>),
}

pub struct PipelineHandle<A> {
    tx: mpsc::Sender<BatchCommand<A>>,
    stats: Arc<IngestStats>,
}

impl<A> Clone for PipelineHandle<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<A: Send + 'static> PipelineHandle<A> {
    pub fn new(tx: mpsc::Sender<BatchCommand<A>>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn enqueue(&self, message: RawMessage, ack: A) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, topic = %message.source.topic, "queued message");
        if self
            .tx
            .send(BatchCommand::Message(message, ack))
            .await
            .is_err()
        {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            anyhow::bail!("batch worker stopped");
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BatchCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub committed_total: AtomicU64,
    pub dead_lettered_total: AtomicU64,
    pub store_failures_total: AtomicU64,
    pub stream_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            committed_total: AtomicU64::new(0),
            dead_lettered_total: AtomicU64::new(0),
            store_failures_total: AtomicU64::new(0),
            stream_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_stream_connected(&self, connected: bool) {
        self.stream_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn log_status(&self) {
        tracing::info!(
            queue_depth = self.queue_depth.load(Ordering::Relaxed),
            last_batch_len = self.last_batch_len.load(Ordering::Relaxed),
            average_flush_micros = self.average_flush_micros.load(Ordering::Relaxed),
            inflight_flushes = self.inflight_flushes.load(Ordering::Relaxed),
            committed = self.committed_total.load(Ordering::Relaxed),
            dead_lettered = self.dead_lettered_total.load(Ordering::Relaxed),
            store_failures = self.store_failures_total.load(Ordering::Relaxed),
            connected = self.stream_connected.load(Ordering::Relaxed),
            last_error = self.last_error().as_deref().unwrap_or(""),
            "ingest status"
        );
    }
}

/// Buffers messages and hands them to the ingestor in batches. Acknowledgement tokens are
/// released only after the batch is committed; a failed batch stays buffered for the next
/// flush.
pub fn spawn_worker<A: Send + 'static>(
    ingestor: Ingestor,
    mut rx: mpsc::Receiver<BatchCommand<A>>,
    batch_size: usize,
    flush_interval: Duration,
    ack_tx: Option<mpsc::UnboundedSender<A>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stats = ingestor.stats();
        let mut buffer: Vec<(RawMessage, A)> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + flush_interval,
            flush_interval,
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = flush(&ingestor, &mut buffer, &stats, ack_tx.as_ref()).await {
                        tracing::warn!(error=%err, "flush on interval failed");
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Message(message, ack)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push((message, ack));
                            if buffer.len() >= batch_size {
                                if let Err(err) = flush(&ingestor, &mut buffer, &stats, ack_tx.as_ref()).await {
                                    tracing::warn!(error=%err, "flush on batch size failed");
                                }
                            }
                        }
                        Some(BatchCommand::Flush(done)) => {
                            if let Err(err) = flush(&ingestor, &mut buffer, &stats, ack_tx.as_ref()).await {
                                tracing::warn!(error=%err, "flush on demand failed");
                            }
                            let _ = done.send(());
                        }
                        None => {
                            if let Err(err) = flush(&ingestor, &mut buffer, &stats, ack_tx.as_ref()).await {
                                tracing::warn!(error=%err, dropped = buffer.len(), "flush during shutdown failed; messages stay unacknowledged");
                            }
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn flush<A>(
    ingestor: &Ingestor,
    buffer: &mut Vec<(RawMessage, A)>,
    stats: &Arc<IngestStats>,
    ack_tx: Option<&mpsc::UnboundedSender<A>>,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
    let (messages, acks): (Vec<RawMessage>, Vec<A>) = std::mem::take(buffer).into_iter().unzip();
    let len = messages.len();

    let result = ingestor.consume_batch(&messages).await;
    stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok(outcomes) => {
            let dead_lettered = outcomes.len() - outcomes.iter().filter(|o| o.is_committed()).count();
            if let Some(ack_tx) = ack_tx {
                for ack in acks {
                    let _ = ack_tx.send(ack);
                }
            }

            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(len, dead_lettered, micros, "flushed metrics batch");
        }
        Err(err) => {
            stats.record_error(err.to_string());
            tracing::error!(error=%err, len, "failed to commit metrics batch");
            buffer.extend(messages.into_iter().zip(acks));
            return Err(err.into());
        }
    }

    Ok(())
}
