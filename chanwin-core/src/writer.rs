use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::metrics::{BATCHES_FLUSHED, BUFFERED_DOCS, DOCS_WRITTEN, SINK_WRITE_LATENCY_MS};
use crate::progress::Stopwatch;
use crate::{DocumentSink, Error, OutputDoc, Result};

/// How documents reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteMode {
    /// One insert per document; a failure abandons the current channel.
    #[default]
    #[serde(rename = "single")]
    Single,
    /// Buffered unordered bulk inserts; item failures are logged, a failed call ends the run.
    #[serde(rename = "batch", alias = "batch_unordered", alias = "batch-unordered")]
    BatchUnordered,
}

impl WriteMode {
    fn label(&self) -> &'static str {
        match self {
            WriteMode::Single => "single",
            WriteMode::BatchUnordered => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub written: u64,
    pub item_failures: u64,
    pub batches: u64,
}

/// Buffers operator output and hands it to a `DocumentSink`.
///
/// Flushes are size-triggered (`batch_size` reached) or explicit (`flush`, called by the
/// executor once the source is drained). There is no time-based flush.
pub struct BatchWriter {
    sink: Box<dyn DocumentSink>,
    mode: WriteMode,
    batch_size: usize,
    timeout: Duration,
    buffer: Vec<OutputDoc>,
    stats: WriteStats,
    clock: Stopwatch,
}

impl BatchWriter {
    pub fn new(sink: Box<dyn DocumentSink>, mode: WriteMode, batch_size: usize, timeout: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            mode,
            batch_size,
            timeout,
            buffer: Vec::with_capacity(batch_size),
            stats: WriteStats::default(),
            clock: Stopwatch::start(),
        }
    }

    /// Report elapsed time relative to an externally started clock.
    pub fn with_clock(mut self, clock: Stopwatch) -> Self {
        self.clock = clock;
        self
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    pub fn collection(&self) -> &str {
        self.sink.collection()
    }

    pub async fn ensure_collection(&mut self) -> Result<bool> {
        let created = self.sink.ensure_collection().await?;
        if created {
            info!(collection = self.sink.collection(), "collection created");
        }
        Ok(created)
    }

    pub async fn write(&mut self, doc: OutputDoc) -> Result<()> {
        match self.mode {
            WriteMode::Single => self.write_one(doc).await,
            WriteMode::BatchUnordered => {
                self.buffer.push(doc);
                BUFFERED_DOCS.set(self.buffer.len() as i64);
                if self.buffer.len() >= self.batch_size {
                    self.flush().await?;
                }
                Ok(())
            }
        }
    }

    async fn write_one(&mut self, doc: OutputDoc) -> Result<()> {
        let started = Instant::now();
        let res = tokio::time::timeout(self.timeout, self.sink.insert_one(&doc)).await;
        SINK_WRITE_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
        match res {
            Err(_) => {
                DOCS_WRITTEN.with_label_values(&[self.mode.label(), "failed"]).inc();
                error!(channel = doc.channel(), timeout = ?self.timeout, "insert timed out");
                Err(Error::SinkBatchFailed(format!("insert timed out after {:?}", self.timeout)))
            }
            Ok(Err(e)) => {
                DOCS_WRITTEN.with_label_values(&[self.mode.label(), "failed"]).inc();
                Err(Error::SinkWriteFailed(format!("channel {} at {}: {}", doc.channel(), doc.start(), e)))
            }
            Ok(Ok(())) => {
                self.stats.written += 1;
                DOCS_WRITTEN.with_label_values(&[self.mode.label(), "ok"]).inc();
                debug!(channel = doc.channel(), from = %doc.start(), "document saved");
                Ok(())
            }
        }
    }

    /// Push the buffered remainder, if any, as one unordered bulk insert.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        BUFFERED_DOCS.set(0);
        self.stats.batches += 1;
        let index = self.stats.batches;

        let started = Instant::now();
        let res = tokio::time::timeout(self.timeout, self.sink.insert_many_unordered(&batch)).await;
        SINK_WRITE_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
        let outcome = match res {
            Err(_) => {
                DOCS_WRITTEN.with_label_values(&[self.mode.label(), "failed"]).inc_by(batch.len() as u64);
                error!(batch = index, docs = batch.len(), timeout = ?self.timeout, "bulk insert timed out");
                return Err(Error::SinkBatchFailed(format!(
                    "batch {} timed out after {:?}",
                    index, self.timeout
                )));
            }
            Ok(Err(e)) => {
                DOCS_WRITTEN.with_label_values(&[self.mode.label(), "failed"]).inc_by(batch.len() as u64);
                error!(batch = index, docs = batch.len(), error = %e, "error in batch creation");
                return Err(Error::SinkBatchFailed(format!("batch {}: {}", index, e)));
            }
            Ok(Ok(outcome)) => outcome,
        };

        for failure in &outcome.failed {
            warn!(
                batch = index,
                item = failure.index,
                channel = batch.get(failure.index).map(|d| d.channel()),
                error = %failure.message,
                "document not saved"
            );
        }
        self.stats.written += outcome.inserted as u64;
        self.stats.item_failures += outcome.failed.len() as u64;
        DOCS_WRITTEN.with_label_values(&[self.mode.label(), "ok"]).inc_by(outcome.inserted as u64);
        DOCS_WRITTEN
            .with_label_values(&[self.mode.label(), "failed"])
            .inc_by(outcome.failed.len() as u64);
        BATCHES_FLUSHED.inc();
        info!(
            batch = index,
            docs = batch.len(),
            failed = outcome.failed.len(),
            elapsed = %self.clock.hms(),
            "batch documents inserted"
        );
        Ok(())
    }
}
