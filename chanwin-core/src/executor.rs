use std::ops::RangeInclusive;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::metrics::{CHANNELS_ABANDONED, OP_THROUGHPUT, SOURCE_RECORDS};
use crate::progress::Stopwatch;
use crate::writer::{BatchWriter, WriteStats};
use crate::{ChannelCursor, Error, Operator, OutputDoc, RecordSource, Result};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    PerChannel(u32),
    Draining(u32),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// The cursor signalled end-of-data.
    Exhausted,
    /// Remaining records were skipped after a channel-level failure.
    Abandoned { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel: u32,
    pub records_read: u64,
    pub records_skipped: u64,
    pub docs_emitted: u64,
    pub outcome: ChannelOutcome,
}

impl ChannelReport {
    fn new(channel: u32) -> Self {
        Self { channel, records_read: 0, records_skipped: 0, docs_emitted: 0, outcome: ChannelOutcome::Exhausted }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub channels: Vec<ChannelReport>,
    pub writes: WriteStats,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn abandoned(&self) -> impl Iterator<Item = &ChannelReport> {
        self.channels.iter().filter(|c| matches!(c.outcome, ChannelOutcome::Abandoned { .. }))
    }
}

/// Sequential read -> transform -> write loop over a fixed channel range.
///
/// Channels are processed one after another, records one at a time. Every opened cursor is
/// closed exactly once whether the channel drains, is abandoned, or the run fails.
pub struct Pipeline {
    source: Box<dyn RecordSource>,
    operator: Box<dyn Operator>,
    writer: BatchWriter,
    channels: RangeInclusive<u32>,
    stage: Stage,
    clock: Stopwatch,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn RecordSource>,
        operator: Box<dyn Operator>,
        writer: BatchWriter,
        channels: RangeInclusive<u32>,
    ) -> Self {
        let clock = Stopwatch::start();
        Self { source, operator, writer: writer.with_clock(clock), channels, stage: Stage::Init, clock }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn transition(&mut self, next: Stage) {
        debug!(from = ?self.stage, to = ?next, "stage");
        self.stage = next;
    }

    /// Runs every channel. `Err` is returned only for run-fatal failures; channel-level
    /// failures are recorded in the report.
    pub async fn run(mut self) -> Result<RunReport> {
        self.clock = Stopwatch::start();
        self.transition(Stage::Init);
        self.writer.ensure_collection().await?;
        info!(
            collection = self.writer.collection(),
            operator = self.operator.name(),
            mode = ?self.writer.mode(),
            first = self.channels.start(),
            last = self.channels.end(),
            "pipeline started"
        );

        let mut reports = Vec::new();
        for channel in self.channels.clone() {
            self.transition(Stage::PerChannel(channel));
            match self.run_channel(channel).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(channel, error = %e, elapsed = %self.clock.hms(), "run aborted");
                    return Err(e);
                }
            }
        }

        self.transition(Stage::Done);
        if let Err(e) = self.writer.flush().await {
            error!(error = %e, elapsed = %self.clock.hms(), "run aborted");
            return Err(e);
        }
        let report = RunReport { channels: reports, writes: self.writer.stats(), elapsed: self.clock.elapsed() };
        info!(
            written = report.writes.written,
            item_failures = report.writes.item_failures,
            abandoned = report.abandoned().count(),
            "elapsed {}",
            self.clock.hms()
        );
        Ok(report)
    }

    async fn run_channel(&mut self, channel: u32) -> Result<ChannelReport> {
        let mut report = ChannelReport::new(channel);
        let mut cursor = match self.source.open(channel).await {
            Ok(c) => c,
            Err(e) => {
                warn!(channel, error = %e, "cannot open cursor, skipping channel");
                CHANNELS_ABANDONED.inc();
                report.outcome = ChannelOutcome::Abandoned { reason: source_failure(e).to_string() };
                return Ok(report);
            }
        };
        match cursor.count() {
            Some(count) => info!(channel, count, "ready to split and save data"),
            None => info!(channel, "ready to split and save data"),
        }

        self.transition(Stage::Draining(channel));
        let drained = self.drain(channel, cursor.as_mut(), &mut report).await;
        if let Err(e) = cursor.close().await {
            warn!(channel, error = %e, "cursor close failed");
        }

        match drained {
            Ok(()) => {
                info!(
                    channel,
                    records = report.records_read,
                    docs = report.docs_emitted,
                    elapsed = %self.clock.hms(),
                    "split and saved data from channel"
                );
                Ok(report)
            }
            Err(e) if e.is_run_fatal() => Err(e),
            Err(e) => {
                warn!(channel, records = report.records_read, error = %e, "abandoning rest of channel");
                CHANNELS_ABANDONED.inc();
                report.outcome = ChannelOutcome::Abandoned { reason: e.to_string() };
                Ok(report)
            }
        }
    }

    async fn drain(&mut self, channel: u32, cursor: &mut dyn ChannelCursor, report: &mut ChannelReport) -> Result<()> {
        let mut out: Vec<OutputDoc> = Vec::new();
        loop {
            let record = match cursor.next().await {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(()),
                Err(e) if e.is_skippable() => {
                    SOURCE_RECORDS.with_label_values(&["skipped"]).inc();
                    warn!(channel, error = %e, "skipping undecodable record");
                    report.records_skipped += 1;
                    continue;
                }
                Err(e) => return Err(source_failure(e)),
            };
            SOURCE_RECORDS.with_label_values(&["read"]).inc();
            let index = report.records_read;
            report.records_read += 1;

            out.clear();
            if let Err(e) = self.operator.on_record(record, &mut out) {
                if e.is_skippable() {
                    warn!(channel, index, error = %e, "skipping record");
                    report.records_skipped += 1;
                    continue;
                }
                return Err(e);
            }
            OP_THROUGHPUT.with_label_values(&[self.operator.name(), "emit"]).inc_by(out.len() as u64);

            for doc in out.drain(..) {
                self.writer.write(doc).await?;
                report.docs_emitted += 1;
            }
            debug!(channel, index, "saved data from channel");
        }
    }
}

fn source_failure(e: Error) -> Error {
    match e {
        Error::SourceUnavailable(_) => e,
        other => Error::SourceUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::WriteMode;
    use crate::{BulkOutcome, ChannelRecord, DocumentSink};
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    enum Item {
        Record(ChannelRecord),
        Malformed,
        Broken,
    }

    struct FakeSource {
        data: HashMap<u32, Vec<Item>>,
        unavailable: Vec<u32>,
        advertised: Option<u64>,
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    struct FakeCursor {
        items: VecDeque<Item>,
        advertised: Option<u64>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl RecordSource for FakeSource {
        async fn open(&mut self, channel: u32) -> Result<Box<dyn ChannelCursor>> {
            if self.unavailable.contains(&channel) {
                return Err(Error::Anyhow(anyhow::anyhow!("connection refused")));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let items = self.data.remove(&channel).unwrap_or_default();
            Ok(Box::new(FakeCursor { items: items.into(), advertised: self.advertised, closed: self.closed.clone() }))
        }
    }

    #[async_trait::async_trait]
    impl ChannelCursor for FakeCursor {
        fn count(&self) -> Option<u64> {
            self.advertised
        }
        async fn next(&mut self) -> Result<Option<ChannelRecord>> {
            match self.items.pop_front() {
                None => Ok(None),
                Some(Item::Record(r)) => Ok(Some(r)),
                Some(Item::Malformed) => Err(Error::MalformedRecord("Values is not an array".into())),
                Some(Item::Broken) => Err(Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))),
            }
        }
        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct SinkLog {
        attempts: Vec<(u32, i32)>,
        bulk_calls: usize,
    }

    struct FakeSink {
        log: Arc<Mutex<SinkLog>>,
        /// (channel, first sample) of the insert that fails.
        fail_on: Option<(u32, i32)>,
        bulk_transport_failure: bool,
    }

    fn key(doc: &OutputDoc) -> (u32, i32) {
        match doc {
            OutputDoc::Raw(r) => (r.channel, r.values.first().copied().unwrap_or(-1)),
            other => (other.channel(), -1),
        }
    }

    #[async_trait::async_trait]
    impl DocumentSink for FakeSink {
        fn collection(&self) -> &str {
            "fake"
        }
        async fn ensure_collection(&mut self) -> Result<bool> {
            Ok(false)
        }
        async fn insert_one(&mut self, doc: &OutputDoc) -> Result<()> {
            let k = key(doc);
            self.log.lock().attempts.push(k);
            if self.fail_on == Some(k) {
                return Err(Error::Anyhow(anyhow::anyhow!("write concern error")));
            }
            Ok(())
        }
        async fn insert_many_unordered(&mut self, docs: &[OutputDoc]) -> Result<BulkOutcome> {
            let mut log = self.log.lock();
            log.bulk_calls += 1;
            log.attempts.extend(docs.iter().map(key));
            if self.bulk_transport_failure {
                return Err(Error::Anyhow(anyhow::anyhow!("server selection timeout")));
            }
            Ok(BulkOutcome::all_inserted(docs.len()))
        }
    }

    struct PassThrough;

    impl Operator for PassThrough {
        fn name(&self) -> &'static str {
            "PassThrough"
        }
        fn on_record(&mut self, record: ChannelRecord, out: &mut Vec<OutputDoc>) -> Result<()> {
            if record.values.is_empty() {
                return Err(Error::MalformedRecord("no samples".into()));
            }
            out.push(record.into());
            Ok(())
        }
    }

    fn rec(channel: u32, n: i32) -> Item {
        let from = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + ChronoDuration::seconds(n as i64);
        Item::Record(ChannelRecord::new(channel, vec![n], from, from + ChronoDuration::seconds(1)))
    }

    struct Harness {
        pipeline: Pipeline,
        log: Arc<Mutex<SinkLog>>,
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    fn harness(
        data: HashMap<u32, Vec<Item>>,
        channels: RangeInclusive<u32>,
        mode: WriteMode,
        fail_on: Option<(u32, i32)>,
        bulk_transport_failure: bool,
    ) -> Harness {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            data,
            unavailable: vec![],
            advertised: None,
            opened: opened.clone(),
            closed: closed.clone(),
        };
        let sink = FakeSink { log: log.clone(), fail_on, bulk_transport_failure };
        let writer = BatchWriter::new(Box::new(sink), mode, 10, Duration::from_secs(5));
        let pipeline = Pipeline::new(Box::new(source), Box::new(PassThrough), writer, channels);
        Harness { pipeline, log, opened, closed }
    }

    #[tokio::test]
    async fn single_write_failure_abandons_only_that_channel() {
        let mut data = HashMap::new();
        data.insert(3, (1..=10).map(|n| rec(3, n)).collect());
        data.insert(4, (1..=2).map(|n| rec(4, n)).collect());
        let h = harness(data, 3..=4, WriteMode::Single, Some((3, 5)), false);
        assert_eq!(h.pipeline.stage(), Stage::Init);

        let report = h.pipeline.run().await.unwrap();

        let attempts = h.log.lock().attempts.clone();
        assert_eq!(attempts, vec![(3, 1), (3, 2), (3, 3), (3, 4), (3, 5), (4, 1), (4, 2)]);
        assert!(matches!(report.channels[0].outcome, ChannelOutcome::Abandoned { .. }));
        assert_eq!(report.channels[0].records_read, 5);
        assert_eq!(report.channels[1].outcome, ChannelOutcome::Exhausted);
        assert_eq!(report.writes.written, 6);
        assert_eq!(h.opened.load(Ordering::SeqCst), 2);
        assert_eq!(h.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_remainder_is_flushed_after_last_channel() {
        let mut data = HashMap::new();
        data.insert(1, (1..=7).map(|n| rec(1, n)).collect());
        data.insert(2, (1..=6).map(|n| rec(2, n)).collect());
        let h = harness(data, 1..=2, WriteMode::BatchUnordered, None, false);

        let report = h.pipeline.run().await.unwrap();

        let log = h.log.lock();
        assert_eq!(log.bulk_calls, 2);
        assert_eq!(log.attempts.len(), 13);
        assert_eq!(report.writes, WriteStats { written: 13, item_failures: 0, batches: 2 });
        assert_eq!(h.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_transport_failure_aborts_run_and_closes_cursor() {
        let mut data = HashMap::new();
        data.insert(1, (1..=12).map(|n| rec(1, n)).collect());
        data.insert(2, (1..=3).map(|n| rec(2, n)).collect());
        let h = harness(data, 1..=2, WriteMode::BatchUnordered, None, true);

        let err = h.pipeline.run().await.unwrap_err();

        assert!(matches!(err, Error::SinkBatchFailed(_)));
        assert_eq!(h.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.log.lock().bulk_calls, 1);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_and_read_errors_abandon_channel() {
        let mut data = HashMap::new();
        data.insert(
            1,
            vec![
                rec(1, 1),
                Item::Malformed,
                Item::Record(ChannelRecord::new(
                    1,
                    vec![],
                    DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
                    DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
                )),
                rec(1, 2),
            ],
        );
        data.insert(2, vec![rec(2, 1), Item::Broken, rec(2, 2)]);
        data.insert(3, vec![rec(3, 1)]);
        let h = harness(data, 1..=3, WriteMode::Single, None, false);

        let report = h.pipeline.run().await.unwrap();

        assert_eq!(report.channels[0].outcome, ChannelOutcome::Exhausted);
        assert_eq!(report.channels[0].records_skipped, 2);
        assert_eq!(report.channels[0].docs_emitted, 2);
        match &report.channels[1].outcome {
            ChannelOutcome::Abandoned { reason } => assert!(reason.contains("source unavailable")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.channels[2].docs_emitted, 1);
        assert_eq!(h.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unavailable_channel_is_skipped() {
        let mut data = HashMap::new();
        data.insert(2, vec![rec(2, 1)]);
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let closed = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            data,
            unavailable: vec![1],
            advertised: None,
            opened: Arc::new(AtomicUsize::new(0)),
            closed: closed.clone(),
        };
        let sink = FakeSink { log: log.clone(), fail_on: None, bulk_transport_failure: false };
        let writer = BatchWriter::new(Box::new(sink), WriteMode::Single, 10, Duration::from_secs(5));
        let report = Pipeline::new(Box::new(source), Box::new(PassThrough), writer, 1..=2).run().await.unwrap();

        assert_eq!(report.abandoned().count(), 1);
        assert_eq!(report.channels[1].docs_emitted, 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_count_does_not_bound_iteration() {
        let mut data = HashMap::new();
        data.insert(1, (1..=3).map(|n| rec(1, n)).collect());
        let source = FakeSource {
            data,
            unavailable: vec![],
            advertised: Some(1),
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        };
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = FakeSink { log: log.clone(), fail_on: None, bulk_transport_failure: false };
        let writer = BatchWriter::new(Box::new(sink), WriteMode::Single, 10, Duration::from_secs(5));
        let report = Pipeline::new(Box::new(source), Box::new(PassThrough), writer, 1..=1).run().await.unwrap();

        assert_eq!(report.channels[0].records_read, 3);
        assert_eq!(log.lock().attempts.len(), 3);
    }
}
