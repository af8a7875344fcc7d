//! chanwin-core: data model, collaborator traits, batch writer and the pipeline executor.
//!
//! A run has a fixed shape:
//! - a `RecordSource` opens one `ChannelCursor` per channel
//! - an `Operator` turns each `ChannelRecord` into zero or more `OutputDoc`s
//! - a `BatchWriter` hands them to a `DocumentSink`, one at a time or in unordered batches
//!
//! Quick example:
//! ```no_run
//! use chanwin_core::prelude::*;
//! # struct MySource; struct MySink; struct MyOp;
//! # #[async_trait::async_trait]
//! # impl RecordSource for MySource {
//! #     async fn open(&mut self, _channel: u32) -> Result<Box<dyn ChannelCursor>> { unimplemented!() }
//! # }
//! # #[async_trait::async_trait]
//! # impl DocumentSink for MySink {
//! #     fn collection(&self) -> &str { "out" }
//! #     async fn ensure_collection(&mut self) -> Result<bool> { Ok(false) }
//! #     async fn insert_one(&mut self, _doc: &OutputDoc) -> Result<()> { Ok(()) }
//! #     async fn insert_many_unordered(&mut self, docs: &[OutputDoc]) -> Result<BulkOutcome> { Ok(BulkOutcome::all_inserted(docs.len())) }
//! # }
//! # impl Operator for MyOp {
//! #     fn name(&self) -> &'static str { "MyOp" }
//! #     fn on_record(&mut self, r: ChannelRecord, out: &mut Vec<OutputDoc>) -> Result<()> { out.push(r.into()); Ok(()) }
//! # }
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let writer = BatchWriter::new(Box::new(MySink), WriteMode::BatchUnordered, 10, std::time::Duration::from_secs(1000));
//! let report = Pipeline::new(Box::new(MySource), Box::new(MyOp), writer, 1..=24).run().await?;
//! println!("{} channels", report.channels.len());
//! # Ok(()) }
//! ```

use chrono::{DateTime, Utc};

pub mod config;
pub mod executor;
pub mod metrics;
pub mod progress;
pub mod record;
pub mod writer;

pub use executor::{ChannelOutcome, ChannelReport, Pipeline, RunReport, Stage};
pub use record::{ChannelRecord, ChannelWindow, DownsampledRecord, OutputDoc, ReducedChannelWindow, Sample};
pub use writer::{BatchWriter, WriteMode, WriteStats};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("empty window on channel {channel} at {from}")]
    EmptyWindow { channel: u32, from: DateTime<Utc> },
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("sink write failed: {0}")]
    SinkWriteFailed(String),
    #[error("sink batch failed: {0}")]
    SinkBatchFailed(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Only a batch-level sink failure ends the whole run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Error::SinkBatchFailed(_))
    }

    /// Computation errors are skipped where they are detected.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Error::MalformedRecord(_) | Error::EmptyWindow { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read side: a queryable collection of channel records.
#[async_trait::async_trait]
pub trait RecordSource: Send {
    /// Issue a query filtered by `channel`.
    async fn open(&mut self, channel: u32) -> Result<Box<dyn ChannelCursor>>;
}

/// Paged, stateful handle over one channel's records.
#[async_trait::async_trait]
pub trait ChannelCursor: Send {
    /// Best-effort total for progress reporting. Never used to bound iteration.
    fn count(&self) -> Option<u64>;
    /// `Ok(None)` is the only end-of-data signal. `Err(MalformedRecord)` skips one record;
    /// the cursor stays usable.
    async fn next(&mut self) -> Result<Option<ChannelRecord>>;
    /// Release server-side resources.
    async fn close(&mut self) -> Result<()>;
}

/// Write side: one destination collection in a document store.
#[async_trait::async_trait]
pub trait DocumentSink: Send {
    fn collection(&self) -> &str;
    /// Create the collection if absent. Returns `true` when it was created.
    async fn ensure_collection(&mut self) -> Result<bool>;
    async fn insert_one(&mut self, doc: &OutputDoc) -> Result<()>;
    /// Per-item failures go in the outcome; `Err` means the whole call failed.
    async fn insert_many_unordered(&mut self, docs: &[OutputDoc]) -> Result<BulkOutcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub inserted: usize,
    pub failed: Vec<ItemFailure>,
}

impl BulkOutcome {
    pub fn all_inserted(n: usize) -> Self {
        Self { inserted: n, failed: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Position within the submitted batch.
    pub index: usize,
    pub message: String,
}

/// Pure record transformation. Never suspends.
pub trait Operator: Send {
    fn name(&self) -> &'static str;
    fn on_record(&mut self, record: ChannelRecord, out: &mut Vec<OutputDoc>) -> Result<()>;
}

pub mod prelude {
    pub use super::{
        BatchWriter, BulkOutcome, ChannelCursor, ChannelRecord, ChannelWindow, DocumentSink, DownsampledRecord,
        Error, ItemFailure, Operator, OutputDoc, Pipeline, RecordSource, ReducedChannelWindow, Result, RunReport,
        WriteMode,
    };
}
