//! chanwin-io: record sources and document sinks.
//! - `JsonlSource`: one JSON record per line, streamed per channel
//! - `JsonDirSource`: a directory of JSON array files, read one file at a time
//! - `JsonlStore`: a document store keeping each collection as `<dir>/<collection>.jsonl`
//! - `MemoryStore`: in-process source and sink
//! - `mongo` (feature `mongodb`): MongoDB cursor source and sink

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chanwin_core::config::{SinkConfig, SourceConfig};
use chanwin_core::metrics::BYTES_WRITTEN;
use chanwin_core::{
    BulkOutcome, ChannelCursor, ChannelRecord, DocumentSink, Error, ItemFailure, OutputDoc, RecordSource, Result,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::debug;

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

pub use memory::{MemorySink, MemorySource, MemoryStore};
#[cfg(feature = "mongodb")]
pub use mongo::{MongoSink, MongoSource};

fn channel_of(v: &serde_json::Value) -> Option<u32> {
    v.get("Channel")
        .and_then(|c| c.as_u64())
        .and_then(|c| u32::try_from(c).ok())
        .filter(|&c| c >= 1)
}

/// Keeps documents for `channel`. Documents that belong to no channel are kept only by the
/// cursor that reports them, so decoding flags each one once per run.
fn wanted(v: &serde_json::Value, channel: u32, reports_unattributed: bool) -> bool {
    channel_of(v).map_or(reports_unattributed, |c| c == channel)
}

fn unavailable(path: &Path, e: std::io::Error) -> Error {
    Error::SourceUnavailable(format!("{}: {}", path.display(), e))
}

/// The first channel a source is opened for also reports input that belongs to no channel.
fn claim_reporting(reporter: &mut Option<u32>, channel: u32) -> bool {
    *reporter.get_or_insert(channel) == channel
}

/// Reads `ChannelRecord`s from a JSON-lines file.
pub struct JsonlSource {
    pub path: PathBuf,
    reporter: Option<u32>,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), reporter: None }
    }
}

#[async_trait]
impl RecordSource for JsonlSource {
    async fn open(&mut self, channel: u32) -> Result<Box<dyn ChannelCursor>> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| unavailable(&self.path, e))?;
        Ok(Box::new(JsonlCursor {
            channel,
            path: self.path.clone(),
            reader: Some(tokio::io::BufReader::new(file)),
            buf: Vec::new(),
            line_no: 0,
            reports_unattributed: claim_reporting(&mut self.reporter, channel),
        }))
    }
}

struct JsonlCursor {
    channel: u32,
    path: PathBuf,
    reader: Option<tokio::io::BufReader<tokio::fs::File>>,
    buf: Vec<u8>,
    line_no: usize,
    reports_unattributed: bool,
}

impl JsonlCursor {
    fn malformed(&self, e: impl std::fmt::Display) -> Error {
        Error::MalformedRecord(format!("{}:{}: {}", self.path.display(), self.line_no, e))
    }
}

#[async_trait]
impl ChannelCursor for JsonlCursor {
    fn count(&self) -> Option<u64> {
        None
    }

    async fn next(&mut self) -> Result<Option<ChannelRecord>> {
        loop {
            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => return Ok(None),
            };
            self.buf.clear();
            // raw bytes so a line that is not UTF-8 decodes as a malformed record
            let n = reader.read_until(b'\n', &mut self.buf).await.map_err(|e| unavailable(&self.path, e))?;
            if n == 0 {
                self.reader = None;
                return Ok(None);
            }
            self.line_no += 1;
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let v: serde_json::Value = match serde_json::from_slice(&self.buf) {
                Ok(v) => v,
                Err(e) if self.reports_unattributed => return Err(self.malformed(e)),
                Err(_) => continue,
            };
            if !wanted(&v, self.channel, self.reports_unattributed) {
                continue;
            }
            return ChannelRecord::from_json(v).map(Some).map_err(|e| self.malformed(e));
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Reads a directory of `*.json` files, each holding a JSON array of records.
///
/// Files are visited in name order and only one file is held in memory at a time.
pub struct JsonDirSource {
    pub dir: PathBuf,
    reporter: Option<u32>,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), reporter: None }
    }
}

#[async_trait]
impl RecordSource for JsonDirSource {
    async fn open(&mut self, channel: u32) -> Result<Box<dyn ChannelCursor>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| unavailable(&self.dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| unavailable(&self.dir, e))? {
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        debug!(channel, files = files.len(), dir = %self.dir.display(), "opened json directory");
        Ok(Box::new(JsonDirCursor {
            channel,
            files: files.into(),
            pending: VecDeque::new(),
            reports_unattributed: claim_reporting(&mut self.reporter, channel),
        }))
    }
}

struct JsonDirCursor {
    channel: u32,
    files: VecDeque<PathBuf>,
    pending: VecDeque<serde_json::Value>,
    reports_unattributed: bool,
}

#[async_trait]
impl ChannelCursor for JsonDirCursor {
    fn count(&self) -> Option<u64> {
        None
    }

    async fn next(&mut self) -> Result<Option<ChannelRecord>> {
        loop {
            if let Some(v) = self.pending.pop_front() {
                return ChannelRecord::from_json(v).map(Some);
            }
            let path = match self.files.pop_front() {
                Some(path) => path,
                None => return Ok(None),
            };
            let bytes = tokio::fs::read(&path).await.map_err(|e| unavailable(&path, e))?;
            let docs: Vec<serde_json::Value> = match serde_json::from_slice(&bytes) {
                Ok(docs) => docs,
                Err(e) if self.reports_unattributed => {
                    return Err(Error::MalformedRecord(format!("{}: {}", path.display(), e)))
                }
                Err(_) => continue,
            };
            let (channel, reports) = (self.channel, self.reports_unattributed);
            self.pending = docs.into_iter().filter(|v| wanted(v, channel, reports)).collect();
            debug!(channel = self.channel, file = %path.display(), records = self.pending.len(), "loaded file");
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.files.clear();
        self.pending.clear();
        Ok(())
    }
}

/// Document store keeping each collection as a JSON-lines file.
pub struct JsonlStore {
    dir: PathBuf,
    collection: String,
    file: Option<tokio::fs::File>,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self { dir: dir.into(), collection: collection.into(), file: None }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", self.collection))
    }

    async fn handle(&mut self) -> Result<&mut tokio::fs::File> {
        let file = match self.file.take() {
            Some(f) => f,
            None => {
                tokio::fs::create_dir_all(&self.dir).await?;
                tokio::fs::OpenOptions::new().create(true).append(true).open(self.path()).await?
            }
        };
        Ok(self.file.insert(file))
    }

    async fn append(&mut self, text: &str) -> Result<()> {
        let f = self.handle().await?;
        f.write_all(text.as_bytes()).await?;
        f.flush().await?;
        BYTES_WRITTEN.with_label_values(&["JsonlStore"]).inc_by(text.len() as u64);
        Ok(())
    }
}

#[async_trait]
impl DocumentSink for JsonlStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn ensure_collection(&mut self) -> Result<bool> {
        let existed = tokio::fs::try_exists(self.path()).await?;
        self.handle().await?;
        Ok(!existed)
    }

    async fn insert_one(&mut self, doc: &OutputDoc) -> Result<()> {
        let mut line = serde_json::to_string(doc)?;
        line.push('\n');
        self.append(&line).await
    }

    async fn insert_many_unordered(&mut self, docs: &[OutputDoc]) -> Result<BulkOutcome> {
        let mut buf = String::new();
        let mut outcome = BulkOutcome::default();
        for (index, doc) in docs.iter().enumerate() {
            match serde_json::to_string(doc) {
                Ok(line) => {
                    buf.push_str(&line);
                    buf.push('\n');
                    outcome.inserted += 1;
                }
                Err(e) => outcome.failed.push(ItemFailure { index, message: e.to_string() }),
            }
        }
        self.append(&buf).await?;
        Ok(outcome)
    }
}

/// Builds the source named by `[source]`.
pub async fn build_source(cfg: &SourceConfig) -> anyhow::Result<Box<dyn RecordSource>> {
    match cfg.kind.as_str() {
        "jsonl" => {
            let path = cfg.path.clone().ok_or_else(|| anyhow::anyhow!("source.path is required"))?;
            Ok(Box::new(JsonlSource::new(path)))
        }
        "json_dir" => {
            let path = cfg.path.clone().ok_or_else(|| anyhow::anyhow!("source.path is required"))?;
            Ok(Box::new(JsonDirSource::new(path)))
        }
        #[cfg(feature = "mongodb")]
        "mongo" => {
            let (uri, db, coll) = match (&cfg.uri, &cfg.database, &cfg.collection) {
                (Some(u), Some(d), Some(c)) => (u, d, c),
                _ => anyhow::bail!("source.uri, source.database and source.collection are required"),
            };
            Ok(Box::new(MongoSource::connect(uri, db, coll, cfg.page_size).await?))
        }
        #[cfg(not(feature = "mongodb"))]
        "mongo" => anyhow::bail!("this build has no MongoDB support (enable the `mongodb` feature)"),
        other => anyhow::bail!("unsupported source kind: {}", other),
    }
}

/// Builds the sink named by `[sink]`.
pub async fn build_sink(cfg: &SinkConfig) -> anyhow::Result<Box<dyn DocumentSink>> {
    match cfg.kind.as_str() {
        "jsonl_dir" => {
            let dir = cfg.out_dir.clone().ok_or_else(|| anyhow::anyhow!("sink.out_dir is required"))?;
            Ok(Box::new(JsonlStore::new(dir, cfg.collection.clone())))
        }
        #[cfg(feature = "mongodb")]
        "mongo" => {
            let (uri, db) = match (&cfg.uri, &cfg.database) {
                (Some(u), Some(d)) => (u, d),
                _ => anyhow::bail!("sink.uri and sink.database are required"),
            };
            Ok(Box::new(MongoSink::connect(uri, db, &cfg.collection).await?))
        }
        #[cfg(not(feature = "mongodb"))]
        "mongo" => anyhow::bail!("this build has no MongoDB support (enable the `mongodb` feature)"),
        other => anyhow::bail!("unsupported sink kind: {}", other),
    }
}
