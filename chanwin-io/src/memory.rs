use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chanwin_core::{BulkOutcome, ChannelCursor, ChannelRecord, DocumentSink, OutputDoc, RecordSource, Result};
use parking_lot::Mutex;

#[derive(Default)]
struct Inner {
    records: Vec<ChannelRecord>,
    collections: HashMap<String, Vec<serde_json::Value>>,
}

/// Shared in-process store. Clones share the same data, so a test can hand a source and a
/// sink to a pipeline and inspect the written collection afterwards.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn with_records(records: Vec<ChannelRecord>) -> Self {
        let store = Self::default();
        store.inner.lock().records = records;
        store
    }

    pub fn push_record(&self, record: ChannelRecord) {
        self.inner.lock().records.push(record);
    }

    pub fn source(&self, page_size: usize) -> MemorySource {
        MemorySource { store: self.clone(), page_size: page_size.max(1) }
    }

    pub fn sink(&self, collection: impl Into<String>) -> MemorySink {
        MemorySink { store: self.clone(), collection: collection.into() }
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.inner.lock().collections.contains_key(name)
    }

    /// Documents written to `collection`, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<serde_json::Value> {
        self.inner.lock().collections.get(collection).cloned().unwrap_or_default()
    }
}

/// Pages through the store's records for one channel at a time.
pub struct MemorySource {
    store: MemoryStore,
    page_size: usize,
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn open(&mut self, channel: u32) -> Result<Box<dyn ChannelCursor>> {
        let total = self.store.inner.lock().records.iter().filter(|r| r.channel == channel).count() as u64;
        Ok(Box::new(MemoryCursor {
            store: self.store.clone(),
            channel,
            page_size: self.page_size,
            pos: 0,
            page: VecDeque::new(),
            total,
            done: false,
        }))
    }
}

struct MemoryCursor {
    store: MemoryStore,
    channel: u32,
    page_size: usize,
    pos: usize,
    page: VecDeque<ChannelRecord>,
    /// Matching records when the cursor was opened. Advisory only.
    total: u64,
    done: bool,
}

impl MemoryCursor {
    fn fetch_page(&mut self) {
        let inner = self.store.inner.lock();
        while self.pos < inner.records.len() && self.page.len() < self.page_size {
            let r = &inner.records[self.pos];
            self.pos += 1;
            if r.channel == self.channel {
                self.page.push_back(r.clone());
            }
        }
        if self.page.is_empty() {
            self.done = true;
        }
    }
}

#[async_trait]
impl ChannelCursor for MemoryCursor {
    fn count(&self) -> Option<u64> {
        Some(self.total)
    }

    async fn next(&mut self) -> Result<Option<ChannelRecord>> {
        if self.page.is_empty() && !self.done {
            self.fetch_page();
        }
        Ok(self.page.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.page.clear();
        self.done = true;
        Ok(())
    }
}

pub struct MemorySink {
    store: MemoryStore,
    collection: String,
}

#[async_trait]
impl DocumentSink for MemorySink {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn ensure_collection(&mut self) -> Result<bool> {
        let mut inner = self.store.inner.lock();
        if inner.collections.contains_key(&self.collection) {
            return Ok(false);
        }
        inner.collections.insert(self.collection.clone(), Vec::new());
        Ok(true)
    }

    async fn insert_one(&mut self, doc: &OutputDoc) -> Result<()> {
        let value = doc.to_json()?;
        self.store.inner.lock().collections.entry(self.collection.clone()).or_default().push(value);
        Ok(())
    }

    async fn insert_many_unordered(&mut self, docs: &[OutputDoc]) -> Result<BulkOutcome> {
        let values = docs.iter().map(|d| d.to_json()).collect::<Result<Vec<_>>>()?;
        self.store.inner.lock().collections.entry(self.collection.clone()).or_default().extend(values);
        Ok(BulkOutcome::all_inserted(docs.len()))
    }
}
