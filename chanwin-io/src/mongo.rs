//! MongoDB source and sink.
//!
//! Input documents carry `Channel`, `Values`, `From`, `To`. Timestamps may be BSON dates or
//! strings in either RFC 3339 or the legacy `02-Jan-2006 15:04:05` layout. Output timestamps
//! are written as BSON dates (millisecond precision).

use async_trait::async_trait;
use chanwin_core::record::timestamp;
use chanwin_core::{
    BulkOutcome, ChannelCursor, ChannelRecord, DocumentSink, Error, ItemFailure, OutputDoc, RecordSource, Result,
    Sample,
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{FindOptions, InsertManyOptions};
use mongodb::{Client, Collection, Cursor, Database};
use tracing::{debug, info};

const NAMESPACE_EXISTS: i32 = 48;

pub struct MongoSource {
    collection: Collection<Document>,
    page_size: u32,
}

impl MongoSource {
    pub async fn connect(uri: &str, database: &str, collection: &str, page_size: u32) -> Result<Self> {
        let client = Client::with_uri_str(uri).await.map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        info!(database, collection, "connected to mongodb source");
        Ok(Self::from_collection(client.database(database).collection(collection), page_size))
    }

    pub fn from_collection(collection: Collection<Document>, page_size: u32) -> Self {
        Self { collection, page_size: page_size.max(1) }
    }
}

#[async_trait]
impl RecordSource for MongoSource {
    async fn open(&mut self, channel: u32) -> Result<Box<dyn ChannelCursor>> {
        let filter = doc! { "Channel": channel as i64 };
        let count = match self.collection.count_documents(filter.clone(), None).await {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(channel, error = %e, "count unavailable");
                None
            }
        };
        let options = FindOptions::builder().batch_size(self.page_size).build();
        let cursor = self
            .collection
            .find(filter, options)
            .await
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        Ok(Box::new(MongoCursor { count, cursor: Some(cursor) }))
    }
}

struct MongoCursor {
    count: Option<u64>,
    cursor: Option<Cursor<Document>>,
}

#[async_trait]
impl ChannelCursor for MongoCursor {
    fn count(&self) -> Option<u64> {
        self.count
    }

    async fn next(&mut self) -> Result<Option<ChannelRecord>> {
        let cursor = match self.cursor.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };
        match cursor.try_next().await {
            Ok(Some(doc)) => decode_record(&doc).map(Some),
            Ok(None) => {
                self.cursor = None;
                Ok(None)
            }
            Err(e) => Err(Error::SourceUnavailable(e.to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        // dropping the driver cursor kills it server-side
        self.cursor.take();
        Ok(())
    }
}

fn malformed(field: &str, got: Option<&Bson>) -> Error {
    Error::MalformedRecord(format!("field `{}`: unexpected {:?}", field, got))
}

fn integer(field: &str, b: Option<&Bson>) -> Result<i64> {
    match b {
        Some(Bson::Int32(v)) => Ok(*v as i64),
        Some(Bson::Int64(v)) => Ok(*v),
        other => Err(malformed(field, other)),
    }
}

fn time(field: &str, b: Option<&Bson>) -> Result<DateTime<Utc>> {
    let parsed = match b {
        Some(Bson::DateTime(dt)) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis()),
        Some(Bson::String(s)) => timestamp::parse(s),
        _ => None,
    };
    parsed.ok_or_else(|| malformed(field, b))
}

/// Strict decode; numbers must be integers that fit their target type.
pub fn decode_record(doc: &Document) -> Result<ChannelRecord> {
    let channel = integer("Channel", doc.get("Channel"))?;
    let channel = u32::try_from(channel).map_err(|_| malformed("Channel", doc.get("Channel")))?;
    let values = match doc.get("Values") {
        Some(Bson::Array(items)) => items
            .iter()
            .map(|b| {
                integer("Values", Some(b))
                    .and_then(|v| Sample::try_from(v).map_err(|_| malformed("Values", Some(b))))
            })
            .collect::<Result<Vec<Sample>>>()?,
        Some(Bson::Null) => Vec::new(),
        other => return Err(malformed("Values", other)),
    };
    let record = ChannelRecord::new(channel, values, time("From", doc.get("From"))?, time("To", doc.get("To"))?);
    record.validate()?;
    Ok(record)
}

fn bson_time(t: DateTime<Utc>) -> mongodb::bson::DateTime {
    mongodb::bson::DateTime::from_millis(t.timestamp_millis())
}

pub fn encode_doc(doc: &OutputDoc) -> Document {
    let mut d = Document::new();
    d.insert("Channel", doc.channel() as i64);
    match doc {
        OutputDoc::Raw(r) => d.insert("Values", r.values.clone()),
        OutputDoc::Window(w) => d.insert("Values", w.values.clone()),
        OutputDoc::Reduced(r) => d.insert("Value", r.value),
        OutputDoc::Downsampled(s) => d.insert("Values", s.values.clone()),
    };
    d.insert("From", bson_time(doc.start()));
    d.insert("To", bson_time(doc.end()));
    d
}

pub struct MongoSink {
    db: Database,
    name: String,
    collection: Collection<Document>,
}

impl MongoSink {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await.map_err(|e| Error::SinkBatchFailed(e.to_string()))?;
        info!(database, collection, "connected to mongodb sink");
        Ok(Self::from_database(client.database(database), collection))
    }

    pub fn from_database(db: Database, collection: &str) -> Self {
        Self { collection: db.collection(collection), db, name: collection.to_string() }
    }
}

#[async_trait]
impl DocumentSink for MongoSink {
    fn collection(&self) -> &str {
        &self.name
    }

    async fn ensure_collection(&mut self) -> Result<bool> {
        let names = self
            .db
            .list_collection_names(None)
            .await
            .map_err(|e| Error::SinkBatchFailed(e.to_string()))?;
        if names.iter().any(|n| n == &self.name) {
            return Ok(false);
        }
        match self.db.create_collection(&self.name, None).await {
            Ok(()) => Ok(true),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::Command(c) if c.code == NAMESPACE_EXISTS => Ok(false),
                _ => Err(Error::SinkBatchFailed(e.to_string())),
            },
        }
    }

    async fn insert_one(&mut self, doc: &OutputDoc) -> Result<()> {
        self.collection
            .insert_one(encode_doc(doc), None)
            .await
            .map(|_| ())
            .map_err(|e| Error::SinkWriteFailed(e.to_string()))
    }

    async fn insert_many_unordered(&mut self, docs: &[OutputDoc]) -> Result<BulkOutcome> {
        if docs.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let n = docs.len();
        let options = InsertManyOptions::builder().ordered(false).build();
        match self.collection.insert_many(docs.iter().map(encode_doc), options).await {
            Ok(res) => Ok(BulkOutcome::all_inserted(res.inserted_ids.len())),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::BulkWrite(failure) if failure.write_concern_error.is_none() => {
                    let failed: Vec<ItemFailure> = failure
                        .write_errors
                        .iter()
                        .flatten()
                        .map(|w| ItemFailure { index: w.index, message: w.message.clone() })
                        .collect();
                    Ok(BulkOutcome { inserted: n.saturating_sub(failed.len()), failed })
                }
                _ => Err(Error::SinkBatchFailed(e.to_string())),
            },
        }
    }
}
