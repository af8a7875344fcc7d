use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single signal reading.
pub type Sample = i32;

/// One unit of input: a channel's samples, uniformly spaced across `[from, to)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelRecord {
    pub channel: u32,
    /// `null` decodes as no samples.
    #[serde(deserialize_with = "nullable_values")]
    pub values: Vec<Sample>,
    #[serde(with = "timestamp")]
    pub from: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub to: DateTime<Utc>,
}

fn nullable_values<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Vec<Sample>, D::Error> {
    Ok(Option::<Vec<Sample>>::deserialize(d)?.unwrap_or_default())
}

impl ChannelRecord {
    pub fn new(channel: u32, values: Vec<Sample>, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { channel, values, from, to }
    }

    /// Strict decode from a loosely-typed document. Any shape mismatch is a
    /// `MalformedRecord`; unknown fields (`_id`, `_key`, ...) are ignored.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let record: ChannelRecord =
            serde_json::from_value(value).map_err(|e| Error::MalformedRecord(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel == 0 {
            return Err(Error::MalformedRecord("channel must be >= 1".into()));
        }
        if self.to < self.from {
            return Err(Error::MalformedRecord(format!(
                "channel {}: `To` ({}) precedes `From` ({})",
                self.channel, self.to, self.from
            )));
        }
        self.span_nanos().map(|_| ())
    }

    /// Total covered time in nanoseconds.
    pub fn span_nanos(&self) -> Result<i64> {
        (self.to - self.from).num_nanoseconds().ok_or_else(|| {
            Error::MalformedRecord(format!("channel {}: time range too wide", self.channel))
        })
    }

    /// Time between consecutive samples, `None` when there are no samples.
    pub fn sample_interval(&self) -> Option<Duration> {
        if self.values.is_empty() {
            return None;
        }
        let span = self.span_nanos().ok()?;
        Some(Duration::nanoseconds(span / self.values.len() as i64))
    }

    /// Absolute time of sample index `offset` (which may equal `len` for the end bound).
    ///
    /// Computed as `from + span * offset / len` so consecutive bounds never drift.
    pub fn time_at(&self, span_nanos: i64, offset: usize) -> DateTime<Utc> {
        let len = self.values.len() as i128;
        if len == 0 {
            return self.from;
        }
        let nanos = (span_nanos as i128) * (offset as i128) / len;
        self.from + Duration::nanoseconds(nanos as i64)
    }
}

/// Contiguous sub-sequence of a record's samples with derived time bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelWindow {
    pub channel: u32,
    pub values: Vec<Sample>,
    #[serde(with = "timestamp")]
    pub from: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub to: DateTime<Utc>,
    /// Index of the first sample within the parent record.
    #[serde(skip)]
    pub offset: usize,
}

/// A window collapsed to its mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReducedChannelWindow {
    pub channel: u32,
    pub value: f64,
    #[serde(with = "timestamp")]
    pub from: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub to: DateTime<Utc>,
}

/// A whole record with each window replaced by its mean; keeps the record's bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DownsampledRecord {
    pub channel: u32,
    pub values: Vec<f64>,
    #[serde(with = "timestamp")]
    pub from: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub to: DateTime<Utc>,
}

/// Anything an operator hands to the writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutputDoc {
    Raw(ChannelRecord),
    Window(ChannelWindow),
    Reduced(ReducedChannelWindow),
    Downsampled(DownsampledRecord),
}

impl OutputDoc {
    pub fn channel(&self) -> u32 {
        match self {
            OutputDoc::Raw(r) => r.channel,
            OutputDoc::Window(w) => w.channel,
            OutputDoc::Reduced(r) => r.channel,
            OutputDoc::Downsampled(d) => d.channel,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        match self {
            OutputDoc::Raw(r) => r.from,
            OutputDoc::Window(w) => w.from,
            OutputDoc::Reduced(r) => r.from,
            OutputDoc::Downsampled(d) => d.from,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        match self {
            OutputDoc::Raw(r) => r.to,
            OutputDoc::Window(w) => w.to,
            OutputDoc::Reduced(r) => r.to,
            OutputDoc::Downsampled(d) => d.to,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl From<ChannelRecord> for OutputDoc {
    fn from(r: ChannelRecord) -> Self {
        OutputDoc::Raw(r)
    }
}

impl From<ChannelWindow> for OutputDoc {
    fn from(w: ChannelWindow) -> Self {
        OutputDoc::Window(w)
    }
}

impl From<ReducedChannelWindow> for OutputDoc {
    fn from(r: ReducedChannelWindow) -> Self {
        OutputDoc::Reduced(r)
    }
}

impl From<DownsampledRecord> for OutputDoc {
    fn from(d: DownsampledRecord) -> Self {
        OutputDoc::Downsampled(d)
    }
}

/// `From`/`To` encoding: RFC 3339 on output; RFC 3339 or `02-Jan-2006 15:04:05` (UTC) on input.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const LEGACY_FORMAT: &str = "%d-%b-%Y %H:%M:%S";

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Some(t.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, LEGACY_FORMAT)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp `{}`", s)))
    }
}
