use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use crate::writer::WriteMode;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub kind: String, // "jsonl" | "json_dir" | "mongo"
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    /// Cursor page size hint for paged backends.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SinkConfig {
    pub kind: String, // "jsonl_dir" | "mongo"
    #[serde(default)]
    pub out_dir: Option<PathBuf>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    pub collection: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    /// Copy records verbatim.
    #[default]
    Transfer,
    /// One document per window.
    Split,
    /// One mean per window.
    Reduce,
    /// One document per record holding every window's mean.
    Downsample,
}

/// What to do with trailing samples that do not fill a whole window.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// Emit a shorter final window.
    #[default]
    Emit,
    /// Discard the trailing samples.
    Drop,
    /// Fail the record with `MalformedRecord`.
    Reject,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransformConfig {
    #[serde(default)]
    pub mode: TransformMode,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default)]
    pub remainder: RemainderPolicy,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self { mode: TransformMode::default(), window_size: default_window_size(), remainder: RemainderPolicy::default() }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct ChannelRange {
    pub first: u32,
    pub last: u32,
}

impl ChannelRange {
    pub fn range(&self) -> RangeInclusive<u32> {
        self.first..=self.last
    }
}

impl Default for ChannelRange {
    fn default() -> Self {
        Self { first: 1, last: 24 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WriteConfig {
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bound on a single sink call, e.g. "1000s".
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl WriteConfig {
    pub fn timeout(&self) -> anyhow::Result<Duration> {
        let ms = parse_duration_ms(&self.timeout)?;
        if ms <= 0 {
            anyhow::bail!("write.timeout must be positive, got {}", self.timeout);
        }
        Ok(Duration::from_millis(ms as u64))
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self { mode: WriteMode::default(), batch_size: default_batch_size(), timeout: default_timeout() }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub channels: ChannelRange,
    #[serde(default)]
    pub write: WriteConfig,
}

fn default_page_size() -> u32 {
    1_000
}

fn default_window_size() -> usize {
    1
}

fn default_batch_size() -> usize {
    10
}

fn default_timeout() -> String {
    "1000s".into()
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.source.kind.as_str() {
            "jsonl" | "json_dir" => {
                if self.source.path.is_none() {
                    anyhow::bail!("source.path must be set for source kind {}", self.source.kind);
                }
            }
            "mongo" => {
                if self.source.uri.is_none() || self.source.database.is_none() || self.source.collection.is_none() {
                    anyhow::bail!("source.uri, source.database and source.collection must be set for mongo");
                }
            }
            other => anyhow::bail!("unsupported source kind: {}", other),
        }
        match self.sink.kind.as_str() {
            "jsonl_dir" => {
                if self.sink.out_dir.is_none() {
                    anyhow::bail!("sink.out_dir must be set for sink kind jsonl_dir");
                }
            }
            "mongo" => {
                if self.sink.uri.is_none() || self.sink.database.is_none() {
                    anyhow::bail!("sink.uri and sink.database must be set for mongo");
                }
            }
            other => anyhow::bail!("unsupported sink kind: {}", other),
        }
        if self.sink.collection.trim().is_empty() {
            anyhow::bail!("sink.collection must not be empty");
        }
        if self.transform.window_size == 0 {
            anyhow::bail!("transform.window_size must be >= 1");
        }
        if self.write.batch_size == 0 {
            anyhow::bail!("write.batch_size must be >= 1");
        }
        if self.channels.first == 0 || self.channels.first > self.channels.last {
            anyhow::bail!(
                "channels must be a non-empty range starting at 1 or above, got {}..={}",
                self.channels.first,
                self.channels.last
            );
        }
        self.write.timeout()?;
        Ok(())
    }
}

pub fn parse_duration_ms(s: &str) -> anyhow::Result<i64> {
    // "10s", "500ms", "2m", "1h"
    let s = s.trim();
    let (num, scale) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000)
    } else {
        // bare numbers are seconds
        (s, 1_000)
    };
    num.trim()
        .parse::<i64>()?
        .checked_mul(scale)
        .ok_or_else(|| anyhow::anyhow!("duration out of range: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [source]
        kind = "jsonl"
        path = "data/channels.jsonl"

        [sink]
        kind = "jsonl_dir"
        out_dir = "out"
        collection = "channel_info_list_averaged_from_1_to_100"

        [transform]
        mode = "reduce"
        window_size = 100
        remainder = "drop"

        [channels]
        first = 17
        last = 24

        [write]
        mode = "batch"
        batch_size = 25
        timeout = "30s"
    "#;

    #[test]
    fn parses_full_pipeline() {
        let cfg: PipelineConfig = toml::from_str(FULL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.transform.mode, TransformMode::Reduce);
        assert_eq!(cfg.transform.remainder, RemainderPolicy::Drop);
        assert_eq!(cfg.channels.range(), 17..=24);
        assert_eq!(cfg.write.mode, WriteMode::BatchUnordered);
        assert_eq!(cfg.write.batch_size, 25);
        assert_eq!(cfg.write.timeout().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn minimal_pipeline_gets_defaults() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            [source]
            kind = "json_dir"
            path = "json"
            [sink]
            kind = "jsonl_dir"
            out_dir = "out"
            collection = "coll_wifi_vis"
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.transform.mode, TransformMode::Transfer);
        assert_eq!(cfg.transform.window_size, 1);
        assert_eq!(cfg.channels.range(), 1..=24);
        assert_eq!(cfg.write.mode, WriteMode::Single);
        assert_eq!(cfg.write.batch_size, 10);
        assert_eq!(cfg.write.timeout().unwrap(), Duration::from_secs(1000));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg: PipelineConfig = toml::from_str(FULL).unwrap();
        cfg.transform.window_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg: PipelineConfig = toml::from_str(FULL).unwrap();
        cfg.channels = ChannelRange { first: 5, last: 4 };
        assert!(cfg.validate().is_err());

        let mut cfg: PipelineConfig = toml::from_str(FULL).unwrap();
        cfg.source.kind = "csv".into();
        assert!(cfg.validate().is_err());

        let mut cfg: PipelineConfig = toml::from_str(FULL).unwrap();
        cfg.write.batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg: PipelineConfig = toml::from_str(FULL).unwrap();
        cfg.sink.kind = "mongo".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("10s").unwrap(), 10_000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("7").unwrap(), 7_000);
        assert!(parse_duration_ms("soon").is_err());
        assert!(parse_duration_ms("9300000000000000s").is_err());
        assert!(parse_duration_ms("9223372036854775807h").is_err());
    }

    #[test]
    fn overflowing_timeout_fails_validation() {
        let mut cfg: PipelineConfig = toml::from_str(FULL).unwrap();
        cfg.write.timeout = "9300000000000000s".into();
        assert!(cfg.validate().is_err());
    }
}
