//! Mean of every 5-sample window per channel, written to `<out_dir>/wifi_reduced.jsonl`.
//! Run:
//!   cargo run -p chanwin-examples --bin reduce_jsonl -- chanwin-examples/demos/wifi.jsonl /tmp/chanwin-out
//! Input JSONL fields: Channel (1..=24), Values (integers), From, To (RFC3339 or 02-Jan-2006 15:04:05)

use std::time::Duration;

use anyhow::Result;
use chanwin_core::{BatchWriter, Pipeline, WriteMode};
use chanwin_io::{JsonlSource, JsonlStore};
use chanwin_ops::{RemainderPolicy, SplitReduce};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let input = std::env::args().nth(1).unwrap_or_else(|| {
        let p = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join("wifi.jsonl");
        p.to_string_lossy().to_string()
    });
    let out_dir = std::env::args().nth(2).unwrap_or_else(|| "chanwin-out".into());

    let sink = JsonlStore::new(&out_dir, "wifi_reduced");
    println!("writing {}", sink.path().display());
    let writer = BatchWriter::new(Box::new(sink), WriteMode::BatchUnordered, 10, Duration::from_secs(1000));
    let op = SplitReduce::new(5, RemainderPolicy::Emit)?;

    let report = Pipeline::new(Box::new(JsonlSource::new(input)), Box::new(op), writer, 1..=24).run().await?;
    println!("{} documents in {} batches", report.writes.written, report.writes.batches);
    Ok(())
}
