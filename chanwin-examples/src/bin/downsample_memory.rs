//! Downsamples synthetic channel data held in memory and prints the result.
//! Run:
//!   cargo run -p chanwin-examples --bin downsample_memory

use std::time::Duration;

use anyhow::Result;
use chanwin_core::{BatchWriter, ChannelRecord, Pipeline, WriteMode};
use chanwin_io::MemoryStore;
use chanwin_ops::{Downsample, RemainderPolicy};
use chrono::{DateTime, Utc};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let start = DateTime::<Utc>::from_timestamp(1_609_599_845, 0).unwrap_or_default();
    let store = MemoryStore::default();
    for channel in [1, 6, 11] {
        for second in 0..4 {
            let from = start + chrono::Duration::seconds(second);
            let values = (0..12).map(|i| -50 - ((channel as i32 * 7 + i) % 30)).collect();
            store.push_record(ChannelRecord::new(channel, values, from, from + chrono::Duration::seconds(1)));
        }
    }

    let writer = BatchWriter::new(Box::new(store.sink("downsampled")), WriteMode::Single, 1, Duration::from_secs(5));
    let op = Downsample::new(4, RemainderPolicy::Drop)?;
    Pipeline::new(Box::new(store.source(2)), Box::new(op), writer, 1..=11).run().await?;

    for doc in store.documents("downsampled") {
        println!("{}", doc);
    }
    Ok(())
}
