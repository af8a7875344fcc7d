//! chanwin-ops: window splitting, reduction and the pipeline operators built on them.
//!
//! Included operators:
//! - `Transfer`: copies each record verbatim
//! - `Split`: one document per fixed-size window
//! - `SplitReduce`: one mean per window
//! - `Downsample`: one document per record holding every window's mean

use chanwin_core::config::{TransformConfig, TransformMode};
use chanwin_core::metrics::OP_THROUGHPUT;
use chanwin_core::{ChannelRecord, Error, Operator, OutputDoc, Result};
use tracing::{instrument, warn};

pub mod reduce;
pub mod window;
pub use reduce::{downsample, mean, reduce};
pub use window::{split, RemainderPolicy, WindowSplitter};

/// Copies records through unchanged.
///
/// Example
/// ```no_run
/// use chanwin_ops::Transfer;
/// let op = Transfer;
/// # let _ = op;
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct Transfer;

impl Operator for Transfer {
    fn name(&self) -> &'static str {
        "Transfer"
    }

    #[instrument(name = "transfer_on_record", skip_all)]
    fn on_record(&mut self, record: ChannelRecord, out: &mut Vec<OutputDoc>) -> Result<()> {
        OP_THROUGHPUT.with_label_values(&["Transfer", "receive"]).inc();
        record.validate()?;
        out.push(record.into());
        Ok(())
    }
}

/// Emits each window as its own document.
///
/// Example
/// ```no_run
/// use chanwin_ops::{RemainderPolicy, Split};
/// let op = Split::new(100, RemainderPolicy::Emit).unwrap();
/// # let _ = op;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Split {
    splitter: WindowSplitter,
}

impl Split {
    pub fn new(size: usize, remainder: RemainderPolicy) -> Result<Self> {
        Ok(Self { splitter: WindowSplitter::new(size, remainder)? })
    }
}

impl Operator for Split {
    fn name(&self) -> &'static str {
        "Split"
    }

    #[instrument(name = "split_on_record", skip_all)]
    fn on_record(&mut self, record: ChannelRecord, out: &mut Vec<OutputDoc>) -> Result<()> {
        OP_THROUGHPUT.with_label_values(&["Split", "receive"]).inc();
        out.extend(self.splitter.split(&record)?.into_iter().map(OutputDoc::from));
        Ok(())
    }
}

/// Emits the mean of each window.
#[derive(Debug, Clone, Copy)]
pub struct SplitReduce {
    splitter: WindowSplitter,
}

impl SplitReduce {
    pub fn new(size: usize, remainder: RemainderPolicy) -> Result<Self> {
        Ok(Self { splitter: WindowSplitter::new(size, remainder)? })
    }
}

impl Operator for SplitReduce {
    fn name(&self) -> &'static str {
        "SplitReduce"
    }

    #[instrument(name = "split_reduce_on_record", skip_all)]
    fn on_record(&mut self, record: ChannelRecord, out: &mut Vec<OutputDoc>) -> Result<()> {
        OP_THROUGHPUT.with_label_values(&["SplitReduce", "receive"]).inc();
        for w in self.splitter.split(&record)? {
            match reduce(&w) {
                Ok(r) => out.push(r.into()),
                Err(e @ Error::EmptyWindow { .. }) => warn!(error = %e, "skipping window"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Emits one document per record with the per-window means as its values.
#[derive(Debug, Clone, Copy)]
pub struct Downsample {
    splitter: WindowSplitter,
}

impl Downsample {
    pub fn new(size: usize, remainder: RemainderPolicy) -> Result<Self> {
        Ok(Self { splitter: WindowSplitter::new(size, remainder)? })
    }
}

impl Operator for Downsample {
    fn name(&self) -> &'static str {
        "Downsample"
    }

    #[instrument(name = "downsample_on_record", skip_all)]
    fn on_record(&mut self, record: ChannelRecord, out: &mut Vec<OutputDoc>) -> Result<()> {
        OP_THROUGHPUT.with_label_values(&["Downsample", "receive"]).inc();
        out.push(downsample(&record, &self.splitter)?.into());
        Ok(())
    }
}

/// Builds the operator named by `[transform]`.
pub fn from_config(cfg: &TransformConfig) -> Result<Box<dyn Operator>> {
    Ok(match cfg.mode {
        TransformMode::Transfer => Box::new(Transfer),
        TransformMode::Split => Box::new(Split::new(cfg.window_size, cfg.remainder)?),
        TransformMode::Reduce => Box::new(SplitReduce::new(cfg.window_size, cfg.remainder)?),
        TransformMode::Downsample => Box::new(Downsample::new(cfg.window_size, cfg.remainder)?),
    })
}

pub mod prelude {
    pub use super::{from_config, Downsample, RemainderPolicy, Split, SplitReduce, Transfer, WindowSplitter};
}
