use chanwin_core::{ChannelRecord, ChannelWindow, Error, Result};

pub use chanwin_core::config::RemainderPolicy;

/// Partitions a record's samples into consecutive fixed-size windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSplitter {
    size: usize,
    remainder: RemainderPolicy,
}

impl WindowSplitter {
    pub fn new(size: usize, remainder: RemainderPolicy) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("window size must be >= 1".into()));
        }
        Ok(Self { size, remainder })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn remainder(&self) -> RemainderPolicy {
        self.remainder
    }

    /// Window `i` covers samples `[i*size, (i+1)*size)` and the matching slice of
    /// `[record.from, record.to)`. Consecutive windows share their boundary instant.
    pub fn split(&self, record: &ChannelRecord) -> Result<Vec<ChannelWindow>> {
        let len = record.values.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        record.validate()?;
        let span = record.span_nanos()?;

        let rem = len % self.size;
        let usable = if rem == 0 {
            len
        } else {
            match self.remainder {
                RemainderPolicy::Emit => len,
                RemainderPolicy::Drop => len - rem,
                RemainderPolicy::Reject => {
                    return Err(Error::MalformedRecord(format!(
                        "channel {}: {} samples do not divide into windows of {}",
                        record.channel, len, self.size
                    )))
                }
            }
        };

        Ok(record.values[..usable]
            .chunks(self.size)
            .enumerate()
            .map(|(i, chunk)| {
                let offset = i * self.size;
                ChannelWindow {
                    channel: record.channel,
                    values: chunk.to_vec(),
                    from: record.time_at(span, offset),
                    to: record.time_at(span, offset + chunk.len()),
                    offset,
                }
            })
            .collect())
    }
}

/// One-shot form of [`WindowSplitter::split`].
pub fn split(record: &ChannelRecord, size: usize, remainder: RemainderPolicy) -> Result<Vec<ChannelWindow>> {
    WindowSplitter::new(size, remainder)?.split(record)
}
