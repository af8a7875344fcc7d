use chanwin_core::{ChannelRecord, ChannelWindow, DownsampledRecord, Error, ReducedChannelWindow, Result, Sample};

use crate::window::WindowSplitter;

/// Arithmetic mean with an `i64` accumulator; `None` for an empty slice.
pub fn mean(values: &[Sample]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: i64 = values.iter().map(|&v| v as i64).sum();
    Some(sum as f64 / values.len() as f64)
}

/// Collapses a window to its mean, keeping its channel and bounds.
pub fn reduce(window: &ChannelWindow) -> Result<ReducedChannelWindow> {
    let value = mean(&window.values).ok_or(Error::EmptyWindow { channel: window.channel, from: window.from })?;
    Ok(ReducedChannelWindow { channel: window.channel, value, from: window.from, to: window.to })
}

/// Replaces every window of `record` with its mean, keeping the record's bounds.
pub fn downsample(record: &ChannelRecord, splitter: &WindowSplitter) -> Result<DownsampledRecord> {
    let values = splitter
        .split(record)?
        .iter()
        .map(|w| reduce(w).map(|r| r.value))
        .collect::<Result<Vec<f64>>>()?;
    Ok(DownsampledRecord { channel: record.channel, values, from: record.from, to: record.to })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::RemainderPolicy;
    use chrono::{DateTime, Duration, Utc};

    fn window(values: Vec<i32>) -> ChannelWindow {
        let from = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        ChannelWindow { channel: 9, values, from, to: from + Duration::milliseconds(400), offset: 0 }
    }

    #[test]
    fn mean_of_window() {
        let w = window(vec![2, 4, 6, 8]);
        let r = reduce(&w).unwrap();
        assert_eq!(r.value, 5.0);
        assert_eq!((r.channel, r.from, r.to), (w.channel, w.from, w.to));
    }

    #[test]
    fn mean_is_fractional() {
        assert_eq!(mean(&[1, 2]), Some(1.5));
        assert_eq!(mean(&[-3, 3, -90]), Some(-30.0));
    }

    #[test]
    fn single_sample_window_is_identity() {
        assert_eq!(reduce(&window(vec![-71])).unwrap().value, -71.0);
    }

    #[test]
    fn accumulator_does_not_overflow() {
        let values = vec![i32::MAX; 1_000];
        assert_eq!(mean(&values), Some(i32::MAX as f64));
    }

    #[test]
    fn empty_window_is_rejected() {
        assert!(matches!(reduce(&window(vec![])), Err(Error::EmptyWindow { channel: 9, .. })));
    }

    #[test]
    fn downsample_keeps_record_bounds() {
        let from = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let rec = ChannelRecord::new(4, vec![1, 3, 5, 7, 9], from, from + Duration::seconds(5));
        let splitter = WindowSplitter::new(2, RemainderPolicy::Emit).unwrap();
        let d = downsample(&rec, &splitter).unwrap();
        assert_eq!(d.values, vec![2.0, 6.0, 9.0]);
        assert_eq!((d.channel, d.from, d.to), (4, rec.from, rec.to));

        let splitter = WindowSplitter::new(2, RemainderPolicy::Drop).unwrap();
        assert_eq!(downsample(&rec, &splitter).unwrap().values, vec![2.0, 6.0]);
    }
}
