use std::time::{Duration, Instant};

/// Formats a duration as `HH:MM:SS`, rounded to the nearest second.
pub fn fmt_hms(d: Duration) -> String {
    let secs = (d.as_millis() + 500) / 1000;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

/// Wall-clock timer started at the beginning of a run.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self { started: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn hms(&self) -> String {
        fmt_hms(self.elapsed())
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}
