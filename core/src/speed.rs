//! Byte-rate accumulator: recompute only once the accumulator exceeds
//! 1 MiB or the sampling window (>= 1s) has elapsed, so a rate query never
//! triggers a computation on every single byte added.

use std::time::Instant;

const BYTES_PER_RECOMPUTE: u64 = 1024 * 1024;
const MIN_SAMPLE_WINDOW_SECS: f64 = 1.0;

#[derive(Debug)]
pub struct BytesSpeed {
    bytes: u64,
    last_computed: Option<Instant>,
    rate: f64,
    window_start: Instant,
    window_start_bytes: u64,
}

impl Default for BytesSpeed {
    fn default() -> Self {
        let now = Instant::now();
        BytesSpeed {
            bytes: 0,
            last_computed: None,
            rate: 0.0,
            window_start: now,
            window_start_bytes: 0,
        }
    }
}

impl BytesSpeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` bytes to the accumulator, recomputing the rate if either
    /// gate has tripped.
    pub fn add(&mut self, n: u64) {
        self.bytes += n;
        if self.bytes - self.window_start_bytes >= BYTES_PER_RECOMPUTE {
            self.compute(Instant::now());
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs_f64() >= MIN_SAMPLE_WINDOW_SECS {
            self.compute(now);
        }
    }

    fn compute(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start).as_secs_f64();
        if elapsed > 0.0 {
            self.rate = (self.bytes - self.window_start_bytes) as f64 / elapsed;
        }
        self.window_start = now;
        self.window_start_bytes = self.bytes;
        self.last_computed = Some(now);
    }

    /// Returns the last-computed rate in bytes/sec. Ticks the computation
    /// first if the sampling window has already elapsed, so a caller polling
    /// less often than it writes still sees a fresh-ish number.
    pub fn get(&mut self) -> f64 {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs_f64() >= MIN_SAMPLE_WINDOW_SECS {
            self.compute(now);
        }
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn accumulates_without_recompute_below_thresholds() {
        let mut s = BytesSpeed::new();
        s.add(100);
        assert_eq!(s.bytes, 100);
    }

    #[test]
    fn recomputes_after_one_mib() {
        let mut s = BytesSpeed::new();
        s.add(2 * 1024 * 1024);
        assert!(s.get() > 0.0);
    }

    #[test]
    fn recomputes_after_time_window() {
        let mut s = BytesSpeed::new();
        s.add(10);
        sleep(Duration::from_millis(1100));
        let rate = s.get();
        assert!(rate >= 0.0);
    }
}
