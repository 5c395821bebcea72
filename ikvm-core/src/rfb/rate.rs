//! Frame-rate and throughput accounting.
//!
//! Records one sample per framebuffer update sent and derives frames per
//! second and bytes per second over a rolling window. The numbers are
//! diagnostic only; nothing in the update path reacts to them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::info;

/// Rolling-window frame-rate meter.
///
/// Samples are `(timestamp, bytes)` pairs, one per update sent.
pub struct FrameRateMeter {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
    /// Updates recorded since the meter was created.
    lifetime_frames: u64,
}

impl FrameRateMeter {
    /// A meter with a 1-second rolling window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(128),
            window,
            total_bytes: 0,
            lifetime_frames: 0,
        }
    }

    /// Record one update of `bytes` sent at `when`.
    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        self.lifetime_frames += 1;
        self.evict(when);
    }

    /// Drop samples that fell out of the window as of `now`.
    pub fn advance(&mut self, now: Instant) {
        self.evict(now);
    }

    /// Updates per second over the window.
    pub fn fps(&self) -> f64 {
        match self.span() {
            Some(secs) => self.samples.len() as f64 / secs,
            None => 0.0,
        }
    }

    /// Bytes per second over the window.
    pub fn bytes_per_sec(&self) -> u64 {
        match self.span() {
            Some(secs) => (self.total_bytes as f64 / secs) as u64,
            None => 0,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn lifetime_frames(&self) -> u64 {
        self.lifetime_frames
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Seconds covered by the samples, never less than one millisecond.
    fn span(&self) -> Option<f64> {
        let (first, _) = self.samples.front()?;
        let (last, _) = self.samples.back()?;
        let d = last.duration_since(*first).max(Duration::from_millis(1));
        Some(d.as_secs_f64())
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.saturating_duration_since(ts) > self.window {
                self.samples.pop_front();
                self.total_bytes = self.total_bytes.saturating_sub(bytes);
            } else {
                break;
            }
        }
    }
}

impl Default for FrameRateMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ── FpsDump ──────────────────────────────────────────────────────

/// One periodic fps report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub frames: u64,
    pub bytes: u64,
    pub interval: Duration,
    pub fps: f64,
    pub bytes_per_sec: u64,
}

/// Counts updates between periodic dumps.
pub struct FpsDump {
    interval: Duration,
    started: Instant,
    frames: u64,
    bytes: u64,
}

impl FpsDump {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            started: now,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.frames += 1;
        self.bytes += bytes;
    }

    /// Once the interval has elapsed, return the averages and restart.
    pub fn poll(&mut self, now: Instant) -> Option<FpsReport> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.interval {
            return None;
        }
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let report = FpsReport {
            frames: self.frames,
            bytes: self.bytes,
            interval: elapsed,
            fps: self.frames as f64 / secs,
            bytes_per_sec: (self.bytes as f64 / secs) as u64,
        };
        self.started = now;
        self.frames = 0;
        self.bytes = 0;
        info!(
            frames = report.frames,
            interval_ms = report.interval.as_millis() as u64,
            fps = format_args!("{:.1}", report.fps),
            bytes_per_sec = report.bytes_per_sec,
            "frame rate"
        );
        Some(report)
    }
}

// ── Tests ────────────────────────────────────────────────────────
