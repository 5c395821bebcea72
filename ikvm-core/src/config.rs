//! Runtime parameters of the update engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── ServerConfig ─────────────────────────────────────────────────

/// Configuration for [`EventLoop`](crate::rfb::EventLoop) and
/// [`UpdateScheduler`](crate::rfb::UpdateScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Nominal frame rate of the capture engine (1..=60).
    pub frame_rate: u32,
    /// Per-tick processing budget subtracted from the poll timeout.
    pub poll_overhead_us: u64,
    /// Maximum number of simultaneously connected viewers.
    pub max_clients: usize,
    /// Forced full-frame sends after a connect or a mode change.
    pub settle_frames: u32,
    /// Seconds between fps log lines; 0 disables the dump.
    pub fps_dump_secs: u64,
    /// Attempts before the tile codec is declared stalled.
    pub encode_retry_limit: u32,
    /// Size of each session's output buffer in bytes.
    pub update_buf_size: usize,
    /// Chunks the socket writer may queue before the session backs off.
    pub output_queue_depth: usize,
    /// Announce "count follows" and terminate with a LastRect marker when the
    /// client supports it.
    pub use_last_rect: bool,
    /// Name sent in ServerInit.
    pub desktop_name: String,
    /// Interval between attempts to leave the placeholder frame.
    pub placeholder_retry_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            poll_overhead_us: 100,
            max_clients: 10,
            settle_frames: 30,
            fps_dump_secs: 0,
            encode_retry_limit: 8,
            update_buf_size: 30_000,
            output_queue_depth: 1024,
            use_last_rect: true,
            desktop_name: "OpenBMC IKVM".into(),
            placeholder_retry_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Bounded wait for socket activity in one event-loop iteration:
    /// `max(1, 1_000_000 / frame_rate - poll_overhead_us)` microseconds.
    pub fn poll_timeout(&self) -> Duration {
        let per_frame = 1_000_000 / u64::from(self.frame_rate.max(1));
        Duration::from_micros(per_frame.saturating_sub(self.poll_overhead_us).max(1))
    }

    /// One nominal frame interval.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.frame_rate.max(1)))
    }

    /// Interval between fps log lines, if enabled.
    pub fn fps_dump_interval(&self) -> Option<Duration> {
        (self.fps_dump_secs > 0).then(|| Duration::from_secs(self.fps_dump_secs))
    }

    pub fn placeholder_retry(&self) -> Duration {
        Duration::from_millis(self.placeholder_retry_ms)
    }

    /// Clamp every field into the range the engine supports.
    pub fn sanitized(mut self) -> Self {
        self.frame_rate = self.frame_rate.clamp(1, 60);
        self.max_clients = self.max_clients.max(1);
        self.encode_retry_limit = self.encode_retry_limit.max(1);
        self.update_buf_size = self.update_buf_size.max(64);
        self.output_queue_depth = self.output_queue_depth.max(1);
        self
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_timeout_follows_frame_rate() {
        let cfg = ServerConfig::default();
        // 1_000_000 / 30 = 33_333, minus the 100 µs overhead.
        assert_eq!(cfg.poll_timeout(), Duration::from_micros(33_233));
    }

    #[test]
    fn poll_timeout_never_zero() {
        let cfg = ServerConfig {
            frame_rate: 60,
            poll_overhead_us: 1_000_000,
            ..Default::default()
        };
        assert_eq!(cfg.poll_timeout(), Duration::from_micros(1));
    }

    #[test]
    fn sanitized_clamps() {
        let cfg = ServerConfig {
            frame_rate: 240,
            max_clients: 0,
            encode_retry_limit: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(cfg.frame_rate, 60);
        assert_eq!(cfg.max_clients, 1);
        assert_eq!(cfg.encode_retry_limit, 1);
    }

    #[test]
    fn fps_dump_disabled_by_default() {
        assert!(ServerConfig::default().fps_dump_interval().is_none());
    }
}
